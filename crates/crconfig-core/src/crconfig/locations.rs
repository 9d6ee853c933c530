// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edge and router locations with their fallback chains.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use super::{BackupLocations, ELIGIBLE_STATUSES, LastModified, LocalizationMethod, Location, Source};
use crate::error::{Result, ResultExt};
use crate::snapshot;

/// Cachegroups keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Locations {
    /// Cachegroups hosting an eligible edge cache.
    pub edge_locations: BTreeMap<String, Location>,
    /// Cachegroups hosting an eligible router.
    pub router_locations: BTreeMap<String, Location>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LocationRow {
    pub id: i64,
    pub name: String,
    pub is_router: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fallback_to_closest: bool,
    pub localization_methods: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Parse configured methods, falling back to [`LocalizationMethod::DEFAULT`]
/// when none are set.
pub fn localization_methods(configured: &[String]) -> Vec<LocalizationMethod> {
    let methods: Vec<LocalizationMethod> = configured
        .iter()
        .filter_map(|m| LocalizationMethod::from_db(m))
        .collect();
    if methods.is_empty() {
        LocalizationMethod::DEFAULT.to_vec()
    } else {
        methods
    }
}

/// Assemble locations from rows and `primary_cg` → ordered backup names.
pub(crate) fn build_locations(
    rows: Vec<LocationRow>,
    fallbacks: &HashMap<i64, Vec<String>>,
) -> (Locations, LastModified) {
    let mut locations = Locations::default();
    let mut modified = LastModified::default();
    for row in rows {
        modified.observe(row.last_updated);
        let backup_locations = if row.is_router {
            BackupLocations::default()
        } else {
            BackupLocations {
                fallback_to_closest: row.fallback_to_closest,
                list: fallbacks.get(&row.id).cloned().unwrap_or_default(),
            }
        };
        let location = Location {
            latitude: row.latitude.unwrap_or_default(),
            longitude: row.longitude.unwrap_or_default(),
            backup_locations,
            localization_methods: localization_methods(&row.localization_methods),
        };
        if row.is_router {
            locations.router_locations.insert(row.name, location);
        } else {
            locations.edge_locations.insert(row.name, location);
        }
    }
    (locations, modified)
}

/// Build edge and router locations.
pub async fn make_locations(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<(Locations, LastModified)> {
    let cachegroup = source.table(&snapshot::CACHEGROUP);
    let q = format!(
        "SELECT DISTINCT cg.id, cg.name, (t.name = 'CCR') AS is_router, \
                co.latitude, co.longitude, cg.fallback_to_closest, \
                ARRAY(SELECT clm.method FROM {clm} AS clm WHERE clm.cachegroup = cg.id ORDER BY clm.method) \
                    AS localization_methods, \
                cg.last_updated \
         FROM {server} AS s \
         JOIN {cachegroup} AS cg ON cg.id = s.cachegroup \
         JOIN {typ} AS t ON t.id = s.type \
         JOIN {status} AS st ON st.id = s.status \
         LEFT JOIN {coordinate} AS co ON co.id = cg.coordinate \
         WHERE s.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND (t.name LIKE 'EDGE%' OR t.name = 'CCR') \
         AND st.name IN {statuses} \
         ORDER BY cg.name",
        clm = source.table(&snapshot::CACHEGROUP_LOCALIZATION_METHOD),
        server = source.table(&snapshot::SERVER),
        cachegroup = cachegroup,
        typ = source.table(&snapshot::TYPE),
        status = source.table(&snapshot::STATUS),
        coordinate = source.table(&snapshot::COORDINATE),
        cdn = source.table(&snapshot::CDN),
        statuses = ELIGIBLE_STATUSES,
    );
    let rows = sqlx::query_as::<_, LocationRow>(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying locations")?;

    let q = format!(
        "SELECT cgf.primary_cg, cg.name, cgf.last_updated \
         FROM {cgf} AS cgf \
         JOIN {cachegroup} AS cg ON cg.id = cgf.backup_cg \
         WHERE EXISTS (SELECT 1 FROM {cdn} AS c WHERE c.name = $1) \
         ORDER BY cgf.primary_cg, cgf.set_order",
        cgf = source.table(&snapshot::CACHEGROUP_FALLBACKS),
        cachegroup = cachegroup,
        cdn = source.table(&snapshot::CDN),
    );
    let fallback_rows: Vec<(i64, String, DateTime<Utc>)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying cachegroup fallbacks")?;

    let mut fallbacks: HashMap<i64, Vec<String>> = HashMap::new();
    let mut fallback_modified = LastModified::default();
    for (primary, backup, last_updated) in fallback_rows {
        fallbacks.entry(primary).or_default().push(backup);
        fallback_modified.observe(last_updated);
    }

    let (locations, mut modified) = build_locations(rows, &fallbacks);
    modified.merge(fallback_modified);
    Ok((locations, modified))
}
