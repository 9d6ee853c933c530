// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topologies and their cachegroup nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use super::{LastModified, Source, Topology};
use crate::error::{Result, ResultExt};
use crate::snapshot;

/// Build every topology. Topologies are global, so the CDN only has to
/// exist in `source`.
pub async fn make_topologies(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<(BTreeMap<String, Topology>, LastModified)> {
    let tc = source.table(&snapshot::TOPOLOGY_CACHEGROUP);
    let q = format!(
        "SELECT t.name, \
                ARRAY(SELECT tc.cachegroup FROM {tc} AS tc WHERE tc.topology = t.name ORDER BY tc.id) AS nodes, \
                GREATEST(t.last_updated, \
                         (SELECT MAX(tc.last_updated) FROM {tc} AS tc WHERE tc.topology = t.name)) \
                    AS last_updated \
         FROM {topology} AS t \
         WHERE EXISTS (SELECT 1 FROM {cdn} AS c WHERE c.name = $1) \
         ORDER BY t.name",
        tc = tc,
        topology = source.table(&snapshot::TOPOLOGY),
        cdn = source.table(&snapshot::CDN),
    );
    let rows: Vec<(String, Vec<String>, DateTime<Utc>)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying topologies")?;

    let mut modified = LastModified::default();
    let topologies = rows
        .into_iter()
        .map(|(name, nodes, last_updated)| {
            modified.observe(last_updated);
            (name, Topology { nodes })
        })
        .collect();
    Ok((topologies, modified))
}
