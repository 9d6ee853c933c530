// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CRConfig compiler.
//!
//! [`make`] runs the sub-builders in dependency order against one connection
//! (normally a transaction) and assembles a [`CrConfig`]:
//!
//! | Step | Builder | Consumes |
//! |------|---------|----------|
//! | 1 | [`get_cdn_info`] | |
//! | 2 | [`config::make_config`] | CDN info |
//! | 3 | [`servers::get_server_ds_names`] and [`servers::get_server_ds_remaps`] | CDN domain |
//! | 4 | [`servers::make_servers`] | remaps |
//! | 5 | [`locations::make_locations`] | |
//! | 6 | [`deliveryservice::make_delivery_services`] | CDN info, server assignments |
//! | 7 | [`topologies::make_topologies`] | |
//!
//! Every builder reads through a [`Source`], so the same code compiles either
//! the live tables or the state recorded by the CDN's last snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{info, instrument};

use crate::error::{Error, Result, ResultExt};
use crate::snapshot::{self, SnapshotTable};

pub mod config;
pub mod deliveryservice;
pub mod locations;
pub mod servers;
pub mod topologies;
mod types;

pub use types::*;

/// Server statuses that make a server part of the document.
pub(crate) const ELIGIBLE_STATUSES: &str = "('REPORTED', 'ONLINE', 'ADMIN_DOWN')";

/// Delivery service type excluded from routing.
pub(crate) const ANY_MAP_TYPE: &str = "ANY_MAP";

/// Where builder queries read rows from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Source {
    /// The live tables.
    #[default]
    Live,
    /// The latest `*_snapshot` rows at or before the CDN's snapshot time,
    /// without deletion markers.
    Snapshot,
}

impl Source {
    /// Relation to select `table`'s rows from.
    ///
    /// Builder queries always bind the CDN name as `$1`, which the snapshot
    /// relation uses to find the snapshot time.
    pub fn table(&self, table: &SnapshotTable) -> String {
        match self {
            Self::Live => format!("\"{}\"", table.table),
            Self::Snapshot => table.latest_as_of_snapshot(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Newest modification time observed so far. Never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LastModified(Option<DateTime<Utc>>);

impl LastModified {
    /// Start from one observed time.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self(Some(time))
    }

    /// Fold in a row's `last_updated`.
    pub fn observe(&mut self, time: DateTime<Utc>) {
        if self.0.is_none_or(|current| time > current) {
            self.0 = Some(time);
        }
    }

    /// Fold in an optional time, e.g. a `MAX()` over zero rows.
    pub fn observe_opt(&mut self, time: Option<DateTime<Utc>>) {
        if let Some(t) = time {
            self.observe(t);
        }
    }

    /// Fold in another tracker.
    pub fn merge(&mut self, other: LastModified) {
        self.observe_opt(other.0);
    }

    /// The newest time, if anything was observed.
    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }
}

/// Provenance recorded in the document's `stats`.
#[derive(Debug, Clone)]
pub struct MakeOptions {
    /// Requesting user.
    pub user: String,
    /// Generating host.
    pub host: String,
    /// Generator version.
    pub version: String,
    /// Becomes `stats.date`.
    pub generated_at: DateTime<Utc>,
}

impl MakeOptions {
    /// Options stamped with the crate version and the current time.
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now(),
        }
    }
}

/// CDN-wide settings every builder needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CdnInfo {
    /// Domain appended to delivery service host names.
    pub domain_name: String,
    /// DNSSEC signing enabled.
    pub dnssec_enabled: bool,
    /// Cap for every TTL in the document, when positive.
    pub ttl_override: Option<i32>,
    /// Row modification time.
    pub last_updated: DateTime<Utc>,
}

impl CdnInfo {
    /// The TTL cap, if one is in force.
    pub fn ttl_override(&self) -> Option<i32> {
        self.ttl_override.filter(|ttl| *ttl > 0)
    }
}

/// Look up the CDN. `None` if it does not exist in `source`.
pub async fn get_cdn_info(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<Option<CdnInfo>> {
    let q = format!(
        "SELECT c.domain_name, c.dnssec_enabled, c.ttl_override, c.last_updated FROM {} AS c WHERE c.name = $1",
        source.table(&snapshot::CDN)
    );
    let info = sqlx::query_as::<_, CdnInfo>(&q)
        .bind(cdn)
        .fetch_optional(&mut *conn)
        .await
        .context("querying CDN info")?;
    Ok(info)
}

/// Compile the CRConfig for `cdn`.
///
/// Fails with [`ErrorKind::NotFound`](crate::error::ErrorKind::NotFound) if
/// the CDN does not exist in `source`. Any builder failure aborts the whole
/// compile.
#[instrument(skip(conn, opts), fields(cdn = %cdn, source = %source))]
pub async fn make(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
    opts: &MakeOptions,
) -> Result<CrConfig> {
    let info = get_cdn_info(conn, cdn, source)
        .await
        .context("getting CDN info")?
        .ok_or_else(|| Error::not_found(format!("cdn '{}' not found", cdn)))?;
    let ttl_override = info.ttl_override();

    let mut doc = CrConfig::default();
    doc.modified.observe(info.last_updated);

    let (cfg, modified) = config::make_config(conn, cdn, source, &info)
        .await
        .context("making CRConfig config")?;
    doc.config = cfg;
    doc.modified.merge(modified);

    let assignments = servers::get_server_ds_names(conn, cdn, source)
        .await
        .context("getting server deliveryservices")?;
    let remaps = servers::get_server_ds_remaps(conn, cdn, source, &info.domain_name, &assignments)
        .await
        .context("getting server deliveryservices")?;

    let (made, modified) = servers::make_servers(conn, cdn, source, &remaps, &assignments)
        .await
        .context("making CRConfig servers")?;
    doc.content_servers = made.content_servers;
    doc.content_routers = made.content_routers;
    doc.monitors = made.monitors;
    doc.modified.merge(modified);

    let (locations, modified) = locations::make_locations(conn, cdn, source)
        .await
        .context("making CRConfig locations")?;
    doc.edge_locations = locations.edge_locations;
    doc.router_locations = locations.router_locations;
    doc.modified.merge(modified);

    let (dses, modified) = deliveryservice::make_delivery_services(
        conn,
        cdn,
        source,
        &info.domain_name,
        ttl_override,
        &assignments,
    )
    .await
    .context("making CRConfig deliveryservices")?;
    doc.delivery_services = dses;
    doc.modified.merge(modified);

    let (topologies, modified) = topologies::make_topologies(conn, cdn, source)
        .await
        .context("making CRConfig topologies")?;
    doc.topologies = topologies;
    doc.modified.merge(modified);

    doc.stats = Stats {
        cdn_name: cdn.to_string(),
        date: opts.generated_at.timestamp(),
        tm_host: opts.host.clone(),
        tm_user: opts.user.clone(),
        tm_version: opts.version.clone(),
    };

    info!(
        servers = doc.content_servers.len(),
        routers = doc.content_routers.len(),
        monitors = doc.monitors.len(),
        delivery_services = doc.delivery_services.len(),
        "Made CRConfig"
    );
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_last_modified_keeps_maximum_in_any_order() {
        let times = [ts(300), ts(100), ts(200)];
        let orders = [[0, 1, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let mut lm = LastModified::default();
            for i in order {
                lm.observe(times[i]);
            }
            assert_eq!(lm.get(), Some(ts(300)), "order {:?}", order);
        }
    }

    #[test]
    fn test_last_modified_merge_and_empty() {
        let mut lm = LastModified::default();
        assert_eq!(lm.get(), None);
        lm.merge(LastModified::default());
        assert_eq!(lm.get(), None);

        lm.observe_opt(Some(ts(50)));
        lm.merge(LastModified::at(ts(40)));
        assert_eq!(lm.get(), Some(ts(50)));
        lm.merge(LastModified::at(ts(60)));
        assert_eq!(lm.get(), Some(ts(60)));
        lm.observe_opt(None);
        assert_eq!(lm.get(), Some(ts(60)));
    }

    #[test]
    fn test_source_table() {
        assert_eq!(Source::Live.table(&snapshot::SERVER), "\"server\"");
        let snap = Source::Snapshot.table(&snapshot::SERVER);
        assert!(snap.contains("\"server_snapshot\""));
        assert!(snap.contains("cdn = $1"));
        assert_eq!(Source::default(), Source::Live);
    }

    #[test]
    fn test_ttl_override_only_when_positive() {
        let mut info = CdnInfo {
            domain_name: "cdn.example".to_string(),
            dnssec_enabled: false,
            ttl_override: None,
            last_updated: ts(0),
        };
        assert_eq!(info.ttl_override(), None);
        info.ttl_override = Some(0);
        assert_eq!(info.ttl_override(), None);
        info.ttl_override = Some(-5);
        assert_eq!(info.ttl_override(), None);
        info.ttl_override = Some(60);
        assert_eq!(info.ttl_override(), Some(60));
    }

    #[test]
    fn test_make_options_defaults() {
        let opts = MakeOptions::new("admin", "to.example");
        assert_eq!(opts.user, "admin");
        assert_eq!(opts.host, "to.example");
        assert_eq!(opts.version, env!("CARGO_PKG_VERSION"));
    }
}
