// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only snapshot tables.
//!
//! Every live table in [`SNAPSHOT_TABLES`] has a `<table>_snapshot` shadow with
//! the same columns plus `deleted`. Snapshotting a table is two statements:
//!
//! 1. copy every live row into the shadow (`ON CONFLICT DO NOTHING`, so rows
//!    whose `last_updated` did not move insert nothing);
//! 2. append a `deleted = true` marker for every key whose latest shadow row is
//!    live but which has vanished from the live table.
//!
//! The latest row per key (`DISTINCT ON (pk) ... ORDER BY pk, last_updated
//! DESC`) is authoritative. Shadow rows are never updated or deleted.
//!
//! Adding a table to the mechanism is one [`SnapshotTable`] entry plus the
//! matching `*_snapshot` migration.

use sqlx::PgConnection;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// Static description of one snapshotted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTable {
    /// Live table name. The shadow table is `<table>_snapshot`.
    pub table: &'static str,
    /// Logical primary key of a row, stable across versions.
    pub pk: &'static [&'static str],
    /// Data columns, excluding `last_updated` and `deleted`.
    pub columns: &'static [&'static str],
}

/// `cachegroup`
pub const CACHEGROUP: SnapshotTable = SnapshotTable {
    table: "cachegroup",
    pk: &["id"],
    columns: &[
        "id",
        "name",
        "short_name",
        "parent_cachegroup_id",
        "secondary_parent_cachegroup_id",
        "type",
        "fallback_to_closest",
        "coordinate",
    ],
};

/// `cachegroup_fallbacks`
pub const CACHEGROUP_FALLBACKS: SnapshotTable = SnapshotTable {
    table: "cachegroup_fallbacks",
    pk: &["primary_cg", "backup_cg"],
    columns: &["primary_cg", "backup_cg", "set_order"],
};

/// `cachegroup_localization_method`
pub const CACHEGROUP_LOCALIZATION_METHOD: SnapshotTable = SnapshotTable {
    table: "cachegroup_localization_method",
    pk: &["cachegroup", "method"],
    columns: &["cachegroup", "method"],
};

/// `cdn`
pub const CDN: SnapshotTable = SnapshotTable {
    table: "cdn",
    pk: &["name"],
    columns: &["id", "name", "domain_name", "dnssec_enabled", "ttl_override"],
};

/// `coordinate`
pub const COORDINATE: SnapshotTable = SnapshotTable {
    table: "coordinate",
    pk: &["id"],
    columns: &["id", "name", "latitude", "longitude"],
};

/// `deliveryservice`
pub const DELIVERY_SERVICE: SnapshotTable = SnapshotTable {
    table: "deliveryservice",
    pk: &["xml_id"],
    columns: &[
        "id",
        "xml_id",
        "active",
        "type",
        "profile",
        "cdn_id",
        "ccr_dns_ttl",
        "protocol",
        "geo_limit",
        "geo_limit_countries",
        "geolimit_redirect_url",
        "geo_provider",
        "http_bypass_fqdn",
        "dns_bypass_ip",
        "dns_bypass_ip6",
        "dns_bypass_ttl",
        "dns_bypass_cname",
        "max_dns_answers",
        "miss_lat",
        "miss_long",
        "initial_dispersion",
        "regional_geo_blocking",
        "anonymous_blocking_enabled",
        "ipv6_routing_enabled",
        "ecs_enabled",
        "deep_caching_type",
        "tr_request_headers",
        "tr_response_headers",
        "routing_name",
        "consistent_hash_regex",
        "topology",
    ],
};

/// `deliveryservice_regex`
pub const DELIVERY_SERVICE_REGEX: SnapshotTable = SnapshotTable {
    table: "deliveryservice_regex",
    pk: &["deliveryservice", "regex"],
    columns: &["deliveryservice", "regex", "set_number"],
};

/// `deliveryservice_server`, the largest table. Single-DS snapshots scope it
/// by `deliveryservice`.
pub const DELIVERY_SERVICE_SERVER: SnapshotTable = SnapshotTable {
    table: "deliveryservice_server",
    pk: &["deliveryservice", "server"],
    columns: &["deliveryservice", "server"],
};

/// `parameter`
pub const PARAMETER: SnapshotTable = SnapshotTable {
    table: "parameter",
    pk: &["id"],
    columns: &["id", "name", "config_file", "value", "secure"],
};

/// `profile`
pub const PROFILE: SnapshotTable = SnapshotTable {
    table: "profile",
    pk: &["name"],
    columns: &["id", "name", "description", "type", "cdn", "routing_disabled"],
};

/// `profile_parameter`
pub const PROFILE_PARAMETER: SnapshotTable = SnapshotTable {
    table: "profile_parameter",
    pk: &["profile", "parameter"],
    columns: &["profile", "parameter"],
};

/// `regex`
pub const REGEX: SnapshotTable = SnapshotTable {
    table: "regex",
    pk: &["id"],
    columns: &["id", "pattern", "type"],
};

/// `server`
pub const SERVER: SnapshotTable = SnapshotTable {
    table: "server",
    pk: &["id"],
    columns: &[
        "id",
        "host_name",
        "domain_name",
        "tcp_port",
        "https_port",
        "xmpp_id",
        "interface_name",
        "ip_address",
        "ip6_address",
        "cachegroup",
        "type",
        "status",
        "profile",
        "cdn_id",
    ],
};

/// `staticdnsentry`
pub const STATIC_DNS_ENTRY: SnapshotTable = SnapshotTable {
    table: "staticdnsentry",
    pk: &["id"],
    columns: &[
        "id",
        "host",
        "address",
        "type",
        "ttl",
        "deliveryservice",
        "cachegroup",
    ],
};

/// `status`
pub const STATUS: SnapshotTable = SnapshotTable {
    table: "status",
    pk: &["name"],
    columns: &["id", "name", "description"],
};

/// `topology`
pub const TOPOLOGY: SnapshotTable = SnapshotTable {
    table: "topology",
    pk: &["name"],
    columns: &["name", "description"],
};

/// `topology_cachegroup`
pub const TOPOLOGY_CACHEGROUP: SnapshotTable = SnapshotTable {
    table: "topology_cachegroup",
    pk: &["id"],
    columns: &["id", "topology", "cachegroup"],
};

/// `type`
pub const TYPE: SnapshotTable = SnapshotTable {
    table: "type",
    pk: &["name"],
    columns: &["id", "name", "description", "use_in_table"],
};

/// Every snapshotted table except [`DELIVERY_SERVICE_SERVER`].
pub static SNAPSHOT_TABLES: &[SnapshotTable] = &[
    CACHEGROUP,
    CACHEGROUP_FALLBACKS,
    CACHEGROUP_LOCALIZATION_METHOD,
    CDN,
    COORDINATE,
    DELIVERY_SERVICE,
    DELIVERY_SERVICE_REGEX,
    PARAMETER,
    PROFILE,
    PROFILE_PARAMETER,
    REGEX,
    SERVER,
    STATIC_DNS_ENTRY,
    STATUS,
    TOPOLOGY,
    TOPOLOGY_CACHEGROUP,
    TYPE,
];

/// The full registry, [`DELIVERY_SERVICE_SERVER`] included.
pub fn all_tables() -> impl Iterator<Item = &'static SnapshotTable> {
    SNAPSHOT_TABLES
        .iter()
        .chain(std::iter::once(&DELIVERY_SERVICE_SERVER))
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_list(columns: &[&str], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|c| match alias {
            Some(a) => format!("{}.{}", a, quote(c)),
            None => quote(c),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl SnapshotTable {
    /// Name of the shadow table.
    pub fn snapshot_table(&self) -> String {
        format!("{}_snapshot", self.table)
    }

    fn pk_list(&self) -> String {
        column_list(self.pk, None)
    }

    /// Copy live rows into the shadow table.
    ///
    /// With `scope`, only live rows whose `scope` column equals `$1` are copied.
    pub fn insert_snapshot_query(&self, scope: Option<&str>) -> String {
        let cols = column_list(self.columns, None);
        let filter = scope
            .map(|c| format!(" WHERE {} = $1", quote(c)))
            .unwrap_or_default();
        format!(
            "INSERT INTO {} ({}, last_updated) SELECT {}, last_updated FROM {}{} ON CONFLICT DO NOTHING",
            quote(&self.snapshot_table()),
            cols,
            cols,
            quote(self.table),
            filter
        )
    }

    /// Latest shadow row per key, deletion markers included.
    ///
    /// `filter` is an SQL predicate over the shadow table's columns.
    pub fn latest_query(&self, filter: Option<&str>) -> String {
        let pk = self.pk_list();
        let filter = filter.map(|f| format!(" WHERE {}", f)).unwrap_or_default();
        format!(
            "SELECT DISTINCT ON ({}) * FROM {}{} ORDER BY {}, last_updated DESC",
            pk,
            quote(&self.snapshot_table()),
            filter,
            pk
        )
    }

    /// Append a deletion marker for every key whose latest shadow row is live
    /// and which no longer exists in the live table.
    ///
    /// Markers are stamped with `clock_timestamp()` so they sort after any
    /// version written earlier in the same transaction. With `scope`, only
    /// keys whose latest row has `scope = $1` are considered.
    pub fn insert_deleted_query(&self, scope: Option<&str>) -> String {
        let scope_filter = scope.map(|c| format!("{} = $1", quote(c)));
        let key_match = self
            .pk
            .iter()
            .map(|c| format!("t.{col} = l.{col}", col = quote(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "INSERT INTO {} ({}, last_updated, deleted) \
             SELECT {}, clock_timestamp(), true FROM ({}) AS l \
             WHERE NOT l.deleted AND NOT EXISTS (SELECT 1 FROM {} AS t WHERE {}) \
             ON CONFLICT DO NOTHING",
            quote(&self.snapshot_table()),
            column_list(self.columns, None),
            column_list(self.columns, Some("l")),
            self.latest_query(scope_filter.as_deref()),
            quote(self.table),
            key_match
        )
    }

    /// Re-append live rows whose key's latest shadow row is a deletion marker.
    ///
    /// A key deleted and then re-created can come back with a `last_updated`
    /// no later than its marker, e.g. when both happen in one transaction or
    /// the reinsert supplies an old timestamp. The plain copy then lands
    /// behind the marker and the key would stay hidden, so the live row is
    /// stamped with `clock_timestamp()` instead. Runs after the plain copy.
    pub fn insert_revived_query(&self, scope: Option<&str>) -> String {
        let scope_filter = scope.map(|c| format!("{} = $1", quote(c)));
        let key_match = self
            .pk
            .iter()
            .map(|c| format!("live.{col} = l.{col}", col = quote(c)))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(
            "INSERT INTO {} ({}, last_updated) \
             SELECT {}, clock_timestamp() FROM {} AS live JOIN ({}) AS l ON {} \
             WHERE l.deleted \
             ON CONFLICT DO NOTHING",
            quote(&self.snapshot_table()),
            column_list(self.columns, None),
            column_list(self.columns, Some("live")),
            quote(self.table),
            self.latest_query(scope_filter.as_deref()),
            key_match
        )
    }

    /// Rows of this table as they stood at the CDN's last snapshot.
    ///
    /// A parenthesised relation usable wherever the live table name is, with
    /// the CDN name bound as `$1`. Keys whose latest row as of the snapshot
    /// time is a deletion marker are excluded.
    pub fn latest_as_of_snapshot(&self) -> String {
        let pk = self.pk_list();
        format!(
            "(SELECT * FROM (SELECT DISTINCT ON ({}) * FROM {} \
             WHERE last_updated <= (SELECT time FROM snapshot WHERE cdn = $1) \
             ORDER BY {}, last_updated DESC) AS t_latest WHERE NOT t_latest.deleted)",
            pk,
            quote(&self.snapshot_table()),
            pk
        )
    }

    /// Advance the shadow table to the live table's current state.
    pub async fn update_snapshot(&self, conn: &mut PgConnection) -> Result<()> {
        let insert = self.insert_snapshot_query(None);
        let inserted = sqlx::query(&insert)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.query_error("inserting snapshot rows", &insert, e))?;

        let revive = self.insert_revived_query(None);
        let revived = sqlx::query(&revive)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.query_error("inserting revived snapshot rows", &revive, e))?;

        let deleted = self.insert_deleted_query(None);
        let marked = sqlx::query(&deleted)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.query_error("inserting deleted snapshot rows", &deleted, e))?;

        debug!(
            table = self.table,
            inserted = inserted.rows_affected(),
            revived = revived.rows_affected(),
            deleted = marked.rows_affected(),
            "Updated snapshot table"
        );
        Ok(())
    }

    /// [`update_snapshot`](Self::update_snapshot) restricted to rows whose
    /// `column` equals `id`.
    pub async fn update_snapshot_scoped(
        &self,
        conn: &mut PgConnection,
        column: &str,
        id: i64,
    ) -> Result<()> {
        let insert = self.insert_snapshot_query(Some(column));
        let inserted = sqlx::query(&insert)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.query_error("inserting snapshot rows", &insert, e))?;

        let revive = self.insert_revived_query(Some(column));
        let revived = sqlx::query(&revive)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.query_error("inserting revived snapshot rows", &revive, e))?;

        let deleted = self.insert_deleted_query(Some(column));
        let marked = sqlx::query(&deleted)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| self.query_error("inserting deleted snapshot rows", &deleted, e))?;

        debug!(
            table = self.table,
            column,
            id,
            inserted = inserted.rows_affected(),
            revived = revived.rows_affected(),
            deleted = marked.rows_affected(),
            "Updated scoped snapshot table"
        );
        Ok(())
    }

    fn query_error(&self, action: &str, query: &str, err: sqlx::Error) -> Error {
        Error::from(err).context(format!("{} for {} with query '{}'", action, self.table, query))
    }
}

/// Snapshot every registered table.
#[instrument(skip(conn))]
pub async fn update_snapshot_tables(conn: &mut PgConnection) -> Result<()> {
    for table in all_tables() {
        table.update_snapshot(conn).await?;
    }
    Ok(())
}

/// Snapshot for a single delivery service change.
///
/// Every table but `deliveryservice_server` is snapshotted in full; that one
/// is scoped to the delivery service's rows. This bounds the scan of the
/// largest table and is not a strict narrowing: rows unrelated to `ds_id` in
/// the other tables are still captured.
#[instrument(skip(conn))]
pub async fn update_snapshot_tables_for_ds(conn: &mut PgConnection, ds_id: i64) -> Result<()> {
    for table in SNAPSHOT_TABLES {
        table.update_snapshot(conn).await?;
    }
    DELIVERY_SERVICE_SERVER
        .update_snapshot_scoped(conn, "deliveryservice", ds_id)
        .await
}
