// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for crconfig-core integration tests.
//!
//! Provides [`TestDb`] for a migrated database connection and [`Fixture`] for
//! a small CDN: one edge, one offline edge, one router and one monitor, an
//! HTTP delivery service with a host regex, a static DNS entry and a
//! topology, plus an inactive delivery service.
//!
//! Fixture rows carry explicit `last_updated` values an hour in the past so
//! an `UPDATE` later in the same transaction produces a distinct version.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Domain of every fixture CDN.
pub const DOMAIN: &str = "cdn.example";

// Serializes tests within one test binary; snapshot commits scan every row.
static DB_LOCK: Mutex<()> = Mutex::new(());

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// A migrated database, held exclusively for one test.
pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

impl TestDb {
    /// Connect to TEST_DATABASE_URL and run migrations.
    pub async fn new() -> Option<Self> {
        let guard = DB_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        crconfig_core::migrations::run_postgres(&pool).await.ok()?;
        Some(Self {
            pool,
            _guard: guard,
        })
    }

    /// A transaction that is rolled back when dropped.
    pub async fn begin(&self) -> Transaction<'static, Postgres> {
        self.pool.begin().await.expect("Failed to begin transaction")
    }
}

/// Whole seconds, an hour ago.
pub fn base_time() -> DateTime<Utc> {
    Utc.timestamp_opt(Utc::now().timestamp() - 3600, 0).unwrap()
}

/// Short unique suffix for names with UNIQUE constraints.
pub fn unique_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub async fn type_id(conn: &mut PgConnection, name: &str) -> i64 {
    sqlx::query("INSERT INTO type (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await
        .unwrap();
    sqlx::query_scalar("SELECT id FROM type WHERE name = $1")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .unwrap()
}

pub async fn status_id(conn: &mut PgConnection, name: &str) -> i64 {
    sqlx::query_scalar("SELECT id FROM status WHERE name = $1")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .unwrap()
}

/// Find or create a parameter and attach it to `profile`.
pub async fn add_param(
    conn: &mut PgConnection,
    profile: i64,
    name: &str,
    config_file: &str,
    value: &str,
    at: DateTime<Utc>,
) -> i64 {
    sqlx::query(
        "INSERT INTO parameter (name, config_file, value, last_updated) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (name, config_file, value) DO NOTHING",
    )
    .bind(name)
    .bind(config_file)
    .bind(value)
    .bind(at)
    .execute(&mut *conn)
    .await
    .unwrap();
    let id: i64 = sqlx::query_scalar(
        "SELECT id FROM parameter WHERE name = $1 AND config_file = $2 AND value = $3",
    )
    .bind(name)
    .bind(config_file)
    .bind(value)
    .fetch_one(&mut *conn)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO profile_parameter (profile, parameter, last_updated) VALUES ($1, $2, $3)",
    )
    .bind(profile)
    .bind(id)
    .bind(at)
    .execute(&mut *conn)
    .await
    .unwrap();
    id
}

async fn cachegroup(
    conn: &mut PgConnection,
    name: &str,
    type_id: i64,
    coordinate: Option<i64>,
    at: DateTime<Utc>,
) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO cachegroup (name, short_name, type, coordinate, last_updated) \
         VALUES ($1, $1, $2, $3, $4) RETURNING id",
    )
    .bind(name)
    .bind(type_id)
    .bind(coordinate)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .unwrap()
}

pub async fn profile(conn: &mut PgConnection, name: &str, at: DateTime<Utc>) -> i64 {
    sqlx::query_scalar("INSERT INTO profile (name, last_updated) VALUES ($1, $2) RETURNING id")
        .bind(name)
        .bind(at)
        .fetch_one(&mut *conn)
        .await
        .unwrap()
}

#[allow(clippy::too_many_arguments)]
async fn server(
    conn: &mut PgConnection,
    host: &str,
    cachegroup: i64,
    type_id: i64,
    status: i64,
    profile: i64,
    cdn_id: i64,
    ip: &str,
    at: DateTime<Utc>,
) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO server (host_name, domain_name, tcp_port, https_port, interface_name, ip_address, \
                             cachegroup, type, status, profile, cdn_id, last_updated) \
         VALUES ($1, 'example.net', 80, 443, 'eth0', $2, $3, $4, $5, $6, $7, $8) RETURNING id",
    )
    .bind(host)
    .bind(ip)
    .bind(cachegroup)
    .bind(type_id)
    .bind(status)
    .bind(profile)
    .bind(cdn_id)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .unwrap()
}

/// Insert a delivery service with one `HOST_REGEXP` in set 0.
pub async fn add_delivery_service(
    conn: &mut PgConnection,
    cdn_id: i64,
    xml_id: &str,
    active: bool,
    at: DateTime<Utc>,
) -> i64 {
    let http = type_id(conn, "HTTP").await;
    let host_regexp = type_id(conn, "HOST_REGEXP").await;
    let ds_id: i64 = sqlx::query_scalar(
        "INSERT INTO deliveryservice (xml_id, active, type, cdn_id, ccr_dns_ttl, protocol, \
                                      tr_response_headers, last_updated) \
         VALUES ($1, $2, $3, $4, 3600, 1, 'X-Test: yes', $5) RETURNING id",
    )
    .bind(xml_id)
    .bind(active)
    .bind(http)
    .bind(cdn_id)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .unwrap();
    let regex_id: i64 = sqlx::query_scalar(
        "INSERT INTO regex (pattern, type, last_updated) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(format!(r".*\.{}\..*", xml_id))
    .bind(host_regexp)
    .bind(at)
    .fetch_one(&mut *conn)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO deliveryservice_regex (deliveryservice, regex, set_number, last_updated) \
         VALUES ($1, $2, 0, $3)",
    )
    .bind(ds_id)
    .bind(regex_id)
    .bind(at)
    .execute(&mut *conn)
    .await
    .unwrap();
    ds_id
}

pub async fn assign(conn: &mut PgConnection, ds_id: i64, server_id: i64, at: DateTime<Utc>) {
    sqlx::query(
        "INSERT INTO deliveryservice_server (deliveryservice, server, last_updated) VALUES ($1, $2, $3)",
    )
    .bind(ds_id)
    .bind(server_id)
    .bind(at)
    .execute(&mut *conn)
    .await
    .unwrap();
}

/// A small CDN with unique names.
pub struct Fixture {
    pub suffix: String,
    pub t0: DateTime<Utc>,
    pub cdn: String,
    pub cdn_id: i64,
    pub edge_cg: String,
    pub backup_cg: String,
    pub router_cg: String,
    pub edge_profile: String,
    pub router_profile: String,
    pub edge_profile_id: i64,
    pub router_profile_id: i64,
    pub edge_server_id: i64,
    pub xml_id: String,
    pub ds_id: i64,
    pub inactive_xml_id: String,
    pub topology: String,
    pub static_dns_time: DateTime<Utc>,
}

impl Fixture {
    pub async fn create(conn: &mut PgConnection) -> Self {
        let suffix = unique_suffix();
        let t0 = base_time();

        let edge_t = type_id(conn, "EDGE").await;
        let ccr_t = type_id(conn, "CCR").await;
        let rascal_t = type_id(conn, "RASCAL").await;
        let cg_t = type_id(conn, "EDGE_LOC").await;
        let a_record = type_id(conn, "A_RECORD").await;
        let reported = status_id(conn, "REPORTED").await;
        let online = status_id(conn, "ONLINE").await;
        let offline = status_id(conn, "OFFLINE").await;

        let cdn = format!("cdn-{}", suffix);
        let cdn_id: i64 = sqlx::query_scalar(
            "INSERT INTO cdn (name, domain_name, last_updated) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&cdn)
        .bind(DOMAIN)
        .bind(t0)
        .fetch_one(&mut *conn)
        .await
        .unwrap();

        let coordinate: i64 = sqlx::query_scalar(
            "INSERT INTO coordinate (name, latitude, longitude, last_updated) \
             VALUES ($1, 40.0, -75.0, $2) RETURNING id",
        )
        .bind(format!("coord-{}", suffix))
        .bind(t0)
        .fetch_one(&mut *conn)
        .await
        .unwrap();

        let edge_cg = format!("edge-{}", suffix);
        let backup_cg = format!("backup-{}", suffix);
        let router_cg = format!("router-{}", suffix);
        let edge_cg_id = cachegroup(conn, &edge_cg, cg_t, Some(coordinate), t0).await;
        let backup_cg_id = cachegroup(conn, &backup_cg, cg_t, None, t0).await;
        let router_cg_id = cachegroup(conn, &router_cg, cg_t, Some(coordinate), t0).await;

        sqlx::query(
            "INSERT INTO cachegroup_fallbacks (primary_cg, backup_cg, set_order, last_updated) \
             VALUES ($1, $2, 1, $3)",
        )
        .bind(edge_cg_id)
        .bind(backup_cg_id)
        .bind(t0)
        .execute(&mut *conn)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO cachegroup_localization_method (cachegroup, method, last_updated) \
             VALUES ($1, 'CZ', $2)",
        )
        .bind(edge_cg_id)
        .bind(t0)
        .execute(&mut *conn)
        .await
        .unwrap();

        let edge_profile = format!("EDGE-{}", suffix);
        let router_profile = format!("CCR-{}", suffix);
        let edge_profile_id = profile(conn, &edge_profile, t0).await;
        let router_profile_id = profile(conn, &router_profile, t0).await;
        let monitor_profile_id = profile(conn, &format!("RASCAL-{}", suffix), t0).await;

        let geo_url = format!("http://geo.example/{}", suffix);
        add_param(conn, edge_profile_id, "geolocation.polling.url", "CRConfig.json", &geo_url, t0).await;
        add_param(conn, edge_profile_id, "tld.ttls.NS", "CRConfig.json", "3600", t0).await;
        add_param(conn, edge_profile_id, "weight", "CRConfig.json", "0.5", t0).await;
        add_param(conn, router_profile_id, "api.port", "server.xml", "3333", t0).await;

        let edge_server_id = server(
            conn, "edge1", edge_cg_id, edge_t, reported, edge_profile_id, cdn_id, "192.0.2.10", t0,
        )
        .await;
        let offline_server_id = server(
            conn, "edge2", edge_cg_id, edge_t, offline, edge_profile_id, cdn_id, "192.0.2.11", t0,
        )
        .await;
        server(
            conn, "ccr1", router_cg_id, ccr_t, online, router_profile_id, cdn_id, "192.0.2.20", t0,
        )
        .await;
        server(
            conn, "mon1", router_cg_id, rascal_t, online, monitor_profile_id, cdn_id, "192.0.2.30", t0,
        )
        .await;

        let topology = format!("topo-{}", suffix);
        sqlx::query("INSERT INTO topology (name, last_updated) VALUES ($1, $2)")
            .bind(&topology)
            .bind(t0)
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO topology_cachegroup (topology, cachegroup, last_updated) VALUES ($1, $2, $3)",
        )
        .bind(&topology)
        .bind(&edge_cg)
        .bind(t0)
        .execute(&mut *conn)
        .await
        .unwrap();

        let xml_id = format!("ds-{}", suffix);
        let ds_id = add_delivery_service(conn, cdn_id, &xml_id, true, t0).await;
        sqlx::query("UPDATE deliveryservice SET topology = $2, last_updated = $3 WHERE id = $1")
            .bind(ds_id)
            .bind(&topology)
            .bind(t0)
            .execute(&mut *conn)
            .await
            .unwrap();
        assign(conn, ds_id, edge_server_id, t0).await;
        assign(conn, ds_id, offline_server_id, t0).await;

        let static_dns_time = t0 + TimeDelta::minutes(10);
        sqlx::query(
            "INSERT INTO staticdnsentry (host, address, type, ttl, deliveryservice, last_updated) \
             VALUES ('www', '192.0.2.1', $1, 300, $2, $3)",
        )
        .bind(a_record)
        .bind(ds_id)
        .bind(static_dns_time)
        .execute(&mut *conn)
        .await
        .unwrap();

        let inactive_xml_id = format!("inactive-{}", suffix);
        let inactive_id = add_delivery_service(conn, cdn_id, &inactive_xml_id, false, t0).await;
        assign(conn, inactive_id, edge_server_id, t0).await;

        Self {
            suffix,
            t0,
            cdn,
            cdn_id,
            edge_cg,
            backup_cg,
            router_cg,
            edge_profile,
            router_profile,
            edge_profile_id,
            router_profile_id,
            edge_server_id,
            xml_id,
            ds_id,
            inactive_xml_id,
            topology,
            static_dns_time,
        }
    }

    /// The remap `edge1` answers to for the fixture delivery service.
    pub fn edge_remap(&self) -> String {
        format!("edge1.{}.{}", self.xml_id, DOMAIN)
    }
}
