// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot table integration tests.
//!
//! Each test runs in a transaction that is rolled back on drop.

mod common;

use chrono::{DateTime, TimeDelta, Utc};
use common::*;
use crconfig_core::snapshot;
use sqlx::PgConnection;

async fn ds_versions(conn: &mut PgConnection, xml_id: &str) -> Vec<(DateTime<Utc>, bool)> {
    sqlx::query_as(
        "SELECT last_updated, deleted FROM deliveryservice_snapshot \
         WHERE xml_id = $1 ORDER BY last_updated",
    )
    .bind(xml_id)
    .fetch_all(&mut *conn)
    .await
    .unwrap()
}

async fn static_dns_versions(conn: &mut PgConnection, ds_id: i64) -> Vec<(DateTime<Utc>, bool)> {
    sqlx::query_as(
        "SELECT last_updated, deleted FROM staticdnsentry_snapshot \
         WHERE deliveryservice = $1 ORDER BY last_updated",
    )
    .bind(ds_id)
    .fetch_all(&mut *conn)
    .await
    .unwrap()
}

async fn assignment_count(conn: &mut PgConnection, ds_id: i64) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM deliveryservice_server_snapshot WHERE deliveryservice = $1",
    )
    .bind(ds_id)
    .fetch_one(&mut *conn)
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_snapshot_copies_live_rows() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();

    let versions = ds_versions(&mut tx, &fx.xml_id).await;
    assert_eq!(versions, vec![(fx.t0, false)]);
    let statics = static_dns_versions(&mut tx, fx.ds_id).await;
    assert_eq!(statics, vec![(fx.static_dns_time, false)]);
    assert_eq!(assignment_count(&mut tx, fx.ds_id).await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_snapshot_twice_without_changes_is_noop() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM server_snapshot")
        .fetch_one(&mut *tx)
        .await
        .unwrap();

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    let total_again: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM server_snapshot")
        .fetch_one(&mut *tx)
        .await
        .unwrap();

    assert_eq!(total, total_again);
    assert_eq!(ds_versions(&mut tx, &fx.xml_id).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_update_appends_new_version() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    sqlx::query("UPDATE deliveryservice SET routing_name = 'ccr' WHERE id = $1")
        .bind(fx.ds_id)
        .execute(&mut *tx)
        .await
        .unwrap();
    snapshot::update_snapshot_tables(&mut tx).await.unwrap();

    let versions = ds_versions(&mut tx, &fx.xml_id).await;
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0], (fx.t0, false));
    assert!(versions[1].0 > fx.t0);
    assert!(!versions[1].1);

    let routing_names: Vec<(String,)> = sqlx::query_as(
        "SELECT routing_name FROM deliveryservice_snapshot WHERE xml_id = $1 ORDER BY last_updated",
    )
    .bind(&fx.xml_id)
    .fetch_all(&mut *tx)
    .await
    .unwrap();
    assert_eq!(
        routing_names,
        vec![("cdn".to_string(),), ("ccr".to_string(),)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_deleted_row_gets_single_marker() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    sqlx::query("DELETE FROM staticdnsentry WHERE deliveryservice = $1")
        .bind(fx.ds_id)
        .execute(&mut *tx)
        .await
        .unwrap();

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    let statics = static_dns_versions(&mut tx, fx.ds_id).await;
    assert_eq!(statics.len(), 2);
    assert_eq!(statics[0], (fx.static_dns_time, false));
    assert!(statics[1].1, "latest row should be a deletion marker");
    assert!(statics[1].0 > fx.static_dns_time);

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    assert_eq!(static_dns_versions(&mut tx, fx.ds_id).await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_reinserted_key_after_delete_is_captured() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    sqlx::query("DELETE FROM deliveryservice_server WHERE deliveryservice = $1 AND server = $2")
        .bind(fx.ds_id)
        .bind(fx.edge_server_id)
        .execute(&mut *tx)
        .await
        .unwrap();
    snapshot::update_snapshot_tables(&mut tx).await.unwrap();

    // Later than the deletion marker, as a reinsert in a new transaction would be.
    let reinserted_at = Utc::now() + TimeDelta::hours(1);
    assign(&mut tx, fx.ds_id, fx.edge_server_id, reinserted_at).await;
    snapshot::update_snapshot_tables(&mut tx).await.unwrap();

    let rows: Vec<(bool,)> = sqlx::query_as(
        "SELECT deleted FROM deliveryservice_server_snapshot \
         WHERE deliveryservice = $1 AND server = $2 ORDER BY last_updated",
    )
    .bind(fx.ds_id)
    .bind(fx.edge_server_id)
    .fetch_all(&mut *tx)
    .await
    .unwrap();
    assert_eq!(rows, vec![(false,), (true,), (false,)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_reinsert_older_than_marker_is_revived() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    sqlx::query("DELETE FROM deliveryservice_server WHERE deliveryservice = $1 AND server = $2")
        .bind(fx.ds_id)
        .bind(fx.edge_server_id)
        .execute(&mut *tx)
        .await
        .unwrap();
    snapshot::update_snapshot_tables(&mut tx).await.unwrap();

    // Same timestamp as the original row, so earlier than the marker.
    assign(&mut tx, fx.ds_id, fx.edge_server_id, fx.t0).await;
    snapshot::update_snapshot_tables(&mut tx).await.unwrap();

    let rows: Vec<(DateTime<Utc>, bool)> = sqlx::query_as(
        "SELECT last_updated, deleted FROM deliveryservice_server_snapshot \
         WHERE deliveryservice = $1 AND server = $2 ORDER BY last_updated",
    )
    .bind(fx.ds_id)
    .bind(fx.edge_server_id)
    .fetch_all(&mut *tx)
    .await
    .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], (fx.t0, false));
    assert!(rows[1].1);
    assert!(!rows[2].1, "latest row should be the revived assignment");
    assert!(rows[2].0 > rows[1].0);

    // Revived once; later passes leave the key alone.
    snapshot::update_snapshot_tables(&mut tx).await.unwrap();
    assert_eq!(assignment_count(&mut tx, fx.ds_id).await, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_ds_snapshot_scopes_assignments() {
    skip_if_no_db!();
    let db = TestDb::new().await.expect("Failed to connect to test database");
    let mut tx = db.begin().await;
    let fx = Fixture::create(&mut tx).await;

    let other_xml_id = format!("other-{}", fx.suffix);
    let other_id = add_delivery_service(&mut tx, fx.cdn_id, &other_xml_id, true, fx.t0).await;
    assign(&mut tx, other_id, fx.edge_server_id, fx.t0).await;

    snapshot::update_snapshot_tables_for_ds(&mut tx, fx.ds_id)
        .await
        .unwrap();

    assert_eq!(assignment_count(&mut tx, fx.ds_id).await, 2);
    assert_eq!(assignment_count(&mut tx, other_id).await, 0);
    // Other tables are snapshotted in full.
    assert_eq!(ds_versions(&mut tx, &other_xml_id).await.len(), 1);
}
