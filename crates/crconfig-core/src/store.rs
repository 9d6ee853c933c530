// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot store.
//!
//! A commit advances every `*_snapshot` table to the live state and moves the
//! CDN's row in the `snapshot` pointer table to the commit time. Reading a
//! committed snapshot recompiles the CRConfig from the snapshot tables as of
//! that time, so no document blob is stored. The monitoring document is
//! stored in the pointer row.
//!
//! Concurrent commits for the same CDN are not serialized: the last commit to
//! write the pointer row wins.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{info, instrument};

use crate::crconfig::{self, CrConfig, MakeOptions, Source};
use crate::error::{Error, Result, ResultExt};
use crate::monitoring;
use crate::snapshot;

/// Monitoring blob returned for a CDN that exists but has none stored.
pub const EMPTY_MONITORING: &str = "{}";

async fn cdn_exists(conn: &mut PgConnection, cdn: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM cdn WHERE name = $1")
        .bind(cdn)
        .fetch_optional(&mut *conn)
        .await
        .context("checking CDN existence")?;
    Ok(row.is_some())
}

/// Point the CDN's snapshot at the current time.
///
/// `clock_timestamp()` rather than `now()`, so the pointer is never behind a
/// deletion marker written earlier in the same transaction.
async fn upsert_snapshot_time(conn: &mut PgConnection, cdn: &str) -> Result<DateTime<Utc>> {
    let (time,): (DateTime<Utc>,) = sqlx::query_as(
        "INSERT INTO snapshot (cdn, time) VALUES ($1, clock_timestamp()) \
         ON CONFLICT (cdn) DO UPDATE SET time = clock_timestamp() \
         RETURNING time",
    )
    .bind(cdn)
    .fetch_one(&mut *conn)
    .await
    .context("updating snapshot time")?;
    Ok(time)
}

/// Snapshot every table and move the CDN's pointer.
///
/// Returns the new snapshot time, or `None` if the CDN does not exist.
#[instrument(skip(conn))]
pub async fn snapshot(conn: &mut PgConnection, cdn: &str) -> Result<Option<DateTime<Utc>>> {
    if !cdn_exists(conn, cdn).await? {
        return Ok(None);
    }
    snapshot::update_snapshot_tables(conn)
        .await
        .context("updating snapshot tables")?;
    let time = upsert_snapshot_time(conn, cdn).await?;
    info!(cdn = %cdn, time = %time, "Snapshot committed");
    Ok(Some(time))
}

/// Snapshot after a change to one delivery service and move the pointer of
/// the delivery service's CDN.
///
/// Returns the new snapshot time, or `None` if the delivery service does not
/// exist.
#[instrument(skip(conn))]
pub async fn snapshot_ds(conn: &mut PgConnection, xml_id: &str) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(i64, String)> = sqlx::query_as(
        "SELECT ds.id, c.name FROM deliveryservice AS ds \
         JOIN cdn AS c ON c.id = ds.cdn_id \
         WHERE ds.xml_id = $1",
    )
    .bind(xml_id)
    .fetch_optional(&mut *conn)
    .await
    .context("querying deliveryservice")?;
    let Some((ds_id, cdn)) = row else {
        return Ok(None);
    };

    snapshot::update_snapshot_tables_for_ds(conn, ds_id)
        .await
        .context("updating snapshot tables for deliveryservice")?;
    let time = upsert_snapshot_time(conn, &cdn).await?;
    info!(deliveryservice = %xml_id, cdn = %cdn, time = %time, "Deliveryservice snapshot committed");
    Ok(Some(time))
}

/// Store the monitoring document in the CDN's pointer row. The CDN must have
/// been snapshotted.
#[instrument(skip(conn, monitoring))]
pub async fn set_snapshot_monitoring(
    conn: &mut PgConnection,
    cdn: &str,
    monitoring: &str,
) -> Result<()> {
    let res = sqlx::query("UPDATE snapshot SET monitoring = $2::json WHERE cdn = $1")
        .bind(cdn)
        .bind(monitoring)
        .execute(&mut *conn)
        .await
        .context("updating snapshot monitoring")?;
    if res.rows_affected() == 0 {
        return Err(Error::not_found(format!("cdn '{}' has no snapshot", cdn)));
    }
    Ok(())
}

/// The stored monitoring document.
///
/// `None` if the CDN does not exist, [`EMPTY_MONITORING`] if it was never
/// snapshotted or has no document stored.
pub async fn get_snapshot_monitoring(conn: &mut PgConnection, cdn: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        "SELECT s.monitoring::text FROM cdn AS c \
         LEFT JOIN snapshot AS s ON s.cdn = c.name \
         WHERE c.name = $1",
    )
    .bind(cdn)
    .fetch_optional(&mut *conn)
    .await
    .context("querying snapshot monitoring")?;
    Ok(row.map(|(monitoring,)| monitoring.unwrap_or_else(|| EMPTY_MONITORING.to_string())))
}

/// The CDN's snapshot time, `None` if it was never snapshotted.
pub async fn get_snapshot_time(conn: &mut PgConnection, cdn: &str) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as("SELECT time FROM snapshot WHERE cdn = $1")
        .bind(cdn)
        .fetch_optional(&mut *conn)
        .await
        .context("querying snapshot time")?;
    Ok(row.map(|(time,)| time))
}

/// Compile the CRConfig as of the CDN's snapshot.
///
/// `stats.date` is the snapshot time rather than `opts.generated_at`.
/// Returns `None` if the CDN was never snapshotted.
#[instrument(skip(conn, opts))]
pub async fn get_snapshot(
    conn: &mut PgConnection,
    cdn: &str,
    opts: &MakeOptions,
) -> Result<Option<(CrConfig, DateTime<Utc>)>> {
    let Some(time) = get_snapshot_time(conn, cdn).await? else {
        return Ok(None);
    };
    let opts = MakeOptions {
        generated_at: time,
        ..opts.clone()
    };
    let doc = crconfig::make(conn, cdn, Source::Snapshot, &opts)
        .await
        .context("making CRConfig from snapshot")?;
    Ok(Some((doc, time)))
}

/// Snapshot the CDN, compile the committed document and store its
/// monitoring document.
///
/// Returns `None` if the CDN does not exist.
#[instrument(skip(conn, opts))]
pub async fn commit_snapshot(
    conn: &mut PgConnection,
    cdn: &str,
    opts: &MakeOptions,
) -> Result<Option<(CrConfig, DateTime<Utc>)>> {
    if snapshot(conn, cdn).await?.is_none() {
        return Ok(None);
    }
    let Some((doc, time)) = get_snapshot(conn, cdn, opts).await? else {
        return Err(Error::internal(format!(
            "cdn '{}' has no snapshot after commit",
            cdn
        )));
    };
    let monitoring = serde_json::to_string(&monitoring::make_monitoring(&doc))
        .context("serializing monitoring config")?;
    set_snapshot_monitoring(conn, cdn, &monitoring).await?;
    Ok(Some((doc, time)))
}
