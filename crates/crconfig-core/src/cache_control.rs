// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ETag and conditional-request handling for committed snapshots.
//!
//! An ETag encodes a snapshot time as `"v0-<base36 unix nanoseconds>"`. A
//! request is answered with 304 only when the time it claims (from
//! `If-None-Match`, else `If-Modified-Since`) is not before the CDN's
//! snapshot time. Anything unparseable is treated as modified.

use axum::http::HeaderMap;
use axum::http::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use sqlx::PgConnection;
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::store;

/// Current ETag encoding version.
pub const ETAG_VERSION: &str = "v0";

/// Decoded times further than this from now are rejected.
const MAX_ETAG_DRIFT_DAYS: i64 = 365 * 20;

/// Outcome of a conditional snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    /// The client's copy is current.
    pub not_modified: bool,
    /// The CDN's snapshot time, for minting `ETag` and `Last-Modified`.
    pub snapshot_time: DateTime<Utc>,
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Encode `time` as a quoted ETag.
pub fn etag(time: DateTime<Utc>) -> String {
    let nanos = time.timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
    format!("\"{}-{}\"", ETAG_VERSION, to_base36(nanos))
}

/// Decode an ETag produced by [`etag`].
pub fn parse_etag(tag: &str) -> Result<DateTime<Utc>> {
    parse_etag_at(tag, Utc::now())
}

/// [`parse_etag`] with an explicit notion of now.
pub fn parse_etag_at(tag: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    let inner = tag
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| Error::invalid(format!("etag {:?} is not quoted", tag)))?;

    let (version, encoded) = inner
        .split_once('-')
        .ok_or_else(|| Error::invalid(format!("etag {:?} has no version", tag)))?;
    if version != ETAG_VERSION {
        return Err(Error::invalid(format!(
            "etag {:?} has unsupported version {:?}",
            tag, version
        )));
    }
    if encoded.is_empty() || !encoded.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::invalid(format!("etag {:?} has a malformed time", tag)));
    }
    let nanos = i64::from_str_radix(encoded, 36)
        .map_err(|e| Error::invalid(format!("etag {:?} time: {}", tag, e)))?;

    let time = Utc.timestamp_nanos(nanos);
    let drift = TimeDelta::days(MAX_ETAG_DRIFT_DAYS);
    if time > now + drift || time < now - drift {
        return Err(Error::invalid(format!(
            "etag {:?} time {} is too far from now",
            tag, time
        )));
    }
    Ok(time)
}

/// Parse an HTTP-date such as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn parse_if_modified_since(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::invalid(format!("If-Modified-Since {:?}: {}", value, e)))
}

/// Format `time` for a `Last-Modified` header.
pub fn last_modified(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn claimed_by_etags(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != "*")
        .filter_map(|t| match parse_etag_at(t, now) {
            Ok(time) => Some(time),
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable If-None-Match tag");
                None
            }
        })
        .max()
}

/// Whether the request's conditional headers are satisfied by
/// `snapshot_time`.
pub fn is_not_modified(headers: &HeaderMap, snapshot_time: DateTime<Utc>) -> bool {
    is_not_modified_at(headers, snapshot_time, Utc::now())
}

/// [`is_not_modified`] with an explicit notion of now.
pub fn is_not_modified_at(
    headers: &HeaderMap,
    snapshot_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let from_etags = headers
        .get_all(IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| claimed_by_etags(v, now))
        .max();
    if let Some(claimed) = from_etags {
        return snapshot_time <= claimed;
    }

    let Some(value) = headers.get(IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match parse_if_modified_since(value) {
        // HTTP-dates carry whole seconds.
        Ok(claimed) => snapshot_time.timestamp() <= claimed.timestamp(),
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable If-Modified-Since");
            false
        }
    }
}

/// Evaluate the request against the CDN's snapshot time. `None` when the CDN
/// has never been snapshotted.
pub async fn check_snapshot(
    conn: &mut PgConnection,
    headers: &HeaderMap,
    cdn: &str,
) -> Result<Option<Freshness>> {
    let Some(snapshot_time) = store::get_snapshot_time(conn, cdn)
        .await
        .context("getting snapshot time")?
    else {
        return Ok(None);
    };
    Ok(Some(Freshness {
        not_modified: is_not_modified(headers, snapshot_time),
        snapshot_time,
    }))
}
