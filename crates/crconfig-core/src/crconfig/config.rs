// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The document's `config` section.
//!
//! Built from `CRConfig.json` parameters on the profiles of the CDN's
//! servers. `tld.soa.*` and `tld.ttls.*` parameters are grouped into the
//! `soa` and `ttls` maps with the prefix stripped; every other parameter is a
//! top-level string.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use super::{CdnInfo, ConfigValue, LastModified, Source};
use crate::error::{Result, ResultExt};
use crate::snapshot;

/// `config_file` of parameters that go into the document.
pub const CONFIG_FILE: &str = "CRConfig.json";

const SOA_PREFIX: &str = "tld.soa.";
const TTLS_PREFIX: &str = "tld.ttls.";

/// Partition `(name, value)` parameters into the `config` map.
///
/// Later duplicates of a name overwrite earlier ones. Empty grouped values
/// are dropped.
pub fn build_config<'a>(
    params: impl IntoIterator<Item = (&'a str, &'a str)>,
    info: &CdnInfo,
) -> BTreeMap<String, ConfigValue> {
    let mut config = BTreeMap::new();
    let mut soa = BTreeMap::new();
    let mut ttls = BTreeMap::new();
    for (name, value) in params {
        if let Some(key) = name.strip_prefix(SOA_PREFIX) {
            if !value.is_empty() {
                soa.insert(key.to_string(), value.to_string());
            }
        } else if let Some(key) = name.strip_prefix(TTLS_PREFIX) {
            if !value.is_empty() {
                ttls.insert(key.to_string(), value.to_string());
            }
        } else {
            config.insert(name.to_string(), ConfigValue::String(value.to_string()));
        }
    }
    if !soa.is_empty() {
        config.insert("soa".to_string(), ConfigValue::Map(soa));
    }
    if !ttls.is_empty() {
        config.insert("ttls".to_string(), ConfigValue::Map(ttls));
    }
    config.insert(
        "dnssec.enabled".to_string(),
        ConfigValue::String(info.dnssec_enabled.to_string()),
    );
    config.insert(
        "domain_name".to_string(),
        ConfigValue::String(info.domain_name.clone()),
    );
    config
}

/// Build the `config` section for `cdn`.
pub async fn make_config(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
    info: &CdnInfo,
) -> Result<(BTreeMap<String, ConfigValue>, LastModified)> {
    let q = format!(
        "SELECT DISTINCT p.name, p.value, p.last_updated \
         FROM {param} AS p \
         JOIN {pp} AS pp ON pp.parameter = p.id \
         WHERE p.config_file = '{config_file}' \
         AND pp.profile IN (SELECT s.profile FROM {server} AS s \
                            WHERE s.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1)) \
         ORDER BY p.name, p.value",
        param = source.table(&snapshot::PARAMETER),
        pp = source.table(&snapshot::PROFILE_PARAMETER),
        server = source.table(&snapshot::SERVER),
        cdn = source.table(&snapshot::CDN),
        config_file = CONFIG_FILE,
    );
    let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying CRConfig.json parameters")?;

    let mut modified = LastModified::default();
    for (_, _, last_updated) in &rows {
        modified.observe(*last_updated);
    }
    let config = build_config(rows.iter().map(|(n, v, _)| (n.as_str(), v.as_str())), info);
    Ok((config, modified))
}
