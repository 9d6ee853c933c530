// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery services.
//!
//! Match sets, domains and static DNS entries for the whole CDN are fetched
//! once and looked up by `xml_id` while the delivery service rows are
//! assembled. A delivery service's freshness folds its own row, its regex and
//! `deliveryservice_regex` rows, its static DNS entries and its server
//! assignments.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, warn};

use super::servers::ServerDsAssignments;
use super::{
    ANY_MAP_TYPE, BypassDestination, DeepCachingType, DeliveryService, Dispersion, GeoEnabled,
    LastModified, MatchItem, MatchSet, MissLocation, Protocol, Soa, Source, StaticDnsEntry, Ttls,
};
use crate::error::{Error, Result, ResultExt};
use crate::snapshot;

/// SOA admin mailbox.
pub const CDN_SOA_ADMIN: &str = "traffic_ops";
/// SOA expire, seconds.
pub const CDN_SOA_EXPIRE: i64 = 604_800;
/// SOA minimum, seconds.
pub const CDN_SOA_MINIMUM: i64 = 30;
/// SOA refresh, seconds.
pub const CDN_SOA_REFRESH: i64 = 28_800;
/// SOA retry, seconds.
pub const CDN_SOA_RETRY: i64 = 7_200;

/// `SOA` record TTL without a `tld.ttls.SOA` parameter.
pub const DEFAULT_TLD_TTL_SOA: i64 = 86_400;
/// `NS` record TTL without a `tld.ttls.NS` parameter.
pub const DEFAULT_TLD_TTL_NS: i64 = 3_600;

/// Geolocation provider 0, the default.
pub const GEO_PROVIDER_MAXMIND: &str = "maxmindGeolocationService";
/// Geolocation provider 1.
pub const GEO_PROVIDER_NEUSTAR: &str = "neustarGeolocationService";

/// Parameter names that must agree across every server profile in the CDN.
pub const DS_PARAM_NAMES: [&str; 8] = [
    "tld.soa.admin",
    "tld.soa.expire",
    "tld.soa.minimum",
    "tld.soa.refresh",
    "tld.soa.retry",
    "tld.ttls.SOA",
    "tld.ttls.NS",
    "LogRequestHeaders",
];

/// Routing family of a delivery service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsCategory {
    /// `HTTP*` types.
    Http,
    /// `DNS*` types.
    Dns,
    /// Steering, any-map and the like.
    Other,
}

impl DsCategory {
    /// Classify a type name, case-insensitively.
    pub fn from_type(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("http") {
            Self::Http
        } else if lower.starts_with("dns") {
            Self::Dns
        } else {
            Self::Other
        }
    }

    /// Match set protocol string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Dns => "DNS",
            Self::Other => "",
        }
    }
}

/// `min(value, ttl_override)` when an override is in force.
pub fn cap_ttl<T: Ord + From<i32>>(value: T, ttl_override: Option<i32>) -> T {
    match ttl_override {
        Some(o) => value.min(T::from(o)),
        None => value,
    }
}

/// CDN-wide SOA defaults, each capped by the override.
pub fn cdn_soa(ttl_override: Option<i32>) -> Soa {
    Soa {
        admin: CDN_SOA_ADMIN.to_string(),
        expire: cap_ttl(CDN_SOA_EXPIRE, ttl_override).to_string(),
        minimum: cap_ttl(CDN_SOA_MINIMUM, ttl_override).to_string(),
        refresh: cap_ttl(CDN_SOA_REFRESH, ttl_override).to_string(),
        retry: cap_ttl(CDN_SOA_RETRY, ttl_override).to_string(),
    }
}

/// Map the stored protocol code. Unknown or absent codes behave like 0.
///
/// | code | acceptHttp | acceptHttps | redirectToHttps |
/// |------|------------|-------------|-----------------|
/// | 0 | (omitted) | false | false |
/// | 1 | false | true | false |
/// | 2 | (omitted) | true | false |
/// | 3 | (omitted) | true | true |
pub fn protocol(code: Option<i16>) -> Protocol {
    match code {
        Some(1) => Protocol {
            accept_http: Some(false),
            accept_https: true,
            redirect_to_https: false,
        },
        Some(2) => Protocol {
            accept_http: None,
            accept_https: true,
            redirect_to_https: false,
        },
        Some(3) => Protocol {
            accept_http: None,
            accept_https: true,
            redirect_to_https: true,
        },
        _ => Protocol::default(),
    }
}

/// Map the stored geolocation provider code.
pub fn geo_provider(code: i16) -> &'static str {
    match code {
        1 => GEO_PROVIDER_NEUSTAR,
        _ => GEO_PROVIDER_MAXMIND,
    }
}

fn header_lines(raw: &str) -> impl Iterator<Item = String> {
    raw.replace("__RETURN__", "\n")
        .split('\n')
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}

/// Parse `Name: value` lines separated by newlines or `__RETURN__`.
pub fn parse_response_headers(raw: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for line in header_lines(raw) {
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.trim_matches(|c| c == ' ' || c == '\n' || c == '"')),
            None => (line.as_str(), ""),
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        headers.insert(name.to_string(), value.to_string());
    }
    headers
}

/// Header names from lines separated by newlines or `__RETURN__`.
///
/// One name per line, blank lines included, so a trailing separator yields
/// an empty name.
pub fn parse_request_headers(raw: &str) -> Vec<String> {
    header_lines(raw)
        .map(|line| line.split(':').next().unwrap_or_default().trim().to_string())
        .collect()
}

/// Collapse per-profile parameters into one value per recognised name.
///
/// Two profiles supplying different values for a name in [`DS_PARAM_NAMES`]
/// is an [`ErrorKind::Conflict`](crate::error::ErrorKind::Conflict) naming both
/// profiles and both values.
pub fn get_ds_params(
    server_params: &BTreeMap<String, BTreeMap<String, String>>,
) -> Result<BTreeMap<String, String>> {
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    let mut origin: HashMap<&str, &str> = HashMap::new();
    for (profile, profile_params) in server_params {
        for name in DS_PARAM_NAMES {
            let Some(value) = profile_params.get(name) else {
                continue;
            };
            if let Some(existing) = params.get(name) {
                if existing != value {
                    return Err(Error::conflict(format!(
                        "profiles {} and {} have conflicting values '{}' and '{}' for parameter {}",
                        origin.get(name).copied().unwrap_or_default(),
                        profile,
                        existing,
                        value,
                        name
                    )));
                }
                continue;
            }
            params.insert(name.to_string(), value.clone());
            origin.insert(name, profile);
        }
    }
    Ok(params)
}

/// Parameters of every profile used by a server in the CDN, keyed by
/// profile name then parameter name.
pub async fn get_server_profile_params(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let q = format!(
        "SELECT pr.name AS profile, p.name, p.value \
         FROM {profile} AS pr \
         JOIN {pp} AS pp ON pp.profile = pr.id \
         JOIN {param} AS p ON p.id = pp.parameter \
         WHERE pr.id IN (SELECT s.profile FROM {server} AS s \
                         WHERE s.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1)) \
         ORDER BY pr.name, p.name, p.value",
        profile = source.table(&snapshot::PROFILE),
        pp = source.table(&snapshot::PROFILE_PARAMETER),
        param = source.table(&snapshot::PARAMETER),
        server = source.table(&snapshot::SERVER),
        cdn = source.table(&snapshot::CDN),
    );
    let rows: Vec<(String, String, String)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying server profile parameters")?;

    let mut params: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for (profile, name, value) in rows {
        params.entry(profile).or_default().insert(name, value);
    }
    Ok(params)
}

/// Remove `\`, `.*` and `.` from a host regex.
pub fn strip_domain_pattern(pattern: &str) -> String {
    pattern.replace('\\', "").replace(".*", "").replace('.', "")
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RegexRow {
    pub xml_id: String,
    pub pattern: String,
    pub regex_type: String,
    pub ds_type: String,
    pub set_number: i32,
    pub last_updated: DateTime<Utc>,
}

/// Match sets, domains and freshness of every delivery service's regexes.
#[derive(Debug, Clone, Default)]
pub struct DsRegexes {
    /// `xml_id` to match sets in `set_number` order.
    pub match_sets: HashMap<String, Vec<MatchSet>>,
    /// `xml_id` to host names.
    pub domains: HashMap<String, Vec<String>>,
    /// `xml_id` to newest regex or `deliveryservice_regex` row.
    pub modified: HashMap<String, LastModified>,
}

fn match_type(regex_type: &str) -> Option<&'static str> {
    match regex_type {
        "HOST_REGEXP" => Some("HOST"),
        "PATH_REGEXP" => Some("PATH"),
        "HEADER_REGEXP" => Some("HEADER"),
        _ => None,
    }
}

/// Build match sets from regex rows, one set per recognised regex.
///
/// Sets are ordered by `set_number`, ties keeping row order. Regexes of
/// unrecognised type are skipped without leaving a gap.
pub(crate) fn build_ds_regexes(mut rows: Vec<RegexRow>, domain: &str) -> DsRegexes {
    rows.sort_by_key(|row| row.set_number);
    let mut regexes = DsRegexes::default();
    for row in rows {
        regexes
            .modified
            .entry(row.xml_id.clone())
            .or_default()
            .observe(row.last_updated);

        let Some(match_type) = match_type(&row.regex_type) else {
            debug!(
                deliveryservice = %row.xml_id,
                regex_type = %row.regex_type,
                "Unknown deliveryservice regex type, skipping"
            );
            continue;
        };

        if row.regex_type == "HOST_REGEXP" && row.set_number == 0 {
            regexes
                .domains
                .entry(row.xml_id.clone())
                .or_default()
                .push(format!("{}.{}", strip_domain_pattern(&row.pattern), domain));
        }

        regexes
            .match_sets
            .entry(row.xml_id)
            .or_default()
            .push(MatchSet {
                protocol: DsCategory::from_type(&row.ds_type).as_str().to_string(),
                match_list: vec![MatchItem {
                    match_type: match_type.to_string(),
                    regex: row.pattern,
                }],
            });
    }
    regexes
}

/// Fetch and group every active delivery service's regexes.
pub async fn get_ds_regexes_domains(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
    domain: &str,
) -> Result<DsRegexes> {
    let q = format!(
        "SELECT ds.xml_id, r.pattern, rt.name AS regex_type, dt.name AS ds_type, \
                COALESCE(dsr.set_number, 0) AS set_number, \
                GREATEST(r.last_updated, dsr.last_updated) AS last_updated \
         FROM {regex} AS r \
         JOIN {dsr} AS dsr ON dsr.regex = r.id \
         JOIN {ds} AS ds ON ds.id = dsr.deliveryservice \
         JOIN {typ} AS rt ON rt.id = r.type \
         JOIN {typ} AS dt ON dt.id = ds.type \
         WHERE ds.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND ds.active \
         ORDER BY ds.xml_id, set_number, r.id",
        regex = source.table(&snapshot::REGEX),
        dsr = source.table(&snapshot::DELIVERY_SERVICE_REGEX),
        ds = source.table(&snapshot::DELIVERY_SERVICE),
        typ = source.table(&snapshot::TYPE),
        cdn = source.table(&snapshot::CDN),
    );
    let rows = sqlx::query_as::<_, RegexRow>(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying deliveryservice regexes")?;
    Ok(build_ds_regexes(rows, domain))
}

/// Static DNS entries of every active delivery service, keyed by `xml_id`,
/// with the newest entry row per delivery service.
pub async fn get_static_dns_entries(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<(HashMap<String, Vec<StaticDnsEntry>>, HashMap<String, LastModified>)> {
    let q = format!(
        "SELECT ds.xml_id, e.host, e.ttl, e.address, t.name AS entry_type, e.last_updated \
         FROM {sde} AS e \
         JOIN {ds} AS ds ON ds.id = e.deliveryservice \
         JOIN {typ} AS t ON t.id = e.type \
         WHERE ds.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND ds.active \
         ORDER BY ds.xml_id, e.host, e.id",
        sde = source.table(&snapshot::STATIC_DNS_ENTRY),
        ds = source.table(&snapshot::DELIVERY_SERVICE),
        typ = source.table(&snapshot::TYPE),
        cdn = source.table(&snapshot::CDN),
    );
    let rows: Vec<(String, String, i64, String, String, DateTime<Utc>)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying static DNS entries")?;

    let mut entries: HashMap<String, Vec<StaticDnsEntry>> = HashMap::new();
    let mut modified: HashMap<String, LastModified> = HashMap::new();
    for (xml_id, host, ttl, address, entry_type, last_updated) in rows {
        modified.entry(xml_id.clone()).or_default().observe(last_updated);
        entries.entry(xml_id).or_default().push(StaticDnsEntry {
            name: host,
            ttl,
            entry_type: entry_type.replace("_RECORD", ""),
            value: address,
        });
    }
    Ok((entries, modified))
}

#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub(crate) struct DsRow {
    pub xml_id: String,
    pub anonymous_blocking_enabled: bool,
    pub consistent_hash_regex: Option<String>,
    pub deep_caching_type: Option<String>,
    pub initial_dispersion: Option<i32>,
    pub dns_bypass_cname: Option<String>,
    pub dns_bypass_ip: Option<String>,
    pub dns_bypass_ip6: Option<String>,
    pub dns_bypass_ttl: Option<i32>,
    pub routing_name: String,
    pub ccr_dns_ttl: Option<i32>,
    pub ecs_enabled: bool,
    pub regional_geo_blocking: bool,
    pub geo_limit: i16,
    pub geo_limit_countries: Option<String>,
    pub geolimit_redirect_url: Option<String>,
    pub geo_provider: i16,
    pub http_bypass_fqdn: Option<String>,
    pub ipv6_routing_enabled: Option<bool>,
    pub max_dns_answers: Option<i32>,
    pub miss_lat: Option<f64>,
    pub miss_long: Option<f64>,
    pub profile: Option<String>,
    pub protocol: Option<i16>,
    pub topology: Option<String>,
    pub tr_request_headers: Option<String>,
    pub tr_response_headers: Option<String>,
    pub ds_type: String,
    pub last_updated: DateTime<Utc>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

fn ttl_param(
    ds_params: &BTreeMap<String, String>,
    name: &str,
    default: i64,
    xml_id: &str,
    profile: &str,
) -> i64 {
    match ds_params.get(name) {
        Some(raw) => match raw.parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    deliveryservice = %xml_id,
                    profile = %profile,
                    param = %name,
                    value = %raw,
                    "Parameter is not a number, using default"
                );
                default
            }
        },
        None => default,
    }
}

/// Assemble one delivery service from its row. Match sets, domains and static
/// DNS entries are attached by the caller.
pub(crate) fn assemble_delivery_service(
    row: DsRow,
    soa: &Soa,
    ds_params: &BTreeMap<String, String>,
    ttl_override: Option<i32>,
) -> DeliveryService {
    let category = DsCategory::from_type(&row.ds_type);
    let protocol = protocol(row.protocol);
    let ttl = row.ccr_dns_ttl.map(|t| cap_ttl(t, ttl_override));

    let mut ds = DeliveryService {
        ssl_enabled: protocol.accept_https,
        protocol,
        geolocation_provider: geo_provider(row.geo_provider).to_string(),
        routing_name: row.routing_name,
        soa: soa.clone(),
        ttl,
        topology: row.topology,
        consistent_hash_regex: non_empty(row.consistent_hash_regex),
        deep_caching_type: row.deep_caching_type.as_deref().map(DeepCachingType::from_db),
        ip6_routing_enabled: row.ipv6_routing_enabled.unwrap_or(false),
        ecs_enabled: row.ecs_enabled,
        modified: LastModified::at(row.last_updated),
        ..Default::default()
    };

    match (row.miss_lat, row.miss_long) {
        (Some(lat), Some(long)) => ds.miss_location = Some(MissLocation { lat, long }),
        (None, None) => {}
        _ => warn!(
            deliveryservice = %row.xml_id,
            "Miss latitude and longitude must both be set, omitting miss location"
        ),
    }

    match row.geo_limit {
        0 => {}
        1 => {
            ds.coverage_zone_only = true;
            if category == DsCategory::Http {
                ds.geo_limit_redirect_url = Some(row.geolimit_redirect_url.unwrap_or_default());
            }
        }
        _ => {
            if category == DsCategory::Http {
                ds.geo_limit_redirect_url = Some(row.geolimit_redirect_url.unwrap_or_default());
            }
            if let Some(countries) = row.geo_limit_countries {
                ds.geo_enabled = countries
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(|c| GeoEnabled {
                        country_code: c.to_string(),
                    })
                    .collect();
            }
        }
    }

    let mut ns = DEFAULT_TLD_TTL_NS;
    let mut soa_ttl = DEFAULT_TLD_TTL_SOA;
    if let Some(profile) = &row.profile {
        soa_ttl = ttl_param(ds_params, "tld.ttls.SOA", soa_ttl, &row.xml_id, profile);
        ns = ttl_param(ds_params, "tld.ttls.NS", ns, &row.xml_id, profile);
    }
    let a = ttl.map(|t| t.to_string()).unwrap_or_default();
    ds.ttls = Ttls {
        aaaa: a.clone(),
        a,
        ns: cap_ttl(ns, ttl_override).to_string(),
        soa: cap_ttl(soa_ttl, ttl_override).to_string(),
    };

    match category {
        DsCategory::Dns => {
            let dest = BypassDestination {
                ip: non_empty(row.dns_bypass_ip),
                ip6: non_empty(row.dns_bypass_ip6),
                ttl: row.dns_bypass_ttl.map(|t| cap_ttl(t, ttl_override)),
                cname: non_empty(row.dns_bypass_cname),
                ..Default::default()
            };
            if !dest.is_empty() {
                ds.bypass_destination.insert("DNS".to_string(), dest);
            }
            ds.max_dns_ips_for_location = row.max_dns_answers;
        }
        DsCategory::Http => {
            if let Some(fqdn) = non_empty(row.http_bypass_fqdn) {
                let mut parts = fqdn.split(':');
                let dest = BypassDestination {
                    fqdn: parts.next().map(str::to_string),
                    port: parts.next().map(str::to_string),
                    ..Default::default()
                };
                ds.bypass_destination.insert("HTTP".to_string(), dest);
            }
            ds.regional_geo_blocking = Some(row.regional_geo_blocking);
            ds.anonymous_blocking_enabled = Some(row.anonymous_blocking_enabled);
            ds.dispersion = row.initial_dispersion.map(|limit| Dispersion {
                limit,
                shuffled: true,
            });
        }
        DsCategory::Other => {}
    }

    if let Some(raw) = row.tr_response_headers.filter(|s| !s.is_empty()) {
        ds.response_headers = parse_response_headers(&raw);
    }
    if let Some(raw) = row.tr_request_headers.filter(|s| !s.is_empty()) {
        ds.request_headers = parse_request_headers(&raw);
    }
    ds
}

/// Build every active, routed delivery service in the CDN.
pub async fn make_delivery_services(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
    domain: &str,
    ttl_override: Option<i32>,
    assignments: &ServerDsAssignments,
) -> Result<(BTreeMap<String, DeliveryService>, LastModified)> {
    let soa = cdn_soa(ttl_override);

    let server_params = get_server_profile_params(conn, cdn, source)
        .await
        .context("getting deliveryservice parameters")?;
    let ds_params = get_ds_params(&server_params).context("getting deliveryservice server parameters")?;
    let mut regexes = get_ds_regexes_domains(conn, cdn, source, domain)
        .await
        .context("getting regex matchsets")?;
    let (mut static_entries, static_modified) = get_static_dns_entries(conn, cdn, source)
        .await
        .context("getting static DNS entries")?;

    let q = format!(
        "SELECT ds.xml_id, ds.anonymous_blocking_enabled, ds.consistent_hash_regex, ds.deep_caching_type, \
                ds.initial_dispersion, ds.dns_bypass_cname, ds.dns_bypass_ip, ds.dns_bypass_ip6, \
                ds.dns_bypass_ttl, ds.routing_name, ds.ccr_dns_ttl, ds.ecs_enabled, \
                ds.regional_geo_blocking, ds.geo_limit, ds.geo_limit_countries, ds.geolimit_redirect_url, \
                ds.geo_provider, ds.http_bypass_fqdn, ds.ipv6_routing_enabled, ds.max_dns_answers, \
                ds.miss_lat, ds.miss_long, p.name AS profile, ds.protocol, ds.topology, \
                ds.tr_request_headers, ds.tr_response_headers, t.name AS ds_type, ds.last_updated \
         FROM {ds} AS ds \
         JOIN {typ} AS t ON t.id = ds.type \
         LEFT JOIN {profile} AS p ON p.id = ds.profile \
         WHERE ds.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND ds.active \
         AND t.name <> '{any_map}' \
         ORDER BY ds.xml_id",
        ds = source.table(&snapshot::DELIVERY_SERVICE),
        typ = source.table(&snapshot::TYPE),
        profile = source.table(&snapshot::PROFILE),
        cdn = source.table(&snapshot::CDN),
        any_map = ANY_MAP_TYPE,
    );
    let rows = sqlx::query_as::<_, DsRow>(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying deliveryservices")?;

    let mut dses = BTreeMap::new();
    let mut modified = LastModified::default();
    for row in rows {
        let xml_id = row.xml_id.clone();
        let mut ds = assemble_delivery_service(row, &soa, &ds_params, ttl_override);

        match regexes.match_sets.remove(&xml_id) {
            Some(sets) => ds.match_sets = sets,
            None => warn!(deliveryservice = %xml_id, "No regex matchsets for deliveryservice"),
        }
        match regexes.domains.remove(&xml_id) {
            Some(domains) => ds.domains = domains,
            None => warn!(deliveryservice = %xml_id, "No host regex for deliveryservice"),
        }
        if let Some(mut entries) = static_entries.remove(&xml_id) {
            if let Some(ttl) = ttl_override {
                for entry in &mut entries {
                    entry.ttl = i64::from(ttl);
                }
            }
            ds.static_dns_entries = entries;
        }

        for m in [
            regexes.modified.get(&xml_id),
            static_modified.get(&xml_id),
            assignments.ds_modified.get(&xml_id),
        ]
        .into_iter()
        .flatten()
        {
            ds.modified.merge(*m);
        }
        modified.merge(ds.modified);
        dses.insert(xml_id, ds);
    }
    Ok((dses, modified))
}
