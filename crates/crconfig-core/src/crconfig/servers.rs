// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content servers, routers and monitors.
//!
//! One query returns every eligible server in the CDN whatever its role; the
//! type name is resolved once into a [`ServerType`] and the row lands in the
//! matching map. Content servers whose profile does not disable routing are
//! decorated with the remap strings of their delivery services.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::warn;

use super::{ANY_MAP_TYPE, ContentRouter, ContentServer, ELIGIBLE_STATUSES, LastModified, Monitor, Source};
use crate::error::{Result, ResultExt};
use crate::snapshot;

/// Used when a server has no `weight` parameter.
pub const DEFAULT_WEIGHT: f64 = 0.999;
/// Used when a server has no `weightMultiplier` parameter.
pub const DEFAULT_WEIGHT_MULTIPLIER: f64 = 1000.0;

/// Role of a server, from its type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerType {
    /// `CCR`
    Router,
    /// `RASCAL`
    Monitor,
    /// `EDGE*`
    Edge,
    /// `MID*`
    Mid,
    /// Anything else. Not part of the document.
    Unknown(String),
}

impl ServerType {
    /// Classify a type name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "CCR" => Self::Router,
            "RASCAL" => Self::Monitor,
            n if n.starts_with("EDGE") => Self::Edge,
            n if n.starts_with("MID") => Self::Mid,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Edge or mid cache.
    pub fn is_cache(&self) -> bool {
        matches!(self, Self::Edge | Self::Mid)
    }
}

/// Number of consistent-hash ring slots. Truncates, never rounds: the router
/// builds the same ring from the same numbers.
pub fn hash_count(weight: f64, multiplier: f64) -> i64 {
    (weight * multiplier) as i64
}

/// Profile parameters that shape a server entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerParams {
    /// `api.port`
    pub api_port: Option<String>,
    /// `secure.api.port`
    pub secure_api_port: Option<String>,
    /// `weight`
    pub weight: Option<f64>,
    /// `weightMultiplier`
    pub weight_multiplier: Option<f64>,
}

impl ServerParams {
    fn apply(&mut self, host: &str, name: &str, value: &str) {
        match name {
            "api.port" => self.api_port = Some(value.to_string()),
            "secure.api.port" => self.secure_api_port = Some(value.to_string()),
            "weight" | "weightMultiplier" => match value.parse::<f64>() {
                Ok(v) if name == "weight" => self.weight = Some(v),
                Ok(v) => self.weight_multiplier = Some(v),
                Err(_) => warn!(
                    server = %host,
                    param = %name,
                    value = %value,
                    "Server parameter is not a number, ignoring"
                ),
            },
            _ => {}
        }
    }

    /// Hash count with defaults for missing parameters.
    pub fn hash_count(&self) -> i64 {
        hash_count(
            self.weight.unwrap_or(DEFAULT_WEIGHT),
            self.weight_multiplier.unwrap_or(DEFAULT_WEIGHT_MULTIPLIER),
        )
    }
}

/// Load [`ServerParams`] for every eligible server, keyed by host name.
pub async fn get_server_params(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<HashMap<String, ServerParams>> {
    let q = format!(
        "SELECT s.host_name, p.name, p.value \
         FROM {server} AS s \
         JOIN {pp} AS pp ON pp.profile = s.profile \
         JOIN {param} AS p ON p.id = pp.parameter \
         JOIN {status} AS st ON st.id = s.status \
         WHERE s.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND ((p.config_file = 'CRConfig.json' AND p.name IN ('weight', 'weightMultiplier')) \
              OR p.name IN ('api.port', 'secure.api.port')) \
         AND st.name IN {statuses} \
         ORDER BY s.host_name, p.name, p.id",
        server = source.table(&snapshot::SERVER),
        pp = source.table(&snapshot::PROFILE_PARAMETER),
        param = source.table(&snapshot::PARAMETER),
        status = source.table(&snapshot::STATUS),
        cdn = source.table(&snapshot::CDN),
        statuses = ELIGIBLE_STATUSES,
    );
    let rows: Vec<(String, String, String)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying server parameters")?;

    let mut params: HashMap<String, ServerParams> = HashMap::new();
    for (host, name, value) in rows {
        params.entry(host.clone()).or_default().apply(&host, &name, &value);
    }
    Ok(params)
}

/// Which delivery services each server is assigned to.
#[derive(Debug, Clone, Default)]
pub struct ServerDsAssignments {
    /// Host name to `xml_id`s.
    pub by_server: BTreeMap<String, Vec<String>>,
    /// Newest assignment row per host name.
    pub server_modified: HashMap<String, LastModified>,
    /// Newest assignment row per `xml_id`.
    pub ds_modified: HashMap<String, LastModified>,
}

impl ServerDsAssignments {
    fn add(&mut self, host: String, xml_id: String, last_updated: DateTime<Utc>) {
        self.server_modified
            .entry(host.clone())
            .or_default()
            .observe(last_updated);
        self.ds_modified
            .entry(xml_id.clone())
            .or_default()
            .observe(last_updated);
        self.by_server.entry(host).or_default().push(xml_id);
    }
}

/// Server to delivery service assignments for routable servers and active,
/// routed delivery services.
pub async fn get_server_ds_names(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
) -> Result<ServerDsAssignments> {
    let q = format!(
        "SELECT s.host_name, ds.xml_id, dss.last_updated \
         FROM {dss} AS dss \
         JOIN {server} AS s ON s.id = dss.server \
         JOIN {ds} AS ds ON ds.id = dss.deliveryservice \
         JOIN {typ} AS dt ON dt.id = ds.type \
         JOIN {profile} AS p ON p.id = s.profile \
         JOIN {status} AS st ON st.id = s.status \
         WHERE ds.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND ds.active \
         AND dt.name <> '{any_map}' \
         AND NOT p.routing_disabled \
         AND st.name IN {statuses} \
         ORDER BY s.host_name, ds.xml_id",
        dss = source.table(&snapshot::DELIVERY_SERVICE_SERVER),
        server = source.table(&snapshot::SERVER),
        ds = source.table(&snapshot::DELIVERY_SERVICE),
        typ = source.table(&snapshot::TYPE),
        profile = source.table(&snapshot::PROFILE),
        status = source.table(&snapshot::STATUS),
        cdn = source.table(&snapshot::CDN),
        any_map = ANY_MAP_TYPE,
        statuses = ELIGIBLE_STATUSES,
    );
    let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying server deliveryservice names")?;

    let mut assignments = ServerDsAssignments::default();
    for (host, xml_id, last_updated) in rows {
        assignments.add(host, xml_id, last_updated);
    }
    Ok(assignments)
}

/// Remove `\` and `.*` from a host regex.
pub fn strip_host_pattern(pattern: &str) -> String {
    pattern.replace('\\', "").replace(".*", "")
}

/// How a delivery service's host regex becomes a remap string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsRouteInfo {
    /// DNS-routed delivery service.
    pub is_dns: bool,
    /// Pattern has no wildcard and is used verbatim.
    pub is_raw: bool,
    /// Remap without the server host name prefix.
    pub remap: String,
}

impl DsRouteInfo {
    /// Build from one `HOST_REGEXP` pattern.
    pub fn new(ds_type: &str, routing_name: &str, pattern: &str, domain: &str) -> Self {
        let is_dns = ds_type.starts_with("DNS");
        let is_raw = !pattern.contains(".*");
        let remap = if is_raw {
            pattern.to_string()
        } else if is_dns {
            format!("{}{}{}", routing_name, strip_host_pattern(pattern), domain)
        } else {
            format!("{}{}", strip_host_pattern(pattern), domain)
        };
        Self {
            is_dns,
            is_raw,
            remap,
        }
    }

    /// Remap string for a given server.
    pub fn remap_for(&self, host: &str) -> String {
        if !self.is_raw && !self.is_dns {
            format!("{}{}", host, self.remap)
        } else {
            self.remap.clone()
        }
    }
}

/// Join assignments with route infos into host → `xml_id` → remaps.
pub fn build_server_ds_remaps(
    by_server: &BTreeMap<String, Vec<String>>,
    infos: &HashMap<String, Vec<DsRouteInfo>>,
) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
    let mut remaps: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for (host, dses) in by_server {
        for xml_id in dses {
            let Some(ds_infos) = infos.get(xml_id) else {
                warn!(deliveryservice = %xml_id, "Deliveryservice has no regexes, skipping");
                continue;
            };
            let entry = remaps
                .entry(host.clone())
                .or_default()
                .entry(xml_id.clone())
                .or_default();
            entry.extend(ds_infos.iter().map(|inf| inf.remap_for(host)));
        }
    }
    remaps
}

/// Per-server remap strings for every assignment.
pub async fn get_server_ds_remaps(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
    domain: &str,
    assignments: &ServerDsAssignments,
) -> Result<BTreeMap<String, BTreeMap<String, Vec<String>>>> {
    let q = format!(
        "SELECT ds.xml_id, dt.name AS ds_type, ds.routing_name, r.pattern \
         FROM {regex} AS r \
         JOIN {typ} AS rt ON rt.id = r.type \
         JOIN {dsr} AS dsr ON dsr.regex = r.id \
         JOIN {ds} AS ds ON ds.id = dsr.deliveryservice \
         JOIN {typ} AS dt ON dt.id = ds.type \
         WHERE ds.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND ds.active \
         AND dt.name <> '{any_map}' \
         AND rt.name = 'HOST_REGEXP' \
         ORDER BY dsr.set_number ASC, r.id",
        regex = source.table(&snapshot::REGEX),
        typ = source.table(&snapshot::TYPE),
        dsr = source.table(&snapshot::DELIVERY_SERVICE_REGEX),
        ds = source.table(&snapshot::DELIVERY_SERVICE),
        cdn = source.table(&snapshot::CDN),
        any_map = ANY_MAP_TYPE,
    );
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying server deliveryservice regexes")?;

    let mut infos: HashMap<String, Vec<DsRouteInfo>> = HashMap::new();
    for (xml_id, ds_type, routing_name, pattern) in rows {
        infos
            .entry(xml_id)
            .or_default()
            .push(DsRouteInfo::new(&ds_type, &routing_name, &pattern, domain));
    }
    Ok(build_server_ds_remaps(&assignments.by_server, &infos))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ServerRow {
    pub host_name: String,
    pub cachegroup: String,
    pub fqdn: String,
    pub xmpp_id: Option<String>,
    pub https_port: Option<i32>,
    pub interface_name: String,
    pub ip_address: String,
    pub ip6_address: Option<String>,
    pub tcp_port: Option<i32>,
    pub profile: String,
    pub routing_disabled: bool,
    pub status: String,
    pub server_type: String,
    pub last_updated: DateTime<Utc>,
}

/// Servers partitioned by role.
#[derive(Debug, Clone, Default)]
pub struct Servers {
    /// Edge and mid caches.
    pub content_servers: BTreeMap<String, ContentServer>,
    /// Traffic routers.
    pub content_routers: BTreeMap<String, ContentRouter>,
    /// Traffic monitors.
    pub monitors: BTreeMap<String, Monitor>,
}

impl Servers {
    /// Place one server row. Rows of unknown type are logged and dropped.
    pub(crate) fn insert(
        &mut self,
        row: ServerRow,
        params: Option<&ServerParams>,
        remaps: Option<&BTreeMap<String, Vec<String>>>,
        assignments_modified: Option<&LastModified>,
    ) -> LastModified {
        let mut modified = LastModified::at(row.last_updated);
        let ip6 = row.ip6_address.unwrap_or_default();

        match ServerType::from_name(&row.server_type) {
            ServerType::Router => {
                self.content_routers.insert(
                    row.host_name,
                    ContentRouter {
                        api_port: params.and_then(|p| p.api_port.clone()),
                        fqdn: row.fqdn,
                        https_port: row.https_port,
                        ip: row.ip_address,
                        ip6,
                        location: row.cachegroup,
                        port: row.tcp_port,
                        profile: row.profile,
                        secure_api_port: params.and_then(|p| p.secure_api_port.clone()),
                        status: row.status,
                    },
                );
            }
            ServerType::Monitor => {
                self.monitors.insert(
                    row.host_name,
                    Monitor {
                        fqdn: row.fqdn,
                        https_port: row.https_port,
                        ip: row.ip_address,
                        ip6,
                        location: row.cachegroup,
                        port: row.tcp_port,
                        profile: row.profile,
                        status: row.status,
                    },
                );
            }
            ServerType::Edge | ServerType::Mid => {
                if let Some(m) = assignments_modified {
                    modified.merge(*m);
                }
                let hash_count = params.map(ServerParams::hash_count).unwrap_or_else(|| {
                    hash_count(DEFAULT_WEIGHT, DEFAULT_WEIGHT_MULTIPLIER)
                });
                let delivery_services = if row.routing_disabled {
                    BTreeMap::new()
                } else {
                    remaps.cloned().unwrap_or_default()
                };
                let hash_id = row
                    .xmpp_id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| row.host_name.clone());
                self.content_servers.insert(
                    row.host_name,
                    ContentServer {
                        cache_group: row.cachegroup.clone(),
                        fqdn: row.fqdn,
                        hash_count,
                        hash_id,
                        https_port: row.https_port,
                        interface_name: row.interface_name,
                        ip: row.ip_address,
                        ip6,
                        location_id: row.cachegroup,
                        port: row.tcp_port,
                        profile: row.profile,
                        status: row.status,
                        server_type: row.server_type,
                        delivery_services,
                        routing_disabled: i64::from(row.routing_disabled),
                        modified,
                    },
                );
            }
            ServerType::Unknown(name) => {
                warn!(server = %row.host_name, server_type = %name, "Unknown server type, skipping");
            }
        }
        modified
    }
}

/// Build content servers, routers and monitors.
pub async fn make_servers(
    conn: &mut PgConnection,
    cdn: &str,
    source: Source,
    remaps: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
    assignments: &ServerDsAssignments,
) -> Result<(Servers, LastModified)> {
    let params = get_server_params(conn, cdn, source)
        .await
        .context("getting server params")?;

    let q = format!(
        "SELECT s.host_name, cg.name AS cachegroup, s.host_name || '.' || s.domain_name AS fqdn, \
                s.xmpp_id, s.https_port, s.interface_name, s.ip_address, s.ip6_address, s.tcp_port, \
                p.name AS profile, p.routing_disabled, st.name AS status, t.name AS server_type, \
                s.last_updated \
         FROM {server} AS s \
         JOIN {cachegroup} AS cg ON cg.id = s.cachegroup \
         JOIN {typ} AS t ON t.id = s.type \
         JOIN {profile} AS p ON p.id = s.profile \
         JOIN {status} AS st ON st.id = s.status \
         WHERE s.cdn_id = (SELECT id FROM {cdn} AS c WHERE c.name = $1) \
         AND st.name IN {statuses} \
         ORDER BY s.host_name",
        server = source.table(&snapshot::SERVER),
        cachegroup = source.table(&snapshot::CACHEGROUP),
        typ = source.table(&snapshot::TYPE),
        profile = source.table(&snapshot::PROFILE),
        status = source.table(&snapshot::STATUS),
        cdn = source.table(&snapshot::CDN),
        statuses = ELIGIBLE_STATUSES,
    );
    let rows = sqlx::query_as::<_, ServerRow>(&q)
        .bind(cdn)
        .fetch_all(&mut *conn)
        .await
        .context("querying servers")?;

    let mut servers = Servers::default();
    let mut modified = LastModified::default();
    for row in rows {
        let host = row.host_name.clone();
        modified.merge(servers.insert(
            row,
            params.get(&host),
            remaps.get(&host),
            assignments.server_modified.get(&host),
        ));
    }
    Ok((servers, modified))
}
