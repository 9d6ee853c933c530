// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CRConfig document model.
//!
//! Field names and nesting are consumed by independently deployed request
//! routers, monitors and cache agents, so the serialized form must not drift.
//! Several flags are booleans internally but travel as `"true"`/`"false"`
//! strings; those use [`string_bool`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::LastModified;

/// The compiled CDN configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrConfig {
    /// CDN-wide settings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, ConfigValue>,
    /// Edge and mid caches keyed by host name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content_servers: BTreeMap<String, ContentServer>,
    /// Traffic routers keyed by host name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content_routers: BTreeMap<String, ContentRouter>,
    /// Delivery services keyed by `xml_id`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delivery_services: BTreeMap<String, DeliveryService>,
    /// Cachegroups hosting edge caches.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub edge_locations: BTreeMap<String, Location>,
    /// Cachegroups hosting traffic routers.
    #[serde(
        default,
        rename = "trafficRouterLocations",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub router_locations: BTreeMap<String, Location>,
    /// Traffic monitors keyed by host name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub monitors: BTreeMap<String, Monitor>,
    /// Provenance of the document.
    #[serde(default)]
    pub stats: Stats,
    /// Topologies keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub topologies: BTreeMap<String, Topology>,
    /// Newest `last_updated` of any row that went into the document.
    #[serde(skip)]
    pub modified: LastModified,
}

/// A `config` entry: a plain string or a nested string map (`soa`, `ttls`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Top-level parameter value.
    String(String),
    /// Grouped parameters with the prefix stripped.
    Map(BTreeMap<String, String>),
}

impl ConfigValue {
    /// The string value, if this is not a map.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            Self::Map(_) => None,
        }
    }
}

/// An edge or mid cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentServer {
    /// Cachegroup name.
    pub cache_group: String,
    /// `host_name.domain_name`
    pub fqdn: String,
    /// Number of slots on the consistent-hash ring.
    pub hash_count: i64,
    /// Ring identity: xmpp id, or host name when unset.
    pub hash_id: String,
    /// HTTPS port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<i32>,
    /// Service interface.
    pub interface_name: String,
    /// IPv4 address.
    pub ip: String,
    /// IPv6 address, empty when unset.
    pub ip6: String,
    /// Same as the cachegroup name.
    pub location_id: String,
    /// HTTP port.
    pub port: Option<i32>,
    /// Profile name.
    pub profile: String,
    /// Status name.
    pub status: String,
    /// Type name, e.g. `EDGE`.
    #[serde(rename = "type")]
    pub server_type: String,
    /// `xml_id` to remap strings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delivery_services: BTreeMap<String, Vec<String>>,
    /// 1 when the profile has routing disabled.
    pub routing_disabled: i64,
    /// Newest of the server row and its assignment rows.
    #[serde(skip)]
    pub modified: LastModified,
}

/// A traffic router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRouter {
    /// `api.port` profile parameter.
    #[serde(default, rename = "api.port", skip_serializing_if = "Option::is_none")]
    pub api_port: Option<String>,
    /// `host_name.domain_name`
    pub fqdn: String,
    /// HTTPS port.
    pub https_port: Option<i32>,
    /// IPv4 address.
    pub ip: String,
    /// IPv6 address.
    pub ip6: String,
    /// Cachegroup name.
    pub location: String,
    /// HTTP port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Profile name.
    pub profile: String,
    /// `secure.api.port` profile parameter.
    #[serde(
        default,
        rename = "secure.api.port",
        skip_serializing_if = "Option::is_none"
    )]
    pub secure_api_port: Option<String>,
    /// Status name.
    pub status: String,
}

/// A traffic monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    /// `host_name.domain_name`
    pub fqdn: String,
    /// HTTPS port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_port: Option<i32>,
    /// IPv4 address.
    pub ip: String,
    /// IPv6 address.
    pub ip6: String,
    /// Cachegroup name.
    pub location: String,
    /// HTTP port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Profile name.
    pub profile: String,
    /// Status name.
    pub status: String,
}

/// A cachegroup's position and fallback policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    /// Latitude.
    pub latitude: f64,
    /// Longitude.
    pub longitude: f64,
    /// Where to send clients when this cachegroup cannot serve.
    #[serde(default)]
    pub backup_locations: BackupLocations,
    /// Methods allowed to localize clients to this cachegroup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub localization_methods: Vec<LocalizationMethod>,
}

/// Ordered fallback cachegroups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupLocations {
    /// Fall back to the geographically closest cachegroup after the list.
    #[serde(with = "string_bool")]
    pub fallback_to_closest: bool,
    /// Cachegroup names in `set_order`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,
}

/// How a router may localize a client to a cachegroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocalizationMethod {
    /// Coverage zone file.
    #[serde(rename = "CZ")]
    CoverageZone,
    /// Deep coverage zone file.
    #[serde(rename = "DEEP_CZ")]
    DeepCoverageZone,
    /// Geolocation database.
    #[serde(rename = "GEO")]
    Geo,
}

impl LocalizationMethod {
    /// Methods used when a cachegroup configures none.
    pub const DEFAULT: [LocalizationMethod; 3] = [Self::Geo, Self::CoverageZone, Self::DeepCoverageZone];

    /// Parse the database representation.
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "CZ" => Some(Self::CoverageZone),
            "DEEP_CZ" => Some(Self::DeepCoverageZone),
            "GEO" => Some(Self::Geo),
            _ => None,
        }
    }
}

/// A routable content offering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryService {
    /// HTTP only.
    #[serde(default, with = "string_bool::option", skip_serializing_if = "Option::is_none")]
    pub anonymous_blocking_enabled: Option<bool>,
    /// Keyed by `DNS` or `HTTP`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bypass_destination: BTreeMap<String, BypassDestination>,
    /// Regex applied to request paths before hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistent_hash_regex: Option<String>,
    /// Only route clients found in the coverage zone.
    #[serde(with = "string_bool")]
    pub coverage_zone_only: bool,
    /// Serialized as `null` when unset.
    #[serde(default)]
    pub deep_caching_type: Option<DeepCachingType>,
    /// HTTP only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispersion: Option<Dispersion>,
    /// Host names derived from the first match set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// EDNS client subnet.
    #[serde(with = "string_bool")]
    pub ecs_enabled: bool,
    /// Allowed countries in country-list geo limiting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geo_enabled: Vec<GeoEnabled>,
    /// Where geo-limited HTTP clients are sent.
    #[serde(
        default,
        rename = "geoLimitRedirectURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub geo_limit_redirect_url: Option<String>,
    /// Geolocation service name.
    pub geolocation_provider: String,
    /// Route IPv6 clients.
    #[serde(with = "string_bool")]
    pub ip6_routing_enabled: bool,
    /// Request matchers in `set_number` order.
    #[serde(default, rename = "matchsets", skip_serializing_if = "Vec::is_empty")]
    pub match_sets: Vec<MatchSet>,
    /// DNS only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dns_ips_for_location: Option<i32>,
    /// Location used when a client cannot be geolocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miss_location: Option<MissLocation>,
    /// Accepted schemes.
    pub protocol: Protocol,
    /// HTTP only.
    #[serde(default, with = "string_bool::option", skip_serializing_if = "Option::is_none")]
    pub regional_geo_blocking: Option<bool>,
    /// Request header names to log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<String>,
    /// Headers added to router responses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    /// First label of DNS-routed names.
    pub routing_name: String,
    /// SOA record values.
    pub soa: Soa,
    /// Mirrors `protocol.acceptHttps`.
    #[serde(with = "string_bool")]
    pub ssl_enabled: bool,
    /// Extra records served for this delivery service.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_dns_entries: Vec<StaticDnsEntry>,
    /// Topology name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,
    /// Answer TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i32>,
    /// Per-record-type TTLs.
    pub ttls: Ttls,
    /// Newest of the delivery service row, its regexes, static DNS entries
    /// and server assignments.
    #[serde(skip)]
    pub modified: LastModified,
}

/// Bypass target for overflow traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassDestination {
    /// DNS only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// DNS only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<String>,
    /// DNS only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// DNS only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i32>,
    /// HTTP only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    /// HTTP only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl BypassDestination {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Caching of content on deep coverage zone caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeepCachingType {
    /// Always deep cache.
    Always,
    /// Never deep cache.
    Never,
    /// Unrecognised database value.
    Invalid,
}

impl DeepCachingType {
    /// Case-insensitive; an empty string means `Never`.
    pub fn from_db(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "ALWAYS" => Self::Always,
            "NEVER" | "" => Self::Never,
            _ => Self::Invalid,
        }
    }
}

/// Spread of responses across caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispersion {
    /// Number of caches.
    pub limit: i32,
    /// Always true for generated documents.
    #[serde(with = "string_bool")]
    pub shuffled: bool,
}

/// An allowed country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoEnabled {
    /// ISO country code.
    pub country_code: String,
}

/// Fallback client location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissLocation {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub long: f64,
}

/// Accepted schemes. `acceptHttp` is omitted when true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    /// Only present (as `"false"`) for HTTPS-only delivery services.
    #[serde(default, with = "string_bool::option", skip_serializing_if = "Option::is_none")]
    pub accept_http: Option<bool>,
    /// HTTPS accepted.
    #[serde(with = "string_bool")]
    pub accept_https: bool,
    /// HTTP requests redirected to HTTPS.
    #[serde(with = "string_bool")]
    pub redirect_to_https: bool,
}

/// Ordered group of request matchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSet {
    /// `HTTP` or `DNS`.
    pub protocol: String,
    /// Matchers.
    #[serde(rename = "matchlist")]
    pub match_list: Vec<MatchItem>,
}

/// One regex matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchItem {
    /// `HOST`, `PATH` or `HEADER`.
    #[serde(rename = "match-type")]
    pub match_type: String,
    /// Pattern.
    pub regex: String,
}

/// SOA record values, all seconds as strings except `admin`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soa {
    /// Responsible mailbox.
    pub admin: String,
    /// Expire.
    pub expire: String,
    /// Negative caching TTL.
    pub minimum: String,
    /// Refresh.
    pub refresh: String,
    /// Retry.
    pub retry: String,
}

/// TTLs in seconds as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttls {
    /// `A` records; empty when the delivery service has no TTL.
    #[serde(rename = "A")]
    pub a: String,
    /// `AAAA` records.
    #[serde(rename = "AAAA")]
    pub aaaa: String,
    /// `NS` records.
    #[serde(rename = "NS")]
    pub ns: String,
    /// `SOA` records.
    #[serde(rename = "SOA")]
    pub soa: String,
}

/// A static DNS record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDnsEntry {
    /// Host label.
    pub name: String,
    /// TTL in seconds.
    pub ttl: i64,
    /// Record type without the `_RECORD` suffix.
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Record data.
    pub value: String,
}

/// Cachegroups of a topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Cachegroup names in insertion order.
    pub nodes: Vec<String>,
}

/// Who generated the document, where and when.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// CDN name.
    #[serde(rename = "CDN_name")]
    pub cdn_name: String,
    /// Unix seconds.
    pub date: i64,
    /// Generating host.
    pub tm_host: String,
    /// Generating user.
    pub tm_user: String,
    /// Generator version.
    pub tm_version: String,
}

/// `bool` as `"true"` / `"false"`.
pub mod string_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as a string.
    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(if *value { "true" } else { "false" })
    }

    /// Accepts only `"true"` and `"false"`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("expected \"true\" or \"false\", got {:?}", s)))
    }

    pub(crate) fn parse(s: &str) -> Option<bool> {
        match s {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// `Option<bool>` as an optional string.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` as a string and `None` as null.
        pub fn serialize<S>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Null or missing is `None`.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(s) => super::parse(&s).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("expected \"true\" or \"false\", got {:?}", s))
                }),
            }
        }
    }
}
