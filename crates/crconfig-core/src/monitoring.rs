// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitoring configuration derived from a compiled CRConfig.
//!
//! Health monitors poll every cache listed here, so the document is produced
//! from the same snapshot-backed CRConfig that routers receive and stored
//! alongside the snapshot pointer on commit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crconfig::{ConfigValue, CrConfig, Topology};

/// Status reported for every monitored delivery service.
pub const DS_STATUS: &str = "REPORTED";

/// The monitoring document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringConfig {
    /// Caches to poll.
    pub traffic_servers: Vec<TrafficServer>,
    /// Peer monitors.
    pub traffic_monitors: Vec<TrafficMonitor>,
    /// Cachegroups with coordinates.
    pub cache_groups: Vec<CacheGroup>,
    /// Delivery services with thresholds.
    pub delivery_services: Vec<MonitoredDeliveryService>,
    /// Top-level string entries of the CRConfig `config` section.
    pub config: BTreeMap<String, String>,
    /// Topologies keyed by name.
    pub topologies: BTreeMap<String, Topology>,
}

/// A cache as seen by the monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficServer {
    /// Profile name.
    pub profile: String,
    /// Status name.
    pub status: String,
    /// HTTP port.
    pub port: Option<i32>,
    /// Cachegroup name.
    #[serde(rename = "cachegroup")]
    pub cache_group: String,
    /// Host name.
    #[serde(rename = "hostname")]
    pub host_name: String,
    /// Fully qualified name.
    pub fqdn: String,
    /// IPv4 address.
    pub ip: String,
    /// IPv6 address.
    pub ip6: String,
    /// Interface to read statistics for.
    #[serde(rename = "interfacename")]
    pub interface_name: String,
    /// Type name.
    #[serde(rename = "type")]
    pub server_type: String,
    /// Consistent-hash identity.
    #[serde(rename = "hashid")]
    pub hash_id: String,
    /// Assigned delivery services.
    #[serde(rename = "deliveryServices")]
    pub delivery_services: Vec<ServerDeliveryService>,
}

/// A delivery service assignment of one cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDeliveryService {
    /// Delivery service `xml_id`.
    #[serde(rename = "xmlId")]
    pub xml_id: String,
    /// Remap strings the cache answers to.
    pub remaps: Vec<String>,
}

/// A peer monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficMonitor {
    /// Profile name.
    pub profile: String,
    /// Status name.
    pub status: String,
    /// HTTP port.
    pub port: Option<i32>,
    /// Cachegroup name.
    #[serde(rename = "cachegroup")]
    pub cache_group: String,
    /// Host name.
    #[serde(rename = "hostname")]
    pub host_name: String,
    /// Fully qualified name.
    pub fqdn: String,
    /// IPv4 address.
    pub ip: String,
    /// IPv6 address.
    pub ip6: String,
}

/// A cachegroup position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheGroup {
    /// Cachegroup name.
    pub name: String,
    /// Position.
    pub coordinates: Coordinates,
}

/// Latitude and longitude.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude.
    pub latitude: f64,
    /// Longitude.
    pub longitude: f64,
}

/// A delivery service with its alerting thresholds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredDeliveryService {
    /// Delivery service `xml_id`.
    pub xml_id: String,
    /// Transactions per second alert threshold, 0 for none.
    pub total_tps_threshold: i64,
    /// Always [`DS_STATUS`].
    pub status: String,
    /// Kilobits per second alert threshold, 0 for none.
    pub total_kbps_threshold: i64,
    /// `HTTP`, `DNS` or empty.
    #[serde(rename = "type")]
    pub ds_type: String,
    /// Topology name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<String>,
    /// Host regexes of every match set.
    pub host_regexes: Vec<String>,
}

/// Derive the monitoring document from a compiled CRConfig.
pub fn make_monitoring(doc: &CrConfig) -> MonitoringConfig {
    let traffic_servers = doc
        .content_servers
        .iter()
        .map(|(host, cs)| TrafficServer {
            profile: cs.profile.clone(),
            status: cs.status.clone(),
            port: cs.port,
            cache_group: cs.cache_group.clone(),
            host_name: host.clone(),
            fqdn: cs.fqdn.clone(),
            ip: cs.ip.clone(),
            ip6: cs.ip6.clone(),
            interface_name: cs.interface_name.clone(),
            server_type: cs.server_type.clone(),
            hash_id: cs.hash_id.clone(),
            delivery_services: cs
                .delivery_services
                .iter()
                .map(|(xml_id, remaps)| ServerDeliveryService {
                    xml_id: xml_id.clone(),
                    remaps: remaps.clone(),
                })
                .collect(),
        })
        .collect();

    let traffic_monitors = doc
        .monitors
        .iter()
        .map(|(host, m)| TrafficMonitor {
            profile: m.profile.clone(),
            status: m.status.clone(),
            port: m.port,
            cache_group: m.location.clone(),
            host_name: host.clone(),
            fqdn: m.fqdn.clone(),
            ip: m.ip.clone(),
            ip6: m.ip6.clone(),
        })
        .collect();

    let mut positions: BTreeMap<&str, Coordinates> = BTreeMap::new();
    for (name, loc) in doc.router_locations.iter().chain(doc.edge_locations.iter()) {
        positions.insert(
            name,
            Coordinates {
                latitude: loc.latitude,
                longitude: loc.longitude,
            },
        );
    }
    let cache_groups = positions
        .into_iter()
        .map(|(name, coordinates)| CacheGroup {
            name: name.to_string(),
            coordinates,
        })
        .collect();

    let delivery_services = doc
        .delivery_services
        .iter()
        .map(|(xml_id, ds)| MonitoredDeliveryService {
            xml_id: xml_id.clone(),
            total_tps_threshold: 0,
            status: DS_STATUS.to_string(),
            total_kbps_threshold: 0,
            ds_type: ds
                .match_sets
                .first()
                .map(|m| m.protocol.clone())
                .unwrap_or_default(),
            topology: ds.topology.clone(),
            host_regexes: ds
                .match_sets
                .iter()
                .flat_map(|m| m.match_list.iter())
                .filter(|item| item.match_type == "HOST")
                .map(|item| item.regex.clone())
                .collect(),
        })
        .collect();

    let config = doc
        .config
        .iter()
        .filter_map(|(k, v)| match v {
            ConfigValue::String(s) => Some((k.clone(), s.clone())),
            ConfigValue::Map(_) => None,
        })
        .collect();

    MonitoringConfig {
        traffic_servers,
        traffic_monitors,
        cache_groups,
        delivery_services,
        config,
        topologies: doc.topologies.clone(),
    }
}
