use crate::probe::Identity;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use ::time::OffsetDateTime;

/// One discovered or manually registered player endpoint.
///
/// Field names serialize in camelCase so the persisted list stays readable by
/// the mobile front end.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub ip_address: Ipv4Addr,
    pub port: u16,
    pub is_online: bool,
    /// Epoch milliseconds of the last successful probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

impl DeviceRecord {
    /// Record for an endpoint that just answered a probe.
    pub fn discovered(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            id: device_id(ip, port),
            name: default_name(ip),
            ip_address: ip,
            port,
            is_online: true,
            last_seen: Some(now_millis()),
        }
    }

    /// Like [`discovered`](Self::discovered), named by what the endpoint
    /// reported about itself when it said anything.
    pub fn identified(ip: Ipv4Addr, port: u16, identity: Identity) -> Self {
        Self::discovered(ip, port).with_name(identity.name.unwrap_or_default())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.name = name;
        }
        self
    }

    /// Apply the outcome of an availability check.
    pub fn mark(&mut self, online: bool) {
        self.is_online = online;
        if online {
            self.last_seen = Some(now_millis());
        }
    }
}

pub fn device_id(ip: Ipv4Addr, port: u16) -> String {
    format!("{ip}:{port}")
}

pub fn default_name(ip: Ipv4Addr) -> String {
    format!("R_VOLUTION ({ip})")
}

pub fn now_millis() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// Events emitted by a running scan, in the order the scanner observes them.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A probe for `ip` is about to be sent.
    ProbeStarted { ip: Ipv4Addr },
    DeviceFound { record: DeviceRecord },
    /// `settled` addresses out of `total` have finished probing.
    Progress { settled: u64, total: u64, fraction: f64 },
    /// Always the last event of a session.
    Completed { records: Vec<DeviceRecord>, cancelled: bool },
}

/// Aggregate counters for the HTTP status endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanSummary {
    pub scanned_total: u64,
    pub scanned_done: u64,
    pub found: u64,
    pub cancelled: bool,
}
