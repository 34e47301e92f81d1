//! Registry of probes seen on the network
//!
//! The registry is the single owner of probe records. Callers hold
//! [`ProbeHandle`]s carrying the generation the record had when the handle
//! was issued; once a probe expires and is seen again it gets a new
//! generation and old handles stop resolving.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::RegistryError;

/// Default expiry of a probe that is only visible
pub const VISIBLE_EXPIRY_SECS: i64 = 6;
/// Default expiry of a probe with an open session
pub const CONNECTED_EXPIRY_SECS: i64 = 10;

const BEACON_MAGIC: &[u8] = b"CB";

/// Parse a discovery beacon: `CB|<id>|<version>`
pub fn parse_beacon(datagram: &[u8]) -> Option<(String, String)> {
    if !datagram.starts_with(BEACON_MAGIC) {
        return None;
    }
    let text = std::str::from_utf8(datagram).ok()?;
    let mut fields = text.trim_end_matches('\0').split('|').skip(1);
    let id = fields.next()?.trim();
    let version = fields.next()?.trim();
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), version.to_string()))
}

/// Generation-checked reference to a registry record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeHandle {
    id: String,
    generation: u64,
}

impl ProbeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeInfo {
    pub id: String,
    pub version: String,
    pub ip: IpAddr,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
    pub generation: u64,
}

/// What an observation did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Discovered(ProbeHandle),
    Refreshed(ProbeHandle),
}

impl Observation {
    pub fn handle(&self) -> &ProbeHandle {
        match self {
            Self::Discovered(handle) | Self::Refreshed(handle) => handle,
        }
    }
}

pub struct ProbeRegistry {
    probes: RwLock<HashMap<String, ProbeInfo>>,
    next_generation: AtomicU64,
    visible_expiry: Duration,
    connected_expiry: Duration,
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::with_expiry(
            Duration::seconds(VISIBLE_EXPIRY_SECS),
            Duration::seconds(CONNECTED_EXPIRY_SECS),
        )
    }

    pub fn with_expiry(visible: Duration, connected: Duration) -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            visible_expiry: visible,
            connected_expiry: connected,
        }
    }

    /// Record a beacon from `ip`
    pub fn observe(&self, id: &str, version: &str, ip: IpAddr) -> Observation {
        self.observe_at(id, version, ip, Utc::now())
    }

    pub fn observe_at(&self, id: &str, version: &str, ip: IpAddr, now: DateTime<Utc>) -> Observation {
        let mut probes = self.probes.write();
        if let Some(probe) = probes.get_mut(id) {
            probe.last_seen = now;
            probe.ip = ip;
            probe.version = version.to_string();
            return Observation::Refreshed(ProbeHandle {
                id: probe.id.clone(),
                generation: probe.generation,
            });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        info!(id, version, %ip, generation, "Probe discovered");
        probes.insert(
            id.to_string(),
            ProbeInfo {
                id: id.to_string(),
                version: version.to_string(),
                ip,
                last_seen: now,
                connected: false,
                generation,
            },
        );
        Observation::Discovered(ProbeHandle {
            id: id.to_string(),
            generation,
        })
    }

    fn with_probe<T>(
        &self,
        handle: &ProbeHandle,
        f: impl FnOnce(&mut ProbeInfo) -> T,
    ) -> Result<T, RegistryError> {
        let mut probes = self.probes.write();
        let probe = probes
            .get_mut(&handle.id)
            .ok_or_else(|| RegistryError::UnknownProbe(handle.id.clone()))?;
        if probe.generation != handle.generation {
            return Err(RegistryError::StaleHandle(handle.id.clone()));
        }
        Ok(f(probe))
    }

    /// Resolve a handle; `None` once the record expired or was replaced
    pub fn get(&self, handle: &ProbeHandle) -> Option<ProbeInfo> {
        self.probes
            .read()
            .get(&handle.id)
            .filter(|probe| probe.generation == handle.generation)
            .cloned()
    }

    /// Handle for the current record under `id`
    pub fn handle(&self, id: &str) -> Option<ProbeHandle> {
        self.probes.read().get(id).map(|probe| ProbeHandle {
            id: probe.id.clone(),
            generation: probe.generation,
        })
    }

    pub fn set_connected(&self, handle: &ProbeHandle, connected: bool) -> Result<(), RegistryError> {
        self.with_probe(handle, |probe| probe.connected = connected)
    }

    /// Rename a probe. The returned handle replaces `handle`, which no longer resolves.
    pub fn rename(&self, handle: &ProbeHandle, new_id: &str) -> Result<ProbeHandle, RegistryError> {
        if new_id.is_empty() {
            return Err(RegistryError::InvalidId(new_id.to_string()));
        }
        let mut probes = self.probes.write();
        if new_id != handle.id && probes.contains_key(new_id) {
            return Err(RegistryError::DuplicateId(new_id.to_string()));
        }
        match probes.get(&handle.id) {
            None => return Err(RegistryError::UnknownProbe(handle.id.clone())),
            Some(probe) if probe.generation != handle.generation => {
                return Err(RegistryError::StaleHandle(handle.id.clone()))
            }
            Some(_) => {}
        }

        let Some(mut probe) = probes.remove(&handle.id) else {
            return Err(RegistryError::UnknownProbe(handle.id.clone()));
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        info!(from = %handle.id, to = new_id, "Probe renamed");
        probe.id = new_id.to_string();
        probe.generation = generation;
        probes.insert(new_id.to_string(), probe);
        Ok(ProbeHandle {
            id: new_id.to_string(),
            generation,
        })
    }

    pub fn remove(&self, handle: &ProbeHandle) -> Result<ProbeInfo, RegistryError> {
        self.with_probe(handle, |_| ())?;
        self.probes
            .write()
            .remove(&handle.id)
            .ok_or_else(|| RegistryError::UnknownProbe(handle.id.clone()))
    }

    /// Drop probes not seen within their expiry; returns the removed records
    pub fn expire(&self) -> Vec<ProbeInfo> {
        self.expire_at(Utc::now())
    }

    pub fn expire_at(&self, now: DateTime<Utc>) -> Vec<ProbeInfo> {
        let mut probes = self.probes.write();
        let expired: Vec<String> = probes
            .values()
            .filter(|probe| {
                let limit = if probe.connected {
                    self.connected_expiry
                } else {
                    self.visible_expiry
                };
                now - probe.last_seen > limit
            })
            .map(|probe| probe.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| probes.remove(id))
            .inspect(|probe| debug!(id = %probe.id, connected = probe.connected, "Probe expired"))
            .collect()
    }

    /// Snapshot sorted by id
    pub fn probes(&self) -> Vec<ProbeInfo> {
        let mut probes: Vec<ProbeInfo> = self.probes.read().values().cloned().collect();
        probes.sort_by(|a, b| a.id.cmp(&b.id));
        probes
    }

    pub fn len(&self) -> usize {
        self.probes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.read().is_empty()
    }
}
