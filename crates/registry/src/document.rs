//! On-disk registry document and its structural validation.
//!
//! Environment records are decoded one by one. A record that fails to decode
//! or violates a structural invariant is quarantined: it is kept verbatim in
//! the file, excluded from every operation and reported in snapshots until an
//! administrator discards it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use api_types::DeviceInfo;
use api_types::Eid;
use api_types::Environment;
use api_types::QuarantinedRecord;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::RegistryError;
use crate::error::Result;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    version: u64,
    #[serde(default)]
    devices: Vec<DeviceInfo>,
    #[serde(default)]
    environments: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Quarantined {
    pub raw: Value,
    pub reason: String,
}

/// Decoded registry content of one host
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryState {
    pub(crate) version: u64,
    pub(crate) devices: Vec<DeviceInfo>,
    pub(crate) environments: BTreeMap<Eid, Environment>,
    pub(crate) quarantined: BTreeMap<Eid, Quarantined>,
}

impl RegistryState {
    /// Monotonic write counter, bumped on every committed transaction
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn environments(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn quarantined(&self) -> Vec<QuarantinedRecord> {
        self.quarantined
            .iter()
            .map(|(eid, q)| QuarantinedRecord {
                eid: eid.clone(),
                reason: q.reason.clone(),
            })
            .collect()
    }

    pub(crate) fn environment(&self, eid: &Eid) -> Result<&Environment> {
        self.check_quarantine(eid)?;
        self.environments
            .get(eid)
            .ok_or_else(|| RegistryError::UnknownEnvironment { eid: eid.clone() })
    }

    pub(crate) fn environment_mut(&mut self, eid: &Eid) -> Result<&mut Environment> {
        self.check_quarantine(eid)?;
        self.environments
            .get_mut(eid)
            .ok_or_else(|| RegistryError::UnknownEnvironment { eid: eid.clone() })
    }

    fn check_quarantine(&self, eid: &Eid) -> Result<()> {
        match self.quarantined.get(eid) {
            Some(q) => Err(RegistryError::CorruptRecord {
                eid: Some(eid.clone()),
                reason: q.reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Memory each holder of a device reserves on it, `None` for a holder of
    /// the whole device.
    ///
    /// Quarantined records are counted from whatever attachments can still be
    /// read out of them, so a corrupt record never frees its devices.
    pub(crate) fn reservations(&self) -> HashMap<u32, Vec<Option<u64>>> {
        let mut held: HashMap<u32, Vec<Option<u64>>> = HashMap::new();
        for env in self.environments.values() {
            for attachment in &env.attachments {
                held.entry(attachment.index)
                    .or_default()
                    .push(env.capacity.device_memory);
            }
        }
        for q in self.quarantined.values() {
            let reserved = salvage_device_memory(&q.raw);
            for index in salvage_attachments(&q.raw) {
                held.entry(index).or_default().push(reserved);
            }
        }
        held
    }

    /// Memory of `index` no holder has reserved, `None` for an unknown device
    pub(crate) fn unreserved_memory(
        &self,
        index: u32,
        reservations: &HashMap<u32, Vec<Option<u64>>>,
    ) -> Option<u64> {
        let device = self.devices.iter().find(|d| d.index == index)?;
        let reserved = reservations.get(&index).map_or(0, |held| {
            held.iter()
                .map(|memory| memory.unwrap_or(device.total_memory))
                .fold(0, u64::saturating_add)
        });
        Some(device.total_memory.saturating_sub(reserved))
    }

    /// Quarantined record that still names `(pid, start_token)` as bound.
    ///
    /// A readable start token other than `start_token` belongs to an earlier
    /// process with the same pid and does not match.
    pub(crate) fn quarantined_binding(
        &self,
        pid: u32,
        start_token: Option<u64>,
    ) -> Option<(&Eid, &str)> {
        self.quarantined.iter().find_map(|(eid, q)| {
            salvage_bindings(&q.raw)
                .into_iter()
                .any(|(bound, token)| {
                    bound == pid
                        && !matches!((start_token, token), (Some(want), Some(have)) if want != have)
                })
                .then_some((eid, q.reason.as_str()))
        })
    }

    pub(crate) fn has_device(&self, index: u32) -> bool {
        self.devices.iter().any(|d| d.index == index)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let document: Document =
            serde_json::from_slice(bytes).map_err(|e| RegistryError::CorruptRecord {
                eid: None,
                reason: format!("registry document is not readable: {e}"),
            })?;

        let mut seen = BTreeSet::new();
        for device in &document.devices {
            if !seen.insert(device.index) {
                return Err(RegistryError::CorruptRecord {
                    eid: None,
                    reason: format!("device {} is listed more than once", device.index),
                });
            }
        }

        let mut state = Self {
            version: document.version,
            devices: document.devices,
            ..Default::default()
        };

        let mut bound_pids: HashMap<u32, Eid> = HashMap::new();
        for (key, raw) in document.environments {
            let eid = Eid(key);
            match state.validate(&eid, &raw, &bound_pids) {
                Ok(env) => {
                    for binding in &env.bindings {
                        bound_pids.insert(binding.pid, eid.clone());
                    }
                    state.environments.insert(eid, env);
                }
                Err(reason) => {
                    warn!(eid = %eid, reason = %reason, "quarantining corrupt environment record");
                    state.quarantined.insert(eid, Quarantined { raw, reason });
                }
            }
        }

        Ok(state)
    }

    fn validate(
        &self,
        eid: &Eid,
        raw: &Value,
        bound_pids: &HashMap<u32, Eid>,
    ) -> std::result::Result<Environment, String> {
        let env: Environment =
            serde_json::from_value(raw.clone()).map_err(|e| format!("malformed record: {e}"))?;

        if &env.eid != eid {
            return Err(format!("record is stored under {eid} but names {}", env.eid));
        }

        let mut attached = BTreeSet::new();
        for attachment in &env.attachments {
            if !attached.insert(attachment.index) {
                return Err(format!("device {} attached twice", attachment.index));
            }
            if !self.devices.is_empty() && !self.has_device(attachment.index) {
                return Err(format!("attached to unknown device {}", attachment.index));
            }
        }

        if !env.allow_over_subscription && env.attachments.len() > env.capacity.max_devices as usize
        {
            return Err(format!(
                "{} devices attached but capacity is {}",
                env.attachments.len(),
                env.capacity.max_devices
            ));
        }

        let mut pids = BTreeSet::new();
        for binding in &env.bindings {
            if !pids.insert(binding.pid) {
                return Err(format!("process {} bound twice", binding.pid));
            }
            if let Some(other) = bound_pids.get(&binding.pid) {
                return Err(format!(
                    "process {} is also bound to environment {other}",
                    binding.pid
                ));
            }
            if let Some(index) = binding.devices.iter().find(|i| !attached.contains(i)) {
                return Err(format!(
                    "process {} uses device {index} which is not attached",
                    binding.pid
                ));
            }
        }

        Ok(env)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut environments = BTreeMap::new();
        for (eid, env) in &self.environments {
            environments.insert(eid.0.clone(), serde_json::to_value(env)?);
        }
        for (eid, q) in &self.quarantined {
            environments.insert(eid.0.clone(), q.raw.clone());
        }

        let document = Document {
            version: self.version,
            devices: self.devices.clone(),
            environments,
        };

        Ok(serde_json::to_vec_pretty(&document)?)
    }
}

fn salvage_attachments(raw: &Value) -> Vec<u32> {
    salvage_array(raw, "attachments")
        .filter_map(|a| a.get("index").and_then(Value::as_u64))
        .filter_map(|i| u32::try_from(i).ok())
        .collect()
}

fn salvage_device_memory(raw: &Value) -> Option<u64> {
    raw.get("capacity")
        .and_then(|c| c.get("device_memory"))
        .and_then(Value::as_u64)
}

fn salvage_bindings(raw: &Value) -> Vec<(u32, Option<u64>)> {
    salvage_array(raw, "bindings")
        .filter_map(|b| {
            let pid = b.get("pid").and_then(Value::as_u64)?;
            let pid = u32::try_from(pid).ok()?;
            Some((pid, b.get("start_token").and_then(Value::as_u64)))
        })
        .collect()
}

fn salvage_array<'a>(raw: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    raw.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}
