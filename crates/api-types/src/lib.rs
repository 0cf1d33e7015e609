//! Shared API type definitions
//!
//! This crate contains the record and wire types shared by the registry, the
//! shim, the per-host daemon and the fleet aggregator: devices, environments,
//! process bindings, resolved device views, usage samples and host snapshots.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Opaque environment identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eid(pub String);

impl Eid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Eid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Eid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Physical device as reported by the device inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Host-global device index
    pub index: u32,
    /// Total device memory in bytes
    pub total_memory: u64,
}

/// Identity of the user owning an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub username: Option<String>,
}

/// Configured capacity of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Maximum number of attached devices
    pub max_devices: u32,
    /// Aggregate memory budget in bytes across attached devices, `None` is unbounded
    pub memory_budget: Option<u64>,
    /// Memory reserved on each attached device. `None` claims whole devices;
    /// with a reservation, environments share a device while their
    /// reservations fit in its memory.
    #[serde(default)]
    pub device_memory: Option<u64>,
}

/// Request for a new environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRequest {
    pub owner: Owner,
    pub capacity: Capacity,
    /// Human readable name
    #[serde(default)]
    pub name: Option<String>,
    /// Allow attaching more devices than `max_devices` and sharing attached devices
    #[serde(default)]
    pub allow_over_subscription: bool,
    /// Keep the environment registered after its last process exits
    #[serde(default)]
    pub persistent: bool,
    /// Enforce the memory budget against real usage
    #[serde(default = "default_true")]
    pub enforce_memory: bool,
}

fn default_true() -> bool {
    true
}

impl EnvironmentRequest {
    pub fn new(owner: Owner, capacity: Capacity) -> Self {
        Self {
            owner,
            capacity,
            name: None,
            allow_over_subscription: false,
            persistent: false,
            enforce_memory: true,
        }
    }
}

/// Relation between a device and an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub index: u32,
    pub attached_at: DateTime<Utc>,
}

/// Relation between a live process and an environment.
///
/// A binding is identified by `(pid, start_token)`; the start token is the
/// process start time in clock ticks since boot, so a recycled pid never
/// matches a stale binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessBinding {
    pub pid: u32,
    pub start_token: u64,
    pub bound_at: DateTime<Utc>,
    /// Attached devices the process may use, in attachment order
    pub devices: Vec<u32>,
}

/// A capacity-bounded GPU allocation unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub eid: Eid,
    pub owner: Owner,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub capacity: Capacity,
    pub allow_over_subscription: bool,
    pub persistent: bool,
    pub enforce_memory: bool,
    /// Attached devices in attachment order
    pub attachments: Vec<Attachment>,
    pub bindings: Vec<ProcessBinding>,
}

impl Environment {
    /// Attached device indices in attachment order
    pub fn devices(&self) -> Vec<u32> {
        self.attachments.iter().map(|a| a.index).collect()
    }

    pub fn is_attached(&self, index: u32) -> bool {
        self.attachments.iter().any(|a| a.index == index)
    }

    pub fn binding(&self, pid: u32) -> Option<&ProcessBinding> {
        self.bindings.iter().find(|b| b.pid == pid)
    }

    pub fn is_active(&self) -> bool {
        !self.bindings.is_empty()
    }
}

/// Selection of devices for `attach_devices`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Fill the environment up to its configured maximum
    Auto,
    /// Make the environment hold this many devices
    Count(u32),
    /// Attach exactly these device indices
    Indices(Vec<u32>),
}

/// Filter for listing environments; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFilter {
    pub uid: Option<u32>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub eids: Option<Vec<Eid>>,
}

impl EnvironmentFilter {
    pub fn matches(&self, env: &Environment) -> bool {
        if self.uid.is_some_and(|uid| uid != env.owner.uid) {
            return false;
        }
        if let Some(username) = &self.username {
            if env.owner.username.as_ref() != Some(username) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if env.name.as_ref() != Some(name) {
                return false;
            }
        }
        if let Some(eids) = &self.eids {
            if !eids.contains(&env.eid) {
                return false;
            }
        }
        true
    }
}

/// Effective device view of a bound process.
///
/// `device_indices[i]` is the physical device presented as local index `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceView {
    pub eid: Eid,
    pub device_indices: Vec<u32>,
    pub memory_budget: Option<u64>,
    /// Per-device memory reservation of the environment
    #[serde(default)]
    pub device_memory: Option<u64>,
}

/// One process' memory use on one device during a sampling cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub device_index: u32,
    pub pid: u32,
    pub used_memory: u64,
    pub utilization_percent: Option<u32>,
}

/// Registry record that failed structural validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub eid: Eid,
    pub reason: String,
}

/// Point-in-time view of one host's registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub hostname: Option<String>,
    pub taken_at: DateTime<Utc>,
    pub devices: Vec<DeviceInfo>,
    pub environments: Vec<Environment>,
    pub quarantined: Vec<QuarantinedRecord>,
}

/// Response for environment queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentResponse {
    /// Whether the request was successful
    pub success: bool,
    /// Environment data (present when successful)
    pub data: Option<Environment>,
    /// Response message
    pub message: String,
}

/// Response for environment listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentListResponse {
    pub success: bool,
    pub data: Vec<Environment>,
    pub message: String,
}

/// Response for device view queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewResponse {
    /// Whether the request was successful
    pub success: bool,
    /// Resolved view, absent when the process is not bound
    pub data: Option<DeviceView>,
    /// Response message
    pub message: String,
}
