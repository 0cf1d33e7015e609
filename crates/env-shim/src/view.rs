use api_types::DeviceView;
use api_types::Eid;

/// `CUDA_VISIBLE_DEVICES` value that hides every device
pub const NO_DEVICES: &str = "-1";

/// Memory figures of one device, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// What a process is allowed to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedView {
    /// The process is bound; only the environment's devices are visible
    Bound(BoundView),
    /// Unbound process under the passthrough policy
    Unrestricted,
    /// Unbound process under the deny policy, or a process whose view could
    /// not be resolved
    Denied,
}

impl ResolvedView {
    /// Value for `CUDA_VISIBLE_DEVICES`, `None` when the variable should be
    /// left alone.
    pub fn visible_devices(&self) -> Option<String> {
        match self {
            Self::Bound(view) if view.device_count() > 0 => Some(view.visible_devices()),
            Self::Bound(_) | Self::Denied => Some(NO_DEVICES.to_string()),
            Self::Unrestricted => None,
        }
    }

    /// Number of devices the process sees out of `physical` present ones
    pub fn device_count(&self, physical: u32) -> u32 {
        match self {
            Self::Bound(view) => view.device_count(),
            Self::Unrestricted => physical,
            Self::Denied => 0,
        }
    }

    pub fn physical_index(&self, local: u32) -> Option<u32> {
        match self {
            Self::Bound(view) => view.physical_index(local),
            Self::Unrestricted => Some(local),
            Self::Denied => None,
        }
    }

    pub fn local_index(&self, physical: u32) -> Option<u32> {
        match self {
            Self::Bound(view) => view.local_index(physical),
            Self::Unrestricted => Some(physical),
            Self::Denied => None,
        }
    }

    pub fn virtualize_memory(&self, physical: MemoryInfo) -> MemoryInfo {
        match self {
            Self::Bound(view) => view.virtualize_memory(physical),
            Self::Unrestricted | Self::Denied => physical,
        }
    }
}

/// Device view of a bound process with a contiguous local index space.
///
/// Local index `i` is the `i`-th attached device in attachment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundView {
    eid: Eid,
    devices: Vec<u32>,
    memory_budget: Option<u64>,
    device_memory: Option<u64>,
}

impl From<DeviceView> for BoundView {
    fn from(view: DeviceView) -> Self {
        Self {
            eid: view.eid,
            devices: view.device_indices,
            memory_budget: view.memory_budget,
            device_memory: view.device_memory,
        }
    }
}

impl BoundView {
    pub fn eid(&self) -> &Eid {
        &self.eid
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn physical_devices(&self) -> &[u32] {
        &self.devices
    }

    pub fn physical_index(&self, local: u32) -> Option<u32> {
        self.devices.get(local as usize).copied()
    }

    pub fn local_index(&self, physical: u32) -> Option<u32> {
        self.devices
            .iter()
            .position(|&index| index == physical)
            .map(|i| i as u32)
    }

    pub fn memory_budget(&self) -> Option<u64> {
        self.memory_budget
    }

    /// Memory one device may present: the tighter of the environment budget
    /// and its per-device reservation
    pub fn memory_limit(&self) -> Option<u64> {
        match (self.memory_budget, self.device_memory) {
            (Some(budget), Some(reserved)) => Some(budget.min(reserved)),
            (limit, None) | (None, limit) => limit,
        }
    }

    pub fn visible_devices(&self) -> String {
        self.devices
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Memory figures as the process should see them.
    ///
    /// When the memory limit is narrower than the device, it becomes the
    /// device total and free memory is what is left of it.
    pub fn virtualize_memory(&self, physical: MemoryInfo) -> MemoryInfo {
        match self.memory_limit() {
            Some(budget) if budget < physical.total => {
                let used = physical.used.min(budget);
                MemoryInfo {
                    total: budget,
                    used,
                    free: budget - used,
                }
            }
            _ => physical,
        }
    }
}
