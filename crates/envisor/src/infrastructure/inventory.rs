//! Read-only view of the host's GPUs.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use api_types::DeviceInfo;
use api_types::UsageSample;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum InventoryError {
    #[display("device inventory unavailable")]
    Unavailable,
}

impl core::error::Error for InventoryError {}

/// Source of device facts and per-process usage samples.
///
/// Callers must treat an error as "usage unknown", never as "no usage".
pub trait DeviceInventory: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, Report<InventoryError>>;

    fn sample_usage(&self) -> Result<Vec<UsageSample>, Report<InventoryError>>;
}

/// [`DeviceInventory`] backed by NVML
pub struct NvmlInventory {
    nvml: Nvml,
    /// Newest utilization sample timestamp seen per device
    last_seen: Mutex<HashMap<u32, u64>>,
}

impl NvmlInventory {
    pub fn init() -> Result<Self, Report<InventoryError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(_) => {
                tracing::warn!("Standard NVML init failed, trying with explicit library path");
                Nvml::builder()
                    .lib_path(OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context(InventoryError::Unavailable)
                    .attach_printable("NVML could not be initialized")?
            }
        };
        tracing::info!("NVML initialized successfully");

        Ok(Self {
            nvml,
            last_seen: Mutex::new(HashMap::new()),
        })
    }
}

impl DeviceInventory for NvmlInventory {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, Report<InventoryError>> {
        let count = self
            .nvml
            .device_count()
            .change_context(InventoryError::Unavailable)?;

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .change_context(InventoryError::Unavailable)
                .attach_printable_lazy(|| format!("device {index}"))?;
            let memory = device
                .memory_info()
                .change_context(InventoryError::Unavailable)
                .attach_printable_lazy(|| format!("memory info of device {index}"))?;
            devices.push(DeviceInfo {
                index,
                total_memory: memory.total,
            });
        }
        Ok(devices)
    }

    fn sample_usage(&self) -> Result<Vec<UsageSample>, Report<InventoryError>> {
        let count = self
            .nvml
            .device_count()
            .change_context(InventoryError::Unavailable)?;
        let mut last_seen = self.last_seen.lock().map_err(|_| {
            Report::new(InventoryError::Unavailable).attach_printable("sampler state poisoned")
        })?;

        let mut samples = Vec::new();
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .change_context(InventoryError::Unavailable)
                .attach_printable_lazy(|| format!("device {index}"))?;

            let since = last_seen.get(&index).copied().unwrap_or(0);
            let mut newest = since;
            let mut utilizations: HashMap<u32, Vec<u32>> = HashMap::new();
            // utilization is optional; some devices do not support per-process stats
            for sample in device.process_utilization_stats(since).unwrap_or_default() {
                newest = newest.max(sample.timestamp);
                if sample.sm_util <= 100 && sample.timestamp >= since {
                    utilizations
                        .entry(sample.pid)
                        .or_default()
                        .push(sample.sm_util);
                }
            }
            last_seen.insert(index, newest);

            let processes = device
                .running_compute_processes()
                .change_context(InventoryError::Unavailable)
                .attach_printable_lazy(|| format!("compute processes of device {index}"))?;

            for process in processes {
                // usage hidden by the driver is unknown, not zero
                let UsedGpuMemory::Used(used_memory) = process.used_gpu_memory else {
                    tracing::debug!(pid = process.pid, device = index, "process memory usage unavailable");
                    continue;
                };
                let utilization_percent = utilizations
                    .get(&process.pid)
                    .filter(|samples| !samples.is_empty())
                    .map(|samples| samples.iter().sum::<u32>() / samples.len() as u32);

                samples.push(UsageSample {
                    device_index: index,
                    pid: process.pid,
                    used_memory,
                    utilization_percent,
                });
            }
        }
        Ok(samples)
    }
}

/// Scripted inventory for hosts without hardware access
#[derive(Debug)]
pub struct FakeInventory {
    devices: Mutex<Vec<DeviceInfo>>,
    samples: Mutex<Option<Vec<UsageSample>>>,
    failures: AtomicU32,
}

impl FakeInventory {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: Mutex::new(devices),
            samples: Mutex::new(Some(Vec::new())),
            failures: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` sampling calls fail
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn set_samples(&self, samples: Vec<UsageSample>) {
        if let Ok(mut current) = self.samples.lock() {
            *current = Some(samples);
        }
    }

    /// Makes every following sampling call fail
    pub fn set_unavailable(&self) {
        if let Ok(mut current) = self.samples.lock() {
            *current = None;
        }
    }

    /// Drops every sample of `pid`, as if the process exited
    pub fn remove_process(&self, pid: u32) {
        if let Ok(mut current) = self.samples.lock() {
            if let Some(samples) = current.as_mut() {
                samples.retain(|s| s.pid != pid);
            }
        }
    }
}

impl DeviceInventory for FakeInventory {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, Report<InventoryError>> {
        self.devices
            .lock()
            .map(|devices| devices.clone())
            .map_err(|_| Report::new(InventoryError::Unavailable))
    }

    fn sample_usage(&self) -> Result<Vec<UsageSample>, Report<InventoryError>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Report::new(InventoryError::Unavailable));
        }
        match self.samples.lock() {
            Ok(samples) => samples
                .clone()
                .ok_or_else(|| Report::new(InventoryError::Unavailable)),
            Err(_) => Err(Report::new(InventoryError::Unavailable)),
        }
    }
}
