//! Device view resolution for processes running inside an environment.
//!
//! A process resolves its view from the registry before touching any device:
//! the environment's attached devices, renumbered `0..k` in attachment order,
//! with memory totals narrowed to the environment budget. The view is read
//! from the registry on every call, so attachment changes are picked up by
//! the next resolution.

use std::env;

use registry::Registry;
use registry::RegistryError;
use thiserror::Error;
use utils::process::ProcessProbe;
use utils::process::ProcfsProbe;

mod config;
#[cfg(feature = "preload")]
mod interpose;
#[cfg(feature = "preload")]
mod preload;
mod view;

pub use config::ConfigError;
pub use config::ShimConfig;
pub use config::UnboundPolicy;
pub use config::DEFAULT_REGISTRY_PATH;
pub use config::REGISTRY_PATH_ENV_VAR;
pub use config::UNBOUND_POLICY_ENV_VAR;
pub use view::BoundView;
pub use view::NO_DEVICES;
pub use view::MemoryInfo;
pub use view::ResolvedView;

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("shim configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}

pub struct Shim<P = ProcfsProbe> {
    registry: Registry,
    policy: UnboundPolicy,
    probe: P,
}

impl Shim {
    pub fn from_env() -> Result<Self, ShimError> {
        let config = ShimConfig::from_env()?;
        Ok(Self::new(
            Registry::open(config.registry_path),
            config.unbound_policy,
        ))
    }

    pub fn new(registry: Registry, policy: UnboundPolicy) -> Self {
        Self::with_probe(registry, policy, ProcfsProbe)
    }
}

impl<P: ProcessProbe> Shim<P> {
    pub fn with_probe(registry: Registry, policy: UnboundPolicy, probe: P) -> Self {
        Self {
            registry,
            policy,
            probe,
        }
    }

    pub fn policy(&self) -> UnboundPolicy {
        self.policy
    }

    /// Resolves the view of `pid`.
    ///
    /// A binding only counts when its start token matches the live process,
    /// so a recycled pid never inherits another process' devices.
    pub fn resolve_view(&self, pid: u32) -> Result<ResolvedView, ShimError> {
        let view = match self.probe.start_token(pid) {
            Some(token) => self.registry.resolve_view(pid, Some(token))?,
            None => None,
        };

        Ok(match view {
            Some(view) => ResolvedView::Bound(view.into()),
            None => self.unbound(),
        })
    }

    /// Resolves the view of `pid`, hiding every device when the registry
    /// cannot answer.
    ///
    /// A lock timeout or a quarantined environment record never widens what a
    /// process sees, whatever the unbound policy.
    pub fn resolve_or_deny(&self, pid: u32) -> ResolvedView {
        self.resolve_view(pid).unwrap_or_else(|err| {
            tracing::error!(pid, "failed to resolve device view, hiding all devices: {err}");
            ResolvedView::Denied
        })
    }

    /// View of a process bound to no environment.
    pub fn unbound(&self) -> ResolvedView {
        match self.policy {
            UnboundPolicy::Passthrough => ResolvedView::Unrestricted,
            UnboundPolicy::Deny => ResolvedView::Denied,
        }
    }
}

/// Variables that pin `view` for the CUDA runtime and the container toolkit.
///
/// Physical indices are NVML indices, so CUDA is told to enumerate in PCI bus
/// order as NVML does. An unrestricted view sets nothing.
pub fn visible_device_variables(view: &ResolvedView) -> Vec<(&'static str, String)> {
    let Some(visible_devices) = view.visible_devices() else {
        return Vec::new();
    };
    let container_devices = if visible_devices == NO_DEVICES {
        "none".to_string()
    } else {
        visible_devices.clone()
    };
    vec![
        ("CUDA_DEVICE_ORDER", "PCI_BUS_ID".to_string()),
        ("CUDA_VISIBLE_DEVICES", visible_devices),
        ("NVIDIA_VISIBLE_DEVICES", container_devices),
    ]
}

/// Exports `view` into the environment of the current process.
pub fn export_visible_devices(view: &ResolvedView) {
    for (key, value) in visible_device_variables(view) {
        tracing::info!("Setting {key} to `{value}`");
        env::set_var(key, value);
    }
}
