use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use utils::process::ProcessProbe;
use utils::process::ProcfsProbe;

use crate::api::ApiState;
use crate::app::Application;
use crate::app::ApplicationServices;
use crate::config::DaemonArgs;
use crate::domain::enforcement::EnforcementEngine;
use crate::infrastructure::hostname;
use crate::infrastructure::inventory::DeviceInventory;
use crate::infrastructure::inventory::NvmlInventory;
use crate::infrastructure::terminator::LocalTerminator;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let policy = self.daemon_args.enforcement_policy()?;
        let inventory = NvmlInventory::init().map_err(|e| anyhow::anyhow!("{e:?}"))?;
        let devices = inventory
            .list_devices()
            .map_err(|e| anyhow::anyhow!("{e:?}"))?;

        let registry = self.daemon_args.registry.open();
        registry
            .ensure_devices(&devices)
            .with_context(|| format!("failed to record devices in {}", registry.path().display()))?;
        tracing::info!(
            devices = devices.len(),
            registry = %registry.path().display(),
            "Registry ready"
        );

        let dry_run = self.daemon_args.dry_run();
        if dry_run {
            tracing::warn!("Dry run: violating processes will be logged, not terminated");
        }
        let probe: Arc<dyn ProcessProbe> = Arc::new(ProcfsProbe);
        let terminator =
            LocalTerminator::new(policy.termination_timeout, dry_run).with_probe(probe.clone());
        tracing::info!(?policy, "Enforcement policy");

        let engine = Arc::new(EnforcementEngine::new(
            registry.clone(),
            Arc::new(inventory),
            Arc::new(terminator),
            probe.clone(),
            policy,
        ));
        let api_state = Arc::new(ApiState {
            registry,
            probe,
            engine: Some(engine.clone()),
            hostname: hostname(),
        });

        Ok(Application::new(
            ApplicationServices { engine, api_state },
            self.daemon_args,
        ))
    }
}
