use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use registry::Registry;
use utils::flock::LockOptions;

pub const REGISTRY_PATH_ENV_VAR: &str = "ENVISOR_REGISTRY_PATH";

/// Location of the host registry, shared by every subcommand touching it
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    #[arg(
        long,
        env = REGISTRY_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/tmp/envisor/registry.json",
        help = "Path of the host's environment registry"
    )]
    pub registry_path: PathBuf,

    #[arg(
        long,
        env = "ENVISOR_LOCK_TIMEOUT_MS",
        default_value = "5000",
        help = "How long to wait for the registry lock, in milliseconds"
    )]
    pub lock_timeout_ms: u64,
}

impl RegistryArgs {
    pub fn open(&self) -> Registry {
        Registry::with_lock_options(
            &self.registry_path,
            LockOptions::with_timeout(Duration::from_millis(self.lock_timeout_ms)),
        )
    }
}
