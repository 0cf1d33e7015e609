use std::time::Duration;

use api_types::Eid;
use clap::Args;
use utils::flock::LockOptions;

use crate::config::storage::RegistryArgs;
use crate::domain::device_lock::LockTarget;

#[derive(Args, Debug, Clone)]
pub struct LockArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[arg(long, conflicts_with = "pid", help = "Lock the devices of this environment")]
    pub eid: Option<String>,

    #[arg(
        long,
        help = "Lock the devices of the environment this process is bound to [default: parent process]"
    )]
    pub pid: Option<u32>,

    #[arg(
        long,
        default_value = "600000",
        help = "How long to wait for the device locks, in milliseconds"
    )]
    pub wait_ms: u64,

    /// Command to run while the devices are locked
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl LockArgs {
    pub fn target(&self) -> LockTarget {
        match &self.eid {
            Some(eid) => LockTarget::Environment(Eid::from(eid.as_str())),
            None => LockTarget::Process(self.pid.unwrap_or_else(std::os::unix::process::parent_id)),
        }
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::with_timeout(Duration::from_millis(self.wait_ms))
    }
}
