use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::fleet::FleetArgs;
use crate::config::lock::LockArgs;
use crate::config::query::DiscardArgs;
use crate::config::query::EnvironmentsArgs;
use crate::config::query::SnapshotArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the enforcement daemon and its query API
    Daemon(Box<DaemonArgs>),
    /// Print this host's devices, environments and quarantined records as JSON
    Snapshot(SnapshotArgs),
    /// Print this host's environments as JSON
    Environments(EnvironmentsArgs),
    /// Drop a quarantined registry record
    Discard(DiscardArgs),
    /// Query many hosts at once
    Fleet(FleetArgs),
    /// Run a command while holding the locks of an environment's devices
    Lock(LockArgs),
}
