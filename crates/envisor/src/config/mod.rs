//! Command line and file configuration

pub mod cli;
pub mod daemon;
pub mod fleet;
pub mod lock;
pub mod query;
pub mod storage;

pub use cli::Cli;
pub use cli::Commands;
pub use daemon::DaemonArgs;
pub use fleet::FleetArgs;
pub use lock::LockArgs;
pub use storage::RegistryArgs;
