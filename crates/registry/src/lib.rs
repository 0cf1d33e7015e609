//! Durable per-host registry of GPU environments.
//!
//! The registry is a single JSON document guarded by an advisory file lock.
//! Every mutation is one read-modify-write transaction under the exclusive
//! lock; readers take the shared lock. Independent processes (the shim, the
//! enforcement daemon, administrative tools) open their own [`Registry`]
//! handle on the same path.

mod document;
mod error;
mod registry;
mod selection;
mod store;

pub use document::RegistryState;
pub use error::RegistryError;
pub use error::Result;
pub use registry::DeviceLocks;
pub use registry::ReapReport;
pub use registry::Registry;
pub use store::RegistryStore;
