//! Per-host GPU environment daemon: enforcement of environment budgets
//! against observed usage, a read-only HTTP view of the registry and
//! fleet-wide queries over many hosts.

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;
