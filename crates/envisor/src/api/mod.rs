//! HTTP query API of the daemon

pub mod errors;
pub mod handlers;
pub mod server;

pub use handlers::ApiState;
pub use server::ApiServer;
