//! Fan-out of one request to many hosts.
//!
//! Every host is queried independently; a slow or broken host never affects
//! the others' results. There is no cross-host transaction: each entry of the
//! merged result carries its own freshness timestamp.

mod aggregator;

use std::time::Duration;

use api_types::Environment;
use api_types::EnvironmentFilter;
use api_types::HostSnapshot;
use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use error_stack::Report;
use serde::Serialize;

pub use aggregator::FleetAggregator;
pub use aggregator::FleetOptions;

/// Request sent to every host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetRequest {
    Snapshot,
    Environments(EnvironmentFilter),
}

/// Reply of one host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetReply {
    Snapshot(HostSnapshot),
    Environments(Vec<Environment>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetError {
    #[display("host {host} is unreachable: {reason}")]
    RemoteHostUnreachable { host: String, reason: String },
    #[display("host {host} did not answer within {after:?}")]
    Timeout { host: String, after: Duration },
    #[display("query of host {host} was cancelled")]
    Cancelled { host: String },
    #[display("host {host} failed the request: {reason}")]
    RemoteFailure { host: String, reason: String },
    #[display("host {host} sent an unreadable reply: {reason}")]
    InvalidResponse { host: String, reason: String },
}

impl core::error::Error for FleetError {}

impl FleetError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RemoteHostUnreachable { .. } | Self::Timeout { .. }
        )
    }
}

/// Result for one host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostOutcome {
    /// When the reply (or the final error) was obtained
    pub fetched_at: DateTime<Utc>,
    pub result: Result<FleetReply, FleetError>,
}

/// Remote execution of a [`FleetRequest`] on a single host
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn execute(
        &self,
        host: &str,
        request: &FleetRequest,
    ) -> Result<FleetReply, Report<FleetError>>;
}
