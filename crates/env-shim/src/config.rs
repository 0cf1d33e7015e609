use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Registry file shared with the daemon
pub const REGISTRY_PATH_ENV_VAR: &str = "ENVISOR_REGISTRY_PATH";
/// What an unbound process gets to see, `passthrough` or `deny`
pub const UNBOUND_POLICY_ENV_VAR: &str = "ENVISOR_UNBOUND_POLICY";
pub const DEFAULT_REGISTRY_PATH: &str = "/var/tmp/envisor/registry.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid unbound policy `{0}`, expected `passthrough` or `deny`")]
    InvalidPolicy(String),
}

/// Treatment of processes bound to no environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnboundPolicy {
    /// Leave every device visible
    #[default]
    Passthrough,
    /// Hide every device
    Deny,
}

impl FromStr for UnboundPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passthrough" | "allow" => Ok(Self::Passthrough),
            "deny" => Ok(Self::Deny),
            other => Err(ConfigError::InvalidPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    pub registry_path: PathBuf,
    pub unbound_policy: UnboundPolicy,
}

impl ShimConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let registry_path = lookup(REGISTRY_PATH_ENV_VAR)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_REGISTRY_PATH.to_string())
            .into();
        let unbound_policy = match lookup(UNBOUND_POLICY_ENV_VAR) {
            Some(policy) if !policy.is_empty() => policy.parse()?,
            _ => UnboundPolicy::default(),
        };

        Ok(Self {
            registry_path,
            unbound_policy,
        })
    }
}
