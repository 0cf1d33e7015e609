use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde_yaml::Value;

use crate::config::storage::RegistryArgs;
use crate::domain::enforcement::EnforcementMode;
use crate::domain::enforcement::EnforcementPolicy;
use crate::domain::enforcement::Rules;
use crate::domain::enforcement::VictimPolicy;
use crate::infrastructure::terminator::LocalTerminator;

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub registry: RegistryArgs,

    #[arg(
        long,
        env = "ENVISOR_INTERVAL_MS",
        default_value = "5000",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Time between enforcement cycles, in milliseconds"
    )]
    pub interval_ms: u64,

    #[arg(
        long,
        env = "ENVISOR_GRACE_PERIOD_MS",
        default_value = "10000",
        help = "How long a violation must persist before it is acted upon, in milliseconds"
    )]
    pub grace_period_ms: u64,

    #[arg(long, value_enum, default_value_t = VictimPolicy::NewestFirst)]
    pub victim_policy: VictimPolicy,

    #[arg(long, value_enum, default_value_t = EnforcementMode::Soft)]
    pub mode: EnforcementMode,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Terminate processes of environments over their memory budget"
    )]
    pub env_memory: bool,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Terminate bound processes using devices not attached to their environment"
    )]
    pub env_devices: bool,

    #[arg(
        long,
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Terminate GPU processes bound to no environment"
    )]
    pub non_env_processes: bool,

    #[arg(long, help = "Attached devices allowed per user across its environments")]
    pub max_devices_per_user: Option<u32>,

    #[arg(
        long,
        env = "ENVISOR_TERMINATION_TIMEOUT_MS",
        default_value = "5000",
        help = "Wait between the graceful and the forced signal, in milliseconds"
    )]
    pub termination_timeout_ms: u64,

    #[arg(long, help = "Log corrective terminations instead of signalling")]
    pub dry_run: bool,

    #[arg(
        long,
        env = "ENVISOR_POLICY_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML enforcement policy; its fields override the flags above"
    )]
    pub policy_file: Option<PathBuf>,

    #[arg(
        long,
        env = "ENVISOR_VIOLATION_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "JSON-lines violation log, rotated daily, e.g. /var/log/envisor/violations.log"
    )]
    pub violation_log: Option<PathBuf>,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "127.0.0.1:8081",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        help = "Serve the HTTP query API",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_api: bool,
}

impl DaemonArgs {
    /// Policy from the flags, overlaid with the policy file when given
    pub fn enforcement_policy(&self) -> Result<EnforcementPolicy> {
        let policy = EnforcementPolicy {
            interval: Duration::from_millis(self.interval_ms),
            grace_period: Duration::from_millis(self.grace_period_ms),
            victim_policy: self.victim_policy,
            mode: self.mode,
            rules: Rules {
                env_memory: self.env_memory,
                env_devices: self.env_devices,
                non_env_processes: self.non_env_processes,
                max_devices_per_user: self.max_devices_per_user,
            },
            termination_timeout: Duration::from_millis(self.termination_timeout_ms),
            ..Default::default()
        };

        let policy = match &self.policy_file {
            Some(path) => overlay_policy_file(policy, path)?,
            None => policy,
        };
        if policy.interval.is_zero() {
            anyhow::bail!("enforcement interval must be positive");
        }
        Ok(policy)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run || LocalTerminator::dry_run_from_env()
    }
}

fn overlay_policy_file(policy: EnforcementPolicy, path: &Path) -> Result<EnforcementPolicy> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    overlay_policy(policy, &content).with_context(|| format!("invalid policy file {}", path.display()))
}

/// Replaces the fields of `policy` present in the YAML document `overrides`.
pub fn overlay_policy(policy: EnforcementPolicy, overrides: &str) -> Result<EnforcementPolicy> {
    let overrides: Value = serde_yaml::from_str(overrides)?;
    let mut merged = serde_yaml::to_value(policy)?;
    merge(&mut merged, overrides);
    Ok(serde_yaml::from_value(merged)?)
}

fn merge(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Mapping(base), Value::Mapping(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        // an empty document overrides nothing
        (_, Value::Null) => {}
        (base, overrides) => *base = overrides,
    }
}
