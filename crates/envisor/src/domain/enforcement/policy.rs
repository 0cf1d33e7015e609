use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Order in which offending processes of one environment are terminated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VictimPolicy {
    /// Most recently bound first
    #[default]
    NewestFirst,
    /// Earliest bound first
    OldestFirst,
    /// Highest memory use first
    LargestConsumer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EnforcementMode {
    /// Terminate offenders in victim order until the environment is back
    /// within budget
    #[default]
    Soft,
    /// Terminate every process bound to the offending environment
    Hard,
}

/// Individually switchable rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Rules {
    pub env_memory: bool,
    pub env_devices: bool,
    pub non_env_processes: bool,
    /// Attached devices allowed per user, unlimited when unset
    pub max_devices_per_user: Option<u32>,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            env_memory: true,
            env_devices: true,
            non_env_processes: false,
            max_devices_per_user: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EnforcementPolicy {
    #[serde(with = "seconds")]
    pub interval: Duration,
    /// How long a violation must persist before it is acted upon
    #[serde(with = "seconds")]
    pub grace_period: Duration,
    pub victim_policy: VictimPolicy,
    pub mode: EnforcementMode,
    pub rules: Rules,
    /// Per-user overrides of `rules.max_devices_per_user`, by username or uid
    pub user_max_devices: BTreeMap<String, u32>,
    /// Extra attempts when the registry lock is contended
    pub lock_retries: u32,
    #[serde(with = "seconds")]
    pub lock_backoff: Duration,
    /// Extra sampling attempts within one cycle when the inventory fails
    pub inventory_retries: u32,
    #[serde(with = "seconds")]
    pub inventory_backoff: Duration,
    /// Wait between the graceful and the forced signal
    #[serde(with = "seconds")]
    pub termination_timeout: Duration,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            grace_period: Duration::from_secs(10),
            victim_policy: VictimPolicy::default(),
            mode: EnforcementMode::default(),
            rules: Rules::default(),
            user_max_devices: BTreeMap::new(),
            lock_retries: 3,
            lock_backoff: Duration::from_millis(200),
            inventory_retries: 2,
            inventory_backoff: Duration::from_millis(100),
            termination_timeout: Duration::from_secs(5),
        }
    }
}

impl EnforcementPolicy {
    /// Device limit applying to the owner known as `user`
    pub fn max_devices_for(&self, user: &str) -> Option<u32> {
        self.user_max_devices
            .get(user)
            .copied()
            .or(self.rules.max_devices_per_user)
    }
}

/// Durations written as (fractional) seconds
mod seconds {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
