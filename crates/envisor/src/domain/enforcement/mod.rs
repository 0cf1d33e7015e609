//! Sampling, rule evaluation and corrective actions.
//!
//! One cycle joins the registry's bindings with the inventory's usage samples,
//! evaluates every enabled rule against that joined view and, once a violation
//! has persisted past the grace period, executes the corrective actions.

mod engine;
mod policy;
mod rules;

use std::collections::HashMap;
use std::fmt;

use api_types::Eid;
use api_types::Environment;
use api_types::ProcessBinding;
use api_types::UsageSample;

pub use engine::ActionResult;
pub use engine::CycleReport;
pub use engine::EngineState;
pub use engine::EnforcementEngine;
pub use engine::Verdict;
pub use policy::EnforcementMode;
pub use policy::EnforcementPolicy;
pub use policy::Rules;
pub use policy::VictimPolicy;

/// What one cycle knows about the host
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub environments: Vec<Environment>,
    pub samples: Vec<UsageSample>,
}

impl Observation {
    /// Environment and binding owning `pid`
    pub fn owner_of(&self, pid: u32) -> Option<(&Environment, &ProcessBinding)> {
        self.environments
            .iter()
            .find_map(|env| env.binding(pid).map(|binding| (env, binding)))
    }

    /// Memory used by each process on the devices attached to `env`
    pub fn usage_in(&self, env: &Environment) -> HashMap<u32, u64> {
        let mut usage = HashMap::new();
        for sample in &self.samples {
            if env.is_attached(sample.device_index) && env.binding(sample.pid).is_some() {
                *usage.entry(sample.pid).or_default() += sample.used_memory;
            }
        }
        usage
    }

    /// Memory used by each process of `env` on the device `index`
    pub fn usage_on(&self, env: &Environment, index: u32) -> HashMap<u32, u64> {
        let mut usage = HashMap::new();
        for sample in &self.samples {
            if sample.device_index == index && env.binding(sample.pid).is_some() {
                *usage.entry(sample.pid).or_default() += sample.used_memory;
            }
        }
        usage
    }

    /// Samples behind `violation`: those of the processes it terminates and
    /// those on the devices it detaches
    pub fn samples_of(&self, violation: &Violation) -> Vec<UsageSample> {
        self.samples
            .iter()
            .filter(|sample| {
                violation.actions.iter().any(|action| match action {
                    Action::Terminate { pid, .. } => *pid == sample.pid,
                    Action::Detach { index, .. } => *index == sample.device_index,
                })
            })
            .copied()
            .collect()
    }
}

/// Identity of a violation across cycles, used to track its grace period
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViolationKey {
    EnvMemory(Eid),
    EnvDeviceMemory { eid: Eid, index: u32 },
    EnvDevices { eid: Eid, pid: u32 },
    NonEnvProcess(u32),
    UserDevices(String),
}

impl fmt::Display for ViolationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnvMemory(eid) => write!(f, "env-memory/{eid}"),
            Self::EnvDeviceMemory { eid, index } => write!(f, "env-memory/{eid}/device/{index}"),
            Self::EnvDevices { eid, pid } => write!(f, "env-devices/{eid}/{pid}"),
            Self::NonEnvProcess(pid) => write!(f, "non-env-processes/{pid}"),
            Self::UserDevices(user) => write!(f, "max-devices-per-user/{user}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Stop a process; `start_token` guards against a recycled pid
    Terminate {
        pid: u32,
        start_token: Option<u64>,
        eid: Option<Eid>,
    },
    Detach { eid: Eid, index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub key: ViolationKey,
    /// Measured quantity: bytes for memory rules, devices for device rules
    pub observed: u64,
    pub limit: u64,
    pub actions: Vec<Action>,
}
