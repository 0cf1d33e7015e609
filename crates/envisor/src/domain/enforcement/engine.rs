use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::time::Instant;

use api_types::Eid;
use api_types::EnvironmentFilter;
use api_types::UsageSample;
use error_stack::Report;
use registry::Registry;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::process::ProcessProbe;

use super::rules;
use super::Action;
use super::EnforcementPolicy;
use super::Observation;
use super::Violation;
use super::ViolationKey;
use crate::infrastructure::inventory::DeviceInventory;
use crate::infrastructure::inventory::InventoryError;
use crate::infrastructure::logging::VIOLATION_TARGET;
use crate::infrastructure::terminator::TerminationOutcome;
use crate::infrastructure::terminator::Terminator;

/// `Idle → Sampling → Evaluating → (Compliant | Violating) → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Sampling,
    Evaluating,
    Compliant,
    Violating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No violation has outlived the grace period
    Compliant,
    /// Corrective actions were taken
    Violating,
    /// Usage could not be sampled; nothing was evaluated
    #[display("skipped (inventory unavailable)")]
    InventoryUnavailable,
    /// The registry could not be read within the retry budget
    #[display("skipped (registry unavailable)")]
    RegistryUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Terminated(TerminationOutcome),
    /// Indices actually removed from the environment
    Detached(Vec<u32>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub verdict: Verdict,
    /// Bindings removed because their process was gone
    pub reaped: usize,
    /// Every violation seen this cycle, sustained or not
    pub violations: Vec<Violation>,
    /// Actions executed, each at most once per cycle
    pub actions: Vec<(Action, ActionResult)>,
}

impl CycleReport {
    fn skipped(verdict: Verdict, reaped: usize) -> Self {
        Self {
            verdict,
            reaped,
            violations: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Pids terminated (or found gone) this cycle
    pub fn terminated(&self) -> Vec<u32> {
        self.actions
            .iter()
            .filter_map(|(action, result)| match (action, result) {
                (Action::Terminate { pid, .. }, ActionResult::Terminated(outcome))
                    if outcome.is_gone() =>
                {
                    Some(*pid)
                }
                _ => None,
            })
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic reconciliation of recorded budgets against observed usage.
pub struct EnforcementEngine {
    registry: Registry,
    inventory: Arc<dyn DeviceInventory>,
    terminator: Arc<dyn Terminator>,
    probe: Arc<dyn ProcessProbe>,
    policy: EnforcementPolicy,
    state: Mutex<EngineState>,
    /// First cycle each still-present violation was seen in
    violating_since: Mutex<HashMap<ViolationKey, Instant>>,
}

impl EnforcementEngine {
    pub fn new(
        registry: Registry,
        inventory: Arc<dyn DeviceInventory>,
        terminator: Arc<dyn Terminator>,
        probe: Arc<dyn ProcessProbe>,
        policy: EnforcementPolicy,
    ) -> Self {
        Self {
            registry,
            inventory,
            terminator,
            probe,
            policy,
            state: Mutex::new(EngineState::Idle),
            violating_since: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn policy(&self) -> &EnforcementPolicy {
        &self.policy
    }

    fn transition(&self, next: EngineState) {
        let mut state = lock(&self.state);
        debug!(from = %state, to = %next, "engine state change");
        *state = next;
    }

    /// Runs cycles every `policy.interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Enforcement loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let engine = self.clone();
                    match tokio::task::spawn_blocking(move || engine.run_cycle()).await {
                        Ok(report) => debug!(
                            verdict = %report.verdict,
                            violations = report.violations.len(),
                            actions = report.actions.len(),
                            "enforcement cycle finished"
                        ),
                        Err(e) => error!("enforcement cycle failed: {e}"),
                    }
                }
            }
        }
    }

    pub fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Instant::now())
    }

    /// One reconciliation cycle, with `now` as the reference for grace periods.
    #[tracing::instrument(skip_all)]
    pub fn run_cycle_at(&self, now: Instant) -> CycleReport {
        let mut violating_since = lock(&self.violating_since);
        self.transition(EngineState::Sampling);

        let reaped = match self.with_retry("reap", |registry| registry.reap(self.probe.as_ref())) {
            Ok(report) => report.removed.len(),
            Err(e) => {
                warn!("failed to reap exited processes: {e}");
                0
            }
        };

        let samples = match self.sample_with_retry() {
            Ok(samples) => samples,
            Err(report) => {
                warn!("usage unknown, skipping cycle: {report:?}");
                self.transition(EngineState::Idle);
                return CycleReport::skipped(Verdict::InventoryUnavailable, reaped);
            }
        };
        let environments = match self.with_retry("list", |registry| {
            registry.list_environments(&EnvironmentFilter::default())
        }) {
            Ok(environments) => environments,
            Err(e) => {
                warn!("registry unavailable, skipping cycle: {e}");
                self.transition(EngineState::Idle);
                return CycleReport::skipped(Verdict::RegistryUnavailable, reaped);
            }
        };

        self.transition(EngineState::Evaluating);
        let observation = Observation {
            environments,
            samples,
        };
        let violations = rules::evaluate(&observation, &self.policy);

        violating_since.retain(|key, _| violations.iter().any(|v| &v.key == key));
        let mut sustained = Vec::new();
        for violation in &violations {
            let since = *violating_since.entry(violation.key.clone()).or_insert(now);
            let elapsed = now.saturating_duration_since(since);
            if elapsed >= self.policy.grace_period {
                sustained.push(violation);
            } else {
                debug!(
                    violation = %violation.key,
                    observed = violation.observed,
                    limit = violation.limit,
                    ?elapsed,
                    "violation within grace period"
                );
            }
        }

        if sustained.is_empty() {
            self.transition(EngineState::Compliant);
            self.transition(EngineState::Idle);
            return CycleReport {
                verdict: Verdict::Compliant,
                reaped,
                violations,
                actions: Vec::new(),
            };
        }

        self.transition(EngineState::Violating);
        for violation in &sustained {
            let samples = observation.samples_of(violation);
            warn!(
                target: VIOLATION_TARGET,
                violation = %violation.key,
                observed = violation.observed,
                limit = violation.limit,
                actions = violation.actions.len(),
                samples = %serde_json::to_string(&samples).unwrap_or_default(),
                "sustained violation"
            );
        }
        let actions = self.execute(&sustained);
        self.transition(EngineState::Idle);

        CycleReport {
            verdict: Verdict::Violating,
            reaped,
            violations,
            actions,
        }
    }

    /// Executes the actions of `violations`, detaching before terminating and
    /// acting on every device and process at most once.
    fn execute(&self, violations: &[&Violation]) -> Vec<(Action, ActionResult)> {
        let mut detaches: BTreeMap<(Eid, u32), &ViolationKey> = BTreeMap::new();
        let mut terminations: BTreeMap<u32, (&Action, &ViolationKey)> = BTreeMap::new();
        for violation in violations {
            for action in &violation.actions {
                match action {
                    Action::Detach { eid, index } => {
                        detaches.entry((eid.clone(), *index)).or_insert(&violation.key);
                    }
                    Action::Terminate { pid, .. } => {
                        terminations.entry(*pid).or_insert((action, &violation.key));
                    }
                }
            }
        }

        let mut results = Vec::new();
        let mut detached_envs = BTreeSet::new();
        for ((eid, index), key) in detaches {
            let result = match self.with_retry("detach", |registry| {
                registry.detach_devices(&eid, Some(index))
            }) {
                Ok(removed) => {
                    detached_envs.insert(eid.clone());
                    ActionResult::Detached(removed)
                }
                Err(e) => ActionResult::Failed(e.to_string()),
            };
            warn!(
                target: VIOLATION_TARGET,
                violation = %key,
                eid = %eid,
                device = index,
                result = ?result,
                "device detached"
            );
            results.push((Action::Detach { eid, index }, result));
        }

        for (pid, (action, key)) in terminations {
            let Action::Terminate {
                start_token, eid, ..
            } = action
            else {
                continue;
            };
            let outcome = self.terminator.terminate(pid, *start_token);
            warn!(
                target: VIOLATION_TARGET,
                violation = %key,
                pid,
                eid = eid.as_ref().map(|eid| eid.as_str()),
                outcome = ?outcome,
                "process terminated"
            );

            if outcome.is_gone() && eid.is_some() {
                self.forget_process(pid);
            }
            results.push((action.clone(), ActionResult::Terminated(outcome)));
        }

        for eid in detached_envs {
            if let Err(e) = self.with_retry("deregister", |registry| registry.deregister_if_empty(&eid)) {
                warn!(eid = %eid, "failed to deregister environment: {e}");
            }
        }
        results
    }

    /// Drops the binding of a terminated process and its environment if it
    /// was the last one.
    fn forget_process(&self, pid: u32) {
        match self.with_retry("detach process", |registry| registry.detach_process(pid)) {
            Ok(Some(eid)) => {
                if let Err(e) = self.with_retry("deregister", |registry| registry.deregister_if_empty(&eid)) {
                    warn!(eid = %eid, "failed to deregister environment: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(pid, "failed to remove binding of terminated process: {e}"),
        }
    }

    /// Samples usage, retrying with backoff while the inventory is unavailable.
    fn sample_with_retry(&self) -> Result<Vec<UsageSample>, Report<InventoryError>> {
        let mut backoff = self.policy.inventory_backoff;
        let mut attempt = 0;
        loop {
            match self.inventory.sample_usage() {
                Err(report) if attempt < self.policy.inventory_retries => {
                    attempt += 1;
                    warn!(attempt, "usage sampling failed, retrying: {report:?}");
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    /// Runs a registry operation, retrying with backoff while the lock is
    /// contended.
    fn with_retry<T>(
        &self,
        operation: &str,
        mut op: impl FnMut(&Registry) -> registry::Result<T>,
    ) -> registry::Result<T> {
        let mut backoff = self.policy.lock_backoff;
        let mut attempt = 0;
        loop {
            match op(&self.registry) {
                Err(e) if e.is_transient() && attempt < self.policy.lock_retries => {
                    attempt += 1;
                    warn!(operation, attempt, "registry busy, retrying: {e}");
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }
}
