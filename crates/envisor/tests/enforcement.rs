use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use api_types::Capacity;
use api_types::DeviceInfo;
use api_types::DeviceSelector;
use api_types::Eid;
use api_types::EnvironmentRequest;
use api_types::Owner;
use api_types::UsageSample;
use envisor::domain::enforcement::Action;
use envisor::domain::enforcement::ActionResult;
use envisor::domain::enforcement::EngineState;
use envisor::domain::enforcement::EnforcementEngine;
use envisor::domain::enforcement::EnforcementPolicy;
use envisor::domain::enforcement::Verdict;
use envisor::domain::enforcement::ViolationKey;
use envisor::infrastructure::inventory::FakeInventory;
use envisor::infrastructure::terminator::TerminationOutcome;
use envisor::infrastructure::terminator::Terminator;
use registry::Registry;
use registry::RegistryError;
use similar_asserts::assert_eq;
use test_log::test;
use utils::flock::FileLock;
use utils::flock::LockMode;
use utils::flock::LockOptions;
use utils::process::ProcessProbe;

const GIB: u64 = 1 << 30;

/// Live processes as `pid -> start token`
#[derive(Default)]
struct FakeProcessTable(Mutex<HashMap<u32, u64>>);

impl FakeProcessTable {
    fn spawn(&self, pid: u32, token: u64) {
        self.0.lock().unwrap().insert(pid, token);
    }

    fn exit(&self, pid: u32) {
        self.0.lock().unwrap().remove(&pid);
    }
}

impl ProcessProbe for FakeProcessTable {
    fn start_token(&self, pid: u32) -> Option<u64> {
        self.0.lock().unwrap().get(&pid).copied()
    }
}

/// Terminator that makes its targets exit and remembers them
struct RecordingTerminator {
    processes: Arc<FakeProcessTable>,
    inventory: Arc<FakeInventory>,
    calls: Mutex<Vec<(u32, Option<u64>)>>,
}

impl RecordingTerminator {
    fn calls(&self) -> Vec<(u32, Option<u64>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, pid: u32, start_token: Option<u64>) -> TerminationOutcome {
        self.calls.lock().unwrap().push((pid, start_token));
        self.processes.exit(pid);
        self.inventory.remove_process(pid);
        TerminationOutcome::Terminated
    }
}

struct Host {
    dir: tempfile::TempDir,
    registry: Registry,
    processes: Arc<FakeProcessTable>,
    inventory: Arc<FakeInventory>,
    terminator: Arc<RecordingTerminator>,
}

impl Host {
    /// Host with `devices` 16 GiB devices and an empty registry
    fn new(devices: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_at(dir.path(), Duration::from_secs(5));
        let devices: Vec<_> = (0..devices)
            .map(|index| DeviceInfo {
                index,
                total_memory: 16 * GIB,
            })
            .collect();
        registry.ensure_devices(&devices).unwrap();

        let processes = Arc::new(FakeProcessTable::default());
        let inventory = Arc::new(FakeInventory::new(devices));
        let terminator = Arc::new(RecordingTerminator {
            processes: processes.clone(),
            inventory: inventory.clone(),
            calls: Mutex::new(Vec::new()),
        });
        Self {
            dir,
            registry,
            processes,
            inventory,
            terminator,
        }
    }

    fn engine(&self, policy: EnforcementPolicy) -> EnforcementEngine {
        self.engine_on(self.registry.clone(), policy)
    }

    fn engine_on(&self, registry: Registry, policy: EnforcementPolicy) -> EnforcementEngine {
        EnforcementEngine::new(
            registry,
            self.inventory.clone(),
            self.terminator.clone(),
            self.processes.clone(),
            policy,
        )
    }

    /// Environment of `username` with `devices` attached and a memory budget
    fn environment(&self, username: &str, devices: u32, budget: Option<u64>) -> Eid {
        let eid = self
            .registry
            .create_environment(EnvironmentRequest::new(
                Owner {
                    uid: 1000,
                    username: Some(username.to_string()),
                },
                Capacity {
                    max_devices: devices,
                    memory_budget: budget,
                    device_memory: None,
                },
            ))
            .unwrap();
        self.registry
            .attach_devices(&eid, &DeviceSelector::Auto)
            .unwrap();
        eid
    }

    fn run_process(&self, eid: &Eid, pid: u32) {
        let token = u64::from(pid) * 100;
        self.processes.spawn(pid, token);
        self.registry.bind_process(eid, pid, token).unwrap();
    }
}

fn registry_at(dir: &Path, lock_timeout: Duration) -> Registry {
    Registry::with_lock_options(
        dir.join("registry.json"),
        LockOptions::with_timeout(lock_timeout),
    )
}

fn sample(device_index: u32, pid: u32, used_memory: u64) -> UsageSample {
    UsageSample {
        device_index,
        pid,
        used_memory,
        utilization_percent: Some(50),
    }
}

fn policy(grace_period: Duration) -> EnforcementPolicy {
    EnforcementPolicy {
        grace_period,
        lock_backoff: Duration::from_millis(20),
        inventory_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

#[test]
fn over_budget_process_is_terminated_after_grace_then_compliant() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(4 * GIB));
    host.run_process(&eid, 100);
    host.inventory.set_samples(vec![sample(0, 100, 5 * GIB)]);
    let engine = host.engine(policy(Duration::from_secs(10)));
    let start = Instant::now();

    let report = engine.run_cycle_at(start);
    assert_eq!(report.verdict, Verdict::Compliant);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].key, ViolationKey::EnvMemory(eid.clone()));
    assert_eq!(report.violations[0].observed, 5 * GIB);
    assert!(host.terminator.calls().is_empty());

    let report = engine.run_cycle_at(start + Duration::from_secs(11));
    assert_eq!(report.verdict, Verdict::Violating);
    assert_eq!(report.terminated(), vec![100]);
    assert_eq!(host.terminator.calls(), vec![(100, Some(10_000))]);
    assert!(matches!(
        host.registry.query_environment(&eid),
        Err(RegistryError::UnknownEnvironment { .. })
    ));

    let report = engine.run_cycle_at(start + Duration::from_secs(12));
    assert_eq!(report.verdict, Verdict::Compliant);
    assert!(report.violations.is_empty());
    assert_eq!(host.terminator.calls().len(), 1);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn violation_that_clears_within_grace_is_forgotten() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(4 * GIB));
    host.run_process(&eid, 100);
    let engine = host.engine(policy(Duration::from_secs(10)));
    let start = Instant::now();

    host.inventory.set_samples(vec![sample(0, 100, 5 * GIB)]);
    engine.run_cycle_at(start);
    host.inventory.set_samples(vec![sample(0, 100, 3 * GIB)]);
    assert_eq!(
        engine.run_cycle_at(start + Duration::from_secs(5)).verdict,
        Verdict::Compliant
    );

    // the grace period starts over
    host.inventory.set_samples(vec![sample(0, 100, 5 * GIB)]);
    let report = engine.run_cycle_at(start + Duration::from_secs(12));
    assert_eq!(report.verdict, Verdict::Compliant);
    assert!(host.terminator.calls().is_empty());
}

#[test]
fn exited_process_is_reaped_and_environment_deregistered() {
    let host = Host::new(2);
    let eid = host.environment("alice", 1, None);
    host.run_process(&eid, 200);
    let engine = host.engine(policy(Duration::ZERO));

    host.processes.exit(200);
    let report = engine.run_cycle();

    assert_eq!(report.reaped, 1);
    assert_eq!(report.verdict, Verdict::Compliant);
    assert!(matches!(
        host.registry.query_environment(&eid),
        Err(RegistryError::UnknownEnvironment { .. })
    ));
    assert!(host.terminator.calls().is_empty());
}

#[test]
fn each_process_gets_one_action_per_cycle() {
    let host = Host::new(2);
    let eid = host.environment("alice", 1, Some(GIB));
    host.run_process(&eid, 300);
    // over budget on its own device and also running on a foreign one
    host.inventory
        .set_samples(vec![sample(0, 300, 2 * GIB), sample(1, 300, GIB)]);
    let engine = host.engine(policy(Duration::ZERO));

    let report = engine.run_cycle();

    assert_eq!(report.verdict, Verdict::Violating);
    assert_eq!(report.violations.len(), 2);
    assert_eq!(report.actions.len(), 1);
    assert_eq!(host.terminator.calls(), vec![(300, Some(30_000))]);
}

#[test]
fn unavailable_inventory_skips_the_cycle() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(GIB));
    host.run_process(&eid, 100);
    host.inventory.set_unavailable();
    let engine = host.engine(policy(Duration::ZERO));

    let report = engine.run_cycle();

    assert_eq!(report.verdict, Verdict::InventoryUnavailable);
    assert!(report.violations.is_empty());
    assert!(host.terminator.calls().is_empty());
    assert_eq!(engine.state(), EngineState::Idle);
    // unknown usage is not treated as no usage: the binding stays
    assert_eq!(
        host.registry.query_environment(&eid).unwrap().bindings.len(),
        1
    );
}

#[test]
fn transient_inventory_failure_is_retried_within_the_cycle() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(GIB));
    host.run_process(&eid, 100);
    host.inventory.set_samples(vec![sample(0, 100, 2 * GIB)]);
    host.inventory.fail_next(1);
    let engine = host.engine(policy(Duration::ZERO));

    let report = engine.run_cycle();

    assert_eq!(report.verdict, Verdict::Violating);
    assert_eq!(host.terminator.calls(), vec![(100, Some(10_000))]);
}

#[test]
fn inventory_failing_past_the_retries_skips_the_cycle() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(GIB));
    host.run_process(&eid, 100);
    host.inventory.set_samples(vec![sample(0, 100, 2 * GIB)]);
    host.inventory.fail_next(2);
    let engine = host.engine(EnforcementPolicy {
        inventory_retries: 1,
        ..policy(Duration::ZERO)
    });

    assert_eq!(engine.run_cycle().verdict, Verdict::InventoryUnavailable);
    assert_eq!(engine.run_cycle().verdict, Verdict::Violating);
}

#[test]
fn contended_lock_is_retried() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(GIB));
    host.run_process(&eid, 100);
    host.inventory.set_samples(vec![sample(0, 100, 2 * GIB)]);
    let registry = registry_at(host.dir.path(), Duration::from_millis(50));
    let engine = host.engine_on(
        registry,
        EnforcementPolicy {
            lock_retries: 6,
            lock_backoff: Duration::from_millis(50),
            grace_period: Duration::ZERO,
            ..Default::default()
        },
    );

    let lock_path = host.dir.path().join("registry.json.lock");
    let held = FileLock::acquire(&lock_path, LockMode::Exclusive, LockOptions::default()).unwrap();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        drop(held);
    });

    let report = engine.run_cycle();
    releaser.join().unwrap();

    assert_eq!(report.verdict, Verdict::Violating);
    assert_eq!(host.terminator.calls(), vec![(100, Some(10_000))]);
}

#[test]
fn lock_held_past_retries_skips_the_cycle() {
    let host = Host::new(1);
    let eid = host.environment("alice", 1, Some(GIB));
    host.run_process(&eid, 100);
    host.inventory.set_samples(vec![sample(0, 100, 2 * GIB)]);
    let registry = registry_at(host.dir.path(), Duration::from_millis(20));
    let engine = host.engine_on(
        registry,
        EnforcementPolicy {
            lock_retries: 1,
            lock_backoff: Duration::from_millis(10),
            grace_period: Duration::ZERO,
            ..Default::default()
        },
    );

    let _held = FileLock::acquire(
        &host.dir.path().join("registry.json.lock"),
        LockMode::Exclusive,
        LockOptions::default(),
    )
    .unwrap();
    let report = engine.run_cycle();

    assert_eq!(report.verdict, Verdict::RegistryUnavailable);
    assert!(host.terminator.calls().is_empty());
}

#[test]
fn user_over_device_maximum_loses_latest_device() {
    let host = Host::new(3);
    let first = host.environment("alice", 1, None);
    let second = host.environment("alice", 2, None);
    host.run_process(&second, 400);
    let devices = host.registry.query_environment(&second).unwrap().devices();
    let latest = *devices.last().unwrap();
    host.inventory.set_samples(vec![sample(latest, 400, GIB)]);

    let mut policy = policy(Duration::ZERO);
    policy.rules.max_devices_per_user = Some(2);
    let engine = host.engine(policy);

    let report = engine.run_cycle();

    assert_eq!(report.verdict, Verdict::Violating);
    assert_eq!(
        report.actions[0],
        (
            Action::Detach {
                eid: second.clone(),
                index: latest
            },
            ActionResult::Detached(vec![latest])
        )
    );
    assert_eq!(host.terminator.calls(), vec![(400, Some(40_000))]);
    assert_eq!(host.registry.query_environment(&first).unwrap().devices().len(), 1);
    // the last binding went with the process
    assert!(host.registry.query_environment(&second).is_err());
}

#[test]
fn unbound_processes_are_left_alone_unless_enabled() {
    let host = Host::new(1);
    host.processes.spawn(500, 50_000);
    host.inventory.set_samples(vec![sample(0, 500, GIB)]);

    let report = host.engine(policy(Duration::ZERO)).run_cycle();
    assert_eq!(report.verdict, Verdict::Compliant);

    let mut policy = policy(Duration::ZERO);
    policy.rules.non_env_processes = true;
    let report = host.engine(policy).run_cycle();

    assert_eq!(report.verdict, Verdict::Violating);
    assert_eq!(host.terminator.calls(), vec![(500, None)]);
}
