//! Exclusive use of an environment's devices for the duration of a command.
//!
//! Environments sharing a device by memory reservation cooperate through the
//! registry's per-device locks: a command run under [`run_locked`] holds every
//! device of its environment until it exits.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::process::ExitStatus;

use anyhow::Context;
use anyhow::Result;
use api_types::Eid;
use registry::Registry;
use utils::flock::LockOptions;
use utils::process::ProcessProbe;

/// Whose devices to lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTarget {
    Environment(Eid),
    /// The environment a live process is bound to
    Process(u32),
}

/// Devices attached to the environment of `target`, empty for a process bound
/// to no environment.
pub fn devices_of(
    registry: &Registry,
    target: &LockTarget,
    processes: &dyn ProcessProbe,
) -> registry::Result<Vec<u32>> {
    match target {
        LockTarget::Environment(eid) => Ok(registry.query_environment(eid)?.devices()),
        LockTarget::Process(pid) => match processes.start_token(*pid) {
            Some(token) => registry.bound_devices(*pid, Some(token)),
            None => Ok(Vec::new()),
        },
    }
}

/// Runs `command` while holding the locks of `devices`. Without devices the
/// command runs unlocked.
pub fn run_locked(
    registry: &Registry,
    devices: &[u32],
    options: LockOptions,
    command: &[String],
) -> Result<ExitStatus> {
    let (program, args) = command.split_first().context("no command to run")?;

    let locks = if devices.is_empty() {
        tracing::info!("No devices to lock, running unlocked");
        None
    } else {
        let locks = registry
            .lock_devices(devices, options)
            .with_context(|| format!("failed to lock devices {devices:?}"))?;
        tracing::info!(devices = ?locks.indices(), "Devices locked");
        Some(locks)
    };

    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program}"))?;
    drop(locks);
    Ok(status)
}

/// Exit code reporting `status` the way a shell does
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;

    use api_types::Capacity;
    use api_types::DeviceInfo;
    use api_types::DeviceSelector;
    use api_types::EnvironmentRequest;
    use api_types::Owner;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    struct FakeProcessTable(HashMap<u32, u64>);

    impl ProcessProbe for FakeProcessTable {
        fn start_token(&self, pid: u32) -> Option<u64> {
            self.0.get(&pid).copied()
        }
    }

    fn registry(dir: &Path) -> Registry {
        let registry = Registry::with_lock_options(
            dir.join("registry.json"),
            LockOptions::with_timeout(Duration::from_secs(2)),
        );
        let devices: Vec<_> = (0..3)
            .map(|index| DeviceInfo {
                index,
                total_memory: 1 << 34,
            })
            .collect();
        registry.ensure_devices(&devices).unwrap();
        registry
    }

    fn environment(registry: &Registry, devices: Vec<u32>) -> Eid {
        let eid = registry
            .create_environment(EnvironmentRequest::new(
                Owner {
                    uid: 1000,
                    username: None,
                },
                Capacity {
                    max_devices: 2,
                    memory_budget: None,
                    device_memory: Some(1 << 30),
                },
            ))
            .unwrap();
        registry
            .attach_devices(&eid, &DeviceSelector::Indices(devices))
            .unwrap();
        eid
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn target_devices_follow_the_environment() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let eid = environment(&registry, vec![2, 0]);
        registry.bind_process(&eid, 40, 4).unwrap();
        let table = FakeProcessTable(HashMap::from([(40, 4), (41, 1)]));

        let by_eid = devices_of(&registry, &LockTarget::Environment(eid), &table).unwrap();
        assert_eq!(by_eid, vec![2, 0]);
        assert_eq!(
            devices_of(&registry, &LockTarget::Process(40), &table).unwrap(),
            vec![2, 0]
        );
        assert!(devices_of(&registry, &LockTarget::Process(41), &table)
            .unwrap()
            .is_empty());
        assert!(devices_of(&registry, &LockTarget::Process(42), &table)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn command_runs_under_the_locks_and_keeps_its_status() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let status = run_locked(
            &registry,
            &[0, 1],
            LockOptions::with_timeout(Duration::from_millis(100)),
            &sh("exit 3"),
        )
        .unwrap();
        assert_eq!(exit_code(status), 3);

        let unlocked = run_locked(
            &registry,
            &[],
            LockOptions::default(),
            &sh("exit 0"),
        )
        .unwrap();
        assert!(unlocked.success());
    }

    #[test]
    fn held_device_times_out_without_running_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let marker = dir.path().join("ran");
        let _held = registry
            .lock_devices(&[1], LockOptions::default())
            .unwrap();

        let err = run_locked(
            &registry,
            &[0, 1],
            LockOptions::with_timeout(Duration::from_millis(100)),
            &sh(&format!("touch {}", marker.display())),
        )
        .unwrap_err();

        assert!(err.to_string().contains("failed to lock devices"), "{err:#}");
        assert!(!marker.exists());
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        assert!(run_locked(&registry, &[], LockOptions::default(), &[]).is_err());
    }
}
