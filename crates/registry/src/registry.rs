use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use api_types::Attachment;
use api_types::DeviceInfo;
use api_types::DeviceSelector;
use api_types::DeviceView;
use api_types::Eid;
use api_types::Environment;
use api_types::EnvironmentFilter;
use api_types::EnvironmentRequest;
use api_types::HostSnapshot;
use api_types::ProcessBinding;
use chrono::Utc;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::flock::FileLock;
use utils::flock::LockMode;
use utils::flock::LockOptions;
use utils::process::ProcessProbe;

use crate::document::RegistryState;
use crate::error::RegistryError;
use crate::error::Result;
use crate::selection;
use crate::store::RegistryStore;

/// Outcome of [`Registry::reap`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Bindings removed because their process is gone, as `(eid, pid)`
    pub removed: Vec<(Eid, u32)>,
    /// Environments destroyed because they lost their last binding
    pub deregistered: Vec<Eid>,
}

/// Handle to the environment registry of one host.
///
/// Handles are cheap and hold no state between calls: every operation is one
/// transaction against the registry file, so independent processes may each
/// open their own handle on the same path.
#[derive(Debug, Clone)]
pub struct Registry {
    store: RegistryStore,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_lock_options(path, LockOptions::default())
    }

    pub fn with_lock_options(path: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        Self {
            store: RegistryStore::new(path, lock_options),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Records the host's devices.
    ///
    /// Attachments always refer to this list, so it should be refreshed from
    /// the device inventory before environments are created. Devices that
    /// left the inventory are detached from every healthy environment and
    /// returned as `(eid, index)`.
    pub fn ensure_devices(&self, devices: &[DeviceInfo]) -> Result<Vec<(Eid, u32)>> {
        let mut devices = devices.to_vec();
        devices.sort_by_key(|d| d.index);
        devices.dedup_by_key(|d| d.index);

        let lost = self.store.transaction(|state| {
            let mut lost = Vec::new();
            if state.devices == devices {
                return Ok(lost);
            }
            if !state.devices.is_empty() {
                warn!(
                    previous = state.devices.len(),
                    current = devices.len(),
                    "device inventory changed"
                );
            }

            let present: BTreeSet<u32> = devices.iter().map(|d| d.index).collect();
            for (eid, env) in state.environments.iter_mut() {
                let before = env.attachments.len();
                env.attachments.retain(|a| {
                    let keep = present.contains(&a.index);
                    if !keep {
                        lost.push((eid.clone(), a.index));
                    }
                    keep
                });
                if env.attachments.len() != before {
                    sync_bindings(env);
                }
            }
            state.devices = devices;
            Ok(lost)
        })?;

        for (eid, index) in &lost {
            warn!(eid = %eid, index, "detached device missing from inventory");
        }
        Ok(lost)
    }

    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.store.read()?.devices)
    }

    /// Full decoded registry content, quarantined records included.
    pub fn state(&self) -> Result<RegistryState> {
        self.store.read()
    }

    pub fn create_environment(&self, request: EnvironmentRequest) -> Result<Eid> {
        let eid = Eid(uuid::Uuid::new_v4().simple().to_string());

        let env = Environment {
            eid: eid.clone(),
            owner: request.owner,
            name: request.name,
            created_at: Utc::now(),
            capacity: request.capacity,
            allow_over_subscription: request.allow_over_subscription,
            persistent: request.persistent,
            enforce_memory: request.enforce_memory,
            attachments: Vec::new(),
            bindings: Vec::new(),
        };

        self.store.transaction(|state| {
            state.environments.insert(eid.clone(), env);
            Ok(())
        })?;

        info!(eid = %eid, "environment created");
        Ok(eid)
    }

    /// Attaches devices to `eid` and returns all of its devices in attachment
    /// order.
    ///
    /// Attachment only grows an environment: asking for fewer devices than it
    /// already holds leaves it untouched.
    pub fn attach_devices(&self, eid: &Eid, selector: &DeviceSelector) -> Result<Vec<u32>> {
        let devices = self.store.transaction(|state| {
            let env = state.environment(eid)?;
            let max_devices = env.capacity.max_devices;
            let over = env.allow_over_subscription;
            let current = env.attachments.len();

            let new = match selector {
                DeviceSelector::Auto => {
                    let want = max_devices as usize;
                    selection::least_loaded(state, env, want.saturating_sub(current))?
                }
                DeviceSelector::Count(count) => {
                    let want = *count as usize;
                    if *count > max_devices && !over {
                        return Err(RegistryError::CapacityExceeded {
                            eid: eid.clone(),
                            requested: want,
                            max_devices,
                        });
                    }
                    selection::least_loaded(state, env, want.saturating_sub(current))?
                }
                DeviceSelector::Indices(indices) => explicit(state, env, indices)?,
            };

            let now = Utc::now();
            let env = state.environment_mut(eid)?;
            env.attachments.extend(new.iter().map(|&index| Attachment {
                index,
                attached_at: now,
            }));
            sync_bindings(env);

            Ok(env.devices())
        })?;

        info!(eid = %eid, ?devices, "devices attached");
        Ok(devices)
    }

    /// Detaches `index`, or every device when `None`, and returns what was
    /// detached.
    pub fn detach_devices(&self, eid: &Eid, index: Option<u32>) -> Result<Vec<u32>> {
        let detached = self.store.transaction(|state| {
            let env = state.environment_mut(eid)?;
            let (detached, kept): (Vec<_>, Vec<_>) = env
                .attachments
                .drain(..)
                .partition(|a| index.map_or(true, |i| a.index == i));
            env.attachments = kept;
            sync_bindings(env);
            Ok(detached.into_iter().map(|a| a.index).collect::<Vec<_>>())
        })?;

        if !detached.is_empty() {
            info!(eid = %eid, ?detached, "devices detached");
        }
        Ok(detached)
    }

    /// Binds the process `(pid, start_token)` to `eid`.
    ///
    /// Rebinding the same process to the same environment is a no-op. A
    /// binding for a recycled pid is dropped, and its environment deregistered
    /// if that left it empty.
    pub fn bind_process(&self, eid: &Eid, pid: u32, start_token: u64) -> Result<()> {
        self.store.transaction(|state| {
            state.environment(eid)?;

            let mut stale = Vec::new();
            for (other, env) in state.environments.iter_mut() {
                let Some(binding) = env.binding(pid) else {
                    continue;
                };
                if other == eid {
                    if binding.start_token == start_token {
                        return Ok(());
                    }
                } else if binding.start_token == start_token {
                    return Err(RegistryError::DuplicateBinding {
                        pid,
                        eid: other.clone(),
                    });
                } else {
                    stale.push(other.clone());
                }
                env.bindings.retain(|b| b.pid != pid);
            }

            let env = state.environment_mut(eid)?;
            let devices = env.devices();
            env.bindings.push(ProcessBinding {
                pid,
                start_token,
                bound_at: Utc::now(),
                devices,
            });

            for other in stale {
                warn!(pid, eid = %other, "dropped binding of recycled pid");
                deregister_if_empty_in(state, &other)?;
            }
            Ok(())
        })?;

        info!(eid = %eid, pid, start_token, "process bound");
        Ok(())
    }

    /// Removes the binding of `pid` and returns the environment it was bound
    /// to. The environment itself is left for [`Registry::deregister_if_empty`].
    pub fn detach_process(&self, pid: u32) -> Result<Option<Eid>> {
        let eid = self.store.transaction(|state| {
            for (eid, env) in state.environments.iter_mut() {
                if env.binding(pid).is_some() {
                    env.bindings.retain(|b| b.pid != pid);
                    return Ok(Some(eid.clone()));
                }
            }
            Ok(None)
        })?;

        if let Some(eid) = &eid {
            info!(eid = %eid, pid, "process detached");
        }
        Ok(eid)
    }

    pub fn query_environment(&self, eid: &Eid) -> Result<Environment> {
        self.store.read()?.environment(eid).cloned()
    }

    /// Environments matching `filter`, oldest first.
    pub fn list_environments(&self, filter: &EnvironmentFilter) -> Result<Vec<Environment>> {
        let state = self.store.read()?;
        let mut envs: Vec<_> = state
            .environments
            .into_values()
            .filter(|env| filter.matches(env))
            .collect();
        envs.sort_by(|a, b| (a.created_at, &a.eid).cmp(&(b.created_at, &b.eid)));
        Ok(envs)
    }

    /// Destroys `eid` if no process is bound to it and it is not persistent.
    ///
    /// Returns whether the environment was destroyed; an environment that is
    /// already gone yields `false`.
    pub fn deregister_if_empty(&self, eid: &Eid) -> Result<bool> {
        self.store
            .transaction(|state| deregister_if_empty_in(state, eid))
    }

    /// Drops every binding and the persistence flag of `eid`, then
    /// deregisters it.
    pub fn deactivate(&self, eid: &Eid) -> Result<bool> {
        self.store.transaction(|state| {
            let env = state.environment_mut(eid)?;
            env.bindings.clear();
            env.persistent = false;
            deregister_if_empty_in(state, eid)
        })
    }

    pub fn set_name(&self, eid: &Eid, name: Option<String>) -> Result<()> {
        self.store.transaction(|state| {
            state.environment_mut(eid)?.name = name;
            Ok(())
        })
    }

    /// Removes bindings whose process exited or whose pid was recycled and
    /// deregisters the environments this emptied.
    ///
    /// Environments nobody ever bound to are left alone.
    pub fn reap(&self, probe: &dyn ProcessProbe) -> Result<ReapReport> {
        let report = self.store.transaction(|state| {
            let mut report = ReapReport::default();
            let mut emptied = BTreeSet::new();

            for (eid, env) in state.environments.iter_mut() {
                let before = env.bindings.len();
                env.bindings.retain(|b| {
                    let alive = probe.is_alive(b.pid, b.start_token);
                    if !alive {
                        report.removed.push((eid.clone(), b.pid));
                    }
                    alive
                });
                if before > 0 && env.bindings.is_empty() {
                    emptied.insert(eid.clone());
                }
            }

            for eid in emptied {
                if deregister_if_empty_in(state, &eid)? {
                    report.deregistered.push(eid);
                }
            }
            Ok(report)
        })?;

        for (eid, pid) in &report.removed {
            info!(eid = %eid, pid, "reaped binding of exited process");
        }
        Ok(report)
    }

    /// Device view of `pid`, `None` when the process is not bound.
    ///
    /// With `start_token` set, a binding left behind by an earlier process
    /// with the same pid is not reported. A process still named by a
    /// quarantined record is bound to an environment that cannot be read,
    /// which is a [`RegistryError::CorruptRecord`] rather than "not bound".
    pub fn resolve_view(&self, pid: u32, start_token: Option<u64>) -> Result<Option<DeviceView>> {
        let state = self.store.read()?;
        let view = state.environments.values().find_map(|env| {
            let binding = env.binding(pid)?;
            if start_token.is_some_and(|token| token != binding.start_token) {
                return None;
            }
            Some(DeviceView {
                eid: env.eid.clone(),
                device_indices: env.devices(),
                memory_budget: env.capacity.memory_budget,
                device_memory: env.capacity.device_memory,
            })
        });
        if view.is_some() {
            return Ok(view);
        }

        match state.quarantined_binding(pid, start_token) {
            Some((eid, reason)) => Err(RegistryError::CorruptRecord {
                eid: Some(eid.clone()),
                reason: reason.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Devices attached to the environment `pid` is bound to, empty when the
    /// process is not bound.
    pub fn bound_devices(&self, pid: u32, start_token: Option<u64>) -> Result<Vec<u32>> {
        Ok(self
            .resolve_view(pid, start_token)?
            .map(|view| view.device_indices)
            .unwrap_or_default())
    }

    /// Takes the exclusive lock of every device in `indices`.
    ///
    /// Device locks serialize cooperating processes that share devices, one
    /// lock file per device next to the registry. They are acquired in index
    /// order so two callers never wait on each other's devices, and released
    /// when the returned guard drops.
    pub fn lock_devices(&self, indices: &[u32], options: LockOptions) -> Result<DeviceLocks> {
        let state = self.store.read()?;
        let mut indices = indices.to_vec();
        indices.sort_unstable();
        indices.dedup();
        if let Some(&index) = indices.iter().find(|&&i| !state.has_device(i)) {
            return Err(RegistryError::UnknownDevice { index });
        }

        let dir = self.device_lock_dir();
        let mut locks = Vec::with_capacity(indices.len());
        for &index in &indices {
            let path = dir.join(format!("{index}.lock"));
            locks.push(FileLock::acquire(&path, LockMode::Exclusive, options)?);
        }

        debug!(?indices, "devices locked");
        Ok(DeviceLocks { indices, _locks: locks })
    }

    fn device_lock_dir(&self) -> PathBuf {
        self.path()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("devices")
    }

    pub fn snapshot(&self, hostname: Option<String>) -> Result<HostSnapshot> {
        let state = self.store.read()?;
        let quarantined = state.quarantined();
        Ok(HostSnapshot {
            hostname,
            taken_at: Utc::now(),
            devices: state.devices,
            environments: state.environments.into_values().collect(),
            quarantined,
        })
    }

    /// Deletes a quarantined record. Healthy environments cannot be discarded.
    pub fn discard_quarantined(&self, eid: &Eid) -> Result<bool> {
        let discarded = self
            .store
            .transaction(|state| Ok(state.quarantined.remove(eid).is_some()))?;
        if discarded {
            warn!(eid = %eid, "discarded quarantined environment record");
        }
        Ok(discarded)
    }
}

/// Exclusive locks on a set of devices, released on drop
#[derive(Debug)]
pub struct DeviceLocks {
    indices: Vec<u32>,
    _locks: Vec<FileLock>,
}

impl DeviceLocks {
    /// Locked devices in acquisition order
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }
}

fn explicit(state: &RegistryState, env: &Environment, indices: &[u32]) -> Result<Vec<u32>> {
    let mut new = Vec::new();
    for &index in indices {
        if !state.has_device(index) {
            return Err(RegistryError::UnknownDevice { index });
        }
        if !env.is_attached(index) && !new.contains(&index) {
            new.push(index);
        }
    }

    let total = env.attachments.len() + new.len();
    if total > env.capacity.max_devices as usize && !env.allow_over_subscription {
        return Err(RegistryError::CapacityExceeded {
            eid: env.eid.clone(),
            requested: total,
            max_devices: env.capacity.max_devices,
        });
    }

    if !env.allow_over_subscription {
        let reservations = state.reservations();
        let available = new
            .iter()
            .filter(|&&index| {
                selection::is_available(state, &reservations, index, env.capacity.device_memory)
            })
            .count();
        if available < new.len() {
            return Err(RegistryError::InsufficientCapacity {
                requested: new.len(),
                available,
            });
        }
    }

    Ok(new)
}

fn sync_bindings(env: &mut Environment) {
    let devices = env.devices();
    for binding in &mut env.bindings {
        binding.devices.clone_from(&devices);
    }
}

/// The only place an environment is destroyed.
fn deregister_if_empty_in(state: &mut RegistryState, eid: &Eid) -> Result<bool> {
    let env = match state.environment(eid) {
        Ok(env) => env,
        Err(RegistryError::UnknownEnvironment { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    if env.is_active() || env.persistent {
        return Ok(false);
    }

    state.environments.remove(eid);
    info!(eid = %eid, "environment deregistered");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use api_types::Capacity;
    use api_types::Owner;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    const GIB: u64 = 1 << 30;

    struct FakeProcessTable(HashMap<u32, u64>);

    impl ProcessProbe for FakeProcessTable {
        fn start_token(&self, pid: u32) -> Option<u64> {
            self.0.get(&pid).copied()
        }
    }

    fn registry(dir: &Path, devices: u32) -> Registry {
        let registry = Registry::with_lock_options(
            dir.join("registry.json"),
            LockOptions::with_timeout(Duration::from_secs(2)),
        );
        let devices: Vec<_> = (0..devices)
            .map(|index| DeviceInfo {
                index,
                total_memory: 16 * GIB,
            })
            .collect();
        registry.ensure_devices(&devices).unwrap();
        registry
    }

    fn request(uid: u32, max_devices: u32) -> EnvironmentRequest {
        EnvironmentRequest::new(
            Owner {
                uid,
                username: Some(format!("user{uid}")),
            },
            Capacity {
                max_devices,
                memory_budget: Some(4 * GIB),
                device_memory: None,
            },
        )
    }

    #[test]
    fn auto_attach_fills_to_capacity_and_never_shrinks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4);
        let eid = registry.create_environment(request(1, 2)).unwrap();

        assert_eq!(
            registry.attach_devices(&eid, &DeviceSelector::Auto).unwrap(),
            vec![0, 1]
        );
        assert_eq!(
            registry
                .attach_devices(&eid, &DeviceSelector::Count(1))
                .unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn count_over_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4);
        let eid = registry.create_environment(request(1, 1)).unwrap();

        let err = registry
            .attach_devices(&eid, &DeviceSelector::Count(2))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::CapacityExceeded {
                requested: 2,
                max_devices: 1,
                ..
            }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn explicit_indices_keep_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4);
        let eid = registry.create_environment(request(1, 3)).unwrap();

        let devices = registry
            .attach_devices(&eid, &DeviceSelector::Indices(vec![2, 0]))
            .unwrap();
        assert_eq!(devices, vec![2, 0]);

        let err = registry
            .attach_devices(&eid, &DeviceSelector::Indices(vec![9]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDevice { index: 9 }));
    }

    #[test]
    fn explicit_index_held_elsewhere_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let a = registry.create_environment(request(1, 1)).unwrap();
        let b = registry.create_environment(request(2, 1)).unwrap();
        registry
            .attach_devices(&a, &DeviceSelector::Indices(vec![1]))
            .unwrap();

        let err = registry
            .attach_devices(&b, &DeviceSelector::Indices(vec![1]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InsufficientCapacity { .. }));
    }

    #[test]
    fn over_subscribed_environment_may_share_and_exceed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let a = registry.create_environment(request(1, 2)).unwrap();
        registry.attach_devices(&a, &DeviceSelector::Auto).unwrap();

        let mut req = request(2, 1);
        req.allow_over_subscription = true;
        let b = registry.create_environment(req).unwrap();

        let devices = registry
            .attach_devices(&b, &DeviceSelector::Count(2))
            .unwrap();
        assert_eq!(devices, vec![0, 1]);
    }

    #[test]
    fn binding_follows_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 3);
        let eid = registry.create_environment(request(1, 2)).unwrap();
        registry.bind_process(&eid, 100, 7).unwrap();

        registry
            .attach_devices(&eid, &DeviceSelector::Indices(vec![2]))
            .unwrap();
        let view = registry.resolve_view(100, Some(7)).unwrap().unwrap();
        assert_eq!(view.device_indices, vec![2]);
        assert_eq!(view.memory_budget, Some(4 * GIB));

        registry.detach_devices(&eid, Some(2)).unwrap();
        let env = registry.query_environment(&eid).unwrap();
        assert_eq!(env.binding(100).unwrap().devices, Vec::<u32>::new());
    }

    #[test]
    fn duplicate_binding_is_rejected_but_rebind_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let a = registry.create_environment(request(1, 1)).unwrap();
        let b = registry.create_environment(request(1, 1)).unwrap();

        registry.bind_process(&a, 55, 1).unwrap();
        registry.bind_process(&a, 55, 1).unwrap();

        let err = registry.bind_process(&b, 55, 1).unwrap_err();
        assert!(
            matches!(&err, RegistryError::DuplicateBinding { pid: 55, eid } if *eid == a),
            "got {err:?}"
        );
        assert_eq!(registry.query_environment(&a).unwrap().bindings.len(), 1);
    }

    #[test]
    fn recycled_pid_replaces_stale_binding() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let a = registry.create_environment(request(1, 1)).unwrap();
        let b = registry.create_environment(request(1, 1)).unwrap();

        registry.bind_process(&a, 55, 1).unwrap();
        registry.bind_process(&b, 55, 2).unwrap();

        assert!(matches!(
            registry.query_environment(&a),
            Err(RegistryError::UnknownEnvironment { .. })
        ));
        assert_eq!(registry.resolve_view(55, Some(1)).unwrap(), None);
        assert_eq!(registry.resolve_view(55, Some(2)).unwrap().unwrap().eid, b);
    }

    #[test]
    fn deregister_keeps_bound_and_persistent_environments() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let bound = registry.create_environment(request(1, 1)).unwrap();
        registry.bind_process(&bound, 10, 1).unwrap();
        let mut req = request(1, 1);
        req.persistent = true;
        let persistent = registry.create_environment(req).unwrap();

        assert!(!registry.deregister_if_empty(&bound).unwrap());
        assert!(!registry.deregister_if_empty(&persistent).unwrap());

        assert_eq!(registry.detach_process(10).unwrap(), Some(bound.clone()));
        assert!(registry.deregister_if_empty(&bound).unwrap());
        assert!(!registry.deregister_if_empty(&bound).unwrap());

        assert!(registry.deactivate(&persistent).unwrap());
        assert!(registry
            .list_environments(&EnvironmentFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reap_removes_dead_and_recycled_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 4);
        let dead = registry.create_environment(request(1, 1)).unwrap();
        let recycled = registry.create_environment(request(1, 1)).unwrap();
        let alive = registry.create_environment(request(1, 1)).unwrap();
        let idle = registry.create_environment(request(1, 1)).unwrap();
        registry.bind_process(&dead, 1, 10).unwrap();
        registry.bind_process(&recycled, 2, 20).unwrap();
        registry.bind_process(&alive, 3, 30).unwrap();

        let table = FakeProcessTable(HashMap::from([(2, 21), (3, 30)]));
        let report = registry.reap(&table).unwrap();

        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.deregistered.len(), 2);
        let left: BTreeSet<_> = registry
            .list_environments(&EnvironmentFilter::default())
            .unwrap()
            .into_iter()
            .map(|e| e.eid)
            .collect();
        assert_eq!(left, BTreeSet::from([alive, idle]));
    }

    #[test]
    fn list_filters_by_owner_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let a = registry.create_environment(request(1, 1)).unwrap();
        registry.create_environment(request(2, 1)).unwrap();
        registry.set_name(&a, Some("train".to_string())).unwrap();

        let filter = EnvironmentFilter {
            uid: Some(1),
            name: Some("train".to_string()),
            ..Default::default()
        };
        let envs = registry.list_environments(&filter).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].eid, a);
    }

    #[test]
    fn snapshot_reports_devices_and_environments() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        registry.create_environment(request(1, 1)).unwrap();

        let snapshot = registry.snapshot(Some("gpu-01".to_string())).unwrap();
        assert_eq!(snapshot.hostname.as_deref(), Some("gpu-01"));
        assert_eq!(snapshot.devices.len(), 2);
        assert_eq!(snapshot.environments.len(), 1);
        assert!(snapshot.quarantined.is_empty());
    }

    fn sharing(uid: u32, device_memory: u64) -> EnvironmentRequest {
        let mut req = request(uid, 1);
        req.capacity.device_memory = Some(device_memory);
        req
    }

    #[test]
    fn explicit_index_is_shared_while_reservations_fit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 1);
        let a = registry.create_environment(sharing(1, 8 * GIB)).unwrap();
        let b = registry.create_environment(sharing(2, 8 * GIB)).unwrap();
        let c = registry.create_environment(sharing(3, 1)).unwrap();
        let whole = registry.create_environment(request(4, 1)).unwrap();

        let at_zero = DeviceSelector::Indices(vec![0]);
        registry.attach_devices(&a, &at_zero).unwrap();
        registry.attach_devices(&b, &at_zero).unwrap();
        assert!(matches!(
            registry.attach_devices(&c, &at_zero).unwrap_err(),
            RegistryError::InsufficientCapacity { .. }
        ));
        assert!(matches!(
            registry.attach_devices(&whole, &at_zero).unwrap_err(),
            RegistryError::InsufficientCapacity { .. }
        ));

        registry.bind_process(&a, 10, 1).unwrap();
        let view = registry.resolve_view(10, Some(1)).unwrap().unwrap();
        assert_eq!(view.device_memory, Some(8 * GIB));
    }

    #[test]
    fn binding_in_quarantined_record_is_corrupt_not_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let eid = registry.create_environment(request(1, 1)).unwrap();
        registry.attach_devices(&eid, &DeviceSelector::Auto).unwrap();
        registry.bind_process(&eid, 500, 7).unwrap();

        let mut document: serde_json::Value =
            serde_json::from_slice(&std::fs::read(registry.path()).unwrap()).unwrap();
        document["environments"][eid.as_str()]["name"] = serde_json::json!(42);
        std::fs::write(registry.path(), serde_json::to_vec(&document).unwrap()).unwrap();

        let err = registry.resolve_view(500, Some(7)).unwrap_err();
        assert!(
            matches!(&err, RegistryError::CorruptRecord { eid: Some(e), .. } if *e == eid),
            "got {err:?}"
        );
        assert!(!err.is_transient());
        assert_eq!(registry.resolve_view(500, Some(8)).unwrap(), None);
        assert_eq!(registry.resolve_view(501, None).unwrap(), None);
    }

    #[test]
    fn shrinking_inventory_detaches_instead_of_quarantining() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 2);
        let eid = registry.create_environment(request(1, 2)).unwrap();
        registry.attach_devices(&eid, &DeviceSelector::Auto).unwrap();
        registry.bind_process(&eid, 10, 1).unwrap();

        let lost = registry
            .ensure_devices(&[DeviceInfo {
                index: 0,
                total_memory: 16 * GIB,
            }])
            .unwrap();

        assert_eq!(lost, vec![(eid.clone(), 1)]);
        let env = registry.query_environment(&eid).unwrap();
        assert_eq!(env.devices(), vec![0]);
        assert_eq!(env.binding(10).unwrap().devices, vec![0]);
        assert!(registry.state().unwrap().quarantined().is_empty());
    }

    #[test]
    fn device_locks_exclude_each_other_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 3);
        let short = LockOptions::with_timeout(Duration::from_millis(100));

        let held = registry.lock_devices(&[1, 0, 1], short).unwrap();
        assert_eq!(held.indices(), &[0, 1]);
        assert!(dir.path().join("devices").join("1.lock").exists());

        let err = registry.lock_devices(&[2, 1], short).unwrap_err();
        assert!(err.is_transient(), "got {err:?}");
        let other = registry.lock_devices(&[2], short).unwrap();
        assert_eq!(other.indices(), &[2]);

        assert!(matches!(
            registry.lock_devices(&[9], short).unwrap_err(),
            RegistryError::UnknownDevice { index: 9 }
        ));

        drop(held);
        registry.lock_devices(&[1], short).unwrap();
    }
}
