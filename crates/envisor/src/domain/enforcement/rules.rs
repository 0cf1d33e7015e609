use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::collections::HashMap;

use api_types::Environment;
use api_types::ProcessBinding;

use super::Action;
use super::EnforcementMode;
use super::EnforcementPolicy;
use super::Observation;
use super::VictimPolicy;
use super::Violation;
use super::ViolationKey;

/// Every violation of the enabled rules, in rule order
pub fn evaluate(observation: &Observation, policy: &EnforcementPolicy) -> Vec<Violation> {
    let mut violations = Vec::new();
    if policy.rules.env_memory {
        violations.extend(env_memory(observation, policy));
    }
    if policy.rules.env_devices {
        violations.extend(env_devices(observation));
    }
    if policy.rules.non_env_processes {
        violations.extend(non_env_processes(observation));
    }
    violations.extend(max_devices_per_user(observation, policy));
    violations
}

fn terminate(env: &Environment, binding: &ProcessBinding) -> Action {
    Action::Terminate {
        pid: binding.pid,
        start_token: Some(binding.start_token),
        eid: Some(env.eid.clone()),
    }
}

/// Environments whose aggregate memory use on their attached devices exceeds
/// the budget, or whose use of one device exceeds their reservation on it.
pub fn env_memory(observation: &Observation, policy: &EnforcementPolicy) -> Vec<Violation> {
    let mut violations = Vec::new();
    for env in &observation.environments {
        if !env.enforce_memory {
            continue;
        }

        if let Some(budget) = env.capacity.memory_budget {
            let usage = observation.usage_in(env);
            if let Some(actions) = over_limit(env, &usage, budget, policy) {
                violations.push(Violation {
                    key: ViolationKey::EnvMemory(env.eid.clone()),
                    observed: usage.values().sum(),
                    limit: budget,
                    actions,
                });
            }
        }

        let Some(reserved) = env.capacity.device_memory else {
            continue;
        };
        for index in env.devices() {
            let usage = observation.usage_on(env, index);
            if let Some(actions) = over_limit(env, &usage, reserved, policy) {
                violations.push(Violation {
                    key: ViolationKey::EnvDeviceMemory {
                        eid: env.eid.clone(),
                        index,
                    },
                    observed: usage.values().sum(),
                    limit: reserved,
                    actions,
                });
            }
        }
    }
    violations
}

/// Terminations bringing `usage` back within `limit`, `None` when it already is
fn over_limit(
    env: &Environment,
    usage: &HashMap<u32, u64>,
    limit: u64,
    policy: &EnforcementPolicy,
) -> Option<Vec<Action>> {
    let used: u64 = usage.values().sum();
    if used <= limit {
        return None;
    }

    let victims: Vec<&ProcessBinding> = match policy.mode {
        EnforcementMode::Hard => env.bindings.iter().collect(),
        EnforcementMode::Soft => {
            let over = used - limit;
            let mut freed = 0;
            order_victims(env, usage, policy.victim_policy)
                .into_iter()
                .take_while(|binding| {
                    let more = freed < over;
                    freed += usage.get(&binding.pid).copied().unwrap_or(0);
                    more
                })
                .collect()
        }
    };
    Some(
        victims
            .into_iter()
            .map(|binding| terminate(env, binding))
            .collect(),
    )
}

/// Bound processes of `env` with memory in use, in termination order
pub fn order_victims<'a>(
    env: &'a Environment,
    usage: &HashMap<u32, u64>,
    policy: VictimPolicy,
) -> Vec<&'a ProcessBinding> {
    let mut victims: Vec<&ProcessBinding> = env
        .bindings
        .iter()
        .filter(|binding| usage.get(&binding.pid).is_some_and(|&used| used > 0))
        .collect();

    match policy {
        VictimPolicy::NewestFirst => {
            victims.sort_by_key(|b| (Reverse(b.bound_at), Reverse(b.pid)));
        }
        VictimPolicy::OldestFirst => victims.sort_by_key(|b| (b.bound_at, b.pid)),
        VictimPolicy::LargestConsumer => victims.sort_by_key(|b| {
            (
                Reverse(usage.get(&b.pid).copied().unwrap_or(0)),
                Reverse(b.bound_at),
                Reverse(b.pid),
            )
        }),
    }
    victims
}

/// Bound processes using a device that is not attached to their environment
pub fn env_devices(observation: &Observation) -> Vec<Violation> {
    let mut offenders: BTreeMap<u32, Violation> = BTreeMap::new();
    for sample in &observation.samples {
        let Some((env, binding)) = observation.owner_of(sample.pid) else {
            continue;
        };
        if env.is_attached(sample.device_index) {
            continue;
        }

        let violation = offenders.entry(sample.pid).or_insert_with(|| Violation {
            key: ViolationKey::EnvDevices {
                eid: env.eid.clone(),
                pid: sample.pid,
            },
            observed: 0,
            limit: 0,
            actions: vec![terminate(env, binding)],
        });
        violation.observed += 1;
    }
    offenders.into_values().collect()
}

/// GPU processes bound to no environment
pub fn non_env_processes(observation: &Observation) -> Vec<Violation> {
    let mut offenders: BTreeMap<u32, u64> = BTreeMap::new();
    for sample in &observation.samples {
        if observation.owner_of(sample.pid).is_none() {
            *offenders.entry(sample.pid).or_default() += sample.used_memory;
        }
    }

    offenders
        .into_iter()
        .map(|(pid, used)| Violation {
            key: ViolationKey::NonEnvProcess(pid),
            observed: used,
            limit: 0,
            actions: vec![Action::Terminate {
                pid,
                start_token: None,
                eid: None,
            }],
        })
        .collect()
}

/// Users holding more attached devices than allowed lose their most
/// recently attached ones.
pub fn max_devices_per_user(observation: &Observation, policy: &EnforcementPolicy) -> Vec<Violation> {
    let mut by_user: BTreeMap<String, Vec<&Environment>> = BTreeMap::new();
    for env in &observation.environments {
        let user = env
            .owner
            .username
            .clone()
            .unwrap_or_else(|| env.owner.uid.to_string());
        by_user.entry(user).or_default().push(env);
    }

    let mut violations = Vec::new();
    for (user, envs) in by_user {
        let Some(maximum) = policy.max_devices_for(&user) else {
            continue;
        };

        let mut attachments: Vec<_> = envs
            .iter()
            .flat_map(|env| env.attachments.iter().map(move |a| (*env, a)))
            .collect();
        let attached = attachments.len() as u64;
        let over = attached.saturating_sub(u64::from(maximum));
        if over == 0 {
            continue;
        }

        attachments.sort_by_key(|(env, a)| (Reverse(a.attached_at), Reverse(a.index), env.eid.clone()));

        let mut actions = Vec::new();
        for (env, attachment) in attachments.into_iter().take(over as usize) {
            actions.push(Action::Detach {
                eid: env.eid.clone(),
                index: attachment.index,
            });
            for sample in &observation.samples {
                if sample.device_index != attachment.index {
                    continue;
                }
                if let Some(binding) = env.binding(sample.pid) {
                    actions.push(terminate(env, binding));
                }
            }
        }

        violations.push(Violation {
            key: ViolationKey::UserDevices(user),
            observed: attached,
            limit: u64::from(maximum),
            actions,
        });
    }
    violations
}
