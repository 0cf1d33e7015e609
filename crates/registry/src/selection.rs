use std::collections::HashMap;

use api_types::Environment;

use crate::document::RegistryState;
use crate::error::RegistryError;
use crate::error::Result;

/// Picks `count` more devices for `env`.
///
/// Devices are ranked by how many environments already hold them, ties going
/// to the lower index. Without over-subscription only devices where
/// [`is_available`] holds for the environment's reservation are eligible.
pub(crate) fn least_loaded(
    state: &RegistryState,
    env: &Environment,
    count: usize,
) -> Result<Vec<u32>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let reservations = state.reservations();
    let mut candidates: Vec<(usize, u32)> = state
        .devices
        .iter()
        .map(|d| d.index)
        .filter(|index| !env.is_attached(*index))
        .filter(|index| {
            env.allow_over_subscription
                || is_available(state, &reservations, *index, env.capacity.device_memory)
        })
        .map(|index| (reservations.get(&index).map_or(0, Vec::len), index))
        .collect();

    if candidates.len() < count {
        return Err(RegistryError::InsufficientCapacity {
            requested: count,
            available: candidates.len(),
        });
    }

    candidates.sort_unstable();
    Ok(candidates
        .into_iter()
        .take(count)
        .map(|(_, index)| index)
        .collect())
}

/// Whether `index` can take one more holder reserving `memory` on it.
///
/// A whole-device holder (`None`) needs the device to itself. A reservation
/// fits while the memory other holders reserved leaves room for it; whole
/// devices count as reserving all of their memory.
pub(crate) fn is_available(
    state: &RegistryState,
    reservations: &HashMap<u32, Vec<Option<u64>>>,
    index: u32,
    memory: Option<u64>,
) -> bool {
    match memory {
        None => reservations.get(&index).map_or(true, Vec::is_empty),
        Some(memory) => state
            .unreserved_memory(index, reservations)
            .is_some_and(|free| free >= memory),
    }
}
