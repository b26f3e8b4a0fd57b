//! Bleed-switch selection under the neighbor interlock

use heapless::Vec;

use crate::pack::{BmbState, Pack, NUM_BRICKS_PER_BMB};

/// How far above the lowest brick a cell must sit before it is bled.
pub const BALANCE_THRESHOLD: f32 = 0.002;
/// Bricks are never bled below this voltage.
pub const MIN_BLEED_TARGET_VOLTAGE: f32 = 3.30;

#[derive(Clone, Copy)]
struct Candidate {
    brick: usize,
    voltage: f32,
}

// Plain insertion sort, ascending by voltage. Stable, so equal voltages keep
// their brick order.
fn sort_by_voltage(candidates: &mut [Candidate]) {
    for unsorted in 1..candidates.len() {
        let entry = candidates[unsorted];
        let mut i = unsorted;
        while i > 0 && candidates[i - 1].voltage > entry.voltage {
            candidates[i] = candidates[i - 1];
            i -= 1;
        }
        candidates[i] = entry;
    }
}

/// Pick the subset of requested bricks that may actually bleed.
///
/// The bleed circuit cannot dissipate two neighboring bricks at once, so the
/// highest-voltage bricks are activated first and anything adjacent to an
/// already-active switch is skipped.
pub fn select_balance_switches(bmb: &mut BmbState) {
    let mut candidates: Vec<Candidate, NUM_BRICKS_PER_BMB> = Vec::new();
    for (brick, &requested) in bmb.bal_requested.iter().enumerate() {
        if requested {
            // Cannot overflow: at most one candidate per brick.
            let _ = candidates.push(Candidate {
                brick,
                voltage: bmb.brick_v[brick],
            });
        }
    }

    sort_by_voltage(&mut candidates);

    bmb.bal_active = [false; NUM_BRICKS_PER_BMB];

    for candidate in candidates.iter().rev() {
        let left_clear = candidate.brick == 0 || !bmb.bal_active[candidate.brick - 1];
        let right_clear =
            candidate.brick + 1 >= NUM_BRICKS_PER_BMB || !bmb.bal_active[candidate.brick + 1];

        if left_clear && right_clear {
            bmb.bal_active[candidate.brick] = true;
        }
    }
}

/// Recompute per-brick bleed requests for the whole pack.
///
/// With balancing off every request is dropped; otherwise bricks above the
/// pack-wide target (lowest board minimum plus the balance threshold, floored
/// at the bleed limit) are requested.
pub fn set_bleed_requests(pack: &mut Pack, balance_requested: bool) {
    if !balance_requested {
        for bmb in pack.bmb.iter_mut() {
            bmb.bal_requested = [false; NUM_BRICKS_PER_BMB];
        }
        return;
    }

    let mut target = f32::MAX;
    for bmb in pack.bmb.iter() {
        if bmb.min_brick_v + BALANCE_THRESHOLD < target {
            target = bmb.min_brick_v + BALANCE_THRESHOLD;
        }
    }
    if target < MIN_BLEED_TARGET_VOLTAGE {
        target = MIN_BLEED_TARGET_VOLTAGE;
    }

    for bmb in pack.bmb.iter_mut() {
        for brick in 0..NUM_BRICKS_PER_BMB {
            bmb.bal_requested[brick] = bmb.brick_v[brick] > target;
        }
    }
}

/// Request bleeding of everything above an explicit target voltage.
pub fn set_bleed_requests_to_voltage(pack: &mut Pack, target: f32) {
    let target = if target < MIN_BLEED_TARGET_VOLTAGE {
        MIN_BLEED_TARGET_VOLTAGE
    } else {
        target
    };

    for bmb in pack.bmb.iter_mut() {
        for brick in 0..NUM_BRICKS_PER_BMB {
            bmb.bal_requested[brick] = bmb.brick_v[brick] > target + BALANCE_THRESHOLD;
        }
    }
}
