//! Min/max/avg roll-up over boards and the whole pack

use crate::pack::{BmbState, Pack, NUM_BMBS_PER_PACK};

// Aggregation ignores readings whose status is not Good; a subset of bad
// bricks must not drag the extrema around. A board with no good readings at
// all keeps its previous aggregates.
fn stats(values: &[f32], good: impl Fn(usize) -> bool) -> Option<(f32, f32, f32)> {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    let mut sum = 0.0;
    let mut count = 0;

    for (i, &value) in values.iter().enumerate() {
        if !good(i) {
            continue;
        }
        if value > max {
            max = value;
        }
        if value < min {
            min = value;
        }
        sum += value;
        count += 1;
    }

    (count > 0).then(|| (min, max, sum / count as f32))
}

/// Recompute one board's min/max/avg and stack voltage.
pub fn aggregate_bmb(bmb: &mut BmbState) {
    if let Some((min, max, avg)) = stats(&bmb.brick_v, |i| bmb.brick_v_status[i].is_good()) {
        bmb.min_brick_v = min;
        bmb.max_brick_v = max;
        bmb.avg_brick_v = avg;
    }

    if let Some((min, max, avg)) = stats(&bmb.brick_temp, |i| bmb.brick_temp_status[i].is_good()) {
        bmb.min_brick_temp = min;
        bmb.max_brick_temp = max;
        bmb.avg_brick_temp = avg;
    }

    if let Some((min, max, avg)) = stats(&bmb.board_temp, |i| bmb.board_temp_status[i].is_good()) {
        bmb.min_board_temp = min;
        bmb.max_board_temp = max;
        bmb.avg_board_temp = avg;
    }

    // The stack voltage is the raw sum, a cross-check against VBLOCK.
    bmb.stack_v = bmb.brick_v.iter().sum();
}

/// Roll all boards up to pack-level extrema and the mean of board means.
pub fn aggregate_pack(pack: &mut Pack) {
    for bmb in pack.bmb.iter_mut() {
        aggregate_bmb(bmb);
    }

    let mut max_brick_v = f32::MIN;
    let mut min_brick_v = f32::MAX;
    let mut avg_brick_v_sum = 0.0;

    let mut max_brick_temp = f32::MIN;
    let mut min_brick_temp = f32::MAX;
    let mut avg_brick_temp_sum = 0.0;

    let mut max_board_temp = f32::MIN;
    let mut min_board_temp = f32::MAX;
    let mut avg_board_temp_sum = 0.0;

    for bmb in pack.bmb.iter() {
        if bmb.max_brick_v > max_brick_v {
            max_brick_v = bmb.max_brick_v;
        }
        if bmb.min_brick_v < min_brick_v {
            min_brick_v = bmb.min_brick_v;
        }

        if bmb.max_brick_temp > max_brick_temp {
            max_brick_temp = bmb.max_brick_temp;
        }
        if bmb.min_brick_temp < min_brick_temp {
            min_brick_temp = bmb.min_brick_temp;
        }

        if bmb.max_board_temp > max_board_temp {
            max_board_temp = bmb.max_board_temp;
        }
        if bmb.min_board_temp < min_board_temp {
            min_board_temp = bmb.min_board_temp;
        }

        avg_brick_v_sum += bmb.avg_brick_v;
        avg_brick_temp_sum += bmb.avg_brick_temp;
        avg_board_temp_sum += bmb.avg_board_temp;
    }

    pack.max_brick_v = max_brick_v;
    pack.min_brick_v = min_brick_v;
    pack.avg_brick_v = avg_brick_v_sum / NUM_BMBS_PER_PACK as f32;

    pack.max_brick_temp = max_brick_temp;
    pack.min_brick_temp = min_brick_temp;
    pack.avg_brick_temp = avg_brick_temp_sum / NUM_BMBS_PER_PACK as f32;

    pack.max_board_temp = max_board_temp;
    pack.min_board_temp = min_board_temp;
    pack.avg_board_temp = avg_board_temp_sum / NUM_BMBS_PER_PACK as f32;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pack::SensorStatus;

    fn pack_with_ramp() -> Pack {
        let mut pack = Pack::new();
        for (i, v) in pack.bmb[0].brick_v.iter_mut().enumerate() {
            *v = 3.700 + i as f32 * 0.001;
        }
        pack.bmb[0].brick_v_status = [SensorStatus::Good; 12];
        pack
    }

    #[test]
    fn happy_scan_aggregates() {
        let mut pack = pack_with_ramp();
        aggregate_pack(&mut pack);

        assert_eq!(pack.min_brick_v, 3.700);
        assert_eq!(pack.max_brick_v, 3.711);
        assert!((pack.avg_brick_v - 3.7055).abs() < 1e-5);
        assert!(pack.min_brick_v <= pack.avg_brick_v && pack.avg_brick_v <= pack.max_brick_v);
        assert!((pack.bmb[0].stack_v - 44.466).abs() < 1e-3);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let mut pack = pack_with_ramp();
        aggregate_pack(&mut pack);
        let first = pack.clone();

        aggregate_pack(&mut pack);
        assert_eq!(pack.min_brick_v, first.min_brick_v);
        assert_eq!(pack.max_brick_v, first.max_brick_v);
        assert_eq!(pack.avg_brick_v, first.avg_brick_v);
        assert_eq!(pack.bmb[0].stack_v, first.bmb[0].stack_v);
    }

    #[test]
    fn non_good_samples_are_excluded() {
        let mut pack = pack_with_ramp();
        // A railed sensor reports a wild value that must not show up in the
        // extrema.
        pack.bmb[0].brick_v[4] = 0.0;
        pack.bmb[0].brick_v_status[4] = SensorStatus::Missing;

        aggregate_pack(&mut pack);
        assert_eq!(pack.min_brick_v, 3.700);
        assert_eq!(pack.max_brick_v, 3.711);
    }

    #[test]
    fn all_bad_keeps_previous_aggregates() {
        let mut pack = pack_with_ramp();
        aggregate_pack(&mut pack);
        let min_before = pack.min_brick_v;

        pack.bmb[0].brick_v_status = [SensorStatus::Missing; 12];
        aggregate_pack(&mut pack);
        assert_eq!(pack.min_brick_v, min_before);
    }
}
