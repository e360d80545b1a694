use std::f64::consts::PI;

/// Cosine learning-rate decay with linear warmup.
///
/// Three regimes: linear ramp below `warmup_iters` (exactly 0 at iteration
/// 0), cosine decay between warmup and `lr_decay_iters`, and the `min_lr`
/// floor beyond the horizon. Pure in its inputs; a decay ratio outside
/// `[0, 1]` is a programming error, not a recoverable condition.
pub fn learning_rate(
    iter_num: usize,
    warmup_iters: usize,
    lr_decay_iters: usize,
    min_lr: f64,
    max_lr: f64,
) -> f64 {
    if iter_num < warmup_iters {
        return max_lr * iter_num as f64 / warmup_iters as f64;
    }
    if iter_num > lr_decay_iters {
        return min_lr;
    }
    let decay_ratio = (iter_num - warmup_iters) as f64 / (lr_decay_iters - warmup_iters) as f64;
    assert!(
        (0.0..=1.0).contains(&decay_ratio),
        "decay ratio {decay_ratio} outside [0, 1]"
    );
    let coeff = 0.5 * (1.0 + f64::cos(PI * decay_ratio));
    min_lr + coeff * (max_lr - min_lr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_LR: f64 = 5e-4;
    const MIN_LR: f64 = 5e-5;
    const WARMUP: usize = 100;
    const HORIZON: usize = 1_000;

    fn lr(iter_num: usize) -> f64 {
        learning_rate(iter_num, WARMUP, HORIZON, MIN_LR, MAX_LR)
    }

    #[test]
    fn warmup_is_linear_and_starts_at_zero() {
        assert_eq!(lr(0), 0.0);
        for iter_num in 1..WARMUP {
            let expected = MAX_LR * iter_num as f64 / WARMUP as f64;
            assert!((lr(iter_num) - expected).abs() < 1e-15);
        }
    }

    #[test]
    fn warmup_boundary_reaches_max_rate() {
        assert!((lr(WARMUP) - MAX_LR).abs() < 1e-12);
    }

    #[test]
    fn beyond_horizon_returns_floor() {
        assert_eq!(lr(HORIZON + 1), MIN_LR);
        assert_eq!(lr(HORIZON * 10), MIN_LR);
    }

    #[test]
    fn cosine_branch_is_continuous_at_boundaries() {
        // At the warmup boundary the cosine coefficient is 1.
        let below = lr(WARMUP - 1);
        let at = lr(WARMUP);
        assert!((at - below).abs() < MAX_LR / WARMUP as f64 + 1e-12);

        // At the horizon the cosine coefficient is 0, matching the floor.
        assert!((lr(HORIZON) - MIN_LR).abs() < 1e-12);
    }

    #[test]
    fn midpoint_is_halfway_between_bounds() {
        let mid = lr(WARMUP + (HORIZON - WARMUP) / 2);
        let expected = MIN_LR + 0.5 * (MAX_LR - MIN_LR);
        assert!((mid - expected).abs() < 1e-9);
    }

    #[test]
    fn decay_is_monotonically_non_increasing() {
        let mut prev = lr(WARMUP);
        for iter_num in (WARMUP + 1)..=HORIZON {
            let current = lr(iter_num);
            assert!(current <= prev + 1e-15);
            prev = current;
        }
    }
}
