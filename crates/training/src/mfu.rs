/// Running estimate of model-flops-utilization.
///
/// Holds an explicit "not yet estimated" state instead of a numeric
/// sentinel: the first observed sample initializes the running value
/// directly, later samples blend in with a 0.9/0.1 exponential moving
/// average. Sample gating (the per-process warm-up of 5 iterations) is the
/// caller's responsibility since it depends on the process-local iteration
/// counter, not on this estimator.
#[derive(Debug, Clone, Default)]
pub struct MfuEstimator {
    running: Option<f64>,
}

impl MfuEstimator {
    pub const HISTORY_WEIGHT: f64 = 0.9;

    /// Iterations to let the loop settle before the first sample is
    /// meaningful; early steps carry one-time initialization costs.
    pub const WARMUP_ITERS: usize = 5;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: f64) -> f64 {
        let updated = match self.running {
            None => sample,
            Some(prev) => Self::HISTORY_WEIGHT * prev + (1.0 - Self::HISTORY_WEIGHT) * sample,
        };
        self.running = Some(updated);
        updated
    }

    pub fn value(&self) -> Option<f64> {
        self.running
    }

    /// Percentage for log lines; 0 until the first sample lands, matching
    /// how an unknown utilization should read in output.
    pub fn as_percent(&self) -> f64 {
        self.running.unwrap_or(0.0) * 100.0
    }
}
