use candle_core::{DType, Tensor};

use crate::config::{to_runtime_error, Precision, TrainingError};

/// Tuning knobs for dynamic loss scaling.
#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Process-lifetime loss scaler for reduced-precision training.
///
/// The loss is scaled up before backward so small gradients survive the
/// narrow dynamic range; gradients are unscaled before the optimizer reads
/// them. On detected overflow the optimizer step is skipped and the scale
/// backs off; after a stable interval it grows again. A full-precision run
/// gets a disabled, pass-through scaler.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f32,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if !precision.needs_loss_scaling() {
            return Self {
                state: ScalerState::Disabled,
            };
        }
        let cfg = sanitize_config(config);
        Self {
            state: ScalerState::Enabled(EnabledState {
                loss_scale: cfg.initial_scale,
                stable_steps: 0,
                config: cfg,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => tensor
                .affine(state.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(tensor.clone()),
            ScalerState::Enabled(state) => {
                let inv = 1.0 / state.loss_scale;
                tensor.affine(inv as f64, 0.0).map_err(to_runtime_error)
            }
        }
    }

    /// Adjusts the scale after a step: backoff on overflow, growth after a
    /// clean interval. Called once per optimizer step either way.
    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }
}

/// Cheap device-side non-finite probe: the squared sum is non-finite iff
/// the tensor holds an inf/NaN.
pub fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}
