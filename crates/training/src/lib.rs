//! Training orchestration for the decoder-only language model: the
//! iteration loop, LR scheduling, gradient accumulation, loss scaling,
//! periodic evaluation, and checkpoint save/resume.

pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod export;
pub mod logging;
pub mod mfu;
pub mod optimizer;
pub mod schedule;
pub mod trainer;

pub use amp::{GradientScaler, LossScaleConfig};
pub use config::{
    DataConfig, DeviceKind, EvalConfig, InitWeights, OptimizerConfig, Precision, RuntimeConfig,
    TrainingConfig, TrainingError,
};
pub use trainer::{SplitLosses, Trainer, TrainingState};
