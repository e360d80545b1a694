use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device};
use model::ModelArgs;
use serde::{Deserialize, Serialize};

/// Full run configuration. Serialized verbatim into every checkpoint for
/// provenance and fingerprinted into the manifest, so it must stay an
/// explicit value type rather than anything reflective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelArgs,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub eval: EvalConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.model.validate() {
            errors.push(err.to_string());
        }

        if self.data.pretokenized_dir.as_os_str().is_empty() {
            errors.push("data.pretokenized_dir must not be empty".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.min_lr < 0.0 || self.optimizer.min_lr > self.optimizer.learning_rate {
            errors.push("optimizer.min_lr must be in [0, learning_rate]".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.grad_clip < 0.0 {
            errors.push("optimizer.grad_clip must be >= 0 (0 disables clipping)".to_string());
        }
        if self.optimizer.max_iters == 0 {
            errors.push("optimizer.max_iters must be greater than 0".to_string());
        }
        if self.optimizer.decay_lr && self.optimizer.warmup_iters >= self.optimizer.lr_decay_iters()
        {
            errors.push("optimizer.warmup_iters must be less than the decay horizon".to_string());
        }

        if self.eval.eval_interval == 0 {
            errors.push("eval.eval_interval must be greater than 0".to_string());
        }
        if self.eval.log_interval == 0 {
            errors.push("eval.log_interval must be greater than 0".to_string());
        }
        if self.eval.eval_iters == 0 {
            errors.push("eval.eval_iters must be greater than 0".to_string());
        }
        if self.eval.out_dir.as_os_str().is_empty() {
            errors.push("eval.out_dir must not be empty".to_string());
        }

        if self.runtime.flops_promised <= 0.0 {
            errors.push("runtime.flops_promised must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.pretokenized_dir, base);
        absolutize_in_place(&mut self.eval.out_dir, base);
        if let Some(dir) = self.runtime.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Tokens consumed per optimizer step across all micro-batches.
    pub fn tokens_per_iter(&self) -> usize {
        self.data.gradient_accumulation_steps * self.data.batch_size * self.model.max_context_length
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory of pretokenized `{split}*.bin` shards (u16 little-endian).
    pub pretokenized_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default)]
    pub seed_offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Global gradient-norm ceiling; 0 disables clipping.
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,
    #[serde(default = "default_decay_lr")]
    pub decay_lr: bool,
    #[serde(default = "default_warmup_iters")]
    pub warmup_iters: usize,
    /// Decay horizon; defaults to `max_iters` when absent (Chinchilla rule).
    #[serde(default)]
    pub lr_decay_iters: Option<usize>,
}

impl OptimizerConfig {
    pub fn lr_decay_iters(&self) -> usize {
        self.lr_decay_iters.unwrap_or(self.max_iters)
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            min_lr: 0.0,
            max_iters: default_max_iters(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            grad_clip: default_grad_clip(),
            decay_lr: default_decay_lr(),
            warmup_iters: default_warmup_iters(),
            lr_decay_iters: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_eval_interval")]
    pub eval_interval: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_eval_iters")]
    pub eval_iters: usize,
    #[serde(default)]
    pub always_save_checkpoint: bool,
    #[serde(default)]
    pub init_weights: InitWeights,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            eval_interval: default_eval_interval(),
            log_interval: default_log_interval(),
            eval_iters: default_eval_iters(),
            always_save_checkpoint: false,
            init_weights: InitWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitWeights {
    #[default]
    Random,
    Checkpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_device")]
    pub device: DeviceKind,
    #[serde(default)]
    pub dtype: Precision,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Theoretical accelerator peak used as the MFU denominator.
    #[serde(default = "default_flops_promised")]
    pub flops_promised: f64,
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            dtype: Precision::default(),
            seed: default_seed(),
            flops_promised: default_flops_promised(),
            enable_stdout: default_enable_stdout(),
            tensorboard_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceKind {
    /// Resolves the configured device, falling back to CPU with a warning
    /// when the requested accelerator is unavailable.
    pub fn select(self) -> Device {
        use candle_core::utils::{cuda_is_available, metal_is_available};
        match self {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => match Device::cuda_if_available(0) {
                Ok(device) => device,
                Err(err) => {
                    eprintln!("cuda requested but initialization failed: {err}; using CPU");
                    Device::Cpu
                }
            },
            DeviceKind::Metal => match Device::new_metal(0) {
                Ok(device) => device,
                Err(err) => {
                    eprintln!("metal requested but initialization failed: {err}; using CPU");
                    Device::Cpu
                }
            },
            DeviceKind::Auto => {
                if cuda_is_available() {
                    DeviceKind::Cuda.select()
                } else if metal_is_available() {
                    DeviceKind::Metal.select()
                } else {
                    Device::Cpu
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Float32,
    Float16,
    Bfloat16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Float32 => DType::F32,
            Precision::Float16 => DType::F16,
            Precision::Bfloat16 => DType::BF16,
        }
    }

    /// Reduced-precision parameters need the loss-scaling discipline.
    pub fn needs_loss_scaling(self) -> bool {
        !matches!(self, Precision::Float32)
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Precision::Float32),
            "float16" | "fp16" | "f16" => Ok(Precision::Float16),
            "bfloat16" | "bf16" => Ok(Precision::Bfloat16),
            other => Err(format!("unsupported dtype '{other}'")),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    5e-4
}

fn default_max_iters() -> usize {
    100_000
}

fn default_weight_decay() -> f64 {
    1e-1
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_grad_clip() -> f64 {
    1.0
}

fn default_decay_lr() -> bool {
    true
}

fn default_warmup_iters() -> usize {
    1_000
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_eval_interval() -> usize {
    1_000
}

fn default_log_interval() -> usize {
    100
}

fn default_eval_iters() -> usize {
    100
}

fn default_device() -> DeviceKind {
    DeviceKind::Auto
}

fn default_seed() -> u64 {
    1337
}

fn default_flops_promised() -> f64 {
    2.6e12
}

fn default_enable_stdout() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "io error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = TrainingConfig {
            model: ModelArgs::default(),
            data: DataConfig {
                pretokenized_dir: PathBuf::from("data/tok32000"),
                batch_size: 1,
                gradient_accumulation_steps: 1,
                num_workers: 0,
                seed_offset: 0,
            },
            optimizer: OptimizerConfig::default(),
            eval: EvalConfig::default(),
            runtime: RuntimeConfig::default(),
        };
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = TrainingConfig {
            model: ModelArgs::default(),
            data: DataConfig {
                pretokenized_dir: PathBuf::from("data"),
                batch_size: 0,
                gradient_accumulation_steps: 1,
                num_workers: 0,
                seed_offset: 0,
            },
            optimizer: OptimizerConfig::default(),
            eval: EvalConfig::default(),
            runtime: RuntimeConfig::default(),
        };
        assert!(matches!(
            config.validate(),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn decay_horizon_defaults_to_max_iters() {
        let optimizer = OptimizerConfig {
            max_iters: 500,
            lr_decay_iters: None,
            ..OptimizerConfig::default()
        };
        assert_eq!(optimizer.lr_decay_iters(), 500);
    }

    #[test]
    fn tokens_per_iter_multiplies_batch_shape() {
        let config = TrainingConfig {
            model: ModelArgs {
                max_context_length: 64,
                ..ModelArgs::default()
            },
            data: DataConfig {
                pretokenized_dir: PathBuf::from("data"),
                batch_size: 4,
                gradient_accumulation_steps: 8,
                num_workers: 0,
                seed_offset: 0,
            },
            optimizer: OptimizerConfig::default(),
            eval: EvalConfig::default(),
            runtime: RuntimeConfig::default(),
        };
        assert_eq!(config.tokens_per_iter(), 4 * 8 * 64);
    }
}
