use std::{
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use training::{
    config::{DataConfig, DeviceKind, InitWeights, Precision},
    Trainer, TrainingConfig, TrainingError,
};

/// Train a decoder-only language model on pretokenized shards.
#[derive(Debug, Parser)]
#[command(name = "train", version, about)]
struct Args {
    /// Path to a TOML or JSON run configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of pretokenized `{split}*.bin` shards. Required when no
    /// config file is given.
    #[arg(long)]
    pretokenized_dir: Option<PathBuf>,

    /// Output directory for checkpoints and the exported model.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Start weights: "random" or "checkpoint" (resume from out_dir).
    #[arg(long)]
    init_weights: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,
    #[arg(long)]
    num_workers: Option<usize>,
    #[arg(long)]
    seed_offset: Option<u64>,

    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    min_lr: Option<f64>,
    #[arg(long)]
    max_iters: Option<usize>,
    #[arg(long)]
    warmup_iters: Option<usize>,
    #[arg(long)]
    lr_decay_iters: Option<usize>,
    /// Disable the warmup/cosine schedule and hold the learning rate.
    #[arg(long)]
    no_decay_lr: bool,
    #[arg(long)]
    weight_decay: Option<f64>,
    #[arg(long)]
    grad_clip: Option<f64>,

    #[arg(long)]
    eval_interval: Option<usize>,
    #[arg(long)]
    log_interval: Option<usize>,
    #[arg(long)]
    eval_iters: Option<usize>,
    #[arg(long)]
    always_save_checkpoint: bool,

    #[arg(long)]
    dim: Option<usize>,
    #[arg(long)]
    n_layers: Option<usize>,
    #[arg(long)]
    n_heads: Option<usize>,
    #[arg(long)]
    vocab_size: Option<usize>,
    #[arg(long)]
    max_context_length: Option<usize>,
    #[arg(long)]
    dropout: Option<f32>,

    /// Compute device: "auto", "cpu", "cuda", or "metal".
    #[arg(long)]
    device: Option<String>,
    /// Parameter dtype: "float32", "float16", or "bfloat16".
    #[arg(long)]
    dtype: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    flops_promised: Option<f64>,
    #[arg(long)]
    tensorboard_dir: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), TrainingError> {
    let config = build_config(args)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        eprintln!("warning: failed to install interrupt handler: {err}");
    }

    let mut trainer = Trainer::new(config)?;
    trainer.train_with_shutdown(|| shutdown.load(Ordering::SeqCst))
}

fn build_config(args: Args) -> Result<TrainingConfig, TrainingError> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_path(path)?,
        None => {
            let pretokenized_dir = args.pretokenized_dir.clone().ok_or_else(|| {
                TrainingError::ConfigFormat(
                    "either --config or --pretokenized-dir is required".to_string(),
                )
            })?;
            TrainingConfig {
                model: Default::default(),
                data: DataConfig {
                    pretokenized_dir,
                    batch_size: 1,
                    gradient_accumulation_steps: 1,
                    num_workers: 0,
                    seed_offset: 0,
                },
                optimizer: Default::default(),
                eval: Default::default(),
                runtime: Default::default(),
            }
        }
    };

    if let Some(dir) = args.pretokenized_dir {
        config.data.pretokenized_dir = dir;
    }
    if let Some(dir) = args.out_dir {
        config.eval.out_dir = dir;
    }
    if let Some(mode) = args.init_weights {
        config.eval.init_weights = match mode.as_str() {
            "random" => InitWeights::Random,
            "checkpoint" => InitWeights::Checkpoint,
            other => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported init mode '{other}' (expected 'random' or 'checkpoint')"
                )))
            }
        };
    }

    if let Some(value) = args.batch_size {
        config.data.batch_size = value;
    }
    if let Some(value) = args.gradient_accumulation_steps {
        config.data.gradient_accumulation_steps = value;
    }
    if let Some(value) = args.num_workers {
        config.data.num_workers = value;
    }
    if let Some(value) = args.seed_offset {
        config.data.seed_offset = value;
    }

    if let Some(value) = args.learning_rate {
        config.optimizer.learning_rate = value;
    }
    if let Some(value) = args.min_lr {
        config.optimizer.min_lr = value;
    }
    if let Some(value) = args.max_iters {
        config.optimizer.max_iters = value;
    }
    if let Some(value) = args.warmup_iters {
        config.optimizer.warmup_iters = value;
    }
    if let Some(value) = args.lr_decay_iters {
        config.optimizer.lr_decay_iters = Some(value);
    }
    if args.no_decay_lr {
        config.optimizer.decay_lr = false;
    }
    if let Some(value) = args.weight_decay {
        config.optimizer.weight_decay = value;
    }
    if let Some(value) = args.grad_clip {
        config.optimizer.grad_clip = value;
    }

    if let Some(value) = args.eval_interval {
        config.eval.eval_interval = value;
    }
    if let Some(value) = args.log_interval {
        config.eval.log_interval = value;
    }
    if let Some(value) = args.eval_iters {
        config.eval.eval_iters = value;
    }
    if args.always_save_checkpoint {
        config.eval.always_save_checkpoint = true;
    }

    if let Some(value) = args.dim {
        config.model.dim = value;
    }
    if let Some(value) = args.n_layers {
        config.model.n_layers = value;
    }
    if let Some(value) = args.n_heads {
        config.model.n_heads = value;
    }
    if let Some(value) = args.vocab_size {
        config.model.vocab_size = value;
    }
    if let Some(value) = args.max_context_length {
        config.model.max_context_length = value;
    }
    if let Some(value) = args.dropout {
        config.model.dropout = value;
    }

    if let Some(device) = args.device {
        config.runtime.device = match device.as_str() {
            "auto" => DeviceKind::Auto,
            "cpu" => DeviceKind::Cpu,
            "cuda" => DeviceKind::Cuda,
            "metal" => DeviceKind::Metal,
            other => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported device '{other}'"
                )))
            }
        };
    }
    if let Some(dtype) = args.dtype {
        config.runtime.dtype = dtype
            .parse::<Precision>()
            .map_err(TrainingError::ConfigFormat)?;
    }
    if let Some(value) = args.seed {
        config.runtime.seed = value;
    }
    if let Some(value) = args.flops_promised {
        config.runtime.flops_promised = value;
    }
    if let Some(dir) = args.tensorboard_dir {
        config.runtime.tensorboard_dir = Some(dir);
    }

    config.validate()?;
    Ok(config)
}
