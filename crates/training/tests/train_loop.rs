use std::{fs, io::Write, path::Path, path::PathBuf};

use candle_core::{DType, Device, Tensor};
use model::{ModelArgs, Transformer};
use training::{
    checkpoint,
    config::{
        DataConfig, DeviceKind, EvalConfig, InitWeights, OptimizerConfig, Precision, RuntimeConfig,
    },
    Trainer, TrainingConfig,
};

fn write_shard(dir: &Path, name: &str, tokens: usize, vocab: u16) {
    let mut file = fs::File::create(dir.join(name)).unwrap();
    for i in 0..tokens {
        let token = (i % vocab as usize) as u16;
        file.write_all(&token.to_le_bytes()).unwrap();
    }
}

fn tiny_config(data_dir: &Path, out_dir: &Path) -> TrainingConfig {
    TrainingConfig {
        model: ModelArgs {
            dim: 16,
            n_layers: 1,
            n_heads: 2,
            vocab_size: 64,
            hidden_dim: Some(32),
            max_context_length: 16,
            dropout: 0.0,
            ..ModelArgs::default()
        },
        data: DataConfig {
            pretokenized_dir: data_dir.to_path_buf(),
            batch_size: 2,
            gradient_accumulation_steps: 2,
            num_workers: 0,
            seed_offset: 0,
        },
        optimizer: OptimizerConfig {
            learning_rate: 1e-3,
            min_lr: 1e-4,
            max_iters: 10,
            warmup_iters: 2,
            lr_decay_iters: None,
            grad_clip: 1.0,
            ..OptimizerConfig::default()
        },
        eval: EvalConfig {
            out_dir: out_dir.to_path_buf(),
            eval_interval: 5,
            log_interval: 5,
            eval_iters: 2,
            always_save_checkpoint: false,
            init_weights: InitWeights::Random,
        },
        runtime: RuntimeConfig {
            device: DeviceKind::Cpu,
            dtype: Precision::Float32,
            enable_stdout: false,
            ..RuntimeConfig::default()
        },
    }
}

fn seed_data(data_dir: &Path) {
    write_shard(data_dir, "train0.bin", 1025, 64);
    write_shard(data_dir, "val0.bin", 257, 64);
}

fn parameter_bits(model: &Transformer) -> Vec<Vec<u32>> {
    model
        .named_parameters()
        .iter()
        .map(|(_, var)| {
            var.as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
                .into_iter()
                .map(f32::to_bits)
                .collect()
        })
        .collect()
}

#[test]
fn loop_terminates_past_max_iters_and_checkpoints() {
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    seed_data(data_dir.path());

    let config = tiny_config(data_dir.path(), out_dir.path());
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();

    // Termination happens after the counter passes max_iters, not at it.
    assert_eq!(trainer.state().iter_num, 11);
    assert!(trainer.state().best_val_loss.is_finite());
    // Evaluation fires on the interval, the pass at iteration 0 included.
    assert_eq!(trainer.state().eval_iterations, vec![0, 5, 10]);

    let ckpt = checkpoint::checkpoint_dir(out_dir.path());
    assert!(ckpt.is_dir());
    let outcome = checkpoint::load_checkpoint(&ckpt).unwrap();
    assert!(outcome.manifest.iter_num >= 5);
    assert!(out_dir.path().join("model.bin").is_file());
}

#[test]
fn shutdown_flag_stops_before_any_step() {
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    seed_data(data_dir.path());

    let config = tiny_config(data_dir.path(), out_dir.path());
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train_with_shutdown(|| true).unwrap();
    assert_eq!(trainer.state().iter_num, 0);
}

#[test]
fn accumulated_micro_losses_match_concatenated_batch() {
    let device = Device::Cpu;
    let args = ModelArgs {
        dim: 16,
        n_layers: 1,
        n_heads: 2,
        vocab_size: 64,
        hidden_dim: Some(32),
        max_context_length: 8,
        dropout: 0.0,
        ..ModelArgs::default()
    };
    let model = Transformer::new(args, &device, DType::F32).unwrap();
    model.set_training(false);

    let a_in = Tensor::from_vec(vec![1u32, 2, 3, 4, 5, 6, 7, 8], (1, 8), &device).unwrap();
    let a_tg = Tensor::from_vec(vec![2u32, 3, 4, 5, 6, 7, 8, 9], (1, 8), &device).unwrap();
    let b_in = Tensor::from_vec(vec![9u32, 8, 7, 6, 5, 4, 3, 2], (1, 8), &device).unwrap();
    let b_tg = Tensor::from_vec(vec![8u32, 7, 6, 5, 4, 3, 2, 1], (1, 8), &device).unwrap();

    let (_l, loss_a) = model.forward_train(&a_in, &a_tg).unwrap();
    let (_l, loss_b) = model.forward_train(&b_in, &b_tg).unwrap();
    let mean_of_micros =
        (loss_a.to_vec0::<f32>().unwrap() + loss_b.to_vec0::<f32>().unwrap()) / 2.0;

    let joint_in = Tensor::cat(&[&a_in, &b_in], 0).unwrap();
    let joint_tg = Tensor::cat(&[&a_tg, &b_tg], 0).unwrap();
    let (_l, joint_loss) = model.forward_train(&joint_in, &joint_tg).unwrap();

    assert!((mean_of_micros - joint_loss.to_vec0::<f32>().unwrap()).abs() < 1e-5);
}

#[test]
fn resume_adopts_checkpointed_structure_and_counters() {
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    seed_data(data_dir.path());

    let mut config = tiny_config(data_dir.path(), out_dir.path());
    config.optimizer.max_iters = 4;
    config.eval.eval_interval = 2;
    config.eval.always_save_checkpoint = true;

    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();
    assert_eq!(trainer.state().iter_num, 5);
    assert_eq!(trainer.state().eval_iterations, vec![0, 2, 4]);

    let saved = checkpoint::load_checkpoint(&checkpoint::checkpoint_dir(out_dir.path()))
        .unwrap()
        .manifest;
    assert_eq!(saved.iter_num, 4);
    drop(trainer);

    // The resume config disagrees on the vocabulary; the checkpointed
    // structure must win or the weights would not fit.
    let mut resume_config = tiny_config(data_dir.path(), out_dir.path());
    resume_config.model.vocab_size = 128;
    resume_config.optimizer.max_iters = 6;
    resume_config.eval.eval_interval = 2;
    resume_config.eval.init_weights = InitWeights::Checkpoint;

    let mut resumed = Trainer::new(resume_config).unwrap();
    assert_eq!(resumed.config().model.vocab_size, 64);
    assert_eq!(resumed.state().iter_num, 4);
    assert_eq!(resumed.state().best_val_loss, saved.best_val_loss);
    assert_eq!(resumed.state().local_iter_num, 0);

    resumed.train().unwrap();
    assert_eq!(resumed.state().iter_num, 7);
    assert_eq!(resumed.state().eval_iterations, vec![4, 6]);
}

#[test]
fn non_finite_loss_skips_update_but_advances_counter() {
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    seed_data(data_dir.path());

    let mut config = tiny_config(data_dir.path(), out_dir.path());
    config.optimizer.max_iters = 2;
    config.eval.eval_interval = 100;
    config.eval.log_interval = 100;

    let mut trainer = Trainer::new(config).unwrap();

    // Poison one weight so every forward pass produces a NaN loss.
    let params = trainer.model().named_parameters();
    let (_, var) = &params[0];
    let poison = Tensor::full(f32::NAN, var.dims(), &Device::Cpu).unwrap();
    var.set(&poison).unwrap();
    drop(params);

    let before = parameter_bits(trainer.model());
    trainer.train().unwrap();

    // Every step was detected as non-finite and skipped, yet the loop
    // still counted through to termination.
    assert_eq!(trainer.state().iter_num, 3);
    assert_eq!(parameter_bits(trainer.model()), before);
}

#[test]
fn config_files_round_trip_through_loader() {
    let data_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    seed_data(data_dir.path());

    let config_path: PathBuf = out_dir.path().join("run.toml");
    let contents = format!(
        r#"
[model]
dim = 16
n_layers = 1
n_heads = 2
vocab_size = 64
hidden_dim = 32
max_context_length = 16
dropout = 0.0

[data]
pretokenized_dir = "{}"
batch_size = 2
gradient_accumulation_steps = 2

[optimizer]
learning_rate = 1e-3
max_iters = 10
warmup_iters = 2

[eval]
out_dir = "{}"
eval_interval = 5
log_interval = 5
eval_iters = 2

[runtime]
device = "cpu"
dtype = "float32"
enable_stdout = false
"#,
        data_dir.path().display(),
        out_dir.path().display()
    );
    fs::write(&config_path, contents).unwrap();

    let config = TrainingConfig::from_path(&config_path).unwrap();
    assert_eq!(config.model.dim, 16);
    assert_eq!(config.data.batch_size, 2);
    assert_eq!(config.tokens_per_iter(), 2 * 2 * 16);
}
