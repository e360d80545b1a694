use std::time::Instant;

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use model::Transformer;

use crate::{
    amp::{contains_non_finite, GradientScaler},
    checkpoint::{self, SaveRequest},
    config::{to_runtime_error, InitWeights, TrainingConfig, TrainingError},
    data::{Batches, TokenBatches},
    export::{export_model, LEGACY_VERSION},
    logging::{Logger, LoggingSettings},
    mfu::MfuEstimator,
    optimizer::{self, AdamW, AdamWConfig},
    schedule,
};

const EXPORT_FILENAME: &str = "model.bin";

/// Loop counters that survive checkpointing, plus process-local
/// bookkeeping. `local_iter_num` restarts at zero on resume; it gates
/// throughput estimates past the process warm-up. `eval_iterations`
/// records at which iterations this process evaluated.
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub iter_num: usize,
    pub local_iter_num: usize,
    pub best_val_loss: f64,
    pub eval_iterations: Vec<usize>,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            iter_num: 0,
            local_iter_num: 0,
            best_val_loss: f64::INFINITY,
            eval_iterations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitLosses {
    pub train: f64,
    pub val: f64,
}

/// Restores the model's training mode when evaluation exits, early
/// returns included.
struct EvalGuard<'a> {
    model: &'a Transformer,
    was_training: bool,
}

impl<'a> EvalGuard<'a> {
    fn enter(model: &'a Transformer) -> Self {
        let was_training = model.is_training();
        model.set_training(false);
        Self {
            model,
            was_training,
        }
    }
}

impl Drop for EvalGuard<'_> {
    fn drop(&mut self) {
        self.model.set_training(self.was_training);
    }
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: Transformer,
    optimizer: AdamW,
    scaler: GradientScaler,
    batches: Batches,
    parameter_vars: Vec<Var>,
    parameter_tensors: Vec<Tensor>,
    mfu: MfuEstimator,
    logger: Logger,
    state: TrainingState,
    staged_batch: Option<(Tensor, Tensor)>,
}

impl Trainer {
    pub fn new(mut config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = config.runtime.device.select();
        let seed = config.runtime.seed.wrapping_add(config.data.seed_offset);
        if let Err(err) = device.set_seed(seed) {
            eprintln!("warning: failed to seed device RNG: {err}");
        }

        let dtype = config.runtime.dtype.dtype();
        let mut state = TrainingState::default();

        // Resuming adopts the checkpoint's structural fields so tensor
        // shapes line up, while run knobs like dropout stay configurable.
        let resume = match config.eval.init_weights {
            InitWeights::Random => None,
            InitWeights::Checkpoint => {
                let ckpt_dir = checkpoint::checkpoint_dir(&config.eval.out_dir);
                let outcome = checkpoint::load_checkpoint(&ckpt_dir)?;
                config.model.adopt_structural(&outcome.manifest.model_args);
                state.iter_num = outcome.manifest.iter_num;
                state.best_val_loss = outcome.manifest.best_val_loss;
                Some(outcome)
            }
        };

        let model = Transformer::new(config.model.clone(), &device, dtype)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;

        if let Some(outcome) = &resume {
            checkpoint::apply_model_weights(&model, &outcome.model_weights_path)?;
        }

        let named_parameters = model.named_parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let parameter_vars: Vec<Var> = named_parameters.iter().map(|(_, var)| var.clone()).collect();
        let parameter_tensors: Vec<Tensor> = parameter_vars
            .iter()
            .map(|var| var.as_tensor().clone())
            .collect();

        let mut optimizer = AdamW::new(named_parameters, AdamWConfig::from(&config.optimizer))?;
        if let Some(outcome) = resume {
            optimizer.load_state(outcome.optimizer_state)?;
        }

        let scaler = GradientScaler::new(config.runtime.dtype);

        let batches = Batches::new(
            &config.data.pretokenized_dir,
            "train",
            config.data.batch_size,
            config.model.max_context_length,
            seed,
            config.data.num_workers,
        )?;

        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.enable_stdout,
            config.runtime.tensorboard_dir.clone(),
        ))?;

        logger.info(&format!(
            "model: {} parameters on {:?} ({:?})",
            model.num_parameters(),
            device,
            dtype
        ));
        logger.info(&format!("tokens per iteration: {}", config.tokens_per_iter()));
        if state.iter_num > 0 {
            logger.info(&format!(
                "resumed from checkpoint at iteration {} (best val loss {:.4})",
                state.iter_num, state.best_val_loss
            ));
        }

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            scaler,
            batches,
            parameter_vars,
            parameter_tensors,
            mfu: MfuEstimator::new(),
            logger,
            state,
            staged_batch: None,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.model.set_training(true);
        let accumulation = self.config.data.gradient_accumulation_steps.max(1);
        let effective_batch = accumulation * self.config.data.batch_size;

        loop {
            if should_stop() {
                self.logger.info(&format!(
                    "shutdown requested at iteration {}",
                    self.state.iter_num
                ));
                break;
            }

            let lr = self.current_lr();
            self.optimizer.set_learning_rate(lr);

            if self.state.iter_num % self.config.eval.eval_interval == 0 {
                self.evaluate_and_checkpoint(lr)?;
            }

            let t0 = Instant::now();
            let (step_loss, found_inf) = self.accumulation_step(accumulation)?;
            let dt = t0.elapsed().as_secs_f64();

            if found_inf {
                self.logger.info(&format!(
                    "step {}: non-finite gradients, skipping update (loss scale {:.1})",
                    self.state.iter_num,
                    self.scaler.loss_scale()
                ));
            }

            if self.state.iter_num % self.config.eval.log_interval == 0 {
                let mfu_percent = if self.state.local_iter_num >= MfuEstimator::WARMUP_ITERS {
                    let sample = self.model.estimate_mfu(
                        effective_batch,
                        dt,
                        self.config.runtime.flops_promised,
                    );
                    self.mfu.observe(sample);
                    self.mfu.as_percent()
                } else {
                    self.mfu.as_percent()
                };
                self.logger
                    .log_training_step(self.state.iter_num, step_loss, lr, dt * 1000.0, mfu_percent);
            }

            self.state.iter_num += 1;
            self.state.local_iter_num += 1;

            if self.state.iter_num > self.config.optimizer.max_iters {
                break;
            }
        }

        self.logger.flush();
        Ok(())
    }

    /// Forward/backward over the micro-batches of one optimizer step.
    /// Returns the mean micro-batch loss and whether the step was skipped
    /// because of non-finite gradients.
    fn accumulation_step(&mut self, accumulation: usize) -> Result<(f64, bool), TrainingError> {
        let mut accumulated: Option<GradStore> = None;
        let mut step_loss = 0.0f64;

        let mut batch = match self.staged_batch.take() {
            Some(batch) => batch,
            None => self.batches.next_batch(&self.device)?,
        };

        for _ in 0..accumulation {
            let (inputs, targets) = batch;
            let (_logits, loss) = self
                .model
                .forward_train(&inputs, &targets)
                .map_err(to_runtime_error)?;

            let normalized = loss
                .affine(1.0 / accumulation as f64, 0.0)
                .map_err(to_runtime_error)?;
            step_loss += normalized
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .to_vec0::<f32>()
                .map_err(to_runtime_error)? as f64;

            // Stage the next micro-batch before backward so host-side
            // loading overlaps the backward pass on accelerator devices.
            batch = self.batches.next_batch(&self.device)?;

            let scaled = self.scaler.scale(&normalized)?;
            let micro_grads = scaled.backward().map_err(to_runtime_error)?;
            match accumulated.as_mut() {
                Some(existing) => self.merge_gradient_store(existing, micro_grads)?,
                None => accumulated = Some(micro_grads),
            }
        }
        self.staged_batch = Some(batch);

        let mut grads = accumulated
            .ok_or_else(|| TrainingError::runtime("accumulation produced no gradients"))?;

        let mut found_inf = self.unscale_gradients(&mut grads)?;
        if !step_loss.is_finite() {
            found_inf = true;
        }
        self.scaler.update(found_inf);

        if found_inf {
            self.optimizer.zero_grad(&mut grads);
            return Ok((step_loss, true));
        }

        let grad_clip = self.config.optimizer.grad_clip;
        if grad_clip != 0.0 {
            optimizer::clip_gradients(&self.parameter_vars, &mut grads, grad_clip)?;
        }
        self.optimizer.step(&mut grads)?;

        Ok((step_loss, false))
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for tensor in &self.parameter_tensors {
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    fn unscale_gradients(&self, grads: &mut GradStore) -> Result<bool, TrainingError> {
        let mut found_inf = false;
        for tensor in &self.parameter_tensors {
            if let Some(grad) = grads.remove(tensor) {
                let unscaled = self.scaler.unscale(&grad)?;
                if !found_inf && contains_non_finite(&unscaled)? {
                    found_inf = true;
                }
                grads.insert(tensor, unscaled);
            }
        }
        Ok(found_inf)
    }

    fn current_lr(&self) -> f64 {
        let opt = &self.config.optimizer;
        if opt.decay_lr {
            schedule::learning_rate(
                self.state.iter_num,
                opt.warmup_iters,
                opt.lr_decay_iters(),
                opt.min_lr,
                opt.learning_rate,
            )
        } else {
            opt.learning_rate
        }
    }

    fn evaluate_and_checkpoint(&mut self, lr: f64) -> Result<(), TrainingError> {
        self.state.eval_iterations.push(self.state.iter_num);
        let losses = self.estimate_loss()?;
        self.logger
            .log_evaluation(self.state.iter_num, losses.train, losses.val, lr);
        self.logger.flush();

        let improved = losses.val < self.state.best_val_loss;
        if improved || self.config.eval.always_save_checkpoint {
            self.state.best_val_loss = self.state.best_val_loss.min(losses.val);
            if self.state.iter_num > 0 {
                self.save_checkpoint()?;
            }
        }
        Ok(())
    }

    /// Mean loss per split over `eval_iters` fresh batches, with dropout
    /// disabled. Uses its own samplers so the training stream's position
    /// is unaffected.
    pub fn estimate_loss(&mut self) -> Result<SplitLosses, TrainingError> {
        let _guard = EvalGuard::enter(&self.model);

        let mut means = [0.0f64; 2];
        for (idx, split) in ["train", "val"].iter().enumerate() {
            let mut sampler = TokenBatches::new(
                &self.config.data.pretokenized_dir,
                split,
                self.config.data.batch_size,
                self.config.model.max_context_length,
                self.config.runtime.seed,
            )?;

            let mut losses = Vec::with_capacity(self.config.eval.eval_iters);
            for _ in 0..self.config.eval.eval_iters {
                let (inputs, targets) = sampler.next_batch(&self.device)?;
                let (_logits, loss) = self
                    .model
                    .forward_train(&inputs, &targets)
                    .map_err(to_runtime_error)?;
                losses.push(
                    loss.to_dtype(DType::F32)
                        .map_err(to_runtime_error)?
                        .to_vec0::<f32>()
                        .map_err(to_runtime_error)? as f64,
                );
            }
            means[idx] = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
        }

        Ok(SplitLosses {
            train: means[0],
            val: means[1],
        })
    }

    fn save_checkpoint(&mut self) -> Result<(), TrainingError> {
        let manifest = checkpoint::save_checkpoint(SaveRequest {
            out_dir: &self.config.eval.out_dir,
            config: &self.config,
            model: &self.model,
            optimizer: &self.optimizer,
            iter_num: self.state.iter_num,
            best_val_loss: self.state.best_val_loss,
        })?;
        self.logger.info(&format!(
            "checkpoint saved at iteration {} (config {})",
            manifest.iter_num,
            &manifest.config_sha256[..12]
        ));

        let export_path = self.config.eval.out_dir.join(EXPORT_FILENAME);
        export_model(&self.model, &export_path, LEGACY_VERSION)?;
        Ok(())
    }
}
