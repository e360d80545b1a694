use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{self, to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;
const ADAM_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: ADAM_EPSILON,
            weight_decay: value.weight_decay,
        }
    }
}

/// AdamW over the model's named parameters.
///
/// Reduced-precision parameters get f32 master copies; moments are always
/// f32. Weight decay follows the embedding/matmul convention: tensors of
/// rank 2 or higher decay, vectors (norm gains) do not.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let apply_weight_decay = shape.len() >= 2;

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((idx, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        self.step_adamw(processed)
    }

    fn step_adamw(&mut self, processed: Vec<(usize, Tensor)>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq.affine(1.0 - cfg.beta2, 0.0).map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = if let Some(master) = slot.master.as_ref() {
                master.as_tensor().clone()
            } else {
                slot.param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?
            };

            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let first = flatten_to_vec(&slot.first_moment, numel)?;
            let second = flatten_to_vec(&slot.second_moment, numel)?;
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: first,
                second_moment: second,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    /// Restores moments, step count, and master weights. Every parameter
    /// must be present with matching shape; leftovers in the state are
    /// fatal since they mean the checkpoint belongs to a different model.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let expected = numel(&slot.param.as_tensor().dims().to_vec());
            if slot.param.as_tensor().dims() != state.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().map_or(false, |m| m.len() != expected)
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            slot.first_moment = Tensor::from_vec(state.first_moment, expected, device)
                .map_err(to_runtime_error)?
                .reshape(slot.param.as_tensor().dims())
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, expected, device)
                .map_err(to_runtime_error)?
                .reshape(slot.param.as_tensor().dims())
                .map_err(to_runtime_error)?;

            match (&mut slot.master, state.master) {
                (Some(master), Some(values)) => {
                    let tensor = Tensor::from_vec(values, expected, device)
                        .map_err(to_runtime_error)?
                        .reshape(master.as_tensor().dims())
                        .map_err(to_runtime_error)?;
                    master.set(&tensor).map_err(to_runtime_error)?;
                    let cast = tensor.to_dtype(slot.dtype).map_err(to_runtime_error)?;
                    slot.param.set(&cast).map_err(to_runtime_error)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state carries master weights for '{}' but this run does not use them",
                        slot.name
                    )))
                }
            }
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

/// L2 norm over every gradient currently stored for `params`.
pub fn global_grad_norm(params: &[Var], grads: &GradStore) -> Result<f64, TrainingError> {
    let mut total_sq = 0.0f64;
    for var in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let norm = tensor_l2_norm(grad)?;
            total_sq += norm * norm;
        }
    }
    Ok(total_sq.sqrt())
}

/// Scales every gradient so the global norm does not exceed `max_norm`.
/// Returns the pre-clip norm.
pub fn clip_gradients(
    params: &[Var],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let total_norm = global_grad_norm(params, grads)?;
    if total_norm > max_norm {
        let scale = max_norm / (total_norm + EPS);
        for var in params {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let scaled = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(total_norm)
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn test_config() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 1e-1,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn var_from(data: &[f32], shape: (usize, usize)) -> Var {
        Var::from_tensor(&Tensor::from_slice(data, shape, &Device::Cpu).unwrap()).unwrap()
    }

    fn grads_for(var: &Var, scale: f64) -> GradStore {
        // loss = sum(w * scale) has gradient `scale` in every element.
        let loss = var
            .as_tensor()
            .affine(scale, 0.0)
            .unwrap()
            .sum_all()
            .unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn step_moves_parameters_against_gradient() {
        let var = var_from(&[1.0, 1.0, 1.0, 1.0], (2, 2));
        let mut grads = grads_for(&var, 1.0);
        let mut optimizer = AdamW::new(vec![("w".to_string(), var.clone())], test_config()).unwrap();

        optimizer.step(&mut grads).unwrap();
        let updated = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for value in updated {
            assert!(value < 1.0, "positive gradient should decrease the weight");
        }
    }

    #[test]
    fn clip_rescales_to_max_norm() {
        // Four elements with gradient 5 each: global norm sqrt(4 * 25) = 10.
        let var = var_from(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let mut grads = grads_for(&var, 5.0);

        let params = vec![var.clone()];
        let pre_clip = clip_gradients(&params, &mut grads, 1.0).unwrap();
        assert!((pre_clip - 10.0).abs() < 1e-4);

        let post_clip = global_grad_norm(&params, &grads).unwrap();
        assert!((post_clip - 1.0).abs() < 1e-4);

        // Direction preserved: every element stays equal after uniform scaling.
        let clipped = grads
            .get(var.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for pair in clipped.windows(2) {
            assert!((pair[0] - pair[1]).abs() < 1e-6);
        }
    }

    #[test]
    fn clip_leaves_small_gradients_untouched() {
        let var = var_from(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let mut grads = grads_for(&var, 0.1);
        let params = vec![var.clone()];

        let before = grads
            .get(var.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        clip_gradients(&params, &mut grads, 100.0).unwrap();
        let after = grads
            .get(var.as_tensor())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn weight_decay_skips_vectors() {
        let matrix = var_from(&[1.0, 1.0, 1.0, 1.0], (2, 2));
        let vector =
            Var::from_tensor(&Tensor::from_slice(&[1.0f32, 1.0], (2,), &Device::Cpu).unwrap())
                .unwrap();
        let optimizer = AdamW::new(
            vec![
                ("w".to_string(), matrix),
                ("norm.weight".to_string(), vector),
            ],
            AdamWConfig {
                weight_decay: 0.1,
                ..test_config()
            },
        )
        .unwrap();

        assert!(optimizer.params[0].apply_weight_decay);
        assert!(!optimizer.params[1].apply_weight_decay);
    }

    #[test]
    fn state_round_trips() {
        let var = var_from(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let mut grads = grads_for(&var, 1.0);
        let mut optimizer = AdamW::new(vec![("w".to_string(), var.clone())], test_config()).unwrap();
        optimizer.step(&mut grads).unwrap();

        let state = optimizer.state().unwrap();
        assert_eq!(state.step, 1);

        let fresh_var = var_from(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let mut restored =
            AdamW::new(vec![("w".to_string(), fresh_var)], test_config()).unwrap();
        restored.load_state(state).unwrap();
        assert_eq!(restored.step, 1);

        let original = optimizer.params[0]
            .first_moment
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let loaded = restored.params[0]
            .first_moment
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn load_state_rejects_unknown_parameters() {
        let var = var_from(&[1.0, 1.0, 1.0, 1.0], (2, 2));
        let mut optimizer = AdamW::new(vec![("w".to_string(), var)], test_config()).unwrap();

        let state = OptimizerState {
            step: 3,
            parameters: vec![ParameterState {
                name: "other".to_string(),
                shape: vec![2, 2],
                first_moment: vec![0.0; 4],
                second_moment: vec![0.0; 4],
                master: None,
            }],
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
