use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl AdamWConfig {
    pub fn from_training_config(value: &config::OptimizerConfig, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

/// AdamW over the denoiser's variables. Moments and, for reduced-precision
/// parameters, master weights are kept in `f32`.
#[derive(Debug)]
pub struct TrainerOptimizer {
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
}

impl TrainerOptimizer {
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
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(tensor.dims(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(tensor.dims(), DType::F32, device).map_err(to_runtime_error)?;

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

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// The optimised variables in name order.
    pub fn variables(&self) -> impl Iterator<Item = &Var> {
        self.params.iter().map(|slot| &slot.param)
    }

    /// Applies one AdamW update from the gradients in `grads`, consuming them.
    /// Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
                processed.push((index, grad));
            }
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
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

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + grad
                    .sqr()
                    .and_then(|sq| sq.affine(1.0 - cfg.beta2, 0.0))
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .and_then(|m| m.div(&denom))
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = next.to_dtype(slot.dtype).map_err(to_runtime_error)?;
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

    /// Re-reads master weights from the live parameters after they were replaced
    /// outside the optimizer (checkpoint restore, base-weight fallback).
    pub fn sync_master_weights(&mut self) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            if let Some(master) = &slot.master {
                let fp32 = slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                master.set(&fp32).map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            let master = match &slot.master {
                Some(master) => Some(flatten_to_vec(master.as_tensor(), numel)?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != state.shape.as_slice() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected = numel(dims);
            if expected != state.first_moment.len()
                || expected != state.second_moment.len()
                || state.master.as_ref().is_some_and(|m| m.len() != expected)
            {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }
            if slot.master.is_some() != state.master.is_some() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state master weights for '{}' do not match the run precision",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            let rebuild = |values: Vec<f32>| {
                Tensor::from_vec(values, expected, device)
                    .and_then(|t| t.reshape(dims))
                    .map_err(to_runtime_error)
            };
            let first = rebuild(state.first_moment)?;
            let second = rebuild(state.second_moment)?;
            let master = match state.master {
                Some(values) => Some(rebuild(values)?),
                None => None,
            };
            restored.push((first, second, master));
        }

        if !by_name.is_empty() {
            return Err(TrainingError::checkpoint(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        for (slot, (first, second, master)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
            if let (Some(var), Some(values)) = (&slot.master, master) {
                var.set(&values).map_err(to_runtime_error)?;
            }
        }
        self.step = state.step;
        self.config.learning_rate = state.learning_rate;

        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
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
    pub learning_rate: f64,
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

    fn config() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn quadratic_step(optimizer: &mut TrainerOptimizer, var: &Var) {
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
    }

    #[test]
    fn adamw_moves_against_the_gradient() {
        let var = Var::from_tensor(&Tensor::new(&[1f32, -2.0], &Device::Cpu).unwrap()).unwrap();
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".to_string(), var.clone())], config()).unwrap();
        quadratic_step(&mut optimizer, &var);
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        // the first bias-corrected Adam step has magnitude lr
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 1.9).abs() < 1e-4);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn state_round_trip_reproduces_next_update() {
        let device = Device::Cpu;
        let a = Var::from_tensor(&Tensor::new(&[0.5f32, 1.5], &device).unwrap()).unwrap();
        let b = Var::from_tensor(&a.as_tensor().copy().unwrap()).unwrap();
        let mut first = TrainerOptimizer::new(vec![("w".into(), a.clone())], config()).unwrap();
        let mut second = TrainerOptimizer::new(vec![("w".into(), b.clone())], config()).unwrap();

        quadratic_step(&mut first, &a);
        second
            .load_state(serde_json::from_str(&serde_json::to_string(&first.state().unwrap()).unwrap()).unwrap())
            .unwrap();
        b.set(a.as_tensor()).unwrap();

        quadratic_step(&mut first, &a);
        quadratic_step(&mut second, &b);
        assert_eq!(
            a.as_tensor().to_vec1::<f32>().unwrap(),
            b.as_tensor().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn mismatched_state_is_a_checkpoint_error() {
        let device = Device::Cpu;
        let a = Var::from_tensor(&Tensor::zeros(3, DType::F32, &device).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::zeros(4, DType::F32, &device).unwrap()).unwrap();
        let small = TrainerOptimizer::new(vec![("w".into(), a)], config()).unwrap();
        let mut large = TrainerOptimizer::new(vec![("w".into(), b)], config()).unwrap();
        assert!(matches!(
            large.load_state(small.state().unwrap()),
            Err(TrainingError::Checkpoint(_))
        ));
    }
}
