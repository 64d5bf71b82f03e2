//! Exponential moving average of the denoiser weights.
//!
//! The shadow set is updated after every optimizer step and swapped into the live
//! network for validation through `store` / `copy_to` / `restore`.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::EmaConfig, error::to_runtime_error, TrainingError};

/// Where the shadow weights live between updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidentTier {
    /// Next to the live parameters on the compute device.
    Fast,
    /// Host memory; moved to the compute device only for the update.
    Slow,
}

/// Bookkeeping written next to the shadow weights in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub optimization_step: usize,
    pub decay: f64,
    pub min_decay: f64,
    pub update_after_step: usize,
    pub use_ema_warmup: bool,
    pub inv_gamma: f64,
    pub power: f64,
}

#[derive(Debug)]
pub struct EmaModel {
    config: EmaConfig,
    names: Vec<String>,
    shadow: Vec<Tensor>,
    tier: ResidentTier,
    compute_device: Device,
    optimization_step: usize,
    stored: Option<Vec<Tensor>>,
}

impl EmaModel {
    /// Starts the shadow set as an exact copy of `params`.
    pub fn new(params: &[(String, Var)], config: &EmaConfig) -> Result<Self, TrainingError> {
        let compute_device = params
            .first()
            .map(|(_, var)| var.as_tensor().device().clone())
            .ok_or_else(|| TrainingError::initialization("EMA requires at least one parameter"))?;
        let tier = if config.offload {
            ResidentTier::Slow
        } else {
            ResidentTier::Fast
        };
        let home = tier_device(tier, &compute_device);

        let mut names = Vec::with_capacity(params.len());
        let mut shadow = Vec::with_capacity(params.len());
        for (name, var) in params {
            names.push(name.clone());
            shadow.push(
                var.as_tensor()
                    .to_dtype(DType::F32)
                    .and_then(|t| t.to_device(&home))
                    .and_then(|t| t.copy())
                    .map_err(to_runtime_error)?
                    .detach(),
            );
        }

        Ok(Self {
            config: config.clone(),
            names,
            shadow,
            tier,
            compute_device,
            optimization_step: 0,
            stored: None,
        })
    }

    pub fn resident_tier(&self) -> ResidentTier {
        self.tier
    }

    pub fn optimization_step(&self) -> usize {
        self.optimization_step
    }

    /// Effective decay for the `optimization_step`-th update (1-based).
    pub fn decay_at(&self, optimization_step: usize) -> f64 {
        let cfg = &self.config;
        let step = optimization_step.saturating_sub(cfg.update_after_step + 1);
        if step == 0 {
            return 0.0;
        }
        let step = step as f64;
        let value = if cfg.use_ema_warmup {
            1.0 - (1.0 + step / cfg.inv_gamma).powf(-cfg.power)
        } else {
            (1.0 + step) / (10.0 + step)
        };
        value.min(cfg.decay).max(cfg.min_decay)
    }

    /// One EMA update: `shadow -= (1 - d) * (shadow - param)`. Returns `d`.
    pub fn step(&mut self, params: &[(String, Var)]) -> Result<f64, TrainingError> {
        self.check_names(params)?;
        self.optimization_step += 1;
        let decay = self.decay_at(self.optimization_step);
        let one_minus = 1.0 - decay;

        if self.tier == ResidentTier::Slow {
            let device = self.compute_device.clone();
            self.move_shadow(&device)?;
        }

        for (shadow, (_, var)) in self.shadow.iter_mut().zip(params) {
            let param = var
                .as_tensor()
                .detach()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let delta = (&*shadow - &param)
                .and_then(|d| d.affine(one_minus, 0.0))
                .map_err(to_runtime_error)?;
            *shadow = (&*shadow - delta).map_err(to_runtime_error)?.detach();
        }

        if self.tier == ResidentTier::Slow {
            self.move_shadow(&Device::Cpu)?;
        }

        debug!(step = self.optimization_step, decay, "ema update");
        Ok(decay)
    }

    /// Snapshots the live weights so `restore` can put them back.
    pub fn store(&mut self, params: &[(String, Var)]) -> Result<(), TrainingError> {
        self.check_names(params)?;
        let snapshot = params
            .iter()
            .map(|(_, var)| var.as_tensor().copy().map_err(to_runtime_error))
            .collect::<Result<Vec<_>, _>>()?;
        self.stored = Some(snapshot);
        Ok(())
    }

    /// Overwrites the live weights with the shadow weights.
    pub fn copy_to(&self, params: &[(String, Var)]) -> Result<(), TrainingError> {
        self.check_names(params)?;
        for (shadow, (_, var)) in self.shadow.iter().zip(params) {
            let live = var.as_tensor();
            let value = shadow
                .to_device(live.device())
                .and_then(|t| t.to_dtype(live.dtype()))
                .map_err(to_runtime_error)?;
            var.set(&value).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    /// Puts back the weights captured by the last `store`.
    pub fn restore(&mut self, params: &[(String, Var)]) -> Result<(), TrainingError> {
        self.check_names(params)?;
        let stored = self
            .stored
            .take()
            .ok_or_else(|| TrainingError::runtime("EMA restore called without a prior store"))?;
        for (saved, (_, var)) in stored.iter().zip(params) {
            var.set(saved).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    /// Shadow tensors keyed by parameter name.
    pub fn shadow(&self) -> HashMap<String, Tensor> {
        self.names
            .iter()
            .cloned()
            .zip(self.shadow.iter().cloned())
            .collect()
    }

    pub fn state(&self) -> EmaState {
        EmaState {
            optimization_step: self.optimization_step,
            decay: self.config.decay,
            min_decay: self.config.min_decay,
            update_after_step: self.config.update_after_step,
            use_ema_warmup: self.config.use_ema_warmup,
            inv_gamma: self.config.inv_gamma,
            power: self.config.power,
        }
    }

    /// Replaces the shadow weights and step counter. Decay settings stay those of
    /// the current run.
    pub fn load_state(
        &mut self,
        state: &EmaState,
        mut shadow: HashMap<String, Tensor>,
    ) -> Result<(), TrainingError> {
        let home = tier_device(self.tier, &self.compute_device);
        let mut replacement = Vec::with_capacity(self.names.len());
        for (name, current) in self.names.iter().zip(&self.shadow) {
            let tensor = shadow.remove(name).ok_or_else(|| {
                TrainingError::checkpoint(format!("EMA weights missing parameter '{}'", name))
            })?;
            if tensor.dims() != current.dims() {
                return Err(TrainingError::checkpoint(format!(
                    "EMA weight '{}' has shape {:?}, expected {:?}",
                    name,
                    tensor.dims(),
                    current.dims()
                )));
            }
            replacement.push(
                tensor
                    .to_dtype(DType::F32)
                    .and_then(|t| t.to_device(&home))
                    .map_err(to_runtime_error)?,
            );
        }
        if !shadow.is_empty() {
            return Err(TrainingError::checkpoint(
                "EMA weights contain parameters not present in the model",
            ));
        }
        self.shadow = replacement;
        self.optimization_step = state.optimization_step;
        Ok(())
    }

    fn move_shadow(&mut self, device: &Device) -> Result<(), TrainingError> {
        for tensor in &mut self.shadow {
            *tensor = tensor.to_device(device).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    fn check_names(&self, params: &[(String, Var)]) -> Result<(), TrainingError> {
        let matches = params.len() == self.names.len()
            && params
                .iter()
                .zip(&self.names)
                .all(|((name, _), expected)| name == expected);
        if matches {
            Ok(())
        } else {
            Err(TrainingError::runtime(
                "EMA parameters do not match the tracked parameter list",
            ))
        }
    }
}

fn tier_device(tier: ResidentTier, compute: &Device) -> Device {
    match tier {
        ResidentTier::Fast => compute.clone(),
        ResidentTier::Slow => Device::Cpu,
    }
}
