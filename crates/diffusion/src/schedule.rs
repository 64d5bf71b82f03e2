use std::{f64::consts::FRAC_PI_2, fmt, str::FromStr};

use candle_core::{Device, Error, Result, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::start::extract_into_tensor;

/// Shape of the beta curve used to build the noise table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    #[default]
    ScaledLinear,
    SquaredcosCapV2,
}

/// What the denoiser is trained to output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    #[default]
    Epsilon,
    VPrediction,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown prediction type '{0}' (expected 'epsilon' or 'v_prediction')")]
pub struct UnknownPredictionType(pub String);

impl PredictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionType::Epsilon => "epsilon",
            PredictionType::VPrediction => "v_prediction",
        }
    }
}

impl FromStr for PredictionType {
    type Err = UnknownPredictionType;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim() {
            "epsilon" => Ok(PredictionType::Epsilon),
            "v_prediction" => Ok(PredictionType::VPrediction),
            other => Err(UnknownPredictionType(other.to_string())),
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of a noise scheduler the training loop is allowed to rely on.
pub trait NoiseSchedule: Send + Sync {
    fn num_train_timesteps(&self) -> usize;

    /// Cumulative alpha products, one `f32` entry per training timestep.
    fn alphas_cumprod(&self) -> &Tensor;

    fn prediction_type(&self) -> PredictionType;

    /// Forward diffusion: `sqrt(ac[t]) * original + sqrt(1 - ac[t]) * noise`.
    fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor>;

    /// Velocity target: `sqrt(ac[t]) * noise - sqrt(1 - ac[t]) * sample`.
    fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor)
        -> Result<Tensor>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DdpmConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
}

impl Default for DdpmConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

impl DdpmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_train_timesteps == 0 {
            return Err(Error::Msg("num_train_timesteps must be greater than zero".into()));
        }
        if !(self.beta_start > 0.0 && self.beta_start < 1.0) {
            return Err(Error::Msg(format!(
                "beta_start must lie in (0, 1), got {}",
                self.beta_start
            )));
        }
        if !(self.beta_end > 0.0 && self.beta_end < 1.0) {
            return Err(Error::Msg(format!(
                "beta_end must lie in (0, 1), got {}",
                self.beta_end
            )));
        }
        Ok(())
    }
}

/// Discrete DDPM noise table held both on the host and on the compute device.
#[derive(Debug, Clone)]
pub struct DdpmSchedule {
    config: DdpmConfig,
    betas: Vec<f64>,
    host_alphas_cumprod: Vec<f64>,
    alphas_cumprod: Tensor,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DdpmSchedule {
    pub fn new(config: DdpmConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let betas = compute_betas(&config);

        let mut host_alphas_cumprod = Vec::with_capacity(betas.len());
        let mut running = 1.0f64;
        for beta in &betas {
            running *= 1.0 - beta;
            host_alphas_cumprod.push(running);
        }

        let table: Vec<f32> = host_alphas_cumprod.iter().map(|v| *v as f32).collect();
        let alphas_cumprod = Tensor::from_vec(table, host_alphas_cumprod.len(), device)?;
        let sqrt_alphas_cumprod = alphas_cumprod.sqrt()?;
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.affine(-1.0, 1.0)?.sqrt()?;

        Ok(Self {
            config,
            betas,
            host_alphas_cumprod,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    pub fn config(&self) -> &DdpmConfig {
        &self.config
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Host copy of the cumulative products, kept in `f64`.
    pub fn host_alphas_cumprod(&self) -> &[f64] {
        &self.host_alphas_cumprod
    }

    /// Replaces the prediction type. This is the only post-construction mutation the
    /// schedule supports and it is always logged.
    pub fn with_prediction_type(mut self, prediction_type: PredictionType) -> Self {
        if prediction_type != self.config.prediction_type {
            info!(
                from = %self.config.prediction_type,
                to = %prediction_type,
                "reconfiguring noise schedule prediction type"
            );
        }
        self.config.prediction_type = prediction_type;
        self
    }

    fn blend(
        &self,
        first_coefficients: &Tensor,
        first: &Tensor,
        second_coefficients: &Tensor,
        second: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        if first.dims() != second.dims() {
            return Err(Error::Msg(format!(
                "tensor shapes differ: {:?} vs {:?}",
                first.dims(),
                second.dims()
            )));
        }
        let dtype = first.dtype();
        let a = extract_into_tensor(first_coefficients, timesteps, first.dims())?.to_dtype(dtype)?;
        let b = extract_into_tensor(second_coefficients, timesteps, first.dims())?.to_dtype(dtype)?;
        a.broadcast_mul(first)? + b.broadcast_mul(second)?
    }
}

impl NoiseSchedule for DdpmSchedule {
    fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    fn alphas_cumprod(&self) -> &Tensor {
        &self.alphas_cumprod
    }

    fn prediction_type(&self) -> PredictionType {
        self.config.prediction_type
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.blend(
            &self.sqrt_alphas_cumprod,
            original,
            &self.sqrt_one_minus_alphas_cumprod,
            noise,
            timesteps,
        )
    }

    fn get_velocity(
        &self,
        sample: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let negated = self.sqrt_one_minus_alphas_cumprod.neg()?;
        self.blend(&self.sqrt_alphas_cumprod, noise, &negated, sample, timesteps)
    }
}

fn compute_betas(config: &DdpmConfig) -> Vec<f64> {
    let steps = config.num_train_timesteps;
    let span = steps.saturating_sub(1).max(1) as f64;
    match config.beta_schedule {
        BetaSchedule::Linear => (0..steps)
            .map(|i| config.beta_start + (config.beta_end - config.beta_start) * i as f64 / span)
            .collect(),
        BetaSchedule::ScaledLinear => {
            let start = config.beta_start.sqrt();
            let end = config.beta_end.sqrt();
            (0..steps)
                .map(|i| {
                    let root = start + (end - start) * i as f64 / span;
                    root * root
                })
                .collect()
        }
        BetaSchedule::SquaredcosCapV2 => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * FRAC_PI_2).cos().powi(2);
            (0..steps)
                .map(|i| {
                    let t1 = i as f64 / steps as f64;
                    let t2 = (i + 1) as f64 / steps as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    }
}

/// Uniformly samples one training timestep per batch element as a `u32` tensor.
pub fn sample_timesteps<R: rand::Rng + ?Sized>(
    rng: &mut R,
    batch: usize,
    num_train_timesteps: usize,
    device: &Device,
) -> Result<Tensor> {
    let values: Vec<u32> = (0..batch)
        .map(|_| rng.gen_range(0..num_train_timesteps) as u32)
        .collect();
    Tensor::from_vec(values, batch, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn parses_known_prediction_types() {
        assert_eq!("epsilon".parse::<PredictionType>(), Ok(PredictionType::Epsilon));
        assert_eq!(
            "v_prediction".parse::<PredictionType>(),
            Ok(PredictionType::VPrediction)
        );
        let err = "sample".parse::<PredictionType>().unwrap_err();
        assert!(err.to_string().contains("sample"));
    }

    #[test]
    fn alphas_cumprod_is_positive_and_decreasing() {
        for beta_schedule in [
            BetaSchedule::Linear,
            BetaSchedule::ScaledLinear,
            BetaSchedule::SquaredcosCapV2,
        ] {
            let config = DdpmConfig {
                beta_schedule,
                ..DdpmConfig::default()
            };
            let schedule = DdpmSchedule::new(config, &Device::Cpu).unwrap();
            let table = schedule.host_alphas_cumprod();
            assert_eq!(table.len(), 1000);
            assert!(table.iter().all(|v| *v > 0.0 && *v <= 1.0));
            assert!(table.windows(2).all(|w| w[1] < w[0]));
        }
    }

    #[test]
    fn add_noise_at_first_timestep_is_nearly_clean() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let clean = Tensor::ones((2, 4, 2, 2), DType::F32, &device).unwrap();
        let noise = Tensor::zeros((2, 4, 2, 2), DType::F32, &device).unwrap();
        let t = Tensor::new(&[0u32, 0u32], &device).unwrap();
        let noisy = schedule.add_noise(&clean, &noise, &t).unwrap();
        let expected = schedule.host_alphas_cumprod()[0].sqrt() as f32;
        for value in noisy.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn velocity_matches_closed_form() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let sample = Tensor::full(2.0f32, (1, 1, 2, 2), &device).unwrap();
        let noise = Tensor::full(-1.0f32, (1, 1, 2, 2), &device).unwrap();
        let t = Tensor::new(&[500u32], &device).unwrap();
        let velocity = schedule.get_velocity(&sample, &noise, &t).unwrap();
        let ac = schedule.host_alphas_cumprod()[500];
        let expected = (ac.sqrt() * -1.0 - (1.0 - ac).sqrt() * 2.0) as f32;
        for value in velocity.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn prediction_type_reconfiguration_sticks() {
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &Device::Cpu)
            .unwrap()
            .with_prediction_type(PredictionType::VPrediction);
        assert_eq!(schedule.prediction_type(), PredictionType::VPrediction);
    }

    #[test]
    fn rejects_empty_schedule() {
        let config = DdpmConfig {
            num_train_timesteps: 0,
            ..DdpmConfig::default()
        };
        assert!(DdpmSchedule::new(config, &Device::Cpu).is_err());
    }
}
