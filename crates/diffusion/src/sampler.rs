//! Ancestral DDPM reverse process used for validation sampling.

use candle_core::{Error, Result, Tensor};

use crate::{schedule::PredictionType, DdpmSchedule};

/// Reverse-process stepper with "leading" timestep spacing and the fixed-small
/// posterior variance.
#[derive(Debug, Clone)]
pub struct DdpmSampler {
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
    num_inference_steps: usize,
    timesteps: Vec<usize>,
}

impl DdpmSampler {
    pub fn new(schedule: &DdpmSchedule) -> Self {
        let alphas_cumprod = schedule.host_alphas_cumprod().to_vec();
        let num_inference_steps = alphas_cumprod.len();
        let timesteps = (0..num_inference_steps).rev().collect();
        Self {
            alphas_cumprod,
            prediction_type: schedule.config().prediction_type,
            num_inference_steps,
            timesteps,
        }
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let train_steps = self.num_train_timesteps();
        if num_inference_steps == 0 || num_inference_steps > train_steps {
            return Err(Error::Msg(format!(
                "num_inference_steps must lie in 1..={train_steps}, got {num_inference_steps}"
            )));
        }
        let ratio = train_steps / num_inference_steps;
        self.num_inference_steps = num_inference_steps;
        self.timesteps = (0..num_inference_steps).map(|i| i * ratio).rev().collect();
        Ok(())
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn previous_timestep(&self, timestep: usize) -> Option<usize> {
        let ratio = self.num_train_timesteps() / self.num_inference_steps;
        timestep.checked_sub(ratio)
    }

    /// One reverse step from `timestep`. `variance_noise` is the standard-normal draw
    /// used for the posterior sample and is ignored at `timestep == 0`.
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        variance_noise: Option<&Tensor>,
    ) -> Result<Tensor> {
        let alpha_prod_t = *self.alphas_cumprod.get(timestep).ok_or_else(|| {
            Error::Msg(format!(
                "timestep {timestep} is outside the {}-step schedule",
                self.num_train_timesteps()
            ))
        })?;
        let alpha_prod_t_prev = self
            .previous_timestep(timestep)
            .map(|prev| self.alphas_cumprod[prev])
            .unwrap_or(1.0);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;
        let current_alpha_t = alpha_prod_t / alpha_prod_t_prev;
        let current_beta_t = 1.0 - current_alpha_t;

        let pred_original = match self.prediction_type {
            PredictionType::Epsilon => {
                (sample - model_output.affine(beta_prod_t.sqrt(), 0.0)?)?
                    .affine(1.0 / alpha_prod_t.sqrt(), 0.0)?
            }
            PredictionType::VPrediction => (sample.affine(alpha_prod_t.sqrt(), 0.0)?
                - model_output.affine(beta_prod_t.sqrt(), 0.0)?)?,
        };

        let original_coef = alpha_prod_t_prev.sqrt() * current_beta_t / beta_prod_t;
        let current_coef = current_alpha_t.sqrt() * beta_prod_t_prev / beta_prod_t;
        let prev_sample = (pred_original.affine(original_coef, 0.0)?
            + sample.affine(current_coef, 0.0)?)?;

        match variance_noise {
            Some(noise) if timestep > 0 => {
                let variance = (beta_prod_t_prev / beta_prod_t * current_beta_t).max(1e-20);
                prev_sample + noise.affine(variance.sqrt(), 0.0)?
            }
            _ => Ok(prev_sample),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DdpmConfig, NoiseSchedule};
    use candle_core::Device;

    #[test]
    fn leading_spacing() {
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &Device::Cpu).unwrap();
        let mut sampler = DdpmSampler::new(&schedule);
        sampler.set_timesteps(4).unwrap();
        assert_eq!(sampler.timesteps(), &[750, 500, 250, 0]);
        assert!(sampler.set_timesteps(0).is_err());
        assert!(sampler.set_timesteps(1001).is_err());
    }

    #[test]
    fn final_step_returns_predicted_original() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let sampler = DdpmSampler::new(&schedule);
        let clean = Tensor::randn(0f32, 1f32, (1, 4, 4, 4), &device).unwrap();
        let noise = Tensor::randn(0f32, 1f32, (1, 4, 4, 4), &device).unwrap();
        let t = Tensor::new(&[0u32], &device).unwrap();
        let noisy = schedule.add_noise(&clean, &noise, &t).unwrap();

        let out = sampler.step(&noise, 0, &noisy, Some(&noise)).unwrap();
        let diff = (out - &clean)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4);
    }

    #[test]
    fn out_of_range_timestep_errors() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let sampler = DdpmSampler::new(&schedule);
        let x = Tensor::zeros((1, 1, 2, 2), candle_core::DType::F32, &device).unwrap();
        assert!(sampler.step(&x, 1000, &x, None).is_err());
    }
}
