//! DREAM (Diffusion Rectification and Estimation-Adaptive Models) target adjustment.
//!
//! One extra, gradient-free denoiser pass estimates how far the prediction is from
//! the true noise. That error, scaled by `sqrt(1 - ac[t])^p`, is folded into both
//! the noisy input and the regression target.

use candle_core::{Error, Result, Tensor};

use crate::{schedule::PredictionType, start::extract_into_tensor, NoiseSchedule};

#[derive(Debug, Clone)]
pub struct DreamAdjustment {
    pub noisy_latents: Tensor,
    pub target: Tensor,
}

/// `predict` receives the noisy latents and must return the denoiser output for them
/// (callers attach conditioning inside the closure). Its result is detached.
pub fn compute_dream_and_update_latents<F>(
    schedule: &dyn NoiseSchedule,
    timesteps: &Tensor,
    noise: &Tensor,
    noisy_latents: &Tensor,
    target: &Tensor,
    detail_preservation: f64,
    predict: F,
) -> Result<DreamAdjustment>
where
    F: FnOnce(&Tensor) -> Result<Tensor>,
{
    if schedule.prediction_type() == PredictionType::VPrediction {
        return Err(Error::Msg(
            "DREAM is only defined for epsilon prediction, not v_prediction".into(),
        ));
    }

    let dtype = noisy_latents.dtype();
    let alphas = extract_into_tensor(schedule.alphas_cumprod(), timesteps, noisy_latents.dims())?;
    let sqrt_one_minus = alphas.affine(-1.0, 1.0)?.sqrt()?;
    let lambda = sqrt_one_minus.powf(detail_preservation)?.to_dtype(dtype)?;
    let sqrt_one_minus = sqrt_one_minus.to_dtype(dtype)?;

    let prediction = predict(noisy_latents)?.detach();
    let delta = noise
        .detach()
        .sub(&prediction)?
        .broadcast_mul(&lambda)?
        .detach();

    let noisy_latents = noisy_latents.add(&sqrt_one_minus.broadcast_mul(&delta)?)?;
    let target = target.add(&delta)?;
    Ok(DreamAdjustment {
        noisy_latents,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DdpmConfig, DdpmSchedule};
    use candle_core::{DType, Device};

    #[test]
    fn perfect_prediction_leaves_inputs_untouched() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let noise = Tensor::randn(0f32, 1f32, (2, 4, 4, 4), &device).unwrap();
        let noisy = Tensor::randn(0f32, 1f32, (2, 4, 4, 4), &device).unwrap();
        let t = Tensor::new(&[3u32, 700], &device).unwrap();
        let expected = noise.clone();
        let adjusted = compute_dream_and_update_latents(
            &schedule,
            &t,
            &noise,
            &noisy,
            &noise,
            1.0,
            |_| Ok(expected.clone()),
        )
        .unwrap();
        let diff = (adjusted.noisy_latents - &noisy)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn zero_prediction_shifts_by_scaled_noise() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let noise = Tensor::ones((1, 1, 2, 2), DType::F32, &device).unwrap();
        let noisy = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let t = Tensor::new(&[500u32], &device).unwrap();
        let adjusted = compute_dream_and_update_latents(
            &schedule,
            &t,
            &noise,
            &noisy,
            &noise,
            1.0,
            |x| x.zeros_like(),
        )
        .unwrap();
        let s = (1.0 - schedule.host_alphas_cumprod()[500]).sqrt() as f32;
        let target = adjusted.target.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(target.iter().all(|v| (v - (1.0 + s)).abs() < 1e-5));
        let latents = adjusted.noisy_latents.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(latents.iter().all(|v| (v - s * s).abs() < 1e-5));
    }

    #[test]
    fn v_prediction_is_refused() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device)
            .unwrap()
            .with_prediction_type(PredictionType::VPrediction);
        let x = Tensor::zeros((1, 1, 2, 2), DType::F32, &device).unwrap();
        let t = Tensor::new(&[1u32], &device).unwrap();
        let result =
            compute_dream_and_update_latents(&schedule, &t, &x, &x, &x, 1.0, |x| x.zeros_like());
        assert!(result.is_err());
    }
}
