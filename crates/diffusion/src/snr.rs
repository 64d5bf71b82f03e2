use candle_core::{Result, Tensor};

use crate::{schedule::PredictionType, start::extract_into_tensor, NoiseSchedule};

/// Per-example signal-to-noise ratio `ac[t] / (1 - ac[t])`, shaped `(batch,)`.
pub fn compute_snr(schedule: &dyn NoiseSchedule, timesteps: &Tensor) -> Result<Tensor> {
    let batch = timesteps.dims1()?;
    let alphas = extract_into_tensor(schedule.alphas_cumprod(), timesteps, &[batch, 1])?
        .flatten_all()?;
    let noise = alphas.affine(-1.0, 1.0)?;
    alphas.div(&noise)
}

/// Min-SNR loss weights: `min(snr, gamma) / snr` for epsilon targets and
/// `min(snr, gamma) / (snr + 1)` for velocity targets.
pub fn snr_loss_weights(
    snr: &Tensor,
    gamma: f64,
    prediction_type: PredictionType,
) -> Result<Tensor> {
    let clamped = snr.minimum(gamma)?;
    match prediction_type {
        PredictionType::Epsilon => clamped.div(snr),
        PredictionType::VPrediction => clamped.div(&snr.affine(1.0, 1.0)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DdpmConfig, DdpmSchedule};
    use candle_core::Device;

    #[test]
    fn weights_clamp_to_gamma_over_snr() {
        let device = Device::Cpu;
        let snr = Tensor::new(&[8.0f32, 20.0, 100.0], &device).unwrap();
        let weights = snr_loss_weights(&snr, 5.0, PredictionType::Epsilon)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (w, s) in weights.iter().zip([8.0f32, 20.0, 100.0]) {
            assert!((w - 5.0 / s).abs() < 1e-6);
        }
    }

    #[test]
    fn low_snr_keeps_unit_weight_for_epsilon() {
        let device = Device::Cpu;
        let snr = Tensor::new(&[0.5f32, 2.0], &device).unwrap();
        let weights = snr_loss_weights(&snr, 5.0, PredictionType::Epsilon)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(weights.iter().all(|w| (w - 1.0).abs() < 1e-6));

        let v_weights = snr_loss_weights(&snr, 5.0, PredictionType::VPrediction)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((v_weights[0] - 0.5 / 1.5).abs() < 1e-6);
        assert!((v_weights[1] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn snr_follows_the_table() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let t = Tensor::new(&[0u32, 999], &device).unwrap();
        let snr = compute_snr(&schedule, &t).unwrap().to_vec1::<f32>().unwrap();
        let table = schedule.host_alphas_cumprod();
        for (value, idx) in snr.iter().zip([0usize, 999]) {
            let expected = table[idx] / (1.0 - table[idx]);
            assert!(((*value as f64 - expected) / expected).abs() < 1e-3);
        }
    }
}
