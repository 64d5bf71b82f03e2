//! Closed-form inverse of the forward diffusion equation.

use candle_core::{DType, Error, Result, Tensor};

/// Gathers `table[t]` for every batch element and reshapes the result to
/// `(batch, 1, 1, ...)` so it broadcasts against a tensor of `x_shape`.
pub fn extract_into_tensor(table: &Tensor, timesteps: &Tensor, x_shape: &[usize]) -> Result<Tensor> {
    if x_shape.len() < 2 {
        return Err(Error::Msg(format!(
            "expected a tensor of rank >= 2, got shape {x_shape:?}"
        )));
    }
    let batch = timesteps.dims1()?;
    if batch != x_shape[0] {
        return Err(Error::Msg(format!(
            "got {batch} timesteps for a batch of {}",
            x_shape[0]
        )));
    }

    let indices = timesteps.to_device(table.device())?.to_dtype(DType::U32)?;
    let gathered = table.index_select(&indices, 0)?;
    let mut shape = vec![1usize; x_shape.len()];
    shape[0] = batch;
    gathered.reshape(shape)
}

/// Estimates the clean sample from a noisy sample and a noise prediction:
///
/// `x_0 = sqrt(1 / ac[t]) * x_t - sqrt(1 / ac[t] - 1) * noise`
///
/// Works for any rank >= 2 and returns a tensor shaped like `x_t`. A zero entry in
/// `alphas_cumprod` is a broken schedule and is not guarded here.
pub fn predict_start_from_noise(
    x_t: &Tensor,
    timesteps: &Tensor,
    noise: &Tensor,
    alphas_cumprod: &Tensor,
) -> Result<Tensor> {
    if x_t.dims() != noise.dims() {
        return Err(Error::Msg(format!(
            "noisy sample {:?} and noise {:?} must share a shape",
            x_t.dims(),
            noise.dims()
        )));
    }

    let recip = alphas_cumprod.to_dtype(DType::F32)?.recip()?;
    let sqrt_recip = recip.sqrt()?;
    let sqrt_recip_minus_one = recip.affine(1.0, -1.0)?.sqrt()?;

    let dtype = x_t.dtype();
    let sample_coef = extract_into_tensor(&sqrt_recip, timesteps, x_t.dims())?.to_dtype(dtype)?;
    let noise_coef =
        extract_into_tensor(&sqrt_recip_minus_one, timesteps, x_t.dims())?.to_dtype(dtype)?;

    sample_coef.broadcast_mul(x_t)? - noise_coef.broadcast_mul(noise)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DdpmConfig, DdpmSchedule, NoiseSchedule};
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn inverts_add_noise() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let clean = Tensor::randn(0f32, 1f32, (4, 4, 8, 8), &device).unwrap();
        let noise = Tensor::randn(0f32, 1f32, (4, 4, 8, 8), &device).unwrap();
        let t = Tensor::new(&[0u32, 1, 500, 999], &device).unwrap();

        let noisy = schedule.add_noise(&clean, &noise, &t).unwrap();
        let recovered =
            predict_start_from_noise(&noisy, &t, &noise, schedule.alphas_cumprod()).unwrap();

        assert!(max_abs_diff(&recovered, &clean) < 1e-3);
    }

    #[test]
    fn preserves_shape_for_any_rank() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        for shape in [vec![3, 5], vec![3, 2, 7], vec![3, 4, 6, 6], vec![3, 1, 2, 4, 4]] {
            let x = Tensor::randn(0f32, 1f32, shape.as_slice(), &device).unwrap();
            let noise = Tensor::randn(0f32, 1f32, shape.as_slice(), &device).unwrap();
            let t = Tensor::new(&[10u32, 20, 30], &device).unwrap();
            let out = predict_start_from_noise(&x, &t, &noise, schedule.alphas_cumprod()).unwrap();
            assert_eq!(out.dims(), shape.as_slice());
        }
    }

    #[test]
    fn rejects_mismatched_batch() {
        let device = Device::Cpu;
        let table = Tensor::new(&[0.9f32, 0.5], &device).unwrap();
        let t = Tensor::new(&[0u32], &device).unwrap();
        assert!(extract_into_tensor(&table, &t, &[2, 3]).is_err());
        assert!(extract_into_tensor(&table, &t, &[1]).is_err());
    }
}
