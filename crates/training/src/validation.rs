//! Periodic qualitative check of the denoiser: a full DDPM reverse pass and a
//! one-step direct estimate from the same starting latents, both decoded and
//! pushed through the frozen segmenter.

use candle_core::{DType, IndexOp, Tensor};
use diffusion::{predict_start_from_noise, DdpmSampler, DdpmSchedule, NoiseSchedule};
use image::{Rgb, RgbImage};
use model::{Denoiser, FrozenAutoencoder, FrozenSegmenter, FrozenTextEncoder};
use tracing::debug;

use crate::{config::ValidationConfig, data::DataBatch, error::to_runtime_error, TrainingError};

/// Overlay colours indexed by class id; class 0 is background and left unpainted.
const PALETTE: [[u8; 3]; 14] = [
    [0, 0, 0],
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 212],
    [0, 128, 128],
    [220, 190, 255],
    [170, 110, 40],
];
const OVERLAY_ALPHA: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct ValidationSettings {
    pub num_inference_steps: usize,
    pub direct_timestep: usize,
    pub max_batches: usize,
}

impl From<&ValidationConfig> for ValidationSettings {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            num_inference_steps: config.num_inference_steps,
            direct_timestep: config.direct_timestep,
            max_batches: config.max_batches.max(1),
        }
    }
}

/// Borrowed view of the networks needed for one validation pass.
pub struct Validator<'a> {
    pub denoiser: &'a dyn Denoiser,
    pub autoencoder: &'a FrozenAutoencoder,
    pub text_encoder: &'a FrozenTextEncoder,
    pub segmenter: &'a FrozenSegmenter,
    pub schedule: &'a DdpmSchedule,
}

/// Decoded pixels are clamped to `[-1, 1]`; class maps are `(b, c, h, w)` `u32`.
#[derive(Debug, Clone)]
pub struct ValidationSample {
    pub sampled: Tensor,
    pub direct: Tensor,
    pub sampled_classes: Tensor,
    pub direct_classes: Tensor,
}

/// Per-batch agreement of a [`ValidationSample`] with the batch's ground truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchScores {
    pub sampled_l1: f64,
    pub direct_l1: f64,
    pub pixels: u64,
    pub sampled_correct: u64,
    pub direct_correct: u64,
}

impl Validator<'_> {
    pub fn sample(
        &self,
        batch: &DataBatch,
        settings: &ValidationSettings,
    ) -> Result<ValidationSample, TrainingError> {
        let num_train_timesteps = self.schedule.num_train_timesteps();
        if settings.direct_timestep >= num_train_timesteps {
            return Err(TrainingError::configuration(format!(
                "validation direct_timestep {} must be below num_train_timesteps {}",
                settings.direct_timestep, num_train_timesteps
            )));
        }

        let cond_latents = self
            .autoencoder
            .encode_latents(&batch.conditions)
            .map_err(to_runtime_error)?;
        let context = self
            .text_encoder
            .encode(&batch.input_ids)
            .map_err(to_runtime_error)?;
        let start = cond_latents.randn_like(0.0, 1.0).map_err(to_runtime_error)?;
        let batch_size = start.dim(0).map_err(to_runtime_error)?;
        let device = start.device().clone();

        let mut sampler = DdpmSampler::new(self.schedule);
        sampler
            .set_timesteps(settings.num_inference_steps)
            .map_err(to_runtime_error)?;
        let mut latents = start.clone();
        for &timestep in sampler.timesteps() {
            let timesteps =
                Tensor::full(timestep as u32, batch_size, &device).map_err(to_runtime_error)?;
            let model_output = self.predict(&latents, &cond_latents, &timesteps, &context)?;
            let variance_noise = latents.randn_like(0.0, 1.0).map_err(to_runtime_error)?;
            latents = sampler
                .step(&model_output, timestep, &latents, Some(&variance_noise))
                .map_err(to_runtime_error)?;
        }
        debug!(steps = sampler.timesteps().len(), "validation sampling finished");

        let timesteps = Tensor::full(settings.direct_timestep as u32, batch_size, &device)
            .map_err(to_runtime_error)?;
        let noise_pred = self.predict(&start, &cond_latents, &timesteps, &context)?;
        let direct_latents = predict_start_from_noise(
            &start,
            &timesteps,
            &noise_pred,
            self.schedule.alphas_cumprod(),
        )
        .map_err(to_runtime_error)?;

        let (sampled, sampled_classes) = self.decode_and_segment(&latents)?;
        let (direct, direct_classes) = self.decode_and_segment(&direct_latents)?;
        Ok(ValidationSample {
            sampled,
            direct,
            sampled_classes,
            direct_classes,
        })
    }

    fn predict(
        &self,
        latents: &Tensor,
        cond_latents: &Tensor,
        timesteps: &Tensor,
        context: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let input = Tensor::cat(&[latents, cond_latents], 1).map_err(to_runtime_error)?;
        self.denoiser
            .forward(&input, timesteps, context)
            .map(|out| out.detach())
            .map_err(to_runtime_error)
    }

    fn decode_and_segment(&self, latents: &Tensor) -> Result<(Tensor, Tensor), TrainingError> {
        let decoded = self
            .autoencoder
            .decode_latents(&latents.detach())
            .and_then(|pixels| pixels.clamp(-1f32, 1f32))
            .map_err(to_runtime_error)?;
        let (b, c, _, _) = decoded.dims4().map_err(to_runtime_error)?;
        let rescaled = self.segmenter.rescale(&decoded).map_err(to_runtime_error)?;
        let logits = self
            .segmenter
            .segment_pixels(&rescaled)
            .map_err(to_runtime_error)?;
        let classes = self
            .segmenter
            .predict_classes(&logits, b, c)
            .map_err(to_runtime_error)?;
        Ok((decoded, classes))
    }
}

pub fn score_batch(batch: &DataBatch, sample: &ValidationSample) -> Result<BatchScores, TrainingError> {
    let l1 = |pixels: &Tensor| -> Result<f64, TrainingError> {
        let value = pixels
            .sub(&batch.images.to_dtype(DType::F32).map_err(to_runtime_error)?)
            .and_then(|diff| diff.abs())
            .and_then(|diff| diff.mean_all())
            .and_then(|mean| mean.to_scalar::<f32>())
            .map_err(to_runtime_error)?;
        Ok(value as f64)
    };
    let correct = |classes: &Tensor| -> Result<u64, TrainingError> {
        let count = classes
            .eq(&batch.masks)
            .and_then(|hits| hits.to_dtype(DType::F32))
            .and_then(|hits| hits.sum_all())
            .and_then(|sum| sum.to_scalar::<f32>())
            .map_err(to_runtime_error)?;
        Ok(count.round() as u64)
    };

    Ok(BatchScores {
        sampled_l1: l1(&sample.sampled)?,
        direct_l1: l1(&sample.direct)?,
        pixels: batch.masks.elem_count() as u64,
        sampled_correct: correct(&sample.sampled_classes)?,
        direct_correct: correct(&sample.direct_classes)?,
    })
}

/// Greyscale views of the first example (middle channel) plus class overlays for
/// the ground truth and both sampling paths.
pub fn render_panels(
    batch: &DataBatch,
    sample: &ValidationSample,
) -> Result<Vec<(String, RgbImage)>, TrainingError> {
    let channels = batch.images.dim(1).map_err(to_runtime_error)?;
    let channel = channels / 2;

    let ground_truth = plane(&batch.images, channel)?;
    let condition = plane(&batch.conditions, channel)?;
    let sampled = plane(&sample.sampled, channel)?;
    let direct = plane(&sample.direct, channel)?;

    Ok(vec![
        ("validation/ground_truth".to_string(), greyscale(&ground_truth)),
        ("validation/condition".to_string(), greyscale(&condition)),
        ("validation/sampled".to_string(), greyscale(&sampled)),
        ("validation/direct".to_string(), greyscale(&direct)),
        (
            "validation/ground_truth_segmentation".to_string(),
            overlay(&ground_truth, &class_plane(&batch.masks, channel)?),
        ),
        (
            "validation/sampled_segmentation".to_string(),
            overlay(&sampled, &class_plane(&sample.sampled_classes, channel)?),
        ),
        (
            "validation/direct_segmentation".to_string(),
            overlay(&direct, &class_plane(&sample.direct_classes, channel)?),
        ),
    ])
}

fn plane(tensor: &Tensor, channel: usize) -> Result<Vec<Vec<f32>>, TrainingError> {
    tensor
        .i((0, channel))
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)
}

fn class_plane(tensor: &Tensor, channel: usize) -> Result<Vec<Vec<u32>>, TrainingError> {
    tensor
        .i((0, channel))
        .and_then(|t| t.to_dtype(DType::U32))
        .and_then(|t| t.to_vec2::<u32>())
        .map_err(to_runtime_error)
}

fn to_grey(value: f32) -> u8 {
    (((value.clamp(-1.0, 1.0) + 1.0) * 0.5) * 255.0).round() as u8
}

fn greyscale(pixels: &[Vec<f32>]) -> RgbImage {
    let height = pixels.len() as u32;
    let width = pixels.first().map_or(0, |row| row.len()) as u32;
    RgbImage::from_fn(width, height, |x, y| {
        let g = to_grey(pixels[y as usize][x as usize]);
        Rgb([g, g, g])
    })
}

fn overlay(pixels: &[Vec<f32>], classes: &[Vec<u32>]) -> RgbImage {
    let mut image = greyscale(pixels);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let class = classes[y as usize][x as usize] as usize;
        if class == 0 {
            continue;
        }
        let colour = PALETTE[class % PALETTE.len()];
        for (channel, tint) in pixel.0.iter_mut().zip(colour) {
            *channel =
                ((1.0 - OVERLAY_ALPHA) * *channel as f32 + OVERLAY_ALPHA * tint as f32).round() as u8;
        }
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greyscale_maps_unit_interval_ends() {
        let image = greyscale(&[vec![-1.0, 0.0, 1.0, 7.0]]);
        assert_eq!(image.dimensions(), (4, 1));
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [128, 128, 128]);
        assert_eq!(image.get_pixel(2, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(3, 0).0, [255, 255, 255]);
    }

    #[test]
    fn overlay_leaves_background_unpainted() {
        let image = overlay(&[vec![-1.0, -1.0]], &[vec![0, 1]]);
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [115, 13, 38]);
    }
}
