use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use diffusion::{compute_snr, snr_loss_weights, NoiseSchedule};
use serde::{Deserialize, Serialize};

use crate::{error::to_runtime_error, TrainingError};

/// Distance used between the denoiser output and its target in uniform mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NoiseLossKind {
    L1,
    #[default]
    L2,
}

/// How the step objective is assembled. Chosen once from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossMode {
    /// `noise + pixel_l1 + segmentation_weight * cross_entropy`.
    Uniform {
        noise_loss: NoiseLossKind,
        segmentation_weight: f64,
    },
    /// Min-SNR weighted L2 noise loss on its own.
    SnrWeighted { gamma: f64 },
}

/// Everything the composer may read for one micro-batch.
pub struct LossInputs<'a> {
    pub model_pred: &'a Tensor,
    pub target: &'a Tensor,
    pub timesteps: &'a Tensor,
    /// Present whenever the composer asked for reconstruction.
    pub reconstruction: Option<ReconstructionInputs<'a>>,
}

pub struct ReconstructionInputs<'a> {
    /// Decoded estimate after `clamp(-1, 1) * pixel_scale`.
    pub rescaled_estimate: &'a Tensor,
    /// Ground-truth pixels in `[-1, 1]`.
    pub raw_images: &'a Tensor,
    /// `(b * c, num_classes, h, w)` segmentation logits.
    pub segmentation_logits: &'a Tensor,
    /// `(b, c, h, w)` class ids.
    pub masks: &'a Tensor,
}

#[derive(Debug, Clone)]
pub struct LossTerms {
    pub total: Tensor,
    pub noise: Tensor,
    pub pixel: Option<Tensor>,
    pub segmentation: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct LossComposer {
    mode: LossMode,
    pixel_scale: f64,
}

impl LossComposer {
    pub fn new(mode: LossMode, pixel_scale: f64) -> Self {
        Self {
            mode,
            pixel_scale,
        }
    }

    pub fn mode(&self) -> LossMode {
        self.mode
    }

    /// The SNR-weighted objective never looks at decoded pixels, so the decode and
    /// segmentation passes can be skipped.
    pub fn needs_reconstruction(&self) -> bool {
        matches!(self.mode, LossMode::Uniform { .. })
    }

    pub fn compose(
        &self,
        schedule: &dyn NoiseSchedule,
        inputs: &LossInputs<'_>,
    ) -> Result<LossTerms, TrainingError> {
        let pred = inputs
            .model_pred
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        let target = inputs.target.to_dtype(DType::F32).map_err(to_runtime_error)?;
        if pred.dims() != target.dims() {
            return Err(TrainingError::runtime(format!(
                "prediction {:?} and target {:?} differ in shape",
                pred.dims(),
                target.dims()
            )));
        }

        match self.mode {
            LossMode::Uniform {
                noise_loss,
                segmentation_weight,
            } => {
                let noise = noise_matching_loss(&pred, &target, noise_loss)?;
                let reconstruction = inputs.reconstruction.as_ref().ok_or_else(|| {
                    TrainingError::runtime("uniform loss requires the reconstruction pass")
                })?;
                let pixel = self.pixel_loss(reconstruction)?;
                let segmentation = pixel_cross_entropy(
                    reconstruction.segmentation_logits,
                    reconstruction.masks,
                )?;
                let total = combine_uniform(&noise, &pixel, &segmentation, segmentation_weight)?;
                Ok(LossTerms {
                    total,
                    noise,
                    pixel: Some(pixel),
                    segmentation: Some(segmentation),
                })
            }
            LossMode::SnrWeighted { gamma } => {
                let snr = compute_snr(schedule, inputs.timesteps).map_err(to_runtime_error)?;
                let weights = snr_loss_weights(&snr, gamma, schedule.prediction_type())
                    .map_err(to_runtime_error)?;
                let per_example = (&pred - &target)
                    .and_then(|diff| diff.sqr())
                    .and_then(|sq| sq.flatten_from(1))
                    .and_then(|flat| flat.mean(1))
                    .map_err(to_runtime_error)?;
                let noise = (per_example * weights)
                    .and_then(|weighted| weighted.mean_all())
                    .map_err(to_runtime_error)?;
                Ok(LossTerms {
                    total: noise.clone(),
                    noise,
                    pixel: None,
                    segmentation: None,
                })
            }
        }
    }

    fn pixel_loss(&self, inputs: &ReconstructionInputs<'_>) -> Result<Tensor, TrainingError> {
        let estimate = inputs
            .rescaled_estimate
            .to_dtype(DType::F32)
            .and_then(|t| t.affine(1.0 / self.pixel_scale, 0.0))
            .map_err(to_runtime_error)?;
        let raw = inputs
            .raw_images
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?;
        (estimate - raw)
            .and_then(|diff| diff.abs())
            .and_then(|abs| abs.mean_all())
            .map_err(to_runtime_error)
    }
}

fn noise_matching_loss(
    pred: &Tensor,
    target: &Tensor,
    kind: NoiseLossKind,
) -> Result<Tensor, TrainingError> {
    let diff = (pred - target).map_err(to_runtime_error)?;
    match kind {
        NoiseLossKind::L1 => diff.abs(),
        NoiseLossKind::L2 => diff.sqr(),
    }
    .and_then(|t| t.mean_all())
    .map_err(to_runtime_error)
}

/// `noise + pixel + segmentation_weight * segmentation`.
pub fn combine_uniform(
    noise: &Tensor,
    pixel: &Tensor,
    segmentation: &Tensor,
    segmentation_weight: f64,
) -> Result<Tensor, TrainingError> {
    let weighted = segmentation
        .affine(segmentation_weight, 0.0)
        .map_err(to_runtime_error)?;
    (noise + pixel)
        .and_then(|sum| sum + weighted)
        .map_err(to_runtime_error)
}

/// Mean per-pixel cross entropy of `(n, classes, h, w)` logits. `targets` may be
/// `(n, h, w)` or any shape holding `n * h * w` class ids.
pub fn pixel_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let (n, classes, h, w) = logits.dims4().map_err(to_runtime_error)?;
    if classes == 0 {
        return Err(TrainingError::runtime(
            "segmentation logits must carry at least one class",
        ));
    }
    let pixel_count = n * h * w;
    if targets.elem_count() != pixel_count {
        return Err(TrainingError::runtime(format!(
            "{} class ids for {} predicted pixels",
            targets.elem_count(),
            pixel_count
        )));
    }
    if pixel_count == 0 {
        return Err(TrainingError::runtime(
            "no pixels available for loss computation",
        ));
    }

    let logits_flat = logits
        .to_dtype(DType::F32)
        .and_then(|t| t.permute((0, 2, 3, 1)))
        .and_then(|t| t.contiguous())
        .and_then(|t| t.reshape((pixel_count, classes)))
        .map_err(to_runtime_error)?;
    let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

    let targets_flat = targets
        .to_device(logits.device())
        .and_then(|t| t.reshape((pixel_count,)))
        .map_err(to_runtime_error)?;
    let targets_flat = match targets_flat.dtype() {
        DType::U32 => targets_flat,
        DType::I64 | DType::U8 => targets_flat
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?,
        dtype => {
            return Err(TrainingError::runtime(format!(
                "unsupported target dtype {:?} for cross entropy",
                dtype
            )))
        }
    };

    log_probs
        .gather(&targets_flat.unsqueeze(1).map_err(to_runtime_error)?, 1)
        .and_then(|t| t.neg())
        .and_then(|t| t.mean_all())
        .map_err(to_runtime_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use diffusion::{DdpmConfig, DdpmSchedule};

    fn scalar(t: &Tensor) -> f32 {
        t.to_vec0::<f32>().unwrap()
    }

    #[test]
    fn uniform_total_is_sum_with_small_segmentation_weight() {
        let device = Device::Cpu;
        let a = Tensor::new(0.25f32, &device).unwrap();
        let b = Tensor::new(0.5f32, &device).unwrap();
        let c = Tensor::new(3.0f32, &device).unwrap();
        let total = combine_uniform(&a, &b, &c, 0.001).unwrap();
        assert!((scalar(&total) - 0.753).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_of_confident_correct_logits_is_small() {
        let device = Device::Cpu;
        // two pixels, three classes; pixel 0 -> class 2, pixel 1 -> class 0
        let logits = Tensor::from_vec(vec![-9f32, 9.0, -9.0, -9.0, 9.0, -9.0], (1, 3, 1, 2), &device)
            .unwrap();
        let targets = Tensor::from_slice(&[2u32, 0], (1, 1, 2), &device).unwrap();
        let loss = pixel_cross_entropy(&logits, &targets).unwrap();
        assert!(scalar(&loss) < 1e-3);
    }

    #[test]
    fn uninformative_logits_cost_log_of_class_count() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 1, 2), DType::F32, &device).unwrap();
        let targets = Tensor::from_slice(&[1u32, 0], (1, 1, 2), &device).unwrap();
        let loss = pixel_cross_entropy(&logits, &targets).unwrap();
        assert!((scalar(&loss) - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn snr_mode_ignores_reconstruction() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let composer = LossComposer::new(LossMode::SnrWeighted { gamma: 5.0 }, 1000.0);
        assert!(!composer.needs_reconstruction());

        let pred = Tensor::ones((2, 1, 2, 2), DType::F32, &device).unwrap();
        let target = Tensor::zeros((2, 1, 2, 2), DType::F32, &device).unwrap();
        // both timesteps are late enough that snr < gamma, so every weight is 1
        let timesteps = Tensor::new(&[600u32, 900], &device).unwrap();
        let terms = composer
            .compose(
                &schedule,
                &LossInputs {
                    model_pred: &pred,
                    target: &target,
                    timesteps: &timesteps,
                    reconstruction: None,
                },
            )
            .unwrap();
        assert!((scalar(&terms.total) - 1.0).abs() < 1e-6);
        assert!(terms.pixel.is_none());
        assert!(terms.segmentation.is_none());
    }

    #[test]
    fn uniform_mode_l1_noise_and_pixel_terms() {
        let device = Device::Cpu;
        let schedule = DdpmSchedule::new(DdpmConfig::default(), &device).unwrap();
        let composer = LossComposer::new(
            LossMode::Uniform {
                noise_loss: NoiseLossKind::L1,
                segmentation_weight: 0.001,
            },
            1000.0,
        );
        let pred = Tensor::full(2f32, (1, 1, 1, 2), &device).unwrap();
        let target = Tensor::zeros((1, 1, 1, 2), DType::F32, &device).unwrap();
        let timesteps = Tensor::new(&[10u32], &device).unwrap();
        let estimate = Tensor::full(500f32, (1, 1, 1, 2), &device).unwrap();
        let raw = Tensor::zeros((1, 1, 1, 2), DType::F32, &device).unwrap();
        let logits = Tensor::zeros((1, 2, 1, 2), DType::F32, &device).unwrap();
        let masks = Tensor::zeros((1, 1, 1, 2), DType::U32, &device).unwrap();

        let terms = composer
            .compose(
                &schedule,
                &LossInputs {
                    model_pred: &pred,
                    target: &target,
                    timesteps: &timesteps,
                    reconstruction: Some(ReconstructionInputs {
                        rescaled_estimate: &estimate,
                        raw_images: &raw,
                        segmentation_logits: &logits,
                        masks: &masks,
                    }),
                },
            )
            .unwrap();
        assert!((scalar(&terms.noise) - 2.0).abs() < 1e-6);
        assert!((scalar(terms.pixel.as_ref().unwrap()) - 0.5).abs() < 1e-6);
        let expected = 2.0 + 0.5 + 0.001 * std::f32::consts::LN_2;
        assert!((scalar(&terms.total) - expected).abs() < 1e-5);
    }
}
