//! Read-only capability objects around the frozen collaborator networks.
//!
//! Each wrapper snapshots its configuration when it is built. The only mutation
//! allowed afterwards is [`FrozenAutoencoder::recalibrate_scaling_factor`], which
//! logs the old and new values.

use std::sync::Arc;

use candle_core::{DType, Error, Result, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::contracts::{Autoencoder, SegmentationNetwork, TextEncoder};

#[derive(Clone)]
pub struct FrozenAutoencoder {
    inner: Arc<dyn Autoencoder>,
    scaling_factor: f64,
    dtype: DType,
}

impl FrozenAutoencoder {
    pub fn new(inner: Arc<dyn Autoencoder>, dtype: DType) -> Self {
        let scaling_factor = inner.scaling_factor();
        Self {
            inner,
            scaling_factor,
            dtype,
        }
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn latent_channels(&self) -> usize {
        self.inner.latent_channels()
    }

    /// Samples the posterior and scales it: `encode(x).sample() * s`. The result is
    /// detached and returned in `f32`.
    pub fn encode_latents(&self, pixels: &Tensor) -> Result<Tensor> {
        let distribution = self.inner.encode(&pixels.to_dtype(self.dtype)?)?;
        distribution
            .sample()?
            .affine(self.scaling_factor, 0.0)?
            .to_dtype(DType::F32)
            .map(|t| t.detach())
    }

    /// Undoes the latent scaling and decodes. Gradients flow through to `latents`.
    pub fn decode_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let unscaled = latents.affine(1.0 / self.scaling_factor, 0.0)?;
        self.inner
            .decode(&unscaled.to_dtype(self.dtype)?)?
            .to_dtype(DType::F32)
    }

    pub fn recalibrate_scaling_factor(&mut self, scaling_factor: f64, reason: &str) -> Result<()> {
        if !(scaling_factor.is_finite() && scaling_factor > 0.0) {
            return Err(Error::Msg(format!(
                "scaling factor must be finite and positive, got {scaling_factor}"
            )));
        }
        info!(
            from = self.scaling_factor,
            to = scaling_factor,
            reason,
            "recalibrating latent scaling factor"
        );
        self.scaling_factor = scaling_factor;
        Ok(())
    }
}

#[derive(Clone)]
pub struct FrozenTextEncoder {
    inner: Arc<dyn TextEncoder>,
}

impl FrozenTextEncoder {
    pub fn new(inner: Arc<dyn TextEncoder>) -> Self {
        Self { inner }
    }

    pub fn encode(&self, token_ids: &Tensor) -> Result<Tensor> {
        Ok(self.inner.encode(token_ids)?.detach())
    }
}

/// Intensity window applied to slices before segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityNormalization {
    pub lower: f64,
    pub upper: f64,
    pub mean: f64,
    pub std: f64,
}

impl IntensityNormalization {
    pub fn validate(&self) -> Result<()> {
        if self.lower > self.upper {
            return Err(Error::Msg(format!(
                "intensity window lower bound {} exceeds upper bound {}",
                self.lower, self.upper
            )));
        }
        if !(self.std.is_finite() && self.std > 0.0) {
            return Err(Error::Msg("intensity std must be finite and positive".into()));
        }
        Ok(())
    }

    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        xs.clamp(self.lower, self.upper)?
            .affine(1.0 / self.std, -self.mean / self.std)
    }
}

#[derive(Clone)]
pub struct FrozenSegmenter {
    inner: Arc<dyn SegmentationNetwork>,
    pixel_scale: f64,
    normalization: Option<IntensityNormalization>,
    dtype: DType,
}

impl FrozenSegmenter {
    pub fn new(
        inner: Arc<dyn SegmentationNetwork>,
        pixel_scale: f64,
        normalization: Option<IntensityNormalization>,
        dtype: DType,
    ) -> Result<Self> {
        if let Some(window) = &normalization {
            window.validate()?;
        }
        Ok(Self {
            inner,
            pixel_scale,
            normalization,
            dtype,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    pub fn pixel_scale(&self) -> f64 {
        self.pixel_scale
    }

    /// Maps decoder output into the segmenter's intensity range:
    /// `clamp(x, -1, 1) * pixel_scale`.
    pub fn rescale(&self, decoded: &Tensor) -> Result<Tensor> {
        decoded.clamp(-1.0f32, 1.0f32)?.affine(self.pixel_scale, 0.0)
    }

    /// Segments every channel of `(b, c, h, w)` rescaled pixels as its own slice and
    /// returns `(b * c, num_classes, h, w)` logits in `f32`.
    pub fn segment_pixels(&self, rescaled: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = rescaled.dims4()?;
        let mut slices = rescaled.reshape((b * c, 1, h, w))?;
        if let Some(window) = &self.normalization {
            slices = window.apply(&slices)?;
        }
        self.inner
            .forward(&slices.to_dtype(self.dtype)?)?
            .to_dtype(DType::F32)
    }

    /// Per-pixel argmax of `segment_pixels` logits folded back to `(b, c, h, w)`.
    pub fn predict_classes(&self, logits: &Tensor, batch: usize, channels: usize) -> Result<Tensor> {
        let (n, _, h, w) = logits.dims4()?;
        if n != batch * channels {
            return Err(Error::Msg(format!(
                "expected {} slices, got {n}",
                batch * channels
            )));
        }
        logits.argmax(1)?.reshape((batch, channels, h, w))
    }
}
