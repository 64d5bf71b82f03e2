//! Interfaces the training loop expects from its collaborators.
//!
//! Everything except [`Denoiser`] is treated as frozen: the trainer never asks those
//! networks for parameters and never routes gradients into their weights.

use candle_core::{Error, Result, Tensor, Var};

/// Diagonal Gaussian posterior returned by an autoencoder's encoder.
#[derive(Debug, Clone)]
pub struct LatentDistribution {
    mean: Tensor,
    logvar: Tensor,
}

impl LatentDistribution {
    pub fn new(mean: Tensor, logvar: Tensor) -> Result<Self> {
        if mean.dims() != logvar.dims() {
            return Err(Error::Msg(format!(
                "mean {:?} and logvar {:?} must share a shape",
                mean.dims(),
                logvar.dims()
            )));
        }
        let logvar = logvar.clamp(-30.0f32, 20.0f32)?;
        Ok(Self { mean, logvar })
    }

    /// Splits `(batch, 2 * C, ...)` moments into mean and log-variance halves.
    pub fn from_moments(moments: &Tensor) -> Result<Self> {
        let channels = moments.dim(1)?;
        if channels % 2 != 0 {
            return Err(Error::Msg(format!(
                "moments need an even channel count, got {channels}"
            )));
        }
        let half = channels / 2;
        let mean = moments.narrow(1, 0, half)?;
        let logvar = moments.narrow(1, half, half)?;
        Self::new(mean, logvar)
    }

    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    pub fn mode(&self) -> &Tensor {
        &self.mean
    }

    pub fn std(&self) -> Result<Tensor> {
        self.logvar.affine(0.5, 0.0)?.exp()
    }

    pub fn sample(&self) -> Result<Tensor> {
        let eps = self.mean.randn_like(0.0, 1.0)?;
        self.mean.add(&self.std()?.mul(&eps)?)
    }
}

pub trait Autoencoder: Send + Sync {
    fn encode(&self, pixels: &Tensor) -> Result<LatentDistribution>;

    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// Constant that maps raw latents to unit-variance training latents.
    fn scaling_factor(&self) -> f64;

    fn latent_channels(&self) -> usize;
}

pub trait TextEncoder: Send + Sync {
    /// `(batch, seq)` token ids to `(batch, seq, hidden)` states.
    fn encode(&self, token_ids: &Tensor) -> Result<Tensor>;
}

pub trait SegmentationNetwork: Send + Sync {
    /// `(n, 1, h, w)` slices to `(n, num_classes, h, w)` logits.
    fn forward(&self, slices: &Tensor) -> Result<Tensor>;

    fn num_classes(&self) -> usize;
}

/// The only trainable network in a run.
pub trait Denoiser: Send {
    /// `latents` already carries the conditioning channels.
    fn forward(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor>;

    /// Named trainable variables, sorted by name.
    fn parameters(&self) -> Vec<(String, Var)>;
}
