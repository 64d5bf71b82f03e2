//! Diffusion process building blocks used by the training loop.
//!
//! The [`NoiseSchedule`] trait is the narrow contract the trainer depends on: a
//! per-timestep `alphas_cumprod` table plus the `add_noise` and `get_velocity`
//! operations. [`DdpmSchedule`] is the stock implementation. The remaining modules
//! are pure tensor transforms on top of that contract.

pub mod dream;
pub mod sampler;
pub mod schedule;
pub mod snr;
pub mod start;

pub use dream::{compute_dream_and_update_latents, DreamAdjustment};
pub use sampler::DdpmSampler;
pub use schedule::{
    sample_timesteps, BetaSchedule, DdpmConfig, DdpmSchedule, NoiseSchedule, PredictionType,
    UnknownPredictionType,
};
pub use snr::{compute_snr, snr_loss_weights};
pub use start::{extract_into_tensor, predict_start_from_noise};
