//! Construction of the networks and datasets a run needs, from configuration.

use std::{path::PathBuf, sync::Arc};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use model::{
    frozen_var_builder, ConditionalDenoiser, ConvAutoencoder, ConvSegmenter, Denoiser,
    DenoiserConfig, EmbeddingTextEncoder, FrozenAutoencoder, FrozenSegmenter, FrozenTextEncoder,
};
use tracing::{info, warn};

use crate::{
    config::{DeviceKind, TrainingConfig},
    data::SliceDataset,
    TrainingError,
};

/// Rebuilds the trainable denoiser from its base definition. Used at start-up and
/// when a checkpoint's weights do not fit the configured network.
pub type DenoiserFactory =
    Arc<dyn Fn(&Device) -> candle_core::Result<Box<dyn Denoiser>> + Send + Sync>;

pub struct TrainingComponents {
    pub autoencoder: FrozenAutoencoder,
    pub text_encoder: FrozenTextEncoder,
    pub segmenter: FrozenSegmenter,
    pub denoiser: Box<dyn Denoiser>,
    pub denoiser_factory: DenoiserFactory,
    pub train_data: SliceDataset,
    pub validation_data: Option<SliceDataset>,
}

pub fn select_device(kind: DeviceKind) -> Result<Device, TrainingError> {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    info!(cuda_available, metal_available, requested = ?kind, "device detection");

    let device = match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => {
            if !cuda_available {
                return Err(TrainingError::resource(
                    "CUDA was requested but this build has no CUDA support",
                ));
            }
            Device::new_cuda(0).map_err(|err| {
                TrainingError::resource(format!("failed to initialise CUDA device 0: {err}"))
            })?
        }
        DeviceKind::Metal => {
            if !metal_available {
                return Err(TrainingError::resource(
                    "Metal was requested but this build has no Metal support",
                ));
            }
            Device::new_metal(0).map_err(|err| {
                TrainingError::resource(format!("failed to initialise Metal device 0: {err}"))
            })?
        }
        DeviceKind::Auto => {
            if metal_available {
                match Device::new_metal(0) {
                    Ok(device) => device,
                    Err(err) => {
                        warn!(%err, "failed to initialise Metal, falling back to CPU");
                        Device::Cpu
                    }
                }
            } else if cuda_available {
                match Device::new_cuda(0) {
                    Ok(device) => device,
                    Err(err) => {
                        warn!(%err, "CUDA reported available but initialisation failed");
                        Device::Cpu
                    }
                }
            } else {
                Device::Cpu
            }
        }
    };

    info!(
        is_cuda = device.is_cuda(),
        is_metal = device.is_metal(),
        is_cpu = device.is_cpu(),
        "device selected"
    );
    Ok(device)
}

/// The configured denoiser: base weights when a file is given, otherwise a fresh
/// initialisation from the device RNG.
pub fn denoiser_factory(config: DenoiserConfig, weights: Option<PathBuf>) -> DenoiserFactory {
    Arc::new(move |device: &Device| {
        let denoiser = match &weights {
            Some(path) => ConditionalDenoiser::from_pretrained(config.clone(), path, device)?,
            None => ConditionalDenoiser::new(config.clone(), device)?,
        };
        Ok(Box::new(denoiser) as Box<dyn Denoiser>)
    })
}

pub fn build_components(
    config: &TrainingConfig,
    device: &Device,
) -> Result<TrainingComponents, TrainingError> {
    let dtype = config.runtime.precision.weight_dtype();
    let models = &config.model;

    let autoencoder = {
        let vb = frozen_var_builder(
            "autoencoder",
            models.autoencoder_weights.as_deref(),
            dtype,
            device,
        )
        .map_err(init_error("autoencoder"))?;
        let network = ConvAutoencoder::new(models.autoencoder.clone(), vb)
            .map_err(init_error("autoencoder"))?;
        FrozenAutoencoder::new(Arc::new(network), dtype)
    };

    let text_encoder = {
        let vb = frozen_var_builder(
            "text_encoder",
            models.text_encoder_weights.as_deref(),
            dtype,
            device,
        )
        .map_err(init_error("text encoder"))?;
        let network = EmbeddingTextEncoder::new(models.text_encoder.clone(), vb)
            .map_err(init_error("text encoder"))?;
        FrozenTextEncoder::new(Arc::new(network))
    };

    let segmenter = {
        let vb = frozen_var_builder(
            "segmenter",
            models.segmenter_weights.as_deref(),
            dtype,
            device,
        )
        .map_err(init_error("segmenter"))?;
        let network = ConvSegmenter::new(models.segmenter.clone(), vb)
            .map_err(init_error("segmenter"))?;
        FrozenSegmenter::new(
            Arc::new(network),
            config.loss.pixel_scale,
            config.loss.segmentation_normalization,
            dtype,
        )
        .map_err(init_error("segmenter"))?
    };

    let factory = denoiser_factory(models.denoiser.clone(), models.denoiser_weights.clone());
    let denoiser = factory(device).map_err(init_error("denoiser"))?;

    let train_data = SliceDataset::from_safetensors(&config.data.train_path, device)?;
    let validation_data = match &config.data.validation_path {
        Some(path) => Some(SliceDataset::from_safetensors(path, device)?),
        None => None,
    };
    info!(
        train_slices = train_data.len(),
        validation_slices = validation_data.as_ref().map_or(0, SliceDataset::len),
        "components ready"
    );

    Ok(TrainingComponents {
        autoencoder,
        text_encoder,
        segmenter,
        denoiser,
        denoiser_factory: factory,
        train_data,
        validation_data,
    })
}

fn init_error(network: &'static str) -> impl Fn(candle_core::Error) -> TrainingError {
    move |err| TrainingError::initialization(format!("failed to build {network}: {err}"))
}
