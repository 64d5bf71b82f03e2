#![allow(dead_code)]

use std::{path::Path, sync::Arc};

use candle_core::{DType, Device, Result, Tensor, Var};
use model::{
    Autoencoder, Denoiser, FrozenAutoencoder, FrozenSegmenter, FrozenTextEncoder,
    LatentDistribution, SegmentationNetwork, TextEncoder,
};
use training::{
    components::DenoiserFactory, DataBatch, SliceDataset, TrainingComponents, TrainingConfig,
};

pub const CHANNELS: usize = 1;
pub const SIZE: usize = 4;
pub const PROMPT: usize = 3;
pub const HIDDEN: usize = 4;

/// Latents are the pixels themselves with a vanishing posterior variance.
pub struct IdentityAutoencoder;

impl Autoencoder for IdentityAutoencoder {
    fn encode(&self, pixels: &Tensor) -> Result<LatentDistribution> {
        let logvar = Tensor::full(-30f32, pixels.dims(), pixels.device())?;
        LatentDistribution::new(pixels.clone(), logvar)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(latents.clone())
    }

    fn scaling_factor(&self) -> f64 {
        1.0
    }

    fn latent_channels(&self) -> usize {
        CHANNELS
    }
}

pub struct ZeroTextEncoder;

impl TextEncoder for ZeroTextEncoder {
    fn encode(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = token_ids.dims2()?;
        Tensor::zeros((batch, seq, HIDDEN), DType::F32, token_ids.device())
    }
}

/// Two classes scored as `x` and `-x`.
pub struct SignSegmenter;

impl SegmentationNetwork for SignSegmenter {
    fn forward(&self, slices: &Tensor) -> Result<Tensor> {
        Tensor::cat(&[slices, &slices.neg()?], 1)
    }

    fn num_classes(&self) -> usize {
        2
    }
}

/// `gain * noisy + shift`, reading only the noisy half of the input channels.
pub struct AffineDenoiser {
    names: [&'static str; 2],
    gain: Var,
    shift: Var,
}

impl AffineDenoiser {
    pub fn new(device: &Device) -> Result<Self> {
        Self::named(["gain", "shift"], device)
    }

    pub fn named(names: [&'static str; 2], device: &Device) -> Result<Self> {
        Ok(Self {
            names,
            gain: Var::ones(1, DType::F32, device)?,
            shift: Var::zeros(1, DType::F32, device)?,
        })
    }
}

impl Denoiser for AffineDenoiser {
    fn forward(&self, latents: &Tensor, _timesteps: &Tensor, _context: &Tensor) -> Result<Tensor> {
        latents
            .narrow(1, 0, CHANNELS)?
            .broadcast_mul(self.gain.as_tensor())?
            .broadcast_add(self.shift.as_tensor())
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let mut params = vec![
            (self.names[0].to_string(), self.gain.clone()),
            (self.names[1].to_string(), self.shift.clone()),
        ];
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }
}

pub fn factory(names: [&'static str; 2]) -> DenoiserFactory {
    Arc::new(move |device: &Device| {
        Ok(Box::new(AffineDenoiser::named(names, device)?) as Box<dyn Denoiser>)
    })
}

pub fn zero_dataset(n: usize, device: &Device) -> anyhow::Result<SliceDataset> {
    let images = Tensor::zeros((n, CHANNELS, SIZE, SIZE), DType::F32, device)?;
    let masks = Tensor::zeros((n, CHANNELS, SIZE, SIZE), DType::U32, device)?;
    let ids = Tensor::zeros((n, PROMPT), DType::U32, device)?;
    Ok(SliceDataset::new(images.clone(), images, masks, ids)?)
}

pub fn random_dataset(n: usize, device: &Device) -> anyhow::Result<SliceDataset> {
    let images = Tensor::rand(-1f32, 1f32, (n, CHANNELS, SIZE, SIZE), device)?;
    let conditions = images.affine(0.5, 0.0)?;
    let masks = images.ge(0f32)?.to_dtype(DType::U32)?;
    let ids = Tensor::zeros((n, PROMPT), DType::U32, device)?;
    Ok(SliceDataset::new(images, conditions, masks, ids)?)
}

pub fn components(
    train_data: SliceDataset,
    validation_data: Option<SliceDataset>,
    names: [&'static str; 2],
    device: &Device,
) -> anyhow::Result<TrainingComponents> {
    let denoiser_factory = factory(names);
    let denoiser = denoiser_factory(device)?;
    Ok(TrainingComponents {
        autoencoder: FrozenAutoencoder::new(Arc::new(IdentityAutoencoder), DType::F32),
        text_encoder: FrozenTextEncoder::new(Arc::new(ZeroTextEncoder)),
        segmenter: FrozenSegmenter::new(Arc::new(SignSegmenter), 1000.0, None, DType::F32)?,
        denoiser,
        denoiser_factory,
        train_data,
        validation_data,
    })
}

pub fn config(output_dir: &Path) -> anyhow::Result<TrainingConfig> {
    let mut config: TrainingConfig = toml::from_str(
        r#"
        [data]
        train_path = "unused.safetensors"
        batch_size = 2
        shuffle = false

        [scheduler]
        strategy = "constant"
        warmup_steps = 0

        [runtime]
        device = "cpu"
        checkpointing_steps = 1000
        log_every_n_steps = 1

        [runtime.logging]
        enable_stdout = false
        "#,
    )?;
    config.runtime.output_dir = output_dir.to_path_buf();
    config.optimizer.learning_rate = 1e-2;
    Ok(config)
}

pub fn zero_batch(device: &Device) -> anyhow::Result<DataBatch> {
    let images = Tensor::zeros((2, CHANNELS, SIZE, SIZE), DType::F32, device)?;
    Ok(DataBatch {
        conditions: images.clone(),
        images,
        masks: Tensor::zeros((2, CHANNELS, SIZE, SIZE), DType::U32, device)?,
        input_ids: Tensor::zeros((2, PROMPT), DType::U32, device)?,
        micro_batch_size: 2,
        micro_batch_index: 0,
        micro_batches_per_step: 1,
        ends_accumulation: true,
        epoch: 0,
    })
}

pub fn values(var: &Var) -> anyhow::Result<Vec<f32>> {
    Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?)
}
