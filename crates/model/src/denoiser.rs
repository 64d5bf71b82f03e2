use std::path::Path;

use candle_core::{safetensors, DType, Device, Error, Module, Result, Tensor, Var, D};
use candle_nn::{
    conv2d, group_norm, linear, Conv2d, Conv2dConfig, GroupNorm, Linear, VarBuilder, VarMap,
};
use tracing::info;

use crate::{config::DenoiserConfig, contracts::Denoiser};

struct ResidualBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    emb_proj: Linear,
    norm2: GroupNorm,
    conv2: Conv2d,
}

impl ResidualBlock {
    fn new(config: &DenoiserConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_channels;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            norm1: group_norm(config.norm_groups, hidden, 1e-5, vb.pp("norm1"))?,
            conv1: conv2d(hidden, hidden, 3, same, vb.pp("conv1"))?,
            emb_proj: linear(hidden, hidden, vb.pp("emb_proj"))?,
            norm2: group_norm(config.norm_groups, hidden, 1e-5, vb.pp("norm2"))?,
            conv2: conv2d(hidden, hidden, 3, same, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, emb: &Tensor) -> Result<Tensor> {
        let residual = self.conv1.forward(&self.norm1.forward(xs)?.silu()?)?;
        let emb = self.emb_proj.forward(&emb.silu()?)?.unsqueeze(2)?.unsqueeze(3)?;
        let residual = residual.broadcast_add(&emb)?;
        let residual = self.conv2.forward(&self.norm2.forward(&residual)?.silu()?)?;
        xs + residual
    }
}

/// Timestep- and text-conditioned residual convolution network.
///
/// The input is the noisy latent concatenated with the conditioning latent along the
/// channel axis. Text conditioning is mean-pooled over the sequence and added to the
/// timestep embedding.
pub struct ConditionalDenoiser {
    config: DenoiserConfig,
    varmap: VarMap,
    conv_in: Conv2d,
    time_proj: Linear,
    time_mlp: Linear,
    context_proj: Linear,
    blocks: Vec<ResidualBlock>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl ConditionalDenoiser {
    /// Builds fresh fp32 weights owned by an internal [`VarMap`].
    pub fn new(config: DenoiserConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let hidden = config.hidden_channels;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv_in = conv2d(config.input_channels(), hidden, 3, same, vb.pp("conv_in"))?;
        let time_proj = linear(config.time_embedding_dim, hidden, vb.pp("time_embedding.linear_1"))?;
        let time_mlp = linear(hidden, hidden, vb.pp("time_embedding.linear_2"))?;
        let context_proj = linear(config.context_dim, hidden, vb.pp("context_proj"))?;
        let mut blocks = Vec::with_capacity(config.num_blocks);
        for idx in 0..config.num_blocks {
            blocks.push(ResidualBlock::new(&config, vb.pp(format!("blocks.{idx}")))?);
        }
        let norm_out = group_norm(config.norm_groups, hidden, 1e-5, vb.pp("norm_out"))?;
        let conv_out = conv2d(hidden, config.latent_channels, 3, same, vb.pp("conv_out"))?;

        let denoiser = Self {
            config,
            varmap,
            conv_in,
            time_proj,
            time_mlp,
            context_proj,
            blocks,
            norm_out,
            conv_out,
        };
        if denoiser.config.zero_init_condition && denoiser.config.condition_channels > 0 {
            denoiser.zero_condition_channels()?;
        }
        Ok(denoiser)
    }

    /// Builds the network and overwrites every variable from a safetensors file.
    ///
    /// A `conv_in.weight` that only covers the latent channels is widened with zero
    /// kernels for the conditioning channels.
    pub fn from_pretrained(config: DenoiserConfig, path: &Path, device: &Device) -> Result<Self> {
        let denoiser = Self::new(config, device)?;
        denoiser.load_base_weights(path)?;
        Ok(denoiser)
    }

    pub fn config(&self) -> &DenoiserConfig {
        &self.config
    }

    pub fn load_base_weights(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "loading denoiser weights");
        let mut tensors = safetensors::load(path, &Device::Cpu)?;
        for (name, var) in self.parameters() {
            let stored = tensors
                .remove(&name)
                .ok_or_else(|| Error::Msg(format!("weights file is missing '{name}'")))?;
            let current = var.as_tensor();
            let stored = stored.to_device(current.device())?.to_dtype(current.dtype())?;
            let stored = if name == "conv_in.weight" && stored.dims() != current.dims() {
                self.widen_input_kernel(&stored, current.dims())?
            } else {
                stored
            };
            var.set(&stored)?;
        }
        if !tensors.is_empty() {
            let mut extra: Vec<String> = tensors.into_keys().collect();
            extra.sort();
            return Err(Error::Msg(format!(
                "weights file has unused tensors: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    fn widen_input_kernel(&self, stored: &Tensor, target: &[usize]) -> Result<Tensor> {
        let (out_channels, in_channels, kh, kw) = stored.dims4()?;
        if in_channels != self.config.latent_channels
            || target != [out_channels, self.config.input_channels(), kh, kw]
        {
            return Err(Error::Msg(format!(
                "conv_in.weight {:?} cannot be widened to {target:?}",
                stored.dims()
            )));
        }
        info!(
            from = in_channels,
            to = self.config.input_channels(),
            "widening conv_in with zeroed conditioning kernels"
        );
        let zeros = Tensor::zeros(
            (out_channels, self.config.condition_channels, kh, kw),
            stored.dtype(),
            stored.device(),
        )?;
        Tensor::cat(&[stored, &zeros], 1)
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)
    }

    /// Zeroes the `conv_in` kernels that read the conditioning channels so the
    /// network starts out ignoring the condition.
    pub fn zero_condition_channels(&self) -> Result<()> {
        let weight = self
            .parameters()
            .into_iter()
            .find(|(name, _)| name == "conv_in.weight")
            .map(|(_, var)| var)
            .ok_or_else(|| Error::Msg("conv_in.weight is not registered".into()))?;
        let current = weight.as_tensor();
        let (out_channels, _, kh, kw) = current.dims4()?;
        let latent = current.narrow(1, 0, self.config.latent_channels)?;
        let zeros = Tensor::zeros(
            (out_channels, self.config.condition_channels, kh, kw),
            current.dtype(),
            current.device(),
        )?;
        weight.set(&Tensor::cat(&[&latent, &zeros], 1)?)
    }

    fn embed(&self, timesteps: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor> {
        let temb = timestep_embedding(timesteps, self.config.time_embedding_dim)?;
        let temb = self.time_mlp.forward(&self.time_proj.forward(&temb)?.silu()?)?;
        let context = encoder_hidden_states.to_dtype(DType::F32)?.mean(1)?;
        let context = self.context_proj.forward(&context)?;
        temb + context
    }
}

impl Denoiser for ConditionalDenoiser {
    fn forward(
        &self,
        latents: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
    ) -> Result<Tensor> {
        let channels = latents.dim(1)?;
        if channels != self.config.input_channels() {
            return Err(Error::Msg(format!(
                "denoiser expects {} input channels, got {channels}",
                self.config.input_channels()
            )));
        }
        let emb = self.embed(timesteps, encoder_hidden_states)?;
        let mut hidden = self.conv_in.forward(&latents.to_dtype(DType::F32)?)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &emb)?;
        }
        let hidden = self.norm_out.forward(&hidden)?.silu()?;
        self.conv_out.forward(&hidden)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }
}

/// Sinusoidal embedding, cosine half first. `timesteps` is `(batch,)`.
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let device = timesteps.device();
    let exponent: Vec<f32> = (0..half)
        .map(|i| (-(10000f64.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::from_vec(exponent, (1, half), device)?;
    let args = timesteps
        .to_dtype(DType::F32)?
        .unsqueeze(D::Minus1)?
        .broadcast_mul(&freqs)?;
    Tensor::cat(&[&args.cos()?, &args.sin()?], D::Minus1)
}
