use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::{
    config::AutoencoderConfig,
    contracts::{Autoencoder, LatentDistribution},
};

/// Small strided-convolution VAE.
///
/// Encoder: `conv_in -> [silu, stride-2 conv] x downsample_layers -> quant_conv`,
/// producing `2 * latent_channels` moments. The decoder mirrors it with
/// nearest-neighbour upsampling.
pub struct ConvAutoencoder {
    config: AutoencoderConfig,
    conv_in: Conv2d,
    down: Vec<Conv2d>,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    up: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConvAutoencoder {
    pub fn new(config: AutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let strided = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let hidden = config.hidden_channels;

        let conv_in = conv2d(config.in_channels, hidden, 3, same, vb.pp("encoder.conv_in"))?;
        let mut down = Vec::with_capacity(config.downsample_layers);
        for idx in 0..config.downsample_layers {
            down.push(conv2d(hidden, hidden, 3, strided, vb.pp(format!("encoder.down.{idx}")))?);
        }
        let quant_conv = conv2d(
            hidden,
            2 * config.latent_channels,
            1,
            Default::default(),
            vb.pp("quant_conv"),
        )?;
        let post_quant_conv = conv2d(
            config.latent_channels,
            hidden,
            1,
            Default::default(),
            vb.pp("post_quant_conv"),
        )?;
        let mut up = Vec::with_capacity(config.downsample_layers);
        for idx in 0..config.downsample_layers {
            up.push(conv2d(hidden, hidden, 3, same, vb.pp(format!("decoder.up.{idx}")))?);
        }
        let conv_out = conv2d(hidden, config.in_channels, 3, same, vb.pp("decoder.conv_out"))?;

        Ok(Self {
            config,
            conv_in,
            down,
            quant_conv,
            post_quant_conv,
            up,
            conv_out,
        })
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }
}

impl Autoencoder for ConvAutoencoder {
    fn encode(&self, pixels: &Tensor) -> Result<LatentDistribution> {
        let mut hidden = self.conv_in.forward(pixels)?;
        for layer in &self.down {
            hidden = layer.forward(&hidden.silu()?)?;
        }
        let moments = self.quant_conv.forward(&hidden.silu()?)?;
        LatentDistribution::from_moments(&moments)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let mut hidden = self.post_quant_conv.forward(latents)?;
        for layer in &self.up {
            let (_, _, h, w) = hidden.dims4()?;
            hidden = hidden.upsample_nearest2d(h * 2, w * 2)?;
            hidden = layer.forward(&hidden)?.silu()?;
        }
        self.conv_out.forward(&hidden)
    }

    fn scaling_factor(&self) -> f64 {
        self.config.scaling_factor
    }

    fn latent_channels(&self) -> usize {
        self.config.latent_channels
    }
}
