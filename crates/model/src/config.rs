use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Convolutional VAE geometry. Spatial size shrinks by `2^downsample_layers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    pub in_channels: usize,
    pub latent_channels: usize,
    pub hidden_channels: usize,
    pub downsample_layers: usize,
    pub scaling_factor: f64,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            latent_channels: 4,
            hidden_channels: 32,
            downsample_layers: 2,
            scaling_factor: 0.18215,
        }
    }
}

impl AutoencoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.latent_channels == 0 {
            return Err(Error::Msg("latent_channels must be greater than zero".into()));
        }
        if self.hidden_channels == 0 {
            return Err(Error::Msg("hidden_channels must be greater than zero".into()));
        }
        if !(self.scaling_factor.is_finite() && self.scaling_factor > 0.0) {
            return Err(Error::Msg(format!(
                "scaling_factor must be finite and positive, got {}",
                self.scaling_factor
            )));
        }
        Ok(())
    }

    pub fn downsample_factor(&self) -> usize {
        1 << self.downsample_layers
    }
}

/// Trainable denoiser. The input convolution reads
/// `latent_channels + condition_channels` channels and the output has
/// `latent_channels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiserConfig {
    pub latent_channels: usize,
    pub condition_channels: usize,
    pub hidden_channels: usize,
    pub num_blocks: usize,
    pub norm_groups: usize,
    pub time_embedding_dim: usize,
    pub context_dim: usize,
    pub zero_init_condition: bool,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            condition_channels: 4,
            hidden_channels: 64,
            num_blocks: 2,
            norm_groups: 8,
            time_embedding_dim: 128,
            context_dim: 32,
            zero_init_condition: true,
        }
    }
}

impl DenoiserConfig {
    pub fn validate(&self) -> Result<()> {
        if self.latent_channels == 0 {
            return Err(Error::Msg("latent_channels must be greater than zero".into()));
        }
        if self.hidden_channels == 0 || self.num_blocks == 0 {
            return Err(Error::Msg(
                "hidden_channels and num_blocks must be greater than zero".into(),
            ));
        }
        if self.norm_groups == 0 || self.hidden_channels % self.norm_groups != 0 {
            return Err(Error::Msg(format!(
                "hidden_channels ({}) must be divisible by norm_groups ({})",
                self.hidden_channels, self.norm_groups
            )));
        }
        if self.time_embedding_dim == 0 || self.time_embedding_dim % 2 != 0 {
            return Err(Error::Msg("time_embedding_dim must be even and non-zero".into()));
        }
        if self.context_dim == 0 {
            return Err(Error::Msg("context_dim must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn input_channels(&self) -> usize {
        self.latent_channels + self.condition_channels
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub hidden_channels: usize,
    pub num_layers: usize,
    pub num_classes: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 16,
            num_layers: 3,
            num_classes: 14,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_channels == 0 || self.num_layers == 0 {
            return Err(Error::Msg(
                "segmenter hidden_channels and num_layers must be greater than zero".into(),
            ));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg("segmenter needs at least two classes".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextEncoderConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub max_length: usize,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 1024,
            hidden_dim: 32,
            max_length: 77,
        }
    }
}

impl TextEncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_dim == 0 || self.max_length == 0 {
            return Err(Error::Msg(
                "text encoder vocab_size, hidden_dim and max_length must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
