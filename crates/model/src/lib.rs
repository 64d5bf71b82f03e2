pub mod autoencoder;
pub mod config;
pub mod contracts;
pub mod denoiser;
pub mod frozen;
pub mod segmenter;
pub mod text;
pub mod weights;

pub use autoencoder::ConvAutoencoder;
pub use config::{AutoencoderConfig, DenoiserConfig, SegmenterConfig, TextEncoderConfig};
pub use contracts::{
    Autoencoder, Denoiser, LatentDistribution, SegmentationNetwork, TextEncoder,
};
pub use denoiser::ConditionalDenoiser;
pub use frozen::{FrozenAutoencoder, FrozenSegmenter, FrozenTextEncoder, IntensityNormalization};
pub use segmenter::ConvSegmenter;
pub use text::EmbeddingTextEncoder;
pub use weights::frozen_var_builder;
