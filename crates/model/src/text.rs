use candle_core::{Error, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};

use crate::{config::TextEncoderConfig, contracts::TextEncoder};

/// Token plus learned-position embedding followed by a layer norm.
pub struct EmbeddingTextEncoder {
    config: TextEncoderConfig,
    token_embedding: Embedding,
    position_embedding: Embedding,
    final_norm: LayerNorm,
}

impl EmbeddingTextEncoder {
    pub fn new(config: TextEncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let token_embedding = embedding(config.vocab_size, config.hidden_dim, vb.pp("token_embedding"))?;
        let position_embedding =
            embedding(config.max_length, config.hidden_dim, vb.pp("position_embedding"))?;
        let final_norm = layer_norm(config.hidden_dim, 1e-5, vb.pp("final_layer_norm"))?;
        Ok(Self {
            config,
            token_embedding,
            position_embedding,
            final_norm,
        })
    }
}

impl TextEncoder for EmbeddingTextEncoder {
    fn encode(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (_, seq) = token_ids.dims2()?;
        if seq > self.config.max_length {
            return Err(Error::Msg(format!(
                "sequence of {seq} tokens exceeds max_length {}",
                self.config.max_length
            )));
        }
        let positions = Tensor::arange(0u32, seq as u32, token_ids.device())?;
        let tokens = self.token_embedding.forward(token_ids)?;
        let positions = self.position_embedding.forward(&positions)?.unsqueeze(0)?;
        self.final_norm.forward(&tokens.broadcast_add(&positions)?)
    }
}
