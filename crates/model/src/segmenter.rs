use candle_core::{Error, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::{config::SegmenterConfig, contracts::SegmentationNetwork};

/// Fully convolutional per-pixel classifier over single-channel slices.
pub struct ConvSegmenter {
    config: SegmenterConfig,
    layers: Vec<Conv2d>,
    head: Conv2d,
}

impl ConvSegmenter {
    pub fn new(config: SegmenterConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut layers = Vec::with_capacity(config.num_layers);
        for idx in 0..config.num_layers {
            let in_channels = if idx == 0 { 1 } else { config.hidden_channels };
            layers.push(conv2d(
                in_channels,
                config.hidden_channels,
                3,
                same,
                vb.pp(format!("layers.{idx}")),
            )?);
        }
        let head = conv2d(
            config.hidden_channels,
            config.num_classes,
            1,
            Default::default(),
            vb.pp("head"),
        )?;
        Ok(Self {
            config,
            layers,
            head,
        })
    }
}

impl SegmentationNetwork for ConvSegmenter {
    fn forward(&self, slices: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = slices.dims4()?;
        if channels != 1 {
            return Err(Error::Msg(format!(
                "segmenter expects single-channel slices, got {channels} channels"
            )));
        }
        let mut hidden = slices.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?.silu()?;
        }
        self.head.forward(&hidden)
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}
