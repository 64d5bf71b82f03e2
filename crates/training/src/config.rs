use candle_core::DType;
use diffusion::{BetaSchedule, DdpmConfig, PredictionType};
use model::{
    AutoencoderConfig, DenoiserConfig, IntensityNormalization, SegmenterConfig,
    TextEncoderConfig,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    error::TrainingError,
    loss::{LossMode, NoiseLossKind},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub loss: LossConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ema: EmaConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    /// Fatal settings (prediction type, DREAM with velocity targets) fail with a
    /// `Configuration` error straight away; everything else is collected into one
    /// `Validation` error.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let prediction_type = self.diffusion.prediction_type()?;
        if self.diffusion.dream_training && prediction_type == PredictionType::VPrediction {
            return Err(TrainingError::configuration(
                "DREAM training requires the epsilon prediction type",
            ));
        }

        let mut errors = Vec::new();

        let model_checks = [
            ("model.autoencoder", self.model.autoencoder.validate()),
            ("model.text_encoder", self.model.text_encoder.validate()),
            ("model.segmenter", self.model.segmenter.validate()),
            ("model.denoiser", self.model.denoiser.validate()),
        ];
        for (section, result) in model_checks {
            if let Err(err) = result {
                errors.push(format!("{}: {}", section, err));
            }
        }

        if self.model.denoiser.latent_channels != self.model.autoencoder.latent_channels {
            errors.push(format!(
                "model.denoiser.latent_channels ({}) must match model.autoencoder.latent_channels ({})",
                self.model.denoiser.latent_channels, self.model.autoencoder.latent_channels
            ));
        }
        if self.model.denoiser.condition_channels != self.model.autoencoder.latent_channels {
            errors.push(format!(
                "model.denoiser.condition_channels ({}) must match the conditioning latent width ({})",
                self.model.denoiser.condition_channels, self.model.autoencoder.latent_channels
            ));
        }
        if self.model.denoiser.context_dim != self.model.text_encoder.hidden_dim {
            errors.push(format!(
                "model.denoiser.context_dim ({}) must match model.text_encoder.hidden_dim ({})",
                self.model.denoiser.context_dim, self.model.text_encoder.hidden_dim
            ));
        }

        if let Err(err) = self.diffusion.ddpm_config().and_then(|config| {
            config
                .validate()
                .map_err(|err| TrainingError::configuration(err.to_string()))
        }) {
            errors.push(format!("diffusion: {}", err));
        }
        if self.diffusion.noise_offset < 0.0 {
            errors.push("diffusion.noise_offset must be >= 0".to_string());
        }
        if self.diffusion.input_perturbation < 0.0 {
            errors.push("diffusion.input_perturbation must be >= 0".to_string());
        }
        if self.diffusion.dream_detail_preservation <= 0.0 {
            errors.push("diffusion.dream_detail_preservation must be greater than 0".to_string());
        }

        if let Some(gamma) = self.loss.snr_gamma {
            if !(gamma.is_finite() && gamma > 0.0) {
                errors.push("loss.snr_gamma must be finite and greater than 0".to_string());
            }
        }
        if self.loss.segmentation_weight < 0.0 {
            errors.push("loss.segmentation_weight must be >= 0".to_string());
        }
        if self.loss.pixel_scale <= 0.0 {
            errors.push("loss.pixel_scale must be greater than 0".to_string());
        }
        if let Some(window) = &self.loss.segmentation_normalization {
            if let Err(err) = window.validate() {
                errors.push(format!("loss.segmentation_normalization: {}", err));
            }
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if self.data.prompt_length == 0 {
            errors.push("data.prompt_length must be greater than 0".to_string());
        }
        if self.data.prompt_length > self.model.text_encoder.max_length {
            errors.push(format!(
                "data.prompt_length ({}) exceeds model.text_encoder.max_length ({})",
                self.data.prompt_length, self.model.text_encoder.max_length
            ));
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if let Some(max_norm) = self.optimizer.max_grad_norm {
            if !(max_norm.is_finite() && max_norm > 0.0) {
                errors.push("optimizer.max_grad_norm must be finite and greater than 0".to_string());
            }
        }

        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }
        if self.scheduler.power <= 0.0 {
            errors.push("scheduler.power must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.ema.decay) {
            errors.push("ema.decay must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.ema.min_decay) || self.ema.min_decay > self.ema.decay {
            errors.push("ema.min_decay must be in [0, ema.decay]".to_string());
        }
        if self.ema.inv_gamma <= 0.0 {
            errors.push("ema.inv_gamma must be greater than 0".to_string());
        }
        if self.ema.power <= 0.0 {
            errors.push("ema.power must be greater than 0".to_string());
        }

        if let Some(0) = self.runtime.max_train_steps {
            errors.push("runtime.max_train_steps must be greater than 0".to_string());
        }
        if self.runtime.max_train_steps.is_none() && self.runtime.num_train_epochs == 0 {
            errors.push(
                "runtime.num_train_epochs must be greater than 0 when max_train_steps is unset"
                    .to_string(),
            );
        }
        if self.runtime.checkpointing_steps == 0 {
            errors.push("runtime.checkpointing_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.checkpoints_total_limit {
            errors.push("runtime.checkpoints_total_limit must be greater than 0".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if self.runtime.output_dir.as_os_str().is_empty() {
            errors.push("runtime.output_dir must not be empty".to_string());
        }
        if let Some(0) = self.runtime.validation.every_n_steps {
            errors.push("runtime.validation.every_n_steps must be greater than 0".to_string());
        }
        if self.runtime.validation.num_inference_steps == 0
            || self.runtime.validation.num_inference_steps > self.diffusion.num_train_timesteps
        {
            errors.push(format!(
                "runtime.validation.num_inference_steps must be in 1..={}",
                self.diffusion.num_train_timesteps
            ));
        }
        if self.runtime.validation.direct_timestep >= self.diffusion.num_train_timesteps {
            errors.push(format!(
                "runtime.validation.direct_timestep must be below {}",
                self.diffusion.num_train_timesteps
            ));
        }
        if self.runtime.logging.tensorboard_flush_every_n == 0 {
            errors.push("runtime.logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if self.distributed.world_size == 0 {
            errors.push("distributed.world_size must be greater than 0".to_string());
        }
        if self.distributed.rank >= self.distributed.world_size.max(1) {
            errors.push("distributed.rank must be below distributed.world_size".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Checks that every configured input file exists on disk.
    pub fn ensure_prerequisites(&self) -> Result<(), TrainingError> {
        let mut missing = Vec::new();

        if !self.data.train_path.is_file() {
            missing.push(format!("data.train_path ({})", self.data.train_path.display()));
        }
        if let Some(path) = &self.data.validation_path {
            if !path.is_file() {
                missing.push(format!("data.validation_path ({})", path.display()));
            }
        }
        for (label, path) in self.model.weight_paths() {
            if let Some(path) = path {
                if !path.is_file() {
                    missing.push(format!("{} ({})", label, path.display()));
                }
            }
        }

        if !missing.is_empty() {
            return Err(TrainingError::configuration(format!(
                "missing required artifacts: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// `learning_rate`, multiplied by the effective global batch when `scale_lr` is set.
    pub fn effective_learning_rate(&self) -> f64 {
        if self.optimizer.scale_lr {
            self.optimizer.learning_rate
                * (self.data.gradient_accumulation_steps
                    * self.data.batch_size
                    * self.distributed.world_size) as f64
        } else {
            self.optimizer.learning_rate
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.model.apply_base_path(base);
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(default)]
    pub autoencoder: AutoencoderConfig,
    #[serde(default)]
    pub autoencoder_weights: Option<PathBuf>,
    #[serde(default)]
    pub text_encoder: TextEncoderConfig,
    #[serde(default)]
    pub text_encoder_weights: Option<PathBuf>,
    #[serde(default)]
    pub segmenter: SegmenterConfig,
    #[serde(default)]
    pub segmenter_weights: Option<PathBuf>,
    #[serde(default)]
    pub denoiser: DenoiserConfig,
    /// Base denoiser weights. Also used to rebuild the network when a checkpoint
    /// does not fit it.
    #[serde(default)]
    pub denoiser_weights: Option<PathBuf>,
}

impl ModelSection {
    fn weight_paths(&self) -> [(&'static str, Option<&PathBuf>); 4] {
        [
            ("model.autoencoder_weights", self.autoencoder_weights.as_ref()),
            ("model.text_encoder_weights", self.text_encoder_weights.as_ref()),
            ("model.segmenter_weights", self.segmenter_weights.as_ref()),
            ("model.denoiser_weights", self.denoiser_weights.as_ref()),
        ]
    }

    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.autoencoder_weights.as_mut(),
            self.text_encoder_weights.as_mut(),
            self.segmenter_weights.as_mut(),
            self.denoiser_weights.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default)]
    pub beta_schedule: BetaSchedule,
    /// Overrides the scheduler's prediction type (`epsilon` or `v_prediction`).
    #[serde(default)]
    pub prediction_type: Option<String>,
    #[serde(default)]
    pub noise_offset: f64,
    #[serde(default)]
    pub input_perturbation: f64,
    #[serde(default)]
    pub dream_training: bool,
    #[serde(default = "default_dream_detail_preservation")]
    pub dream_detail_preservation: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: BetaSchedule::default(),
            prediction_type: None,
            noise_offset: 0.0,
            input_perturbation: 0.0,
            dream_training: false,
            dream_detail_preservation: default_dream_detail_preservation(),
        }
    }
}

impl DiffusionConfig {
    pub fn prediction_type(&self) -> Result<PredictionType, TrainingError> {
        match &self.prediction_type {
            Some(value) => Ok(value.parse::<PredictionType>()?),
            None => Ok(PredictionType::default()),
        }
    }

    pub fn ddpm_config(&self) -> Result<DdpmConfig, TrainingError> {
        Ok(DdpmConfig {
            num_train_timesteps: self.num_train_timesteps,
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            beta_schedule: self.beta_schedule,
            prediction_type: self.prediction_type()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Enables Min-SNR weighting of an L2 noise loss and drops the auxiliary terms.
    #[serde(default)]
    pub snr_gamma: Option<f64>,
    #[serde(default)]
    pub noise_loss: NoiseLossKind,
    #[serde(default = "default_segmentation_weight")]
    pub segmentation_weight: f64,
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale: f64,
    #[serde(default)]
    pub segmentation_normalization: Option<IntensityNormalization>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            snr_gamma: None,
            noise_loss: NoiseLossKind::default(),
            segmentation_weight: default_segmentation_weight(),
            pixel_scale: default_pixel_scale(),
            segmentation_normalization: None,
        }
    }
}

impl LossConfig {
    pub fn mode(&self) -> LossMode {
        match self.snr_gamma {
            Some(gamma) => LossMode::SnrWeighted { gamma },
            None => LossMode::Uniform {
                noise_loss: self.noise_loss,
                segmentation_weight: self.segmentation_weight,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_path: PathBuf,
    #[serde(default)]
    pub validation_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Token ids per example handed to the text encoder.
    #[serde(default = "default_prompt_length")]
    pub prompt_length: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_path, base);
        if let Some(path) = self.validation_path.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    #[serde(default)]
    pub scale_lr: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            scale_lr: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default)]
    pub min_lr: f64,
    /// Exponent of the `polynomial` decay.
    #[serde(default = "default_scheduler_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_steps: default_warmup_steps(),
            min_lr: 0.0,
            power: default_scheduler_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    ConstantWithWarmup,
    Linear,
    Cosine,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ema_decay")]
    pub decay: f64,
    #[serde(default)]
    pub min_decay: f64,
    #[serde(default)]
    pub update_after_step: usize,
    #[serde(default)]
    pub use_ema_warmup: bool,
    #[serde(default = "default_ema_inv_gamma")]
    pub inv_gamma: f64,
    #[serde(default = "default_ema_power")]
    pub power: f64,
    /// Keep shadow weights in host memory between updates.
    #[serde(default)]
    pub offload: bool,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            decay: default_ema_decay(),
            min_decay: 0.0,
            update_after_step: 0,
            use_ema_warmup: false,
            inv_gamma: default_ema_inv_gamma(),
            power: default_ema_power(),
            offload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub max_train_steps: Option<usize>,
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,
    #[serde(default = "default_checkpointing_steps")]
    pub checkpointing_steps: usize,
    #[serde(default)]
    pub checkpoints_total_limit: Option<usize>,
    /// `"latest"` or a checkpoint directory.
    #[serde(default)]
    pub resume_from_checkpoint: Option<String>,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub non_finite: NonFinitePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            device: DeviceKind::default(),
            output_dir: default_output_dir(),
            max_train_steps: None,
            num_train_epochs: default_num_train_epochs(),
            checkpointing_steps: default_checkpointing_steps(),
            checkpoints_total_limit: None,
            resume_from_checkpoint: None,
            log_every_n_steps: default_log_every_n_steps(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
            non_finite: NonFinitePolicy::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.output_dir, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub every_n_steps: Option<usize>,
    #[serde(default = "default_num_inference_steps")]
    pub num_inference_steps: usize,
    /// Timestep fed to the one-step direct estimate.
    #[serde(default = "default_direct_timestep")]
    pub direct_timestep: usize,
    #[serde(default = "default_validation_batches")]
    pub max_batches: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: None,
            num_inference_steps: default_num_inference_steps(),
            direct_timestep: default_direct_timestep(),
            max_batches: default_validation_batches(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    /// Dtype of the frozen networks' weights and activations.
    pub fn weight_dtype(&self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// NaN/Inf losses and gradients flow into the optimizer unchecked.
    #[default]
    Propagate,
    /// Abort the run before the optimizer touches a non-finite step.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default)]
    pub rank: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: default_world_size(),
            rank: 0,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_dream_detail_preservation() -> f64 {
    1.0
}

fn default_segmentation_weight() -> f64 {
    0.001
}

fn default_pixel_scale() -> f64 {
    1000.0
}

fn default_batch_size() -> usize {
    4
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_prompt_length() -> usize {
    16
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    1e-2
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_warmup_steps() -> usize {
    500
}

fn default_scheduler_power() -> f64 {
    1.0
}

fn default_ema_decay() -> f64 {
    0.9999
}

fn default_ema_inv_gamma() -> f64 {
    1.0
}

fn default_ema_power() -> f64 {
    2.0 / 3.0
}

fn default_seed() -> u64 {
    42
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_num_train_epochs() -> usize {
    100
}

fn default_checkpointing_steps() -> usize {
    500
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_num_inference_steps() -> usize {
    50
}

fn default_direct_timestep() -> usize {
    499
}

fn default_validation_batches() -> usize {
    1
}

fn default_tensorboard_flush_every_n() -> usize {
    1
}

fn default_world_size() -> usize {
    1
}
