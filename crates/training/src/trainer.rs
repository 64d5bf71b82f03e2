use std::{collections::HashMap, fmt, path::PathBuf, sync::Arc};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use diffusion::{
    compute_dream_and_update_latents, predict_start_from_noise, sample_timesteps, DdpmSchedule,
    NoiseSchedule, PredictionType,
};
use model::{Denoiser, FrozenAutoencoder, FrozenSegmenter, FrozenTextEncoder};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, RngSnapshot, SaveRequest, TrainingProgressSnapshot, DENOISER_SUBDIR},
    components::{build_components, select_device, DenoiserFactory, TrainingComponents},
    config::NonFinitePolicy,
    data::{BlockingDataLoader, DataBatch, SliceDataLoader, SliceDataset},
    distributed::{ProcessGroup, SingleProcess},
    ema::EmaModel,
    logging::{Logger, LoggingSettings},
    loss::{LossComposer, LossInputs, LossTerms, ReconstructionInputs},
    metrics::{StepAccumulator, StepLosses, TrainingMetrics, ValidationMetrics, ValidationSummary},
    optimizer::{AdamWConfig, GradientScaler, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerConfig},
    validation::{render_panels, score_batch, ValidationSettings, Validator},
    TrainingConfig, TrainingError,
};

/// Stages of one training step, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Encode,
    Diffuse,
    DenoisePredict,
    Reconstruct,
    Segment,
    ComposeLoss,
    Backward,
    Optimize,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepPhase::Encode => "encode",
            StepPhase::Diffuse => "diffuse",
            StepPhase::DenoisePredict => "denoise_predict",
            StepPhase::Reconstruct => "reconstruct",
            StepPhase::Segment => "segment",
            StepPhase::ComposeLoss => "compose_loss",
            StepPhase::Backward => "backward",
            StepPhase::Optimize => "optimize",
        };
        f.write_str(name)
    }
}

fn in_phase(phase: StepPhase) -> impl Fn(candle_core::Error) -> TrainingError {
    move |err| TrainingError::runtime(format!("{phase} failed: {err}"))
}

/// Random draws of one step. When passed to [`Trainer::forward_step`] they replace
/// the sampled noise, timesteps and input perturbation verbatim.
#[derive(Debug, Clone)]
pub struct DiffusionDraw {
    /// Same shape as the target latents.
    pub noise: Tensor,
    /// `(b,)` `u32` timesteps.
    pub timesteps: Tensor,
    pub perturbation: Option<Tensor>,
}

/// Everything the forward half of a step produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub latents: Tensor,
    pub noisy_latents: Tensor,
    pub target: Tensor,
    pub model_pred: Tensor,
    pub timesteps: Tensor,
    /// Decoded one-step estimate scaled into the segmenter's range. `None` when the
    /// loss mode skips reconstruction.
    pub rescaled_estimate: Option<Tensor>,
    pub loss: LossTerms,
}

impl StepOutput {
    pub fn losses(&self) -> Result<StepLosses, TrainingError> {
        let scalar = |t: &Tensor| -> Result<f64, TrainingError> {
            t.to_dtype(DType::F32)
                .and_then(|t| t.to_scalar::<f32>())
                .map(f64::from)
                .map_err(in_phase(StepPhase::ComposeLoss))
        };
        Ok(StepLosses {
            total: scalar(&self.loss.total)?,
            noise: scalar(&self.loss.noise)?,
            pixel: self.loss.pixel.as_ref().map(scalar).transpose()?,
            segmentation: self.loss.segmentation.as_ref().map(scalar).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub global_step: usize,
    /// Mean total loss of the last optimizer step.
    pub final_loss: Option<f64>,
    /// Written on the main process only.
    pub final_weights: Option<PathBuf>,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    group: Arc<dyn ProcessGroup>,
    autoencoder: FrozenAutoencoder,
    text_encoder: FrozenTextEncoder,
    segmenter: FrozenSegmenter,
    denoiser: Box<dyn Denoiser>,
    denoiser_factory: DenoiserFactory,
    parameters: Vec<(String, Var)>,
    schedule: DdpmSchedule,
    data_loader: BlockingDataLoader<SliceDataLoader>,
    validation_data: Option<SliceDataset>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    gradient_scaler: GradientScaler,
    loss: LossComposer,
    ema: Option<EmaModel>,
    rng: StdRng,
    rng_snapshot: RngSnapshot,
    max_train_steps: usize,
    update_steps_per_epoch: usize,
    num_epochs: usize,
    global_step: usize,
    first_epoch: usize,
    metrics: TrainingMetrics,
    logger: Logger,
}

impl Trainer {
    /// Single-process trainer built from configuration alone.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        Self::with_process_group(config, Arc::new(SingleProcess))
    }

    pub fn with_process_group(
        config: TrainingConfig,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        config.ensure_prerequisites()?;

        let device = select_device(config.runtime.device)?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            warn!(%err, "device RNG could not be seeded; noise draws are not reproducible");
        }

        let components = build_components(&config, &device)?;
        Self::from_components(config, components, device, group)
    }

    /// Assembles a trainer around already-built networks and datasets, then resumes
    /// from `runtime.resume_from_checkpoint` when one is configured.
    pub fn from_components(
        config: TrainingConfig,
        components: TrainingComponents,
        device: Device,
        group: Arc<dyn ProcessGroup>,
    ) -> Result<Self, TrainingError> {
        let TrainingComponents {
            autoencoder,
            text_encoder,
            segmenter,
            denoiser,
            denoiser_factory,
            train_data,
            validation_data,
        } = components;

        let rank = group.rank();
        let world_size = group.world_size();
        if world_size != config.distributed.world_size.max(1) {
            return Err(TrainingError::initialization(format!(
                "process group has {} workers but distributed.world_size is {}",
                world_size, config.distributed.world_size
            )));
        }

        let schedule = DdpmSchedule::new(config.diffusion.ddpm_config()?, &device)
            .map_err(|err| TrainingError::initialization(format!("noise schedule: {err}")))?;

        let loader = SliceDataLoader::new(
            train_data,
            config.data.batch_size,
            config.data.gradient_accumulation_steps,
            config.data.shuffle,
            config.runtime.seed,
            rank,
            world_size,
        )?;
        let data_loader = BlockingDataLoader::new(loader);

        let accumulation = config.data.gradient_accumulation_steps.max(1);
        let update_steps_per_epoch = data_loader.batches_per_epoch().div_ceil(accumulation);
        let max_train_steps = config
            .runtime
            .max_train_steps
            .unwrap_or(config.runtime.num_train_epochs * update_steps_per_epoch);
        if max_train_steps == 0 {
            return Err(TrainingError::initialization(
                "training would run zero optimizer steps",
            ));
        }
        let num_epochs = max_train_steps.div_ceil(update_steps_per_epoch);

        let parameters = denoiser.parameters();
        let learning_rate = config.effective_learning_rate();
        let optimizer = TrainerOptimizer::new(
            parameters.clone(),
            AdamWConfig::from_training_config(&config.optimizer, learning_rate),
        )?;
        let scheduler = SchedulerConfig::from_training_config(
            &config.scheduler,
            learning_rate,
            max_train_steps,
            world_size,
        )?
        .build();
        let gradient_scaler = GradientScaler::new(config.runtime.precision);
        let loss = LossComposer::new(config.loss.mode(), config.loss.pixel_scale);

        let logger = if group.is_main_process() {
            Logger::new(LoggingSettings::from_config(&config.runtime.logging))?
        } else {
            Logger::new(LoggingSettings::quiet())?
        };

        let seed = config.runtime.seed;
        let mut trainer = Self {
            device,
            group,
            autoencoder,
            text_encoder,
            segmenter,
            denoiser,
            denoiser_factory,
            parameters,
            schedule,
            data_loader,
            validation_data,
            optimizer,
            scheduler,
            gradient_scaler,
            loss,
            ema: None,
            rng: StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
            rng_snapshot: RngSnapshot { master_seed: seed },
            max_train_steps,
            update_steps_per_epoch,
            num_epochs,
            global_step: 0,
            first_epoch: 0,
            metrics: TrainingMetrics::new(),
            logger,
            config,
        };

        trainer.broadcast_parameters()?;
        trainer.ema = trainer.fresh_ema()?;

        info!(
            rank,
            world_size,
            max_train_steps,
            update_steps_per_epoch,
            num_epochs,
            learning_rate,
            loss_mode = ?trainer.loss.mode(),
            prediction_type = %trainer.schedule.prediction_type(),
            ema = trainer.ema.is_some(),
            "trainer ready"
        );

        if let Some(requested) = trainer.config.runtime.resume_from_checkpoint.clone() {
            trainer.resume(&requested)?;
        }
        Ok(trainer)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn first_epoch(&self) -> usize {
        self.first_epoch
    }

    pub fn max_train_steps(&self) -> usize {
        self.max_train_steps
    }

    /// Trainable parameters in name order.
    pub fn parameters(&self) -> &[(String, Var)] {
        &self.parameters
    }

    pub fn ema(&self) -> Option<&EmaModel> {
        self.ema.as_ref()
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Restores training state from `requested` (`"latest"` or a checkpoint path).
    /// Returns `None` when `"latest"` finds nothing and the run starts fresh.
    pub fn resume(
        &mut self,
        requested: &str,
    ) -> Result<Option<TrainingProgressSnapshot>, TrainingError> {
        let output_dir = self.config.runtime.output_dir.clone();
        let Some(directory) = checkpoint::resolve_resume(&output_dir, requested)? else {
            return Ok(None);
        };

        let outcome = checkpoint::load_checkpoint(&directory)?;
        // Read before anything live is touched, so a bad EMA file leaves the
        // trainer as it was.
        let saved_ema = match (&self.ema, &outcome.ema) {
            (Some(_), Some((state, weights_path))) => Some((
                state.clone(),
                checkpoint::read_weights(weights_path, &Device::Cpu)?,
            )),
            _ => None,
        };

        match checkpoint::apply_denoiser_weights(&self.parameters, &outcome.denoiser_weights_path)
        {
            Ok(()) => {
                self.optimizer.load_state(outcome.optimizer_state)?;
                match saved_ema {
                    Some((state, shadow)) => {
                        if let Some(ema) = self.ema.as_mut() {
                            ema.load_state(&state, shadow)?;
                        }
                    }
                    None if self.ema.is_some() => {
                        warn!("checkpoint carries no EMA weights; EMA restarts from the restored weights");
                        self.ema = self.fresh_ema()?;
                    }
                    None => {}
                }
            }
            Err(TrainingError::Checkpoint(reason)) => {
                warn!(
                    %reason,
                    dir = %directory.display(),
                    "checkpoint weights do not fit the denoiser; rebuilding it from its base definition"
                );
                self.rebuild_denoiser()?;
                if let (Some(ema), Some((state, shadow))) = (self.ema.as_mut(), saved_ema) {
                    match ema.load_state(&state, shadow) {
                        Ok(()) => info!("checkpoint EMA weights restored onto the rebuilt denoiser"),
                        Err(TrainingError::Checkpoint(reason)) => warn!(
                            %reason,
                            "checkpoint EMA weights do not fit the rebuilt denoiser; EMA restarts"
                        ),
                        Err(err) => return Err(err),
                    }
                }
            }
            Err(err) => return Err(err),
        }

        self.scheduler.load_snapshot(&outcome.scheduler_state)?;
        self.optimizer
            .set_learning_rate(self.scheduler.learning_rate());
        self.gradient_scaler.load_state(outcome.scaler_state);

        let progress = outcome.manifest.progress;
        self.global_step = progress.global_step;
        self.first_epoch = progress.global_step / self.update_steps_per_epoch;
        info!(
            dir = %directory.display(),
            global_step = self.global_step,
            first_epoch = self.first_epoch,
            "resumed from checkpoint"
        );
        Ok(Some(progress))
    }

    pub fn train(&mut self) -> Result<TrainingSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until `max_train_steps`, the last epoch, or until any worker's
    /// `should_stop` returns true at an optimizer-step boundary.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<TrainingSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let accumulation = self.config.data.gradient_accumulation_steps.max(1) as f64;
        let mut accumulated_grads: Option<GradStore> = None;
        let mut step_losses = StepAccumulator::default();
        let mut final_loss = None;

        let mut epoch = self.first_epoch;
        if self.global_step < self.max_train_steps && epoch < self.num_epochs {
            self.data_loader.start_epoch(epoch, 0)?;
            info!(
                device = ?self.device,
                global_step = self.global_step,
                epoch,
                "starting training"
            );
        }

        while self.global_step < self.max_train_steps && epoch < self.num_epochs {
            let Some(batch) = self.data_loader.next_batch()? else {
                epoch += 1;
                if epoch < self.num_epochs {
                    self.data_loader.start_epoch(epoch, 0)?;
                }
                continue;
            };

            let output = self.forward_step(&batch, None)?;
            step_losses.accumulate(output.losses()?, batch.micro_batch_size);

            let normalized = output
                .loss
                .total
                .affine(1.0 / accumulation, 0.0)
                .map_err(in_phase(StepPhase::Backward))?;
            let scaled = self.gradient_scaler.scale(&normalized)?;
            let micro_grads = scaled.backward().map_err(in_phase(StepPhase::Backward))?;
            match accumulated_grads.as_mut() {
                Some(existing) => self.merge_gradient_store(existing, micro_grads)?,
                None => accumulated_grads = Some(micro_grads),
            }

            if !batch.ends_accumulation {
                continue;
            }
            let Some(mut grads) = accumulated_grads.take() else {
                continue;
            };

            let mut losses = step_losses.average().unwrap_or_default();
            let samples = step_losses.samples() * self.group.world_size() as u64;
            step_losses.reset();
            if self.group.world_size() > 1 {
                self.all_reduce_gradients(&mut grads)?;
                losses = self.all_reduce_losses(losses)?;
            }

            let (found_inf, grad_norm) = self.unscale_gradients(&mut grads)?;
            if self.config.runtime.non_finite == NonFinitePolicy::FailFast {
                let step = self.global_step + 1;
                if !losses.total.is_finite() {
                    return Err(TrainingError::NonFinite {
                        step,
                        value: losses.total,
                    });
                }
                if !self.gradient_scaler.is_enabled() && (found_inf || !grad_norm.is_finite()) {
                    return Err(TrainingError::NonFinite {
                        step,
                        value: grad_norm,
                    });
                }
            }

            let skip_update = self.gradient_scaler.is_enabled() && found_inf;
            self.gradient_scaler.update(found_inf);
            let lr = if skip_update {
                debug!(
                    step = self.global_step + 1,
                    loss_scale = self.gradient_scaler.loss_scale(),
                    "gradient overflow, skipping optimizer step"
                );
                self.optimizer.zero_grad(&mut grads);
                self.optimizer.learning_rate()
            } else {
                if let Some(max_norm) = self.config.optimizer.max_grad_norm {
                    self.clip_gradients(&mut grads, grad_norm, max_norm)?;
                }
                let lr = self.step_scheduler();
                self.optimizer.set_learning_rate(lr);
                self.optimizer.step(&mut grads)?;
                lr
            };

            if let Some(ema) = self.ema.as_mut() {
                ema.step(&self.parameters)?;
            }
            self.global_step += 1;
            final_loss = Some(losses.total);

            let snapshot = self.metrics.record_step(samples, losses, grad_norm);
            let log_every = self.config.runtime.log_every_n_steps.max(1);
            if self.group.is_main_process()
                && (self.global_step % log_every == 0 || self.global_step <= 5)
            {
                self.logger.log_training_step(
                    self.global_step,
                    lr,
                    self.gradient_scaler.loss_scale(),
                    &snapshot,
                );
            }

            self.maybe_checkpoint(epoch)?;
            self.maybe_validate()?;

            if self.stop_requested(should_stop())? {
                info!(global_step = self.global_step, "stop requested, leaving the training loop");
                break;
            }
        }

        let final_weights = if self.group.is_main_process() {
            let tensors = match &self.ema {
                Some(ema) => ema.shadow(),
                None => self.live_weights(),
            };
            let path =
                checkpoint::save_final_weights(&self.config.runtime.output_dir, DENOISER_SUBDIR, tensors)?;
            info!(path = %path.display(), global_step = self.global_step, "final weights saved");
            Some(path)
        } else {
            None
        };
        self.group.barrier()?;
        self.logger.flush();

        Ok(TrainingSummary {
            global_step: self.global_step,
            final_loss,
            final_weights,
        })
    }

    /// Forward half of one micro-batch: encode, diffuse, predict, reconstruct,
    /// segment and compose the loss. No gradients are taken.
    pub fn forward_step(
        &mut self,
        batch: &DataBatch,
        draw: Option<&DiffusionDraw>,
    ) -> Result<StepOutput, TrainingError> {
        let latents = self
            .autoencoder
            .encode_latents(&batch.images)
            .map_err(in_phase(StepPhase::Encode))?;
        let cond_latents = self
            .autoencoder
            .encode_latents(&batch.conditions)
            .map_err(in_phase(StepPhase::Encode))?;

        let draw = match draw {
            Some(draw) => draw.clone(),
            None => self.sample_draw(&latents)?,
        };
        let DiffusionDraw {
            noise,
            timesteps,
            perturbation,
        } = draw;

        let diffusion_noise = match &perturbation {
            Some(perturbation) => perturbation
                .affine(self.config.diffusion.input_perturbation, 0.0)
                .and_then(|p| noise.add(&p))
                .map_err(in_phase(StepPhase::Diffuse))?,
            None => noise.clone(),
        };
        let noisy_latents = self
            .schedule
            .add_noise(&latents, &diffusion_noise, &timesteps)
            .map_err(in_phase(StepPhase::Diffuse))?;
        let target = match self.schedule.prediction_type() {
            PredictionType::Epsilon => noise.clone(),
            PredictionType::VPrediction => self
                .schedule
                .get_velocity(&latents, &noise, &timesteps)
                .map_err(in_phase(StepPhase::Diffuse))?,
        };

        let context = self
            .text_encoder
            .encode(&batch.input_ids)
            .map_err(in_phase(StepPhase::Encode))?;

        let denoiser = self.denoiser.as_ref();
        let predict = |noisy: &Tensor| -> candle_core::Result<Tensor> {
            let input = Tensor::cat(&[noisy, &cond_latents], 1)?;
            denoiser.forward(&input, &timesteps, &context)
        };

        let (noisy_latents, target) = if self.config.diffusion.dream_training {
            let adjusted = compute_dream_and_update_latents(
                &self.schedule,
                &timesteps,
                &noise,
                &noisy_latents,
                &target,
                self.config.diffusion.dream_detail_preservation,
                &predict,
            )
            .map_err(in_phase(StepPhase::DenoisePredict))?;
            (adjusted.noisy_latents, adjusted.target)
        } else {
            (noisy_latents, target)
        };

        let model_pred = predict(&noisy_latents).map_err(in_phase(StepPhase::DenoisePredict))?;

        let (rescaled_estimate, segmentation_logits) = if self.loss.needs_reconstruction() {
            let start = predict_start_from_noise(
                &noisy_latents,
                &timesteps,
                &model_pred,
                self.schedule.alphas_cumprod(),
            )
            .map_err(in_phase(StepPhase::Reconstruct))?;
            let decoded = self
                .autoencoder
                .decode_latents(&start)
                .map_err(in_phase(StepPhase::Reconstruct))?;
            let rescaled = self
                .segmenter
                .rescale(&decoded)
                .map_err(in_phase(StepPhase::Reconstruct))?;
            let logits = self
                .segmenter
                .segment_pixels(&rescaled)
                .map_err(in_phase(StepPhase::Segment))?;
            (Some(rescaled), Some(logits))
        } else {
            (None, None)
        };

        let reconstruction = match (&rescaled_estimate, &segmentation_logits) {
            (Some(rescaled), Some(logits)) => Some(ReconstructionInputs {
                rescaled_estimate: rescaled,
                raw_images: &batch.images,
                segmentation_logits: logits,
                masks: &batch.masks,
            }),
            _ => None,
        };
        let loss = self.loss.compose(
            &self.schedule,
            &LossInputs {
                model_pred: &model_pred,
                target: &target,
                timesteps: &timesteps,
                reconstruction,
            },
        )?;

        Ok(StepOutput {
            latents,
            noisy_latents,
            target,
            model_pred,
            timesteps,
            rescaled_estimate,
            loss,
        })
    }

    /// Validation pass with EMA weights swapped in (when EMA is enabled). Live weights
    /// are restored even when sampling fails.
    pub fn run_validation(&mut self) -> Result<Option<ValidationSummary>, TrainingError> {
        if self.validation_data.is_none() {
            debug!("no validation data configured");
            return Ok(None);
        }

        if let Some(ema) = self.ema.as_mut() {
            ema.store(&self.parameters)?;
            ema.copy_to(&self.parameters)?;
        }
        let result = self.validate_with_live_weights();
        if let Some(ema) = self.ema.as_mut() {
            ema.restore(&self.parameters)?;
        }
        result
    }

    fn validate_with_live_weights(&mut self) -> Result<Option<ValidationSummary>, TrainingError> {
        let Some(dataset) = self.validation_data.clone() else {
            return Ok(None);
        };
        let settings = ValidationSettings::from(&self.config.runtime.validation);
        let batch_size = self.config.data.batch_size.min(dataset.len()).max(1);
        let mut loader = BlockingDataLoader::new(SliceDataLoader::new(
            dataset,
            batch_size,
            1,
            false,
            self.config.runtime.seed,
            0,
            1,
        )?);

        let validator = Validator {
            denoiser: self.denoiser.as_ref(),
            autoencoder: &self.autoencoder,
            text_encoder: &self.text_encoder,
            segmenter: &self.segmenter,
            schedule: &self.schedule,
        };

        let mut metrics = ValidationMetrics::default();
        let mut panels = None;
        for _ in 0..settings.max_batches {
            let Some(batch) = loader.next_batch()? else {
                break;
            };
            let sample = validator.sample(&batch, &settings)?;
            let scores = score_batch(&batch, &sample)?;
            metrics.update(
                scores.sampled_l1,
                scores.direct_l1,
                scores.pixels,
                scores.sampled_correct,
                scores.direct_correct,
            );
            if panels.is_none() {
                panels = Some(render_panels(&batch, &sample)?);
            }
        }

        let summary = metrics.finalize();
        if let Some(summary) = &summary {
            self.logger.log_validation(self.global_step, summary);
        }
        if let Some(panels) = panels {
            let png_dir = self
                .config
                .runtime
                .output_dir
                .join("validation")
                .join(format!("step-{}", self.global_step));
            self.logger.log_images(self.global_step, &panels, &png_dir)?;
        }
        self.logger.flush();
        Ok(summary)
    }

    fn sample_draw(&mut self, latents: &Tensor) -> Result<DiffusionDraw, TrainingError> {
        let diffuse = in_phase(StepPhase::Diffuse);
        let (batch, channels, _, _) = latents.dims4().map_err(&diffuse)?;

        let mut noise = latents.randn_like(0.0, 1.0).map_err(&diffuse)?;
        let noise_offset = self.config.diffusion.noise_offset;
        if noise_offset > 0.0 {
            let offset = Tensor::randn(0f32, 1f32, (batch, channels, 1, 1), latents.device())
                .and_then(|t| t.affine(noise_offset, 0.0))
                .map_err(&diffuse)?;
            noise = noise.broadcast_add(&offset).map_err(&diffuse)?;
        }
        let perturbation = if self.config.diffusion.input_perturbation > 0.0 {
            Some(noise.randn_like(0.0, 1.0).map_err(&diffuse)?)
        } else {
            None
        };
        let timesteps = sample_timesteps(
            &mut self.rng,
            batch,
            self.schedule.num_train_timesteps(),
            latents.device(),
        )
        .map_err(&diffuse)?;

        Ok(DiffusionDraw {
            noise,
            timesteps,
            perturbation,
        })
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for (_, var) in &self.parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad).map_err(in_phase(StepPhase::Backward))?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    /// Averages every parameter gradient across workers. A worker without a
    /// gradient for some parameter contributes zeros.
    fn all_reduce_gradients(&self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let optimize = in_phase(StepPhase::Optimize);
        let mut flat = Vec::new();
        let mut layout = Vec::with_capacity(self.parameters.len());
        for (_, var) in &self.parameters {
            let tensor = var.as_tensor();
            let values = match grads.remove(tensor) {
                Some(grad) => grad
                    .to_dtype(DType::F32)
                    .and_then(|g| g.flatten_all())
                    .and_then(|g| g.to_vec1::<f32>())
                    .map_err(&optimize)?,
                None => vec![0.0; tensor.elem_count()],
            };
            layout.push(values.len());
            flat.extend(values);
        }

        self.group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for ((_, var), len) in self.parameters.iter().zip(layout) {
            let tensor = var.as_tensor();
            let grad = Tensor::from_slice(&flat[offset..offset + len], tensor.dims(), tensor.device())
                .and_then(|g| g.to_dtype(tensor.dtype()))
                .map_err(&optimize)?;
            grads.insert(tensor, grad);
            offset += len;
        }
        Ok(())
    }

    fn all_reduce_losses(&self, losses: StepLosses) -> Result<StepLosses, TrainingError> {
        let mut values = [
            losses.total as f32,
            losses.noise as f32,
            losses.pixel.unwrap_or_default() as f32,
            losses.segmentation.unwrap_or_default() as f32,
        ];
        self.group.all_reduce_mean(&mut values)?;
        Ok(StepLosses {
            total: values[0] as f64,
            noise: values[1] as f64,
            pixel: losses.pixel.map(|_| values[2] as f64),
            segmentation: losses.segmentation.map(|_| values[3] as f64),
        })
    }

    fn unscale_gradients(&self, grads: &mut GradStore) -> Result<(bool, f64), TrainingError> {
        let mut found_inf = false;
        let mut sum_squares = 0.0f64;
        for (_, var) in &self.parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let (unscaled, sq) = self.gradient_scaler.unscale_gradient(&grad)?;
                found_inf |= !sq.is_finite();
                sum_squares += sq;
                grads.insert(tensor, unscaled);
            }
        }
        Ok((found_inf, sum_squares.sqrt()))
    }

    fn clip_gradients(
        &self,
        grads: &mut GradStore,
        total_norm: f64,
        max_norm: f64,
    ) -> Result<(), TrainingError> {
        if total_norm.is_nan() || total_norm <= max_norm {
            return Ok(());
        }
        let clip_coef = max_norm / (total_norm + 1e-6);
        for (_, var) in &self.parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let clipped = grad
                    .affine(clip_coef, 0.0)
                    .map_err(in_phase(StepPhase::Optimize))?;
                grads.insert(tensor, clipped);
            }
        }
        Ok(())
    }

    /// Ticks the schedule once per worker and returns the rate for this step.
    fn step_scheduler(&mut self) -> f64 {
        let lr = self.scheduler.step();
        for _ in 1..self.group.world_size() {
            self.scheduler.step();
        }
        lr
    }

    fn maybe_checkpoint(&mut self, epoch: usize) -> Result<(), TrainingError> {
        let every = self.config.runtime.checkpointing_steps;
        if every == 0 || self.global_step % every != 0 {
            return Ok(());
        }

        if self.group.is_main_process() {
            let descriptor = checkpoint::save_checkpoint(SaveRequest {
                base_dir: &self.config.runtime.output_dir,
                config: &self.config,
                denoiser: &self.parameters,
                ema: self.ema.as_ref(),
                optimizer: &self.optimizer,
                scheduler: self.scheduler.as_ref(),
                scaler: &self.gradient_scaler,
                progress: TrainingProgressSnapshot {
                    global_step: self.global_step,
                    epoch,
                },
                rng: self.rng_snapshot,
                total_limit: self.config.runtime.checkpoints_total_limit,
            })?;
            info!(
                step = self.global_step,
                dir = %descriptor.directory.display(),
                "checkpoint saved"
            );
        }
        self.group.barrier()?;
        Ok(())
    }

    fn maybe_validate(&mut self) -> Result<(), TrainingError> {
        let Some(every) = self.config.runtime.validation.every_n_steps else {
            return Ok(());
        };
        if every == 0 || self.global_step % every != 0 {
            return Ok(());
        }

        if self.group.is_main_process() {
            if let Some(summary) = self.run_validation()? {
                info!(
                    step = self.global_step,
                    sampled_l1 = summary.sampled_pixel_l1,
                    direct_l1 = summary.direct_pixel_l1,
                    "validation finished"
                );
            }
        }
        self.group.barrier()?;
        Ok(())
    }

    fn stop_requested(&self, local: bool) -> Result<bool, TrainingError> {
        let mut vote = [if local { 1.0f32 } else { 0.0 }];
        self.group.all_reduce_mean(&mut vote)?;
        Ok(vote[0] > 0.0)
    }

    fn live_weights(&self) -> HashMap<String, Tensor> {
        self.parameters
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect()
    }

    fn fresh_ema(&self) -> Result<Option<EmaModel>, TrainingError> {
        if self.config.ema.enabled {
            EmaModel::new(&self.parameters, &self.config.ema).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Copies the main process's weights to every worker.
    fn broadcast_parameters(&self) -> Result<(), TrainingError> {
        if self.group.world_size() == 1 {
            return Ok(());
        }
        for (name, var) in &self.parameters {
            let tensor = var.as_tensor();
            let mut values = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|err| TrainingError::initialization(format!("parameter '{name}': {err}")))?;
            self.group.broadcast_from_main(&mut values)?;
            Tensor::from_vec(values, tensor.dims(), tensor.device())
                .and_then(|t| t.to_dtype(tensor.dtype()))
                .and_then(|t| var.set(&t))
                .map_err(|err| TrainingError::initialization(format!("parameter '{name}': {err}")))?;
        }
        Ok(())
    }

    /// Replaces the denoiser with a fresh build from its factory. Optimizer moments
    /// and EMA restart; step counters are left to the caller.
    fn rebuild_denoiser(&mut self) -> Result<(), TrainingError> {
        let denoiser = (self.denoiser_factory)(&self.device)
            .map_err(|err| TrainingError::initialization(format!("failed to rebuild denoiser: {err}")))?;
        let parameters = denoiser.parameters();
        self.optimizer = TrainerOptimizer::new(
            parameters.clone(),
            AdamWConfig::from_training_config(
                &self.config.optimizer,
                self.optimizer.learning_rate(),
            ),
        )?;
        self.denoiser = denoiser;
        self.parameters = parameters;
        self.broadcast_parameters()?;
        self.ema = self.fresh_ema()?;
        Ok(())
    }
}
