use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    /// Advances one tick and returns the rate for the tick just taken.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub step: usize,
    pub learning_rate: f64,
}

/// What happens after warmup.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DecayShape {
    Constant,
    Linear,
    Cosine,
    Polynomial { power: f64 },
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    shape: DecayShape,
}

impl SchedulerConfig {
    /// Warmup and total tick counts are multiplied by `world_size`: the schedule is
    /// ticked once per process per optimizer step.
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        max_train_steps: usize,
        world_size: usize,
    ) -> Result<Self, TrainingError> {
        if max_train_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if cfg.min_lr < 0.0 || cfg.min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }

        let world_size = world_size.max(1);
        let (warmup_steps, shape) = match cfg.strategy {
            config::LearningRateSchedule::Constant => (0, DecayShape::Constant),
            config::LearningRateSchedule::ConstantWithWarmup => {
                (cfg.warmup_steps, DecayShape::Constant)
            }
            config::LearningRateSchedule::Linear => (cfg.warmup_steps, DecayShape::Linear),
            config::LearningRateSchedule::Cosine => (cfg.warmup_steps, DecayShape::Cosine),
            config::LearningRateSchedule::Polynomial => (
                cfg.warmup_steps,
                DecayShape::Polynomial {
                    power: if cfg.power <= 0.0 { 1.0 } else { cfg.power },
                },
            ),
        };

        Ok(Self {
            base_lr,
            min_lr: cfg.min_lr,
            warmup_steps: warmup_steps * world_size,
            total_steps: max_train_steps * world_size,
            shape,
        })
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        Box::new(WarmupDecay {
            config: self,
            step: 0,
            current_lr: 0.0,
        })
    }
}

struct WarmupDecay {
    config: SchedulerConfig,
    step: usize,
    current_lr: f64,
}

impl WarmupDecay {
    fn compute_lr(&self, step: usize) -> f64 {
        let cfg = &self.config;
        if cfg.warmup_steps > 0 && step < cfg.warmup_steps {
            let progress = (step + 1) as f64 / cfg.warmup_steps as f64;
            return cfg.base_lr * progress;
        }

        if cfg.shape == DecayShape::Constant {
            return cfg.base_lr;
        }
        if cfg.total_steps <= cfg.warmup_steps {
            return cfg.min_lr;
        }

        let effective = step.saturating_sub(cfg.warmup_steps) as f64;
        let denom = (cfg.total_steps - cfg.warmup_steps).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        let factor = match cfg.shape {
            DecayShape::Constant => 1.0,
            DecayShape::Linear => 1.0 - progress,
            DecayShape::Cosine => 0.5 * (1.0 + f64::cos(PI * progress)),
            DecayShape::Polynomial { power } => (1.0 - progress).max(0.0).powf(power),
        };
        cfg.min_lr + (cfg.base_lr - cfg.min_lr) * factor
    }
}

impl LRScheduler for WarmupDecay {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            step: self.step,
            learning_rate: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if !state.learning_rate.is_finite() {
            return Err(TrainingError::checkpoint(
                "scheduler state carries a non-finite learning rate",
            ));
        }
        self.step = state.step;
        self.current_lr = state.learning_rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(strategy: config::LearningRateSchedule, warmup: usize) -> Box<dyn LRScheduler> {
        let cfg = config::SchedulerConfig {
            strategy,
            warmup_steps: warmup,
            ..config::SchedulerConfig::default()
        };
        SchedulerConfig::from_training_config(&cfg, 1.0, 10, 1)
            .unwrap()
            .build()
    }

    fn run(mut scheduler: Box<dyn LRScheduler>, ticks: usize) -> Vec<f64> {
        (0..ticks).map(|_| scheduler.step()).collect()
    }

    #[test]
    fn constant_ignores_warmup() {
        let rates = run(schedule(config::LearningRateSchedule::Constant, 5), 3);
        assert_eq!(rates, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn warmup_then_linear_decay() {
        let rates = run(schedule(config::LearningRateSchedule::Linear, 2), 10);
        assert!((rates[0] - 0.5).abs() < 1e-12);
        assert!((rates[1] - 1.0).abs() < 1e-12);
        assert!((rates[2] - 1.0).abs() < 1e-12);
        assert!((rates[6] - 0.5).abs() < 1e-12);
        assert!(rates.windows(2).skip(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn cosine_reaches_min_at_end() {
        let rates = run(schedule(config::LearningRateSchedule::Cosine, 0), 11);
        assert!((rates[0] - 1.0).abs() < 1e-12);
        assert!(rates[10].abs() < 1e-12);
    }

    #[test]
    fn world_size_stretches_the_schedule() {
        let cfg = config::SchedulerConfig {
            strategy: config::LearningRateSchedule::ConstantWithWarmup,
            warmup_steps: 2,
            ..config::SchedulerConfig::default()
        };
        let mut scheduler = SchedulerConfig::from_training_config(&cfg, 1.0, 10, 2)
            .unwrap()
            .build();
        let rates: Vec<f64> = (0..4).map(|_| scheduler.step()).collect();
        assert_eq!(rates, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn snapshot_resumes_mid_schedule() {
        let mut original = schedule(config::LearningRateSchedule::Polynomial, 1);
        for _ in 0..4 {
            original.step();
        }
        let mut restored = schedule(config::LearningRateSchedule::Polynomial, 1);
        restored.load_snapshot(&original.snapshot()).unwrap();
        assert_eq!(restored.learning_rate(), original.learning_rate());
        assert_eq!(restored.step(), original.step());
    }
}
