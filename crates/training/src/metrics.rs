use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Loss terms averaged over the micro-batches of one optimizer step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLosses {
    pub total: f64,
    pub noise: f64,
    pub pixel: Option<f64>,
    pub segmentation: Option<f64>,
}

#[derive(Debug, Default)]
pub(crate) struct StepAccumulator {
    micro_batches: usize,
    samples: u64,
    total: f64,
    noise: f64,
    pixel: Option<f64>,
    segmentation: Option<f64>,
}

impl StepAccumulator {
    pub(crate) fn accumulate(&mut self, losses: StepLosses, samples: usize) {
        self.micro_batches += 1;
        self.samples += samples as u64;
        self.total += losses.total;
        self.noise += losses.noise;
        if let Some(pixel) = losses.pixel {
            *self.pixel.get_or_insert(0.0) += pixel;
        }
        if let Some(segmentation) = losses.segmentation {
            *self.segmentation.get_or_insert(0.0) += segmentation;
        }
    }

    pub(crate) fn samples(&self) -> u64 {
        self.samples
    }

    pub(crate) fn average(&self) -> Option<StepLosses> {
        if self.micro_batches == 0 {
            return None;
        }
        let n = self.micro_batches as f64;
        Some(StepLosses {
            total: self.total / n,
            noise: self.noise / n,
            pixel: self.pixel.map(|value| value / n),
            segmentation: self.segmentation.map(|value| value / n),
        })
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    samples_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            samples_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, samples: u64, losses: StepLosses, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.samples_processed = self.samples_processed.saturating_add(samples);
        let step_samples_per_sec = if step_duration > Duration::ZERO {
            samples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss_avg = self.loss_ema.update(losses.total);
        let throughput_avg = self.throughput_ema.update(step_samples_per_sec);
        let grad_norm_avg = self.grad_norm_ema.update(grad_norm);

        StepSnapshot {
            loss: loss_avg,
            losses,
            samples,
            step_samples_per_sec,
            samples_per_sec: throughput_avg,
            grad_norm: grad_norm_avg,
            raw_grad_norm: grad_norm,
            total_samples: self.samples_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed total loss.
    pub loss: f64,
    pub losses: StepLosses,
    pub samples: u64,
    pub step_samples_per_sec: f64,
    pub samples_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_samples: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Running sums over validation batches.
#[derive(Debug, Default)]
pub struct ValidationMetrics {
    batches: usize,
    sampled_l1: f64,
    direct_l1: f64,
    pixels: u64,
    sampled_correct: u64,
    direct_correct: u64,
}

impl ValidationMetrics {
    /// `*_l1` are batch means against the raw images; `*_correct` count mask pixels
    /// whose predicted class matches the ground truth out of `pixels`.
    pub fn update(
        &mut self,
        sampled_l1: f64,
        direct_l1: f64,
        pixels: u64,
        sampled_correct: u64,
        direct_correct: u64,
    ) {
        self.batches += 1;
        self.sampled_l1 += sampled_l1;
        self.direct_l1 += direct_l1;
        self.pixels += pixels;
        self.sampled_correct += sampled_correct;
        self.direct_correct += direct_correct;
    }

    pub fn finalize(self) -> Option<ValidationSummary> {
        if self.batches == 0 || self.pixels == 0 {
            return None;
        }
        let batches = self.batches as f64;
        let pixels = self.pixels as f64;
        Some(ValidationSummary {
            batches: self.batches,
            sampled_pixel_l1: self.sampled_l1 / batches,
            direct_pixel_l1: self.direct_l1 / batches,
            sampled_segmentation_accuracy: self.sampled_correct as f64 / pixels,
            direct_segmentation_accuracy: self.direct_correct as f64 / pixels,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSummary {
    pub batches: usize,
    pub sampled_pixel_l1: f64,
    pub direct_pixel_l1: f64,
    pub sampled_segmentation_accuracy: f64,
    pub direct_segmentation_accuracy: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_averages_optional_terms() {
        let mut acc = StepAccumulator::default();
        acc.accumulate(
            StepLosses {
                total: 2.0,
                noise: 1.0,
                pixel: Some(0.5),
                segmentation: None,
            },
            4,
        );
        acc.accumulate(
            StepLosses {
                total: 4.0,
                noise: 3.0,
                pixel: Some(1.5),
                segmentation: None,
            },
            4,
        );
        let avg = acc.average().unwrap();
        assert_eq!(avg.total, 3.0);
        assert_eq!(avg.noise, 2.0);
        assert_eq!(avg.pixel, Some(1.0));
        assert_eq!(avg.segmentation, None);
        assert_eq!(acc.samples(), 8);

        acc.reset();
        assert!(acc.average().is_none());
    }

    #[test]
    fn validation_summary_weights_accuracy_by_pixels() {
        let mut metrics = ValidationMetrics::default();
        metrics.update(0.2, 0.4, 10, 5, 10);
        metrics.update(0.4, 0.2, 30, 30, 0);
        let summary = metrics.finalize().unwrap();
        assert_eq!(summary.batches, 2);
        assert!((summary.sampled_pixel_l1 - 0.3).abs() < 1e-12);
        assert!((summary.sampled_segmentation_accuracy - 35.0 / 40.0).abs() < 1e-12);
        assert!((summary.direct_segmentation_accuracy - 0.25).abs() < 1e-12);
        assert!(ValidationMetrics::default().finalize().is_none());
    }
}
