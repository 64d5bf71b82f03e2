use std::{
    fs::{self, File},
    io::{BufWriter, Cursor, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use image::{ImageFormat, RgbImage};
use prost::Message;
use tracing::warn;

use crate::{
    config::LoggingConfig,
    metrics::{StepSnapshot, ValidationSummary},
    TrainingError,
};

const RGB_COLORSPACE: i32 = 3;

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }

    /// Nothing on stdout and no event file; used by non-main ranks.
    pub fn quiet() -> Self {
        Self {
            enable_stdout: false,
            tensorboard_dir: None,
            tensorboard_flush_every_n: 1,
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_training_step(
        &mut self,
        step: usize,
        lr: f64,
        loss_scale: f32,
        snapshot: &StepSnapshot,
    ) {
        let losses = &snapshot.losses;
        if self.settings.enable_stdout {
            println!(
                "train step={} loss={:.4} noise={:.4} pixel={} seg={} samples/s={:.1} grad_norm={:.3} lr={:.5e}",
                step,
                losses.total,
                losses.noise,
                format_optional(losses.pixel),
                format_optional(losses.segmentation),
                snapshot.step_samples_per_sec,
                snapshot.raw_grad_norm,
                lr
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            let mut scalars = vec![
                ("train/loss", losses.total),
                ("train/loss_ema", snapshot.loss),
                ("train/noise_loss", losses.noise),
                ("train/samples_per_sec", snapshot.samples_per_sec),
                ("train/grad_norm", snapshot.raw_grad_norm),
                ("train/learning_rate", lr),
                ("train/loss_scale", loss_scale as f64),
            ];
            if let Some(pixel) = losses.pixel {
                scalars.push(("train/pixel_loss", pixel));
            }
            if let Some(segmentation) = losses.segmentation {
                scalars.push(("train/segmentation_loss", segmentation));
            }
            for (tag, value) in scalars {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    warn!(%err, tag, "dropping tensorboard scalar");
                }
            }
        }
    }

    pub fn log_validation(&mut self, step: usize, summary: &ValidationSummary) {
        if self.settings.enable_stdout {
            println!(
                "validation step={} sampled_l1={:.4} direct_l1={:.4} sampled_seg_acc={:.2}% direct_seg_acc={:.2}% batches={}",
                step,
                summary.sampled_pixel_l1,
                summary.direct_pixel_l1,
                summary.sampled_segmentation_accuracy * 100.0,
                summary.direct_segmentation_accuracy * 100.0,
                summary.batches
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            for (tag, value) in [
                ("validation/sampled_pixel_l1", summary.sampled_pixel_l1),
                ("validation/direct_pixel_l1", summary.direct_pixel_l1),
                (
                    "validation/sampled_segmentation_accuracy",
                    summary.sampled_segmentation_accuracy,
                ),
                (
                    "validation/direct_segmentation_accuracy",
                    summary.direct_segmentation_accuracy,
                ),
            ] {
                if let Err(err) = writer.write_scalar(tag, step, value) {
                    warn!(%err, tag, "dropping tensorboard scalar");
                }
            }
        }
    }

    /// Writes each image as `<png_dir>/<tag>.png` and, when enabled, as a
    /// TensorBoard image summary.
    pub fn log_images(
        &mut self,
        step: usize,
        images: &[(String, RgbImage)],
        png_dir: &Path,
    ) -> Result<(), TrainingError> {
        fs::create_dir_all(png_dir)?;
        for (tag, image) in images {
            let encoded = encode_png(image)?;
            let file_name = format!("{}.png", tag.replace('/', "_"));
            fs::write(png_dir.join(file_name), &encoded)?;

            if let Some(writer) = self.tensorboard.as_mut() {
                if let Err(err) = writer.write_image(tag, step as i64, image, encoded) {
                    warn!(%err, tag = tag.as_str(), "dropping tensorboard image");
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(%err, "failed to flush tensorboard events");
            }
        }
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, TrainingError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .map_err(|err| TrainingError::runtime(format!("failed to encode PNG: {err}")))?;
    Ok(cursor.into_inner())
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        self.write_value(
            step,
            summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
                image: None,
            },
        )
    }

    fn write_image(
        &mut self,
        tag: &str,
        step: i64,
        image: &RgbImage,
        encoded_png: Vec<u8>,
    ) -> Result<(), TrainingError> {
        self.write_value(
            step,
            summary::Value {
                tag: tag.to_string(),
                simple_value: None,
                image: Some(summary::Image {
                    height: image.height() as i32,
                    width: image.width() as i32,
                    colorspace: RGB_COLORSPACE,
                    encoded_image_string: encoded_png,
                }),
            },
        )
    }

    fn write_value(&mut self, step: i64, value: summary::Value) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary { value: vec![value] }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
        #[prost(message, optional, tag = "4")]
        pub image: Option<Image>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Image {
        #[prost(int32, tag = "1")]
        pub height: i32,
        #[prost(int32, tag = "2")]
        pub width: i32,
        #[prost(int32, tag = "3")]
        pub colorspace: i32,
        #[prost(bytes = "vec", tag = "4")]
        pub encoded_image_string: Vec<u8>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_land_as_png_files_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let tb_dir = dir.path().join("tb");
        let mut logger = Logger::new(LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(tb_dir.clone()),
            tensorboard_flush_every_n: 1,
        })
        .unwrap();

        let image = RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        let png_dir = dir.path().join("validation").join("step-4");
        logger
            .log_images(4, &[("validation/sampled".to_string(), image)], &png_dir)
            .unwrap();
        logger.flush();

        let png = fs::read(png_dir.join("validation_sampled.png")).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let event_files: Vec<_> = fs::read_dir(&tb_dir).unwrap().collect();
        assert_eq!(event_files.len(), 1);
        let size = event_files[0].as_ref().unwrap().metadata().unwrap().len();
        assert!(size as usize > png.len());
    }
}
