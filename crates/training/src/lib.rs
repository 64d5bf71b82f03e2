pub mod checkpoint;
pub mod components;
pub mod config;
pub mod data;
pub mod distributed;
pub mod ema;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;
pub mod validation;

pub use components::{build_components, select_device, TrainingComponents};
pub use config::TrainingConfig;
pub use data::{BlockingDataLoader, DataBatch, DataLoader, SliceDataLoader, SliceDataset};
pub use distributed::{InProcessGroup, ProcessGroup, SingleProcess};
pub use ema::EmaModel;
pub use error::TrainingError;
pub use loss::{LossComposer, LossMode, LossTerms};
pub use optimizer::{OptimizerState, TrainerOptimizer};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{DiffusionDraw, StepOutput, Trainer, TrainingSummary};
