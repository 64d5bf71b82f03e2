use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
};

use clap::Parser;
use serde_json::{Map, Number, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use training::{InProcessGroup, ProcessGroup, Trainer, TrainingConfig, TrainingError, TrainingSummary};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Segmentation-consistent latent diffusion trainer", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(
        long,
        value_name = "latest|PATH",
        help = "Resume from the newest checkpoint or from a specific checkpoint directory"
    )]
    resume: Option<String>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(resume) = args.resume {
        config.runtime.resume_from_checkpoint = Some(resume);
    }
    config.validate()?;

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    let summary = if config.distributed.world_size > 1 {
        train_in_process(config, shutdown_flag)?
    } else {
        let mut trainer = Trainer::new(config)?;
        trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?
    };

    info!(
        global_step = summary.global_step,
        final_loss = ?summary.final_loss,
        weights = ?summary.final_weights,
        "training finished"
    );
    Ok(())
}

/// One worker thread per rank sharing an [`InProcessGroup`]. Returns the main
/// worker's summary, or the first error any worker reports.
fn train_in_process(
    config: TrainingConfig,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<TrainingSummary, TrainingError> {
    let world_size = config.distributed.world_size;
    let (sender, receiver) = mpsc::channel();
    for group in InProcessGroup::new(world_size) {
        let mut config = config.clone();
        let rank = group.rank();
        config.distributed.rank = rank;
        let flag = shutdown_flag.clone();
        let sender = sender.clone();
        thread::spawn(move || {
            let group: Arc<dyn ProcessGroup> = Arc::new(group);
            let result = Trainer::with_process_group(config, group)
                .and_then(|mut trainer| trainer.train_with_shutdown(|| flag.load(Ordering::Relaxed)));
            // The receiver is gone once another rank has failed.
            let _ = sender.send((rank, result));
        });
    }
    drop(sender);

    let mut main_summary = None;
    for _ in 0..world_size {
        let (rank, result) = receiver
            .recv()
            .map_err(|_| TrainingError::runtime("a worker panicked before reporting"))?;
        let summary = result.map_err(|err| {
            error!(rank, error = %err, "worker failed");
            err
        })?;
        if rank == 0 {
            main_summary = Some(summary);
        }
    }
    main_summary.ok_or_else(|| TrainingError::runtime("no worker reported a summary"))
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::runtime(format!(
            "override path '{path}' has an empty segment"
        )));
    }

    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(TrainingError::runtime(format!(
                "override path segment '{}' points to non-object value",
                segment
            )));
        };
        if idx + 1 == segments.len() {
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_typed() {
        assert_eq!(parse_override_value("true"), Value::Bool(true));
        assert_eq!(parse_override_value("12"), Value::from(12));
        assert_eq!(parse_override_value("0.5"), Value::from(0.5));
        assert_eq!(parse_override_value("latest"), Value::from("latest"));
    }

    #[test]
    fn overrides_create_nested_objects() {
        let mut value = serde_json::json!({ "runtime": { "seed": 1 } });
        set_value_at_path(&mut value, "runtime.seed", Value::from(7)).unwrap();
        set_value_at_path(&mut value, "loss.snr_gamma", Value::from(5.0)).unwrap();
        assert_eq!(value["runtime"]["seed"], 7);
        assert_eq!(value["loss"]["snr_gamma"], 5.0);
        assert!(set_value_at_path(&mut value, "runtime.seed.inner", Value::Null).is_err());
        assert!(set_value_at_path(&mut value, "runtime..seed", Value::Null).is_err());
    }
}
