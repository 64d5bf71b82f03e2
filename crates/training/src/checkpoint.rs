//! Numbered checkpoint directories under the run's output directory:
//!
//! ```text
//! checkpoint-<global_step>/
//!     denoiser/model.safetensors
//!     denoiser_ema/model.safetensors
//!     denoiser_ema/ema.json
//!     optimizer.json
//!     scheduler.json
//!     scaler.json
//!     manifest.json
//! ```

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{
    config::TrainingConfig,
    ema::{EmaModel, EmaState},
    error::to_runtime_error,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const DENOISER_SUBDIR: &str = "denoiser";
pub const EMA_SUBDIR: &str = "denoiser_ema";
pub const MODEL_FILENAME: &str = "model.safetensors";
const EMA_STATE_FILENAME: &str = "ema.json";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the checkpoint directory.
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TrainingProgressSnapshot {
    pub global_step: usize,
    pub epoch: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub master_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaFiles {
    pub weights: FileRecord,
    pub state: FileRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub denoiser: FileRecord,
    pub ema: Option<EmaFiles>,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
}

pub struct SaveRequest<'a> {
    /// The run's output directory; the checkpoint becomes a child of it.
    pub base_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub denoiser: &'a [(String, Var)],
    pub ema: Option<&'a EmaModel>,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub scaler: &'a GradientScaler,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
    pub total_limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub denoiser_weights_path: PathBuf,
    pub ema: Option<(EmaState, PathBuf)>,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub scaler_state: GradientScalerState,
}

/// Checkpoint directories under `base`, sorted by their embedded step ascending.
pub fn list_checkpoints(base: &Path) -> Result<Vec<(usize, PathBuf)>, TrainingError> {
    let mut found = Vec::new();
    if !base.is_dir() {
        return Ok(found);
    }
    let entries = fs::read_dir(base).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            TrainingError::checkpoint(format!("failed to read checkpoint entry: {err}"))
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(step) = parse_checkpoint_step(&name.to_string_lossy()) {
            found.push((step, path));
        }
    }
    found.sort_by_key(|(step, _)| *step);
    Ok(found)
}

fn parse_checkpoint_step(name: &str) -> Option<usize> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

/// Makes room for one more checkpoint: when `limit` is set and at least `limit`
/// checkpoints exist, the oldest are deleted until `limit - 1` remain.
pub fn prune_checkpoints(
    base: &Path,
    limit: Option<usize>,
) -> Result<Vec<PathBuf>, TrainingError> {
    let Some(limit) = limit else {
        return Ok(Vec::new());
    };
    let existing = list_checkpoints(base)?;
    if existing.len() < limit {
        return Ok(Vec::new());
    }
    let remove_count = existing.len() + 1 - limit.max(1);
    let removing: Vec<PathBuf> = existing
        .into_iter()
        .take(remove_count)
        .map(|(_, path)| path)
        .collect();

    info!(
        limit,
        removing = removing.len(),
        "checkpoint limit reached, removing oldest checkpoints"
    );
    for victim in &removing {
        fs::remove_dir_all(victim).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(removing)
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create output directory {}: {err}",
            request.base_dir.display()
        ))
    })?;
    prune_checkpoints(request.base_dir, request.total_limit)?;

    let checkpoint_dir = request.base_dir.join(format!(
        "{}{}",
        CHECKPOINT_PREFIX, request.progress.global_step
    ));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to replace checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir_all(checkpoint_dir.join(DENOISER_SUBDIR))?;

    let denoiser_path = checkpoint_dir.join(DENOISER_SUBDIR).join(MODEL_FILENAME);
    save_weights(
        request
            .denoiser
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect(),
        &denoiser_path,
    )?;
    let denoiser = file_record(&checkpoint_dir, &denoiser_path)?;

    let ema = match request.ema {
        Some(ema) => {
            let ema_dir = checkpoint_dir.join(EMA_SUBDIR);
            fs::create_dir_all(&ema_dir)?;
            let weights_path = ema_dir.join(MODEL_FILENAME);
            save_weights(ema.shadow(), &weights_path)?;
            let state_path = ema_dir.join(EMA_STATE_FILENAME);
            write_json(&state_path, &ema.state())?;
            Some(EmaFiles {
                weights: file_record(&checkpoint_dir, &weights_path)?,
                state: file_record(&checkpoint_dir, &state_path)?,
            })
        }
        None => None,
    };

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let scheduler_path = checkpoint_dir.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &request.scheduler.snapshot())?;
    let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        denoiser,
        ema,
        optimizer: file_record(&checkpoint_dir, &optimizer_path)?,
        scheduler: file_record(&checkpoint_dir, &scheduler_path)?,
        scaler: file_record(&checkpoint_dir, &scaler_path)?,
        progress: request.progress,
        rng: request.rng,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    info!(
        path = %checkpoint_dir.display(),
        step = manifest.progress.global_step,
        "saved checkpoint"
    );
    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Resolves `"latest"` or an explicit checkpoint. `"latest"` with nothing to
/// resume from yields `None`; an explicit checkpoint that does not exist is an
/// error. Bare directory names are looked up under `base`.
pub fn resolve_resume(base: &Path, requested: &str) -> Result<Option<PathBuf>, TrainingError> {
    let requested = requested.trim();
    if requested == "latest" {
        let latest = list_checkpoints(base)?.pop().map(|(_, path)| path);
        if latest.is_none() {
            info!(dir = %base.display(), "no checkpoint to resume from, starting a new run");
        }
        return Ok(latest);
    }

    let direct = PathBuf::from(requested);
    if direct.is_dir() {
        return Ok(Some(direct));
    }
    let nested = base.join(&direct);
    if nested.is_dir() {
        return Ok(Some(nested));
    }
    Err(TrainingError::checkpoint(format!(
        "checkpoint '{requested}' does not exist"
    )))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&manifest_path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let denoiser_weights_path = verified_path(directory, &manifest.denoiser)?;
    let ema = match &manifest.ema {
        Some(files) => {
            let weights = verified_path(directory, &files.weights)?;
            let state: EmaState = read_json(&verified_path(directory, &files.state)?)?;
            Some((state, weights))
        }
        None => None,
    };
    let optimizer_state: OptimizerState =
        read_json(&verified_path(directory, &manifest.optimizer)?)?;
    let scheduler_state: SchedulerState =
        read_json(&verified_path(directory, &manifest.scheduler)?)?;
    let scaler_state: GradientScalerState =
        read_json(&verified_path(directory, &manifest.scaler)?)?;

    Ok(LoadOutcome {
        directory: directory.to_path_buf(),
        manifest,
        denoiser_weights_path,
        ema,
        optimizer_state,
        scheduler_state,
        scaler_state,
    })
}

pub fn read_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>, TrainingError> {
    safetensors::load(path, device).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
    })
}

/// Copies checkpointed weights into `params`. Nothing is written unless every
/// parameter is present with a matching shape and no tensor is left over.
pub fn apply_denoiser_weights(
    params: &[(String, Var)],
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let device = params
        .first()
        .map(|(_, var)| var.as_tensor().device().clone())
        .unwrap_or(Device::Cpu);
    let mut by_name = read_weights(weights_path, &device)?;

    let mut staged = Vec::with_capacity(params.len());
    for (name, var) in params {
        let tensor = by_name.remove(name).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint is missing parameter '{name}'"))
        })?;
        let live = var.as_tensor();
        if tensor.dims() != live.dims() {
            return Err(TrainingError::checkpoint(format!(
                "parameter '{name}' has shape {:?} in the checkpoint but {:?} in the model",
                tensor.dims(),
                live.dims()
            )));
        }
        let tensor = tensor.to_dtype(live.dtype()).map_err(to_runtime_error)?;
        staged.push((var, tensor));
    }

    if !by_name.is_empty() {
        let mut extra = by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains parameters the model does not have: {}",
            extra.join(", ")
        )));
    }

    for (var, tensor) in staged {
        var.set(&tensor).map_err(to_runtime_error)?;
    }
    Ok(())
}

/// Writes the final trained weights outside any numbered checkpoint.
pub fn save_final_weights(
    output_dir: &Path,
    subdir: &str,
    tensors: HashMap<String, Tensor>,
) -> Result<PathBuf, TrainingError> {
    let dir = output_dir.join(subdir);
    fs::create_dir_all(&dir)?;
    let path = dir.join(MODEL_FILENAME);
    save_weights(tensors, &path)?;
    Ok(path)
}

fn save_weights(tensors: HashMap<String, Tensor>, path: &Path) -> Result<(), TrainingError> {
    if tensors.is_empty() {
        return Err(TrainingError::checkpoint("no parameters to save"));
    }
    safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize weights to {}: {err}",
            path.display()
        ))
    })
}

fn verified_path(directory: &Path, record: &FileRecord) -> Result<PathBuf, TrainingError> {
    let path = directory.join(&record.filename);
    let actual = sha256_file(&path)?;
    if actual != record.sha256 {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(path)
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::checkpoint(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(root: &Path, path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .strip_prefix(root)
        .ok()
        .and_then(|relative| relative.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .replace('\\', "/");
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn touch_checkpoint(base: &Path, step: usize) {
        fs::create_dir_all(base.join(format!("{CHECKPOINT_PREFIX}{step}"))).unwrap();
    }

    fn steps(base: &Path) -> Vec<usize> {
        list_checkpoints(base)
            .unwrap()
            .into_iter()
            .map(|(step, _)| step)
            .collect()
    }

    #[test]
    fn listing_sorts_numerically_and_ignores_strays() {
        let dir = tempfile::tempdir().unwrap();
        for step in [1000, 20, 300] {
            touch_checkpoint(dir.path(), step);
        }
        fs::create_dir_all(dir.path().join("validation")).unwrap();
        fs::create_dir_all(dir.path().join("checkpoint-final")).unwrap();
        fs::write(dir.path().join("checkpoint-5"), b"not a directory").unwrap();

        assert_eq!(steps(dir.path()), vec![20, 300, 1000]);
    }

    #[test]
    fn prune_leaves_room_for_one_more() {
        let dir = tempfile::tempdir().unwrap();
        for step in [10, 20, 30, 40, 50] {
            touch_checkpoint(dir.path(), step);
        }
        let removed = prune_checkpoints(dir.path(), Some(3)).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(steps(dir.path()), vec![40, 50]);
        assert!(prune_checkpoints(dir.path(), None).unwrap().is_empty());
        assert!(prune_checkpoints(dir.path(), Some(5)).unwrap().is_empty());
    }

    #[test]
    fn resolve_latest_without_checkpoints_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_resume(dir.path(), "latest").unwrap().is_none());
        assert!(resolve_resume(&dir.path().join("missing"), "latest")
            .unwrap()
            .is_none());
        assert!(matches!(
            resolve_resume(dir.path(), "checkpoint-7"),
            Err(TrainingError::Checkpoint(_))
        ));
    }

    #[test]
    fn resolve_finds_latest_and_bare_names() {
        let dir = tempfile::tempdir().unwrap();
        touch_checkpoint(dir.path(), 9);
        touch_checkpoint(dir.path(), 12);
        assert_eq!(
            resolve_resume(dir.path(), "latest").unwrap(),
            Some(dir.path().join("checkpoint-12"))
        );
        assert_eq!(
            resolve_resume(dir.path(), "checkpoint-9").unwrap(),
            Some(dir.path().join("checkpoint-9"))
        );
    }

    #[test]
    fn mismatched_weights_leave_parameters_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("a".to_string(), Tensor::ones(2, DType::F32, &device).unwrap());
        tensors.insert("b".to_string(), Tensor::ones(3, DType::F32, &device).unwrap());
        save_weights(tensors, &path).unwrap();

        let a = Var::zeros(2, DType::F32, &device).unwrap();
        let b = Var::zeros(4, DType::F32, &device).unwrap();
        let params = vec![("a".to_string(), a.clone()), ("b".to_string(), b)];
        assert!(matches!(
            apply_denoiser_weights(&params, &path),
            Err(TrainingError::Checkpoint(_))
        ));
        assert_eq!(a.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);

        let b = Var::zeros(3, DType::F32, &device).unwrap();
        let params = vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())];
        apply_denoiser_weights(&params, &path).unwrap();
        assert_eq!(b.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 1.0, 1.0]);
    }
}
