mod common;

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use candle_core::{safetensors, Device, Tensor};
use serde_json::Value;
use sha2::{Digest, Sha256};
use training::{
    checkpoint::list_checkpoints,
    config::NonFinitePolicy,
    InProcessGroup, ProcessGroup, SingleProcess, SliceDataset, Trainer, TrainingError,
};

use common::{components, config, random_dataset, values, CHANNELS, PROMPT, SIZE};

fn single(
    config: training::TrainingConfig,
    data: SliceDataset,
    validation: Option<SliceDataset>,
    names: [&'static str; 2],
) -> Result<Trainer> {
    let device = Device::Cpu;
    let parts = components(data, validation, names, &device)?;
    Ok(Trainer::from_components(
        config,
        parts,
        device,
        Arc::new(SingleProcess),
    )?)
}

fn steps(dir: &Path) -> Result<Vec<usize>> {
    Ok(list_checkpoints(dir)?.into_iter().map(|(step, _)| step).collect())
}

fn all_values(trainer: &Trainer) -> Result<Vec<Vec<f32>>> {
    trainer.parameters().iter().map(|(_, var)| values(var)).collect()
}

/// Re-records the digest of the file behind `pointer` (e.g. `/denoiser`) after
/// the file was rewritten, so only the file's contents are in question.
fn rehash_recorded_file(checkpoint: &Path, pointer: &str) -> Result<()> {
    let manifest_path = checkpoint.join("manifest.json");
    let mut manifest: Value = serde_json::from_slice(&fs::read(&manifest_path)?)?;
    let record = manifest
        .pointer_mut(pointer)
        .with_context(|| format!("manifest has no record at {pointer}"))?;
    let filename = record["filename"]
        .as_str()
        .context("record without filename")?
        .to_string();
    let contents = fs::read(checkpoint.join(filename))?;
    record["sha256"] = Value::from(hex::encode(Sha256::digest(&contents)));
    record["bytes"] = Value::from(contents.len() as u64);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;
    Ok(())
}

fn train_two_steps_with_checkpoint(dir: &Path, data: &SliceDataset) -> Result<std::path::PathBuf> {
    let mut cfg = config(dir)?;
    cfg.runtime.max_train_steps = Some(2);
    cfg.runtime.checkpointing_steps = 2;
    single(cfg, data.clone(), None, ["gain", "shift"])?.train()?;
    Ok(dir.join("checkpoint-2"))
}

/// With `epsilon = 1` the first AdamW update is `lr * g / (|g| + 1)`; invert it.
fn first_step_gradient(before: f32, after: f32, learning_rate: f64) -> f64 {
    let u = (before - after) as f64 / learning_rate;
    u.signum() * u.abs() / (1.0 - u.abs())
}

#[test]
fn smoke_training_checkpoint_resume() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data = random_dataset(8, &Device::Cpu)?;

    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(4);
    cfg.runtime.checkpointing_steps = 2;
    let mut trainer = single(cfg.clone(), data.clone(), None, ["gain", "shift"])?;
    let summary = trainer.train()?;

    assert_eq!(summary.global_step, 4);
    assert!(summary.final_loss.is_some_and(f64::is_finite));
    let weights = summary.final_weights.expect("main process writes final weights");
    assert!(weights.is_file());
    assert_eq!(steps(tmp.path())?, vec![2, 4]);
    let trained: Vec<Vec<f32>> = trainer
        .parameters()
        .iter()
        .map(|(_, var)| values(var))
        .collect::<Result<_>>()?;
    assert_ne!(trained[0], vec![1.0]);

    cfg.runtime.max_train_steps = Some(6);
    cfg.runtime.resume_from_checkpoint = Some("latest".into());
    let mut resumed = single(cfg, data, None, ["gain", "shift"])?;
    assert_eq!(resumed.global_step(), 4);
    assert_eq!(resumed.first_epoch(), 1);
    for ((_, var), expected) in resumed.parameters().iter().zip(&trained) {
        assert_eq!(&values(var)?, expected);
    }

    let summary = resumed.train()?;
    assert_eq!(summary.global_step, 6);
    assert_eq!(steps(tmp.path())?, vec![2, 4, 6]);
    Ok(())
}

#[test]
fn retention_keeps_the_newest_checkpoints() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(5);
    cfg.runtime.checkpointing_steps = 1;
    cfg.runtime.checkpoints_total_limit = Some(3);

    let mut trainer = single(cfg, random_dataset(8, &Device::Cpu)?, None, ["gain", "shift"])?;
    trainer.train()?;
    assert_eq!(steps(tmp.path())?, vec![3, 4, 5]);
    Ok(())
}

#[test]
fn latest_without_checkpoints_starts_fresh() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.resume_from_checkpoint = Some("latest".into());

    let mut trainer = single(cfg, random_dataset(8, &Device::Cpu)?, None, ["gain", "shift"])?;
    assert_eq!(trainer.global_step(), 0);
    assert_eq!(trainer.first_epoch(), 0);
    assert!(trainer.resume("latest")?.is_none());
    Ok(())
}

#[test]
fn missing_explicit_checkpoint_is_an_error() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.resume_from_checkpoint = Some("checkpoint-77".into());

    let err = single(cfg, random_dataset(8, &Device::Cpu)?, None, ["gain", "shift"])
        .err()
        .expect("resume must fail");
    assert!(matches!(
        err.downcast_ref::<TrainingError>(),
        Some(TrainingError::Checkpoint(_))
    ));
    Ok(())
}

#[test]
fn mismatched_checkpoint_falls_back_to_base_denoiser() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data = random_dataset(8, &Device::Cpu)?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(2);
    cfg.runtime.checkpointing_steps = 2;
    single(cfg.clone(), data.clone(), None, ["gain", "shift"])?.train()?;

    cfg.runtime.resume_from_checkpoint = Some("latest".into());
    let resumed = single(cfg, data, None, ["scale", "offset"])?;
    assert_eq!(resumed.global_step(), 2);
    // The saved EMA tracks the old names, so it restarts with the rebuilt network.
    assert_eq!(resumed.ema().map(|ema| ema.optimization_step()), Some(0));
    let restored: Vec<(String, Vec<f32>)> = resumed
        .parameters()
        .iter()
        .map(|(name, var)| Ok((name.clone(), values(var)?)))
        .collect::<Result<_>>()?;
    assert_eq!(
        restored,
        vec![
            ("offset".to_string(), vec![0.0]),
            ("scale".to_string(), vec![1.0]),
        ]
    );
    Ok(())
}

#[test]
fn validation_writes_panels_and_restores_live_weights() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Device::Cpu;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(2);
    cfg.runtime.validation.num_inference_steps = 2;

    let mut trainer = single(
        cfg,
        random_dataset(8, &device)?,
        Some(random_dataset(2, &device)?),
        ["gain", "shift"],
    )?;
    trainer.train()?;

    let before: Vec<Vec<f32>> = trainer
        .parameters()
        .iter()
        .map(|(_, var)| values(var))
        .collect::<Result<_>>()?;
    let summary = trainer.run_validation()?.expect("validation data is configured");
    assert_eq!(summary.batches, 1);
    assert!((0.0..=1.0).contains(&summary.sampled_segmentation_accuracy));
    assert!(summary.direct_pixel_l1.is_finite());

    for ((_, var), expected) in trainer.parameters().iter().zip(&before) {
        assert_eq!(&values(var)?, expected);
    }
    let panels = tmp.path().join("validation").join("step-2");
    for name in ["validation_sampled.png", "validation_direct_segmentation.png"] {
        assert!(panels.join(name).is_file(), "missing {name}");
    }
    Ok(())
}

#[test]
fn stop_request_ends_after_one_step() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(4);

    let mut trainer = single(cfg, random_dataset(8, &Device::Cpu)?, None, ["gain", "shift"])?;
    let summary = trainer.train_with_shutdown(|| true)?;
    assert_eq!(summary.global_step, 1);
    Ok(())
}

#[test]
fn fail_fast_rejects_non_finite_loss() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Device::Cpu;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.non_finite = NonFinitePolicy::FailFast;

    let images = Tensor::full(f32::NAN, (4, CHANNELS, SIZE, SIZE), &device)?;
    let masks = Tensor::zeros((4, CHANNELS, SIZE, SIZE), candle_core::DType::U32, &device)?;
    let ids = Tensor::zeros((4, PROMPT), candle_core::DType::U32, &device)?;
    let data = SliceDataset::new(images.clone(), images, masks, ids)?;

    let mut trainer = single(cfg, data, None, ["gain", "shift"])?;
    match trainer.train() {
        Err(TrainingError::NonFinite { step, value }) => {
            assert_eq!(step, 1);
            assert!(value.is_nan());
        }
        other => panic!("expected a non-finite error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn workers_stay_in_lockstep() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data = random_dataset(8, &Device::Cpu)?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(2);
    cfg.distributed.world_size = 2;

    let workers: Vec<_> = InProcessGroup::new(2)
        .into_iter()
        .map(|group| {
            let mut cfg = cfg.clone();
            cfg.distributed.rank = group.rank();
            let data = data.clone();
            thread::spawn(move || -> Result<(bool, Vec<Vec<f32>>)> {
                let device = Device::Cpu;
                let parts = components(data, None, ["gain", "shift"], &device)?;
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let mut trainer = Trainer::from_components(cfg, parts, device, group)?;
                let summary = trainer.train()?;
                assert_eq!(summary.global_step, 2);
                let params = trainer
                    .parameters()
                    .iter()
                    .map(|(_, var)| values(var))
                    .collect::<Result<_>>()?;
                Ok((summary.final_weights.is_some(), params))
            })
        })
        .collect();

    let results = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker panicked"))
        .collect::<Result<Vec<_>>>()?;
    assert!(results[0].0);
    assert!(!results[1].0);
    assert_eq!(results[0].1, results[1].1);
    Ok(())
}

#[test]
fn gradient_norm_is_clipped_before_the_update() -> Result<()> {
    // Far below any gradient the random batch produces.
    const MAX_NORM: f64 = 1e-4;
    let tmp = tempfile::tempdir()?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(1);
    cfg.optimizer.learning_rate = 1.0;
    cfg.optimizer.epsilon = 1.0;
    cfg.optimizer.weight_decay = 0.0;
    cfg.optimizer.max_grad_norm = Some(MAX_NORM);

    let mut trainer = single(cfg, random_dataset(4, &Device::Cpu)?, None, ["gain", "shift"])?;
    let before = all_values(&trainer)?;
    trainer.train()?;
    let after = all_values(&trainer)?;

    let applied: Vec<f64> = before
        .iter()
        .zip(&after)
        .map(|(b, a)| first_step_gradient(b[0], a[0], 1.0))
        .collect();
    let norm = applied.iter().map(|g| g * g).sum::<f64>().sqrt();
    assert!((norm - MAX_NORM).abs() < 0.02 * MAX_NORM, "applied gradient norm {norm}");
    Ok(())
}

#[test]
fn gradient_accumulation_counts_optimizer_steps() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cfg = config(tmp.path())?;
    cfg.data.gradient_accumulation_steps = 2;
    cfg.runtime.max_train_steps = None;
    cfg.runtime.num_train_epochs = 2;
    cfg.runtime.checkpointing_steps = 2;

    // 8 samples in batches of 2 give 4 micro-batches, so 2 updates per epoch.
    let mut trainer = single(cfg, random_dataset(8, &Device::Cpu)?, None, ["gain", "shift"])?;
    assert_eq!(trainer.max_train_steps(), 4);
    let summary = trainer.train()?;
    assert_eq!(summary.global_step, 4);
    let ema = trainer.ema().expect("EMA is on by default");
    assert_eq!(ema.optimization_step(), 4);
    assert_eq!(steps(tmp.path())?, vec![2, 4]);
    Ok(())
}

#[test]
fn departed_worker_fails_its_peers_instead_of_hanging() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data = random_dataset(8, &Device::Cpu)?;
    let mut cfg = config(tmp.path())?;
    cfg.runtime.max_train_steps = Some(2);
    cfg.distributed.world_size = 2;

    let (sender, receiver) = mpsc::channel();
    for group in InProcessGroup::new(2) {
        let mut cfg = cfg.clone();
        let rank = group.rank();
        cfg.distributed.rank = rank;
        let data = data.clone();
        let sender = sender.clone();
        thread::spawn(move || {
            let device = Device::Cpu;
            let result = components(data, None, ["gain", "shift"], &device).and_then(|parts| {
                let group: Arc<dyn ProcessGroup> = Arc::new(group);
                let mut trainer = Trainer::from_components(cfg, parts, device, group)?;
                if rank == 1 {
                    // Leaves right after start-up, dropping its group handle.
                    return Ok(None);
                }
                Ok(Some(trainer.train()))
            });
            let _ = sender.send((rank, result));
        });
    }
    drop(sender);

    let mut main_result = None;
    for _ in 0..2 {
        let (rank, result) = receiver
            .recv_timeout(Duration::from_secs(60))
            .context("a worker is still blocked")?;
        if rank == 0 {
            main_result = result?;
        }
    }
    match main_result {
        Some(Err(TrainingError::Runtime(_))) => {}
        other => panic!("expected a runtime error on rank 0, got {other:?}"),
    }
    Ok(())
}

#[test]
fn failed_resume_keeps_live_state() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data = random_dataset(8, &Device::Cpu)?;
    let checkpoint = train_two_steps_with_checkpoint(tmp.path(), &data)?;
    fs::write(checkpoint.join("denoiser_ema").join("model.safetensors"), b"not safetensors")?;
    rehash_recorded_file(&checkpoint, "/ema/weights")?;

    let mut trainer = single(config(tmp.path())?, data, None, ["gain", "shift"])?;
    let before = all_values(&trainer)?;
    let err = trainer.resume("latest").err().context("resume must fail")?;
    assert!(matches!(err, TrainingError::Checkpoint(_)));
    assert!(trainer.ema().is_some());
    assert_eq!(all_values(&trainer)?, before);
    assert_eq!(trainer.global_step(), 0);
    Ok(())
}

#[test]
fn fallback_rebuild_still_restores_checkpoint_ema() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let device = Device::Cpu;
    let data = random_dataset(8, &device)?;
    let checkpoint = train_two_steps_with_checkpoint(tmp.path(), &data)?;

    let foreign: HashMap<String, Tensor> =
        HashMap::from([("other".to_string(), Tensor::ones(1, candle_core::DType::F32, &device)?)]);
    safetensors::save(&foreign, checkpoint.join("denoiser").join("model.safetensors"))?;
    rehash_recorded_file(&checkpoint, "/denoiser")?;
    let saved_shadow = safetensors::load(checkpoint.join("denoiser_ema").join("model.safetensors"), &device)?;

    let mut cfg = config(tmp.path())?;
    cfg.runtime.resume_from_checkpoint = Some("latest".into());
    let resumed = single(cfg, data, None, ["gain", "shift"])?;
    assert_eq!(resumed.global_step(), 2);
    assert_eq!(all_values(&resumed)?, vec![vec![1.0], vec![0.0]]);

    let ema = resumed.ema().context("EMA is on by default")?;
    assert_eq!(ema.optimization_step(), 2);
    let shadow = ema.shadow();
    for (name, saved) in &saved_shadow {
        let restored = shadow.get(name).with_context(|| format!("missing {name}"))?;
        assert_eq!(
            restored.flatten_all()?.to_vec1::<f32>()?,
            saved.flatten_all()?.to_vec1::<f32>()?
        );
    }
    Ok(())
}
