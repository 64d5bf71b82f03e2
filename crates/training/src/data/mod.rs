//! Paired CT slice batches: target image, conditioning image, ground-truth label
//! mask and prompt token ids.

use std::path::Path;

use candle_core::{safetensors, DType, Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{debug, info};

use crate::{error::to_runtime_error, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub const IMAGE_KEY: &str = "image";
pub const CONDITION_KEY: &str = "cond";
pub const MASK_KEY: &str = "mask";
pub const INPUT_IDS_KEY: &str = "input_ids";

/// Batch returned by dataset loaders.
#[derive(Debug, Clone)]
pub struct DataBatch {
    /// `(b, c, h, w)` target pixels in `[-1, 1]`.
    pub images: Tensor,
    /// `(b, c, h, w)` degraded conditioning pixels in `[-1, 1]`.
    pub conditions: Tensor,
    /// `(b, c, h, w)` per-channel class ids (`u32`).
    pub masks: Tensor,
    /// `(b, prompt_length)` token ids (`u32`).
    pub input_ids: Tensor,
    pub micro_batch_size: usize,
    pub micro_batch_index: usize,
    pub micro_batches_per_step: usize,
    /// Last micro-batch of an optimizer step (or of the epoch).
    pub ends_accumulation: bool,
    pub epoch: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;

    /// Rewinds to `epoch`, skipping its first `skip_batches` batches.
    fn start_epoch(&mut self, epoch: usize, skip_batches: usize) -> Result<()>;

    fn batches_per_epoch(&self) -> usize;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn start_epoch(&mut self, epoch: usize, skip_batches: usize) -> Result<()> {
        self.inner.start_epoch(epoch, skip_batches)
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.inner.batches_per_epoch()
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl DataLoader for Box<dyn DataLoader> {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        (**self).next_batch()
    }

    fn start_epoch(&mut self, epoch: usize, skip_batches: usize) -> Result<()> {
        (**self).start_epoch(epoch, skip_batches)
    }

    fn batches_per_epoch(&self) -> usize {
        (**self).batches_per_epoch()
    }
}

/// In-memory slice tensors, one row per example.
#[derive(Debug, Clone)]
pub struct SliceDataset {
    images: Tensor,
    conditions: Tensor,
    masks: Tensor,
    input_ids: Tensor,
}

impl SliceDataset {
    pub fn new(images: Tensor, conditions: Tensor, masks: Tensor, input_ids: Tensor) -> Result<Self> {
        let (n, c, h, w) = images.dims4().map_err(to_runtime_error)?;
        if conditions.dims() != images.dims() {
            return Err(TrainingError::initialization(format!(
                "conditioning images {:?} do not match target images {:?}",
                conditions.dims(),
                images.dims()
            )));
        }
        if masks.dims() != [n, c, h, w] {
            return Err(TrainingError::initialization(format!(
                "masks {:?} do not match target images {:?}",
                masks.dims(),
                images.dims()
            )));
        }
        let (ids_n, _) = input_ids.dims2().map_err(to_runtime_error)?;
        if ids_n != n {
            return Err(TrainingError::initialization(format!(
                "{} prompts for {} images",
                ids_n, n
            )));
        }
        Ok(Self {
            images: images.to_dtype(DType::F32).map_err(to_runtime_error)?,
            conditions: conditions.to_dtype(DType::F32).map_err(to_runtime_error)?,
            masks: masks.to_dtype(DType::U32).map_err(to_runtime_error)?,
            input_ids: input_ids.to_dtype(DType::U32).map_err(to_runtime_error)?,
        })
    }

    /// Reads `image`, `cond`, `mask` and `input_ids` from a safetensors file.
    pub fn from_safetensors(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = safetensors::load(path, device).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read slice file {}: {}",
                path.display(),
                err
            ))
        })?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                TrainingError::initialization(format!(
                    "slice file {} has no '{}' tensor",
                    path.display(),
                    key
                ))
            })
        };
        let images = take(IMAGE_KEY)?;
        let conditions = take(CONDITION_KEY)?;
        let masks = take(MASK_KEY)?;
        let input_ids = take(INPUT_IDS_KEY)?;
        Self::new(images, conditions, masks, input_ids)
    }

    pub fn len(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather(&self, indices: &[u32]) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let device = self.images.device();
        let index = Tensor::from_slice(indices, indices.len(), device).map_err(to_runtime_error)?;
        let pick = |t: &Tensor| t.index_select(&index, 0).map_err(to_runtime_error);
        Ok((
            pick(&self.images)?,
            pick(&self.conditions)?,
            pick(&self.masks)?,
            pick(&self.input_ids)?,
        ))
    }
}

/// Rank-sharded, per-epoch shuffled loader over a [`SliceDataset`].
///
/// Every rank sees the same number of examples: the shard is `index % world_size ==
/// rank` truncated to `len / world_size`. Incomplete trailing batches are dropped.
pub struct SliceDataLoader {
    dataset: SliceDataset,
    shard: Vec<u32>,
    order: Vec<u32>,
    batch_size: usize,
    micro_batches_per_step: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
    cursor: usize,
    micro_batch_index: usize,
}

impl SliceDataLoader {
    pub fn new(
        dataset: SliceDataset,
        batch_size: usize,
        gradient_accumulation_steps: usize,
        shuffle: bool,
        seed: u64,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let world_size = world_size.max(1);
        let per_rank = dataset.len() / world_size;
        let shard: Vec<u32> = (0..dataset.len())
            .filter(|index| index % world_size == rank)
            .take(per_rank)
            .map(|index| index as u32)
            .collect();
        if shard.len() < batch_size {
            return Err(TrainingError::initialization(format!(
                "rank {} holds {} slices, fewer than one batch of {}",
                rank,
                shard.len(),
                batch_size
            )));
        }

        info!(
            rank,
            slices = shard.len(),
            batches = shard.len() / batch_size,
            "slice loader ready"
        );

        let mut loader = Self {
            dataset,
            order: shard.clone(),
            shard,
            batch_size,
            micro_batches_per_step: gradient_accumulation_steps.max(1),
            shuffle,
            seed,
            epoch: 0,
            cursor: 0,
            micro_batch_index: 0,
        };
        loader.start_epoch(0, 0)?;
        Ok(loader)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    fn build_batch(&mut self) -> Result<Option<DataBatch>> {
        let per_epoch = self.batches_per_epoch();
        if self.cursor >= per_epoch {
            return Ok(None);
        }

        let start = self.cursor * self.batch_size;
        let indices = &self.order[start..start + self.batch_size];
        let (images, conditions, masks, input_ids) = self.dataset.gather(indices)?;

        let micro_batch_index = self.micro_batch_index;
        self.cursor += 1;
        let last_in_epoch = self.cursor == per_epoch;
        let ends_accumulation =
            micro_batch_index + 1 == self.micro_batches_per_step || last_in_epoch;
        self.micro_batch_index = if ends_accumulation {
            0
        } else {
            micro_batch_index + 1
        };

        Ok(Some(DataBatch {
            images,
            conditions,
            masks,
            input_ids,
            micro_batch_size: self.batch_size,
            micro_batch_index,
            micro_batches_per_step: self.micro_batches_per_step,
            ends_accumulation,
            epoch: self.epoch,
        }))
    }
}

impl DataLoader for SliceDataLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.build_batch() })
    }

    fn start_epoch(&mut self, epoch: usize, skip_batches: usize) -> Result<()> {
        self.order.clone_from(&self.shard);
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.epoch = epoch;
        self.cursor = skip_batches.min(self.batches_per_epoch());
        self.micro_batch_index = 0;
        debug!(epoch, skip_batches, "epoch prepared");
        Ok(())
    }

    fn batches_per_epoch(&self) -> usize {
        self.shard.len() / self.batch_size
    }
}
