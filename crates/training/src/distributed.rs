//! Data-parallel coordination between training workers.
//!
//! Every worker holds a full denoiser replica and a disjoint data shard. The only
//! per-step rendezvous is the gradient average at the accumulation boundary;
//! checkpoint and validation boundaries add an explicit barrier.
//!
//! A worker that leaves the group early, by error or panic, aborts it: peers blocked
//! in a collective, or arriving at one later, get a runtime error instead of
//! waiting forever.

use std::sync::{Arc, Condvar, Mutex};

use crate::TrainingError;

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every worker has reached the same call.
    fn barrier(&self) -> Result<(), TrainingError>;

    /// Replaces `values` with the element-wise mean across workers. All workers
    /// must pass buffers of the same length.
    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), TrainingError>;

    /// Overwrites `values` on every worker with the main process's copy.
    fn broadcast_from_main(&self, values: &mut [f32]) -> Result<(), TrainingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn all_reduce_mean(&self, _values: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast_from_main(&self, _values: &mut [f32]) -> Result<(), TrainingError> {
        Ok(())
    }
}

struct SharedState {
    rendezvous: Rendezvous,
    buffer: Mutex<ReduceBuffer>,
}

/// A reusable barrier that can be aborted.
struct Rendezvous {
    parties: usize,
    state: Mutex<RendezvousState>,
    arrived_all: Condvar,
}

#[derive(Default)]
struct RendezvousState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

impl Rendezvous {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(RendezvousState::default()),
            arrived_all: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<(), TrainingError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TrainingError::runtime("process group barrier poisoned"))?;
        if state.aborted {
            return Err(aborted_error());
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.arrived_all.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .arrived_all
                .wait(state)
                .map_err(|_| TrainingError::runtime("process group barrier poisoned"))?;
        }
        // A barrier that completed before the abort still counts as passed.
        if state.generation != generation {
            Ok(())
        } else {
            Err(aborted_error())
        }
    }

    fn abort(&self) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.aborted = true;
        self.arrived_all.notify_all();
    }
}

fn aborted_error() -> TrainingError {
    TrainingError::runtime("a peer worker left the process group")
}

#[derive(Default)]
struct ReduceBuffer {
    sums: Vec<f64>,
    failed: bool,
}

/// Workers running as threads of one process, reducing through a shared buffer.
pub struct InProcessGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
}

impl InProcessGroup {
    /// One handle per rank; hand each to its own thread.
    pub fn new(world_size: usize) -> Vec<Self> {
        let world_size = world_size.max(1);
        let shared = Arc::new(SharedState {
            rendezvous: Rendezvous::new(world_size),
            buffer: Mutex::new(ReduceBuffer::default()),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn with_buffer<T>(&self, f: impl FnOnce(&mut ReduceBuffer) -> T) -> Result<T, TrainingError> {
        let mut guard = self
            .shared
            .buffer
            .lock()
            .map_err(|_| TrainingError::runtime("process group buffer poisoned"))?;
        Ok(f(&mut guard))
    }
}

impl Drop for InProcessGroup {
    fn drop(&mut self) {
        self.shared.rendezvous.abort();
    }
}

impl ProcessGroup for InProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.shared.rendezvous.wait()
    }

    fn all_reduce_mean(&self, values: &mut [f32]) -> Result<(), TrainingError> {
        if self.world_size == 1 {
            return Ok(());
        }

        // Phases: reset, accumulate, read back. Each ends on the barrier so no
        // worker can touch the buffer for the next phase early.
        if self.rank == 0 {
            self.with_buffer(|buffer| {
                buffer.sums.clear();
                buffer.sums.resize(values.len(), 0.0);
                buffer.failed = false;
            })?;
        }
        self.barrier()?;

        self.with_buffer(|buffer| {
            if buffer.sums.len() != values.len() {
                buffer.failed = true;
                return;
            }
            for (sum, value) in buffer.sums.iter_mut().zip(values.iter()) {
                *sum += *value as f64;
            }
        })?;
        self.barrier()?;

        let world = self.world_size as f64;
        let failed = self.with_buffer(|buffer| {
            if !buffer.failed {
                for (value, sum) in values.iter_mut().zip(&buffer.sums) {
                    *value = (*sum / world) as f32;
                }
            }
            buffer.failed
        })?;
        self.barrier()?;

        if failed {
            return Err(TrainingError::runtime(
                "all_reduce_mean called with mismatched buffer lengths",
            ));
        }
        Ok(())
    }

    fn broadcast_from_main(&self, values: &mut [f32]) -> Result<(), TrainingError> {
        if self.world_size == 1 {
            return Ok(());
        }

        if self.rank == 0 {
            self.with_buffer(|buffer| {
                buffer.sums = values.iter().map(|v| *v as f64).collect();
                buffer.failed = false;
            })?;
        }
        self.barrier()?;

        self.with_buffer(|buffer| {
            if buffer.sums.len() != values.len() {
                buffer.failed = true;
            } else if self.rank != 0 {
                for (value, source) in values.iter_mut().zip(&buffer.sums) {
                    *value = *source as f32;
                }
            }
        })?;
        self.barrier()?;

        let failed = self.with_buffer(|buffer| buffer.failed)?;
        self.barrier()?;

        if failed {
            return Err(TrainingError::runtime(
                "broadcast_from_main called with mismatched buffer lengths",
            ));
        }
        Ok(())
    }
}
