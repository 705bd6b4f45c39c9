//! Simulated compute device.
//!
//! Commands from every queue are executed in submission order by a single
//! worker thread. Completion callbacks run on that thread.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use pathring_core::config::RuntimeConfig;
use pathring_core::device::{
    BufferId, CompletionCallback, CompletionStatus, CompletionToken, Device, Kernel, QueueId,
};
use pathring_core::error::{PathRingError, Result};
use pathring_core::handle::{Path, Raster, TypedHandle};

use crate::block_pool::BlockPool;
use crate::inspect::{self, DecodedPath, Layout};
use crate::kernels::{self, BufferSlot, Counters, DeviceMemory, RasterInfo};

enum Op {
    Kernel(Kernel),
    Map(BufferId),
    Unmap(BufferId, Vec<u32>),
}

struct Command {
    token: u64,
    op: Op,
}

struct State {
    memory: DeviceMemory,
    /// Host storage of completed maps.
    mappings: HashMap<BufferId, Vec<u32>>,
    completed_through: u64,
    callbacks: HashMap<u64, CompletionCallback>,
    /// Failures nobody has asked about yet.
    failures: HashMap<u64, String>,
    fail_next: Option<String>,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    done: Condvar,
    counters: Counters,
}

/// Statistics snapshot of a [`CpuDevice`].
#[derive(Debug, Clone, Default)]
pub struct CpuDeviceStats {
    /// Kernels executed.
    pub kernels: u64,
    /// Kernels that failed.
    pub failures: u64,
    /// Blocks copied from rings into the pool.
    pub blocks_copied: u64,
    /// Paths published to the handle map.
    pub paths_published: u64,
    /// Paths whose blocks went back to the pool.
    pub paths_reclaimed: u64,
    /// Rasters built.
    pub rasters_built: u64,
    /// Free pool blocks.
    pub pool_available: u32,
    /// Pool capacity.
    pub pool_capacity: u32,
}

/// Device simulated on a worker thread.
pub struct CpuDevice {
    shared: Arc<Shared>,
    commands: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_queue: AtomicU32,
    next_buffer: AtomicU32,
    next_token: AtomicU64,
}

impl CpuDevice {
    /// Creates a device sized for `config` and starts its worker.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let layout = Layout {
            block_words: config.block.block_words as usize,
            subblock_words: config.block.subblock_words as usize,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                memory: DeviceMemory {
                    layout,
                    buffers: HashMap::new(),
                    pool: BlockPool::new(config.device.pool_blocks, layout.block_words),
                    handle_map: HashMap::new(),
                    rasters: HashMap::new(),
                    allocated: HashSet::new(),
                },
                mappings: HashMap::new(),
                completed_through: 0,
                callbacks: HashMap::new(),
                failures: HashMap::new(),
                fail_next: None,
                stopped: false,
            }),
            done: Condvar::new(),
            counters: Counters::default(),
        });

        let (tx, rx) = unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("pathring-cpu".to_string())
            .spawn(move || run(worker_shared, rx))
            .map_err(|e| PathRingError::BackendUnavailable(format!("cannot start worker: {e}")))?;

        info!(
            pool_blocks = config.device.pool_blocks,
            block_words = layout.block_words,
            "CPU device started"
        );

        Ok(Self {
            shared,
            commands: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            next_queue: AtomicU32::new(0),
            next_buffer: AtomicU32::new(0),
            next_token: AtomicU64::new(0),
        })
    }

    fn submit(&self, op: Op) -> Result<CompletionToken> {
        let commands = self.commands.lock();
        let tx = commands.as_ref().ok_or(PathRingError::DeviceLost)?;
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        tx.send(Command { token, op })
            .map_err(|_| PathRingError::DeviceLost)?;
        Ok(CompletionToken(token))
    }

    /// The next kernel reports failure with `reason`.
    pub fn fail_next_kernel(&self, reason: impl Into<String>) {
        self.shared.state.lock().fail_next = Some(reason.into());
    }

    /// Decodes a published path.
    pub fn decode_path(&self, path: Path) -> Result<DecodedPath> {
        let handle = path
            .handle()
            .ok_or(PathRingError::HandleInvalid { handle: path.raw() })?;
        let state = self.shared.state.lock();
        let memory = &state.memory;
        let head = *memory
            .handle_map
            .get(&handle)
            .ok_or(PathRingError::HandleInvalid { handle: path.raw() })?;
        inspect::walk(&memory.pool, memory.layout, head)
            .and_then(|walk| inspect::decode(&memory.pool, memory.layout, &walk))
            .map_err(PathRingError::DeviceError)
    }

    /// True once a path's head has been published.
    pub fn is_published(&self, path: Path) -> bool {
        path.handle()
            .map(|h| self.shared.state.lock().memory.handle_map.contains_key(&h))
            .unwrap_or(false)
    }

    /// What the build kernel recorded for a raster.
    pub fn raster_info(&self, raster: Raster) -> Option<RasterInfo> {
        let handle = raster.handle()?;
        self.shared.state.lock().memory.rasters.get(&handle).copied()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CpuDeviceStats {
        let counters = &self.shared.counters;
        let state = self.shared.state.lock();
        CpuDeviceStats {
            kernels: counters.kernels.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            blocks_copied: counters.blocks_copied.load(Ordering::Relaxed),
            paths_published: counters.paths_published.load(Ordering::Relaxed),
            paths_reclaimed: counters.paths_reclaimed.load(Ordering::Relaxed),
            rasters_built: counters.rasters_built.load(Ordering::Relaxed),
            pool_available: state.memory.pool.available(),
            pool_capacity: state.memory.pool.capacity(),
        }
    }

    /// Stops the worker after it drains the submitted commands.
    pub fn shutdown(&self) {
        // dropping the sender ends the worker loop
        self.commands.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("CPU device worker panicked");
            }
            info!("CPU device shut down");
        }
    }
}

fn run(shared: Arc<Shared>, rx: Receiver<Command>) {
    while let Ok(Command { token, op }) = rx.recv() {
        let status = {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            let result = match op {
                Op::Kernel(kernel) => {
                    let name = kernel.name();
                    let result = match state.fail_next.take() {
                        Some(reason) => Err(reason),
                        None => kernels::execute(&mut state.memory, &kernel, &shared.counters),
                    };
                    if let Err(reason) = &result {
                        shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(kernel = name, token, reason = %reason, "kernel failed");
                    }
                    result
                }
                Op::Map(buffer) => match state.memory.buffers.get_mut(&buffer) {
                    Some(slot) => match std::mem::replace(slot, BufferSlot::Mapped) {
                        BufferSlot::Resident(words) => {
                            state.mappings.insert(buffer, words);
                            Ok(())
                        }
                        BufferSlot::Mapped => Err(format!("map of mapped buffer {}", buffer.0)),
                    },
                    None => Err(format!("map of unknown buffer {}", buffer.0)),
                },
                Op::Unmap(buffer, words) => match state.memory.buffers.get_mut(&buffer) {
                    Some(slot) if matches!(slot, BufferSlot::Mapped) => {
                        *slot = BufferSlot::Resident(words);
                        Ok(())
                    }
                    _ => Err(format!("unmap of a buffer that is not mapped: {}", buffer.0)),
                },
            };
            let status = match result {
                Ok(()) => CompletionStatus::Complete,
                Err(reason) => CompletionStatus::Failed(reason),
            };
            state.completed_through = token;
            let callback = state.callbacks.remove(&token);
            if callback.is_none() {
                if let CompletionStatus::Failed(reason) = &status {
                    state.failures.insert(token, reason.clone());
                }
            }
            shared.done.notify_all();
            callback.map(|cb| (cb, status))
        };
        if let Some((callback, status)) = status {
            callback(status);
        }
    }

    let mut state = shared.state.lock();
    state.stopped = true;
    shared.done.notify_all();
    debug!("CPU device worker exiting");
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_queue(&self) -> Result<QueueId> {
        Ok(QueueId(self.next_queue.fetch_add(1, Ordering::Relaxed)))
    }

    fn create_buffer(&self, words: usize) -> Result<BufferId> {
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
        self.shared
            .state
            .lock()
            .memory
            .buffers
            .insert(id, BufferSlot::Resident(vec![0; words]));
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.mappings.remove(&buffer);
        state
            .memory
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| PathRingError::device(format!("release of unknown buffer {}", buffer.0)))
    }

    fn enqueue_kernel(&self, _queue: QueueId, kernel: Kernel) -> Result<CompletionToken> {
        self.submit(Op::Kernel(kernel))
    }

    fn set_completion_callback(
        &self,
        token: CompletionToken,
        callback: CompletionCallback,
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if token.0 <= state.completed_through {
            let status = match state.failures.remove(&token.0) {
                Some(reason) => CompletionStatus::Failed(reason),
                None => CompletionStatus::Complete,
            };
            drop(state);
            callback(status);
        } else {
            state.callbacks.insert(token.0, callback);
        }
        Ok(())
    }

    fn map_buffer(&self, _queue: QueueId, buffer: BufferId) -> Result<CompletionToken> {
        self.submit(Op::Map(buffer))
    }

    fn unmap_buffer(
        &self,
        _queue: QueueId,
        buffer: BufferId,
        data: Vec<u32>,
    ) -> Result<CompletionToken> {
        self.submit(Op::Unmap(buffer, data))
    }

    fn take_mapping(&self, buffer: BufferId) -> Result<Vec<u32>> {
        self.shared
            .state
            .lock()
            .mappings
            .remove(&buffer)
            .ok_or_else(|| PathRingError::device(format!("no completed map of buffer {}", buffer.0)))
    }

    fn wait(&self, token: CompletionToken) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.completed_through < token.0 {
            if state.stopped {
                return Err(PathRingError::DeviceLost);
            }
            self.shared.done.wait(&mut state);
        }
        match state.failures.remove(&token.0) {
            Some(reason) => Err(PathRingError::device(reason)),
            None => Ok(()),
        }
    }

    fn is_complete(&self, token: CompletionToken) -> bool {
        self.shared.state.lock().completed_through >= token.0
    }

    fn flush(&self, _queue: QueueId) -> Result<()> {
        Ok(())
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn device() -> CpuDevice {
        CpuDevice::new(&RuntimeConfig::minimal()).unwrap()
    }

    #[test]
    fn test_map_round_trip() {
        let device = device();
        let queue = device.create_queue().unwrap();
        let buffer = device.create_buffer(4).unwrap();

        let token = device.map_buffer(queue, buffer).unwrap();
        device.wait(token).unwrap();
        let mut words = device.take_mapping(buffer).unwrap();
        assert_eq!(words, vec![0; 4]);
        words[2] = 7;

        device.unmap_buffer(queue, buffer, words).unwrap();
        let token = device.map_buffer(queue, buffer).unwrap();
        device.wait(token).unwrap();
        assert_eq!(device.take_mapping(buffer).unwrap()[2], 7);
    }

    #[test]
    fn test_callback_after_completion() {
        let device = device();
        let queue = device.create_queue().unwrap();
        let token = device
            .enqueue_kernel(queue, Kernel::RastersBuild { paths: vec![], rasters: vec![] })
            .unwrap();
        device.wait(token).unwrap();
        assert!(device.is_complete(token));

        let (tx, rx) = mpsc::channel();
        device
            .set_completion_callback(token, Box::new(move |status| tx.send(status).unwrap()))
            .unwrap();
        assert_eq!(rx.recv().unwrap(), CompletionStatus::Complete);
    }

    #[test]
    fn test_injected_failure_reaches_callback() {
        let device = device();
        let queue = device.create_queue().unwrap();
        device.fail_next_kernel("boom");
        let token = device
            .enqueue_kernel(queue, Kernel::PathsReclaim { handles: vec![] })
            .unwrap();
        let (tx, rx) = mpsc::channel();
        device
            .set_completion_callback(token, Box::new(move |status| tx.send(status).unwrap()))
            .unwrap();
        assert_eq!(rx.recv().unwrap(), CompletionStatus::Failed("boom".to_string()));
        assert_eq!(device.stats().failures, 1);
    }

    #[test]
    fn test_shutdown_fails_new_commands() {
        let device = device();
        let queue = device.create_queue().unwrap();
        device.shutdown();
        assert_eq!(
            device.map_buffer(queue, BufferId(0)),
            Err(PathRingError::DeviceLost)
        );
    }
}
