//! Runtime context and cooperative dispatcher.
//!
//! The runtime owns the handle pool, the grid scheduler, the host temporary
//! allocator and the queue pool. Builders hold a [`SharedRuntime`] back
//! reference and register themselves as grid owners.
//!
//! Device completions arrive on the device's thread and are forwarded as
//! [`Completion`] messages into the runtime's inbox. Nothing else crosses
//! threads: every state change happens on the thread that calls
//! [`Runtime::dispatch`] or [`Runtime::yield_now`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::device::{CompletionStatus, CompletionToken, Device, Kernel, QueueId};
use crate::error::{PathRingError, Result};
use crate::grid::{EventKind, GridEvent, GridId, GridOwner, GridScheduler, OwnerId, SchedulerStats};
use crate::handle::{Handle, HandleType};
use crate::handle_pool::{HandlePool, HandlePoolStats};
use crate::queue_pool::{QueuePool, QueuePoolStats};
use crate::suballocator::{Span, Suballocator, SubbufId, SuballocatorStats};

/// Runtime shared between the context and its builders.
pub type SharedRuntime = Rc<RefCell<Runtime>>;

/// How long a blocked dispatcher waits for a completion before declaring the
/// device lost.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// What a completion means to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// The grid's device work finished.
    GridComplete(GridId),
    /// A reclamation batch finished.
    Reclaimed {
        /// Reclaim record of the batch.
        record: u32,
    },
    /// Nothing to do beyond surfacing a failure.
    Checked,
}

/// A completion forwarded from the device thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// What to do with it.
    pub action: CompletionAction,
    /// Kernel that completed.
    pub kernel: &'static str,
    /// Device status.
    pub status: CompletionStatus,
}

/// Runtime statistics.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    /// Kernels enqueued.
    pub kernels_launched: u64,
    /// Completions processed.
    pub completions: u64,
    /// Commands with a pending completion.
    pub in_flight: usize,
    /// Grid scheduler counters.
    pub grids: SchedulerStats,
    /// Handle pool counters.
    pub handles: HandlePoolStats,
    /// Temporary allocator counters.
    pub temp: SuballocatorStats,
    /// Queue pool counters.
    pub queues: QueuePoolStats,
}

type OwnerRef = Weak<RefCell<dyn GridOwner>>;

/// Reborrows the caller's owner for a single call inside a loop.
fn reborrow<'a>(me: &'a mut Option<&mut dyn GridOwner>) -> Option<&'a mut dyn GridOwner> {
    me.as_mut().map(|m| &mut **m as &mut dyn GridOwner)
}

/// The runtime context.
pub struct Runtime {
    config: RuntimeConfig,
    device: Arc<dyn Device>,
    queues: QueuePool,
    handles: HandlePool,
    grids: GridScheduler,
    temp: Suballocator,
    temp_mem: Vec<u32>,
    owners: Vec<Option<OwnerRef>>,
    inbox: Receiver<Completion>,
    outbox: Sender<Completion>,
    in_flight: usize,
    /// Sticky fatal error.
    failure: Option<PathRingError>,
    kernels_launched: u64,
    completions: u64,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("device", &self.device.name())
            .field("in_flight", &self.in_flight)
            .field("owners", &self.owners.len())
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime over a device.
    pub fn new(config: RuntimeConfig, device: Arc<dyn Device>) -> Result<Self> {
        config.validate()?;

        let handles = HandlePool::new(&config.handles)?;
        let grids = GridScheduler::new(config.scheduler.grids, config.handles.handles);
        let temp = Suballocator::new(config.temp.blocks, config.temp.block_words)?;
        let (outbox, inbox) = unbounded();

        info!(
            device = device.name(),
            handles = config.handles.handles,
            grids = config.scheduler.grids,
            ring_blocks = config.ring.ring_blocks(),
            "pathring runtime created"
        );

        Ok(Self {
            temp_mem: vec![0; config.temp.extent_words()],
            config,
            device,
            queues: QueuePool::new(),
            handles,
            grids,
            temp,
            owners: Vec::new(),
            inbox,
            outbox,
            in_flight: 0,
            failure: None,
            kernels_launched: 0,
            completions: 0,
        })
    }

    /// Wraps the runtime for sharing with builders.
    pub fn into_shared(self) -> SharedRuntime {
        Rc::new(RefCell::new(self))
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The handle pool.
    pub fn handles(&self) -> &HandlePool {
        &self.handles
    }

    /// The grid scheduler.
    pub fn grids(&self) -> &GridScheduler {
        &self.grids
    }

    /// Mutable grid scheduler.
    pub fn grids_mut(&mut self) -> &mut GridScheduler {
        &mut self.grids
    }

    /// Commands awaiting completion.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Fails if a fatal error has been recorded.
    pub fn check(&self) -> Result<()> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: PathRingError) -> PathRingError {
        if err.is_fatal() && self.failure.is_none() {
            warn!(error = %err, "runtime failed");
            self.failure = Some(err.clone());
        }
        err
    }

    // owners

    /// Reserves an owner id. The owner registers itself once constructed.
    pub fn reserve_owner(&mut self) -> OwnerId {
        self.owners.push(None);
        OwnerId((self.owners.len() - 1) as u32)
    }

    /// Registers the owner for a reserved id.
    pub fn register_owner(&mut self, id: OwnerId, owner: OwnerRef) {
        if let Some(slot) = self.owners.get_mut(id.0 as usize) {
            *slot = Some(owner);
        }
    }

    /// Forgets an owner. Events still queued for it are handled as orphans.
    pub fn unregister_owner(&mut self, id: OwnerId) {
        if let Some(slot) = self.owners.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    // queues and launches

    /// Acquires a command queue.
    pub fn acquire_queue(&mut self) -> Result<QueueId> {
        self.queues.acquire(self.device.as_ref())
    }

    /// Returns a command queue to the pool.
    pub fn release_queue(&mut self, queue: QueueId) {
        self.queues.release(queue);
    }

    fn enqueue(&mut self, queue: QueueId, kernel: Kernel) -> Result<CompletionToken> {
        debug!(kernel = kernel.name(), queue = queue.0, "enqueue kernel");
        let token = self
            .device
            .enqueue_kernel(queue, kernel)
            .map_err(|e| self.fail(e))?;
        self.queues.record_launch(queue);
        self.kernels_launched += 1;
        Ok(token)
    }

    /// Enqueues a kernel whose completion performs `action`.
    pub fn launch(
        &mut self,
        queue: QueueId,
        kernel: Kernel,
        action: CompletionAction,
    ) -> Result<CompletionToken> {
        let name = kernel.name();
        let token = self.enqueue(queue, kernel)?;
        self.notify(token, name, action)?;
        Ok(token)
    }

    /// Routes the completion of `token` into the inbox.
    pub fn notify(
        &mut self,
        token: CompletionToken,
        kernel: &'static str,
        action: CompletionAction,
    ) -> Result<()> {
        let outbox = self.outbox.clone();
        self.in_flight += 1;
        let registered = self.device.set_completion_callback(
            token,
            Box::new(move |status| {
                // the runtime may already be gone
                let _ = outbox.send(Completion {
                    action,
                    kernel,
                    status,
                });
            }),
        );
        if let Err(err) = registered {
            self.in_flight -= 1;
            return Err(self.fail(err));
        }
        Ok(())
    }

    // dispatcher

    /// Processes every available completion and delivers every deliverable
    /// event without blocking. `me` is the owner currently borrowed by the
    /// caller, if any. Returns true if anything happened.
    pub fn dispatch(&mut self, mut me: Option<&mut dyn GridOwner>) -> Result<bool> {
        self.check()?;
        let mut progress = false;
        while let Ok(completion) = self.inbox.try_recv() {
            self.process(completion)?;
            progress = true;
        }
        progress |= self.deliver_events(reborrow(&mut me))?;
        Ok(progress)
    }

    /// One cooperative wait step: dispatch, and if nothing could be done,
    /// block until the next completion arrives.
    pub fn yield_now(&mut self, mut me: Option<&mut dyn GridOwner>) -> Result<()> {
        if self.dispatch(reborrow(&mut me))? {
            return Ok(());
        }
        if self.in_flight == 0 {
            return Err(self.fail(PathRingError::stalled(format!(
                "nothing in flight, {} undeliverable events",
                self.grids.event_count()
            ))));
        }
        let completion = match self.inbox.recv_timeout(COMPLETION_TIMEOUT) {
            Ok(c) => c,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(self.fail(PathRingError::DeviceLost));
            }
        };
        self.process(completion)?;
        self.deliver_events(me)?;
        Ok(())
    }

    fn process(&mut self, completion: Completion) -> Result<()> {
        self.in_flight -= 1;
        self.completions += 1;
        trace!(kernel = completion.kernel, action = ?completion.action, "completion");

        if let CompletionStatus::Failed(reason) = completion.status {
            return Err(self.fail(PathRingError::KernelFailed {
                kernel: completion.kernel.to_string(),
                reason,
            }));
        }

        match completion.action {
            CompletionAction::GridComplete(grid) => {
                self.grids.complete(grid).map_err(|e| self.fail_hard(e))?
            }
            CompletionAction::Reclaimed { record } => {
                self.handles
                    .reclaim_complete(record)
                    .map_err(|e| self.fail(e))?;
                self.launch_reclaims()?;
            }
            CompletionAction::Checked => {}
        }
        Ok(())
    }

    /// Errors raised while processing completions leave the runtime unusable.
    fn fail_hard(&mut self, err: PathRingError) -> PathRingError {
        let err = PathRingError::device(err.to_string());
        self.fail(err)
    }

    fn deliver_events(&mut self, mut me: Option<&mut dyn GridOwner>) -> Result<bool> {
        let mut progress = false;
        loop {
            let mut events = self.grids.take_events();
            if events.is_empty() {
                break;
            }
            let mut held = VecDeque::new();
            let mut delivered = false;
            while let Some(event) = events.pop_front() {
                match self.deliver(event, reborrow(&mut me)) {
                    Ok(true) => delivered = true,
                    Ok(false) => held.push_back(event),
                    Err(err) => {
                        held.extend(events.drain(..));
                        self.grids.requeue(held);
                        return Err(self.fail(err));
                    }
                }
            }
            self.grids.requeue(held);
            if !delivered {
                break;
            }
            progress = true;
        }
        Ok(progress)
    }

    fn deliver(&mut self, event: GridEvent, me: Option<&mut dyn GridOwner>) -> Result<bool> {
        if let Some(me) = me {
            if me.owner_id() == event.owner {
                if event.kind != EventKind::Dispose && !me.can_dispatch() {
                    return Ok(false);
                }
                self.run_event(me, event)?;
                return Ok(true);
            }
        }

        let owner = self
            .owners
            .get(event.owner.0 as usize)
            .and_then(Option::as_ref)
            .and_then(Weak::upgrade);
        let Some(owner) = owner else {
            self.orphan(event)?;
            return Ok(true);
        };
        let Ok(mut owner) = owner.try_borrow_mut() else {
            return Ok(false);
        };
        if event.kind != EventKind::Dispose && !owner.can_dispatch() {
            return Ok(false);
        }
        self.run_event(&mut *owner, event)?;
        Ok(true)
    }

    fn run_event(&mut self, owner: &mut dyn GridOwner, event: GridEvent) -> Result<()> {
        trace!(grid = event.grid.index(), kind = ?event.kind, owner = event.owner.0, "deliver");
        match event.kind {
            EventKind::Waiting => owner.on_waiting(self, event.grid, event.data),
            EventKind::Execute => owner.on_execute(self, event.grid, event.data),
            EventKind::Dispose => {
                let result = owner.on_dispose(self, event.grid, event.data);
                self.grids.recycle(event.grid);
                result
            }
        }
    }

    /// Events whose owner is gone. Executing an orphan would never launch,
    /// so it completes at once to release its dependents.
    fn orphan(&mut self, event: GridEvent) -> Result<()> {
        warn!(grid = event.grid.index(), kind = ?event.kind, owner = event.owner.0, "orphaned grid event");
        match event.kind {
            EventKind::Waiting => Ok(()),
            EventKind::Execute => self.grids.complete(event.grid),
            EventKind::Dispose => {
                self.grids.recycle(event.grid);
                Ok(())
            }
        }
    }

    // grids

    /// Attaches a grid, waiting for a free slot.
    pub fn attach(
        &mut self,
        owner: OwnerId,
        data: usize,
        mut me: Option<&mut dyn GridOwner>,
    ) -> Result<GridId> {
        loop {
            if let Some(grid) = self.grids.try_attach(owner, data) {
                return Ok(grid);
            }
            self.yield_now(reborrow(&mut me))?;
        }
    }

    /// Forces the grids producing the given handles.
    pub fn flush_handles(&mut self, raws: &[u32], ty: HandleType) -> Result<()> {
        for &raw in raws {
            let handle = ty
                .untype(raw)
                .filter(|&h| h < self.handles.capacity())
                .ok_or(PathRingError::HandleInvalid { handle: raw })?;
            if let Some(grid) = self.grids.grid_of(handle) {
                self.grids.force(grid);
            }
        }
        self.dispatch(None)?;
        Ok(())
    }

    // handles

    /// Acquires a handle, waiting for a reclamation if the pool is empty.
    pub fn acquire_handle(&mut self, mut me: Option<&mut dyn GridOwner>) -> Result<Handle> {
        loop {
            if let Some(handle) = self.handles.try_acquire() {
                return Ok(handle);
            }
            // nothing else will fill a partial bucket while we wait
            if self.in_flight == 0 && self.handles.has_partial_bucket() {
                self.handles.flush_partial();
                self.launch_reclaims()?;
            }
            self.yield_now(reborrow(&mut me))?;
        }
    }

    /// Host retain of typed handles.
    pub fn retain(&mut self, raws: &[u32], ty: HandleType) -> Result<()> {
        self.handles.retain(raws, ty)
    }

    /// Host release of typed handles.
    pub fn release(&mut self, raws: &[u32], ty: HandleType) -> Result<()> {
        self.handles.release(raws, ty)?;
        self.launch_reclaims()
    }

    /// Validates typed handles and takes a device reference on each.
    pub fn device_retain(&mut self, raws: &[u32], ty: HandleType) -> Result<Vec<Handle>> {
        self.handles.device_retain(raws, ty)
    }

    /// Drops device references held by runtime components.
    pub fn device_release(&mut self, handles: &[Handle], ty: HandleType) -> Result<()> {
        self.handles.device_release(handles, ty)?;
        self.launch_reclaims()
    }

    /// Launches every reclamation batch the pool has ready.
    pub fn launch_reclaims(&mut self) -> Result<()> {
        let batches = self.handles.take_ready();
        if batches.is_empty() {
            return Ok(());
        }
        let queue = self.acquire_queue()?;
        let result = batches.into_iter().try_for_each(|batch| {
            debug!(
                record = batch.record,
                ty = ?batch.ty,
                handles = batch.handles.len(),
                "launch reclaim batch"
            );
            let kernel = match batch.ty {
                HandleType::Path => Kernel::PathsReclaim {
                    handles: batch.handles,
                },
                HandleType::Raster => Kernel::RastersReclaim {
                    handles: batch.handles,
                },
            };
            self.launch(
                queue,
                kernel,
                CompletionAction::Reclaimed {
                    record: batch.record,
                },
            )
            .map(|_| ())
        });
        self.device.flush(queue).map_err(|e| self.fail(e))?;
        self.release_queue(queue);
        result
    }

    // temporary memory

    /// Acquires host temporary memory, waiting while the ring is full.
    pub fn temp_acquire(
        &mut self,
        words: usize,
        mut me: Option<&mut dyn GridOwner>,
    ) -> Result<Span> {
        loop {
            if let Some(span) = self.temp.try_acquire(words)? {
                return Ok(span);
            }
            self.yield_now(reborrow(&mut me))?;
        }
    }

    /// Words of a temporary span.
    pub fn temp_slice(&self, span: &Span) -> &[u32] {
        &self.temp_mem[span.offset..span.offset + span.size]
    }

    /// Mutable words of a temporary span.
    pub fn temp_slice_mut(&mut self, span: &Span) -> &mut [u32] {
        &mut self.temp_mem[span.offset..span.offset + span.size]
    }

    /// Releases a temporary span.
    pub fn temp_release(&mut self, id: SubbufId) -> Result<()> {
        self.temp.release(id)
    }

    // whole runtime

    /// Forces every live grid and drains until the scheduler, the device and
    /// the reclamation path are idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        loop {
            for grid in self.grids.live() {
                self.grids.force(grid);
            }
            self.handles.flush_partial();
            self.launch_reclaims()?;
            self.dispatch(None)?;

            if self.in_flight == 0
                && self.grids.is_idle()
                && !self.handles.has_pending_reclaim()
            {
                debug!(completions = self.completions, "runtime idle");
                return Ok(());
            }
            self.yield_now(None)?;
        }
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            kernels_launched: self.kernels_launched,
            completions: self.completions,
            in_flight: self.in_flight,
            grids: self.grids.stats(),
            handles: self.handles.stats(),
            temp: self.temp.stats(),
            queues: self.queues.stats(),
        }
    }
}
