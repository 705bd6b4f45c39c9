//! Test device that completes every command as soon as it is enqueued.

use std::collections::HashMap;
use parking_lot::Mutex;

use crate::device::{
    BufferId, CompletionCallback, CompletionStatus, CompletionToken, Device, Kernel, QueueId,
};
use crate::error::{PathRingError, Result};

#[derive(Default)]
struct State {
    next_queue: u32,
    next_buffer: u32,
    next_token: u64,
    buffers: HashMap<BufferId, Option<Vec<u32>>>,
    mappings: HashMap<BufferId, Vec<u32>>,
    launched: Vec<Kernel>,
    fail_next: Option<String>,
}

/// Executes nothing; records kernels and reports them complete.
#[derive(Default)]
pub(crate) struct ImmediateDevice {
    state: Mutex<State>,
}

impl ImmediateDevice {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn launched(&self) -> Vec<&'static str> {
        let state = self.state.lock();
        state.launched.iter().map(Kernel::name).collect()
    }

    pub(crate) fn kernels(&self) -> Vec<Kernel> {
        self.state.lock().launched.clone()
    }

    /// The next completion reports failure.
    pub(crate) fn fail_next(&self, reason: &str) {
        self.state.lock().fail_next = Some(reason.to_string());
    }

    /// Device-side contents of a buffer, if it is not mapped.
    pub(crate) fn contents(&self, buffer: BufferId) -> Option<Vec<u32>> {
        self.state.lock().buffers.get(&buffer).cloned().flatten()
    }

    fn token(state: &mut State) -> CompletionToken {
        state.next_token += 1;
        CompletionToken(state.next_token)
    }
}

impl Device for ImmediateDevice {
    fn name(&self) -> &str {
        "immediate"
    }

    fn create_queue(&self) -> Result<QueueId> {
        let mut state = self.state.lock();
        state.next_queue += 1;
        Ok(QueueId(state.next_queue))
    }

    fn create_buffer(&self, words: usize) -> Result<BufferId> {
        let mut state = self.state.lock();
        state.next_buffer += 1;
        let id = BufferId(state.next_buffer);
        state.buffers.insert(id, Some(vec![0; words]));
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) -> Result<()> {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.mappings.remove(&buffer);
        Ok(())
    }

    fn enqueue_kernel(&self, _queue: QueueId, kernel: Kernel) -> Result<CompletionToken> {
        let mut state = self.state.lock();
        state.launched.push(kernel);
        Ok(Self::token(&mut state))
    }

    fn set_completion_callback(
        &self,
        _token: CompletionToken,
        callback: CompletionCallback,
    ) -> Result<()> {
        let status = match self.state.lock().fail_next.take() {
            Some(reason) => CompletionStatus::Failed(reason),
            None => CompletionStatus::Complete,
        };
        callback(status);
        Ok(())
    }

    fn map_buffer(&self, _queue: QueueId, buffer: BufferId) -> Result<CompletionToken> {
        let mut state = self.state.lock();
        let data = state
            .buffers
            .get_mut(&buffer)
            .and_then(Option::take)
            .ok_or_else(|| PathRingError::device("map of unknown or mapped buffer"))?;
        state.mappings.insert(buffer, data);
        Ok(Self::token(&mut state))
    }

    fn unmap_buffer(
        &self,
        _queue: QueueId,
        buffer: BufferId,
        data: Vec<u32>,
    ) -> Result<CompletionToken> {
        let mut state = self.state.lock();
        match state.buffers.get_mut(&buffer) {
            Some(slot) if slot.is_none() => *slot = Some(data),
            _ => return Err(PathRingError::device("unmap of a buffer that is not mapped")),
        }
        Ok(Self::token(&mut state))
    }

    fn take_mapping(&self, buffer: BufferId) -> Result<Vec<u32>> {
        self.state
            .lock()
            .mappings
            .remove(&buffer)
            .ok_or_else(|| PathRingError::device("no completed mapping"))
    }

    fn wait(&self, _token: CompletionToken) -> Result<()> {
        Ok(())
    }

    fn is_complete(&self, _token: CompletionToken) -> bool {
        true
    }

    fn flush(&self, _queue: QueueId) -> Result<()> {
        Ok(())
    }
}
