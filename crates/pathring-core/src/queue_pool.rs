//! Pool of reusable command queues.

use std::collections::HashMap;

use tracing::debug;

use crate::device::{Device, QueueId};
use crate::error::Result;

/// Command queue pool.
///
/// Queues are created lazily on the device and recycled on release.
#[derive(Debug, Default)]
pub struct QueuePool {
    free: Vec<QueueId>,
    created: usize,
    /// Kernel launches per queue.
    launches: HashMap<QueueId, u64>,
    total_launches: u64,
}

impl QueuePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a queue, creating one if none is free.
    pub fn acquire(&mut self, device: &dyn Device) -> Result<QueueId> {
        if let Some(queue) = self.free.pop() {
            return Ok(queue);
        }
        let queue = device.create_queue()?;
        self.created += 1;
        debug!(queue = queue.0, created = self.created, "created command queue");
        Ok(queue)
    }

    /// Returns a queue to the pool.
    pub fn release(&mut self, queue: QueueId) {
        debug_assert!(!self.free.contains(&queue));
        self.free.push(queue);
    }

    /// Records a kernel launch on a queue.
    pub fn record_launch(&mut self, queue: QueueId) {
        self.total_launches += 1;
        *self.launches.entry(queue).or_insert(0) += 1;
    }

    /// Utilization snapshot.
    #[must_use]
    pub fn stats(&self) -> QueuePoolStats {
        let mut per_queue: Vec<(QueueId, u64)> =
            self.launches.iter().map(|(&q, &n)| (q, n)).collect();
        per_queue.sort_by_key(|(q, _)| q.0);
        QueuePoolStats {
            queues_created: self.created,
            queues_free: self.free.len(),
            total_launches: self.total_launches,
            per_queue_launches: per_queue,
        }
    }
}

/// Statistics for the queue pool.
#[derive(Debug, Clone)]
pub struct QueuePoolStats {
    /// Queues created on the device.
    pub queues_created: usize,
    /// Queues currently in the pool.
    pub queues_free: usize,
    /// Kernel launches across all queues.
    pub total_launches: u64,
    /// Kernel launches per queue, ordered by queue id.
    pub per_queue_launches: Vec<(QueueId, u64)>,
}

impl QueuePoolStats {
    /// The queue with the most launches.
    #[must_use]
    pub fn busiest_queue(&self) -> Option<QueueId> {
        self.per_queue_launches
            .iter()
            .max_by_key(|(_, n)| *n)
            .map(|(q, _)| *q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ImmediateDevice;

    #[test]
    fn test_reuses_released_queues() {
        let device = ImmediateDevice::new();
        let mut pool = QueuePool::new();

        let a = pool.acquire(&device).unwrap();
        let b = pool.acquire(&device).unwrap();
        assert_ne!(a, b);

        pool.release(a);
        let c = pool.acquire(&device).unwrap();
        assert_eq!(a, c);
        assert_eq!(pool.stats().queues_created, 2);
    }

    #[test]
    fn test_launch_accounting() {
        let device = ImmediateDevice::new();
        let mut pool = QueuePool::new();
        let a = pool.acquire(&device).unwrap();
        let b = pool.acquire(&device).unwrap();

        pool.record_launch(a);
        pool.record_launch(b);
        pool.record_launch(b);

        let stats = pool.stats();
        assert_eq!(stats.total_launches, 3);
        assert_eq!(stats.busiest_queue(), Some(b));
        assert_eq!(stats.per_queue_launches.len(), 2);
    }
}
