//! Device block pool.

use tracing::trace;

/// Fixed pool of equally sized blocks with a stack of free ids.
#[derive(Debug)]
pub struct BlockPool {
    words: Vec<u32>,
    block_words: usize,
    free: Vec<u32>,
}

impl BlockPool {
    /// Creates a pool of `blocks` zeroed blocks.
    pub fn new(blocks: u32, block_words: usize) -> Self {
        Self {
            words: vec![0; blocks as usize * block_words],
            block_words,
            // pop from the end hands out low ids first
            free: (0..blocks).rev().collect(),
        }
    }

    /// Total blocks.
    pub fn capacity(&self) -> u32 {
        (self.words.len() / self.block_words) as u32
    }

    /// Free blocks.
    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    /// Words per block.
    pub fn block_words(&self) -> usize {
        self.block_words
    }

    /// Pops `count` block ids, or none if the pool cannot supply them all.
    pub fn alloc(&mut self, count: u32) -> Option<Vec<u32>> {
        let count = count as usize;
        if count > self.free.len() {
            return None;
        }
        let ids = self.free.split_off(self.free.len() - count);
        trace!(count, available = self.free.len(), "pool alloc");
        Some(ids.into_iter().rev().collect())
    }

    /// Returns blocks to the pool.
    pub fn free(&mut self, ids: &[u32]) {
        self.free.extend_from_slice(ids);
        trace!(count = ids.len(), available = self.free.len(), "pool free");
    }

    /// Words of a block.
    pub fn block(&self, id: u32) -> &[u32] {
        let base = id as usize * self.block_words;
        &self.words[base..base + self.block_words]
    }

    /// Mutable words of a block.
    pub fn block_mut(&mut self, id: u32) -> &mut [u32] {
        let base = id as usize * self.block_words;
        &mut self.words[base..base + self.block_words]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_all_or_nothing() {
        let mut pool = BlockPool::new(4, 8);
        assert_eq!(pool.alloc(3), Some(vec![0, 1, 2]));
        assert_eq!(pool.alloc(2), None);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_free_and_reuse() {
        let mut pool = BlockPool::new(4, 8);
        let ids = pool.alloc(4).unwrap();
        pool.block_mut(ids[2]).fill(7);
        pool.free(&ids[2..3]);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.alloc(1), Some(vec![2]));
        assert!(pool.block(2).iter().all(|&w| w == 7));
        assert_eq!(pool.capacity(), 4);
    }
}
