//! Block manager for the paged KV cache.
//!
//! The block manager is the sole arbiter of KV block allocation. It maintains:
//!
//! - a free list for O(1) allocation and deallocation,
//! - a block table per sequence mapping logical positions to physical blocks,
//! - reference counts so forked sequences and prefix-cache hits share blocks
//!   copy-on-write,
//! - a prefix hash map for content-based block reuse.
//!
//! The scheduler never touches blocks directly; it queries the capability
//! predicates (`can_allocate_blocks`, `can_append_slots`) and adapts when they
//! say no, so the allocation paths here are never reached without capacity.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::core::block::{hash_prompt_blocks, hash_token_block, KVCacheBlock};
use crate::core::sequence::{SequenceGroup, SequenceId};
use crate::error::{Error, Result};

/// Manages allocation and deallocation of paged KV cache blocks.
///
/// # Example
///
/// ```
/// use paged_scheduler::core::block_manager::BlockManager;
///
/// let mut manager = BlockManager::new(8, false, 4);
/// assert_eq!(manager.num_free_blocks(), 8);
///
/// manager.allocate(0, 2, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
/// assert_eq!(manager.num_free_blocks(), 6);
/// assert_eq!(manager.get_block_table(0).len(), 2);
///
/// manager.free_sequence(0);
/// assert_eq!(manager.num_free_blocks(), 8);
/// ```
#[derive(Debug)]
pub struct BlockManager {
    /// Allocated blocks indexed by physical block index.
    blocks: HashMap<usize, KVCacheBlock>,
    /// Free block indices.
    free_list: VecDeque<usize>,
    /// Per-sequence block tables: physical block indices in logical order.
    block_tables: HashMap<SequenceId, Vec<usize>>,
    /// Prefix hash -> block index, for content-based reuse.
    prefix_cache: HashMap<u64, usize>,
    /// Number of tokens per block.
    block_size: usize,
    /// Total number of blocks in the pool.
    num_blocks: usize,
    /// Whether prefix caching is enabled.
    enable_prefix_caching: bool,
}

impl BlockManager {
    /// Create a new block manager with the specified capacity.
    pub fn new(num_blocks: usize, enable_prefix_caching: bool, block_size: usize) -> Self {
        Self {
            blocks: HashMap::with_capacity(num_blocks),
            free_list: (0..num_blocks).collect(),
            block_tables: HashMap::new(),
            prefix_cache: HashMap::new(),
            block_size,
            num_blocks,
            enable_prefix_caching,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the total number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the number of free blocks.
    pub fn num_free_blocks(&self) -> usize {
        self.free_list.len()
    }

    /// Check whether `num_blocks` blocks can be allocated.
    pub fn can_allocate_blocks(&self, num_blocks: usize) -> bool {
        self.free_list.len() >= num_blocks
    }

    /// Fraction of the pool in use, in percent.
    pub fn get_used_percentage(&self) -> f32 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        (self.num_blocks - self.free_list.len()) as f32 * 100.0 / self.num_blocks as f32
    }

    /// Check whether a sequence owns a block table.
    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.block_tables.contains_key(&seq_id)
    }

    /// Get a sequence's block table: physical block indices in logical order.
    pub fn get_block_table(&self, seq_id: SequenceId) -> &[usize] {
        self.block_tables
            .get(&seq_id)
            .map(|table| table.as_slice())
            .unwrap_or(&[])
    }

    /// Reserve `num_blocks` prompt blocks for a sequence.
    ///
    /// With prefix caching enabled, blocks that hold a complete prompt chunk
    /// are content-hashed; a cache hit shares the existing block instead of
    /// consuming a free one, and misses are registered for future requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBlocks`] if the free list runs dry. Callers are
    /// expected to clamp their request to [`num_free_blocks`](Self::num_free_blocks).
    pub fn allocate(
        &mut self,
        seq_id: SequenceId,
        num_blocks: usize,
        prompt_ids: &[u32],
    ) -> Result<()> {
        for _ in 0..num_blocks {
            let logical_index = self.block_tables.get(&seq_id).map_or(0, |t| t.len());
            let hash = if self.enable_prefix_caching {
                hash_prompt_blocks(prompt_ids, logical_index + 1, self.block_size)
            } else {
                None
            };

            if let Some(h) = hash {
                if let Some(&cached) = self.prefix_cache.get(&h) {
                    if let Some(block) = self.blocks.get_mut(&cached) {
                        block.increment_ref();
                        self.block_tables.entry(seq_id).or_default().push(cached);
                        continue;
                    }
                }
            }

            let block_index = self.take_free_block().ok_or(Error::OutOfBlocks)?;
            if let Some(h) = hash {
                if let Some(block) = self.blocks.get_mut(&block_index) {
                    block.set_hash(h);
                }
                self.prefix_cache.insert(h, block_index);
            }
            self.block_tables.entry(seq_id).or_default().push(block_index);
        }
        Ok(())
    }

    /// Check whether one more logical token per running sibling fits.
    pub fn can_append_slots(&self, group: &SequenceGroup) -> bool {
        self.required_blocks_count(group) <= self.free_list.len()
    }

    /// Blocks needed to satisfy the group's current commitment.
    ///
    /// Accounts for block-table growth up to the group's logical length and
    /// for the copy-on-write duplicate needed when a sibling is about to
    /// write into a shared, partially filled last block.
    pub fn required_blocks_count(&self, group: &SequenceGroup) -> usize {
        let num_logical_blocks = group.num_logical_blocks(self.block_size);
        let partial_last = group.num_processed_tokens() % self.block_size != 0;

        let mut count = 0;
        for seq in group.running_sequences() {
            match self.block_tables.get(&seq.id()) {
                None => count += num_logical_blocks,
                Some(table) if table.is_empty() => count += num_logical_blocks,
                Some(table) => {
                    count += num_logical_blocks.saturating_sub(table.len());
                    if partial_last && self.is_shared(table.last()) {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Reserve slots for the group's current commitment.
    ///
    /// Grows each running sibling's block table to the group's logical length
    /// and resolves writes into shared last blocks by allocating a private
    /// copy. The returned map lists the `src -> [dst...]` block copies the
    /// cache executor must perform before the forward pass.
    pub fn append_slots(&mut self, group: &SequenceGroup) -> HashMap<usize, Vec<usize>> {
        let num_logical_blocks = group.num_logical_blocks(self.block_size);
        let partial_last = group.num_processed_tokens() % self.block_size != 0;
        let seq_ids: Vec<SequenceId> = group.running_sequences().map(|s| s.id()).collect();

        let mut copy_map: HashMap<usize, Vec<usize>> = HashMap::new();
        for seq_id in seq_ids {
            if partial_last {
                let shared_last = self
                    .block_tables
                    .get(&seq_id)
                    .and_then(|t| t.last().copied())
                    .filter(|index| self.is_shared(Some(index)));
                if let Some(src) = shared_last {
                    let Some(dst) = self.take_free_block() else {
                        break;
                    };
                    if let Some(block) = self.blocks.get_mut(&src) {
                        block.decrement_ref();
                    }
                    if let Some(last) = self
                        .block_tables
                        .get_mut(&seq_id)
                        .and_then(|t| t.last_mut())
                    {
                        *last = dst;
                    }
                    copy_map.entry(src).or_default().push(dst);
                    trace!(seq_id, src, dst, "copy-on-write block duplication");
                }
            }

            loop {
                let table_len = self.block_tables.get(&seq_id).map_or(0, |t| t.len());
                if table_len >= num_logical_blocks {
                    break;
                }
                let Some(block_index) = self.take_free_block() else {
                    break;
                };
                self.block_tables.entry(seq_id).or_default().push(block_index);
            }
        }
        copy_map
    }

    /// Release all blocks owned by a sequence.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        if let Some(table) = self.block_tables.remove(&seq_id) {
            for block_index in table {
                self.release_block(block_index);
            }
        }
    }

    /// Trim blocks from the tail of every running sibling until at least
    /// `blocks_needed` additional blocks are free or the tables are empty.
    ///
    /// # Returns
    ///
    /// The number of logical tail blocks removed per sibling.
    pub fn free_group_partially(&mut self, group: &SequenceGroup, blocks_needed: usize) -> usize {
        let seq_ids: Vec<SequenceId> = group.running_sequences().map(|s| s.id()).collect();
        let prev_free = self.free_list.len();

        let mut logical_blocks_released = 0;
        loop {
            if self.free_list.len() - prev_free >= blocks_needed {
                break;
            }
            let mut popped_any = false;
            for seq_id in &seq_ids {
                let popped = self.block_tables.get_mut(seq_id).and_then(|t| t.pop());
                if let Some(block_index) = popped {
                    self.release_block(block_index);
                    popped_any = true;
                }
            }
            if !popped_any {
                break;
            }
            logical_blocks_released += 1;
        }
        logical_blocks_released
    }

    /// Number of unique physical blocks held by the group's live siblings.
    pub fn get_number_of_blocks_occupied_by_sequence(&self, group: &SequenceGroup) -> usize {
        let mut seen = HashSet::new();
        for seq in group.running_sequences() {
            if let Some(table) = self.block_tables.get(&seq.id()) {
                seen.extend(table.iter().copied());
            }
        }
        seen.len()
    }

    /// Share the parent's blocks with a forked child sequence.
    ///
    /// Every block gets its reference count bumped; a later write into a
    /// shared block is resolved copy-on-write by [`append_slots`](Self::append_slots).
    pub fn fork_sequence(&mut self, parent_id: SequenceId, child_id: SequenceId) {
        let Some(table) = self.block_tables.get(&parent_id).cloned() else {
            return;
        };
        for block_index in &table {
            if let Some(block) = self.blocks.get_mut(block_index) {
                block.increment_ref();
            }
        }
        self.block_tables.insert(child_id, table);
    }

    /// Reattach cached prefix blocks to a fresh request before scheduling.
    ///
    /// Walks the prompt block by block, chaining content hashes; every hit
    /// still held in the pool is shared with the new sequence. The processed
    /// count is advanced accordingly, capped at `prompt_len - 1` so the last
    /// prompt token is always computed and produces logits.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        if !self.enable_prefix_caching || group.num_processed_tokens() > 0 {
            return;
        }
        let seq_id = group.sequences()[0].id();

        let mut attached = Vec::new();
        let mut parent_hash = None;
        for chunk in group.prompt_ids().chunks(self.block_size) {
            if chunk.len() < self.block_size {
                break;
            }
            let hash = hash_token_block(chunk, parent_hash);
            parent_hash = Some(hash);

            let Some(&cached) = self.prefix_cache.get(&hash) else {
                break;
            };
            let Some(block) = self.blocks.get_mut(&cached) else {
                break;
            };
            block.increment_ref();
            attached.push(cached);
        }

        if attached.is_empty() {
            return;
        }
        let mut matched_tokens = attached.len() * self.block_size;
        if matched_tokens >= group.prompt_len() {
            matched_tokens = group.prompt_len() - 1;
        }
        trace!(
            request_id = group.request_id(),
            blocks = attached.len(),
            matched_tokens,
            "restored cached prefix blocks"
        );
        self.block_tables.insert(seq_id, attached);
        group.update_processed_tokens(matched_tokens);
    }

    // ========== Internals ==========

    fn take_free_block(&mut self) -> Option<usize> {
        let block_index = self.free_list.pop_front()?;
        self.blocks.insert(block_index, KVCacheBlock::new(block_index));
        Some(block_index)
    }

    fn release_block(&mut self, block_index: usize) {
        let Some(block) = self.blocks.get_mut(&block_index) else {
            return;
        };
        if block.decrement_ref() > 0 {
            return;
        }
        if let Some(hash) = block.hash() {
            self.prefix_cache.remove(&hash);
        }
        self.blocks.remove(&block_index);
        self.free_list.push_back(block_index);
    }

    fn is_shared(&self, block_index: Option<&usize>) -> bool {
        block_index
            .and_then(|index| self.blocks.get(index))
            .is_some_and(|block| block.ref_count() > 1)
    }
}
