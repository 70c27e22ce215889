//! Paged KV cache blocks.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage physical memory with pages. Blocks are reference counted so
//! that sequences sharing a prefix (forks, prefix-cache hits) can share the
//! same physical block until one of them diverges.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// Used for prefix caching to identify shared prefixes. The hash includes the
/// parent block's hash to create a chain, ensuring that blocks at the same
/// position with different prefixes have different hashes.
///
/// # Example
///
/// ```
/// use paged_scheduler::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();

    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }

    for &token in token_ids {
        token.hash(&mut hasher);
    }

    hasher.finish()
}

/// Compute the chained hash of the first `num_blocks` full blocks of a prompt.
///
/// Returns `None` when the prompt does not cover `num_blocks` complete blocks;
/// only fully occupied blocks are eligible for prefix caching.
pub fn hash_prompt_blocks(token_ids: &[u32], num_blocks: usize, block_size: usize) -> Option<u64> {
    if num_blocks == 0 || token_ids.len() < num_blocks * block_size {
        return None;
    }

    let mut hash = None;
    for chunk in token_ids[..num_blocks * block_size].chunks(block_size) {
        hash = Some(hash_token_block(chunk, hash));
    }
    hash
}

/// A fixed-size chunk of KV cache memory.
///
/// Each block stores KV states for `block_size` tokens and is the unit of
/// allocation in the [`BlockManager`](super::block_manager::BlockManager).
#[derive(Debug, Clone)]
pub struct KVCacheBlock {
    /// Index of this physical block in the pool.
    index: usize,
    /// Reference count for prefix sharing and forks.
    ref_count: usize,
    /// Chained content hash of the tokens stored in this block, if the block
    /// holds a complete prompt chunk eligible for prefix caching.
    hash: Option<u64>,
}

impl KVCacheBlock {
    /// Create a freshly allocated block with a single owner.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ref_count: 1,
            hash: None,
        }
    }

    /// Get the physical block index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Get the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Get the content hash, if registered for prefix caching.
    pub fn hash(&self) -> Option<u64> {
        self.hash
    }

    /// Register the content hash for prefix caching.
    pub fn set_hash(&mut self, hash: u64) {
        self.hash = Some(hash);
    }

    /// Increment the reference count (block shared with another sequence).
    pub fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    /// Decrement the reference count.
    ///
    /// # Returns
    ///
    /// The new reference count after decrementing.
    pub fn decrement_ref(&mut self) -> usize {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }
}

/// Number of blocks needed to hold `num_tokens` tokens.
///
/// # Example
///
/// ```
/// use paged_scheduler::core::block::blocks_for_tokens;
///
/// assert_eq!(blocks_for_tokens(35, 16), 3);
/// assert_eq!(blocks_for_tokens(32, 16), 2);
/// assert_eq!(blocks_for_tokens(0, 16), 0);
/// ```
pub fn blocks_for_tokens(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_chain_is_position_sensitive() {
        let tokens = [10u32, 20, 30, 40];
        let first = hash_token_block(&tokens, None);
        let chained = hash_token_block(&tokens, Some(first));
        assert_ne!(first, chained);

        // Deterministic for identical input.
        assert_eq!(first, hash_token_block(&tokens, None));
    }

    #[test]
    fn test_hash_prompt_blocks_requires_full_blocks() {
        let prompt: Vec<u32> = (0..10).collect();

        assert!(hash_prompt_blocks(&prompt, 0, 4).is_none());
        assert!(hash_prompt_blocks(&prompt, 3, 4).is_none());

        let two = hash_prompt_blocks(&prompt, 2, 4).unwrap();
        let expected = hash_token_block(&prompt[4..8], Some(hash_token_block(&prompt[..4], None)));
        assert_eq!(two, expected);
    }

    #[test]
    fn test_ref_counting() {
        let mut block = KVCacheBlock::new(7);
        assert_eq!(block.index(), 7);
        assert_eq!(block.ref_count(), 1);

        block.increment_ref();
        assert_eq!(block.ref_count(), 2);
        assert_eq!(block.decrement_ref(), 1);
        assert_eq!(block.decrement_ref(), 0);
        assert_eq!(block.decrement_ref(), 0);
    }
}
