//! Configuration types for paged-scheduler.

use serde::{Deserialize, Serialize};

/// Scheduler configuration.
///
/// Selects the batching regime and bounds the three resources every step
/// competes for: the per-step token budget, the per-step sequence budget and
/// the paged KV cache pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Batching regime. When `true`, prompt chunks and generation tokens share
    /// a single step; when `false`, each step is either a padded prompt batch
    /// or a generation batch.
    pub dynamic_split_fuse: bool,
    /// Maximum number of tokens scheduled across all sequences in one step.
    pub max_num_batched_tokens: usize,
    /// Maximum number of sequence groups admitted in one padded prompt step.
    pub max_num_seqs: usize,
    /// Total number of KV cache blocks in the pool.
    pub num_kv_blocks: usize,
    /// Number of tokens per KV cache block.
    pub block_size: usize,
    /// Enable reuse of KV blocks across requests sharing a token prefix.
    pub enable_prefix_caching: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dynamic_split_fuse: true,
            max_num_batched_tokens: 4096,
            max_num_seqs: 256,
            num_kv_blocks: 1024,
            block_size: 16,
            enable_prefix_caching: false,
        }
    }
}

impl SchedulerConfig {
    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
