//! Continuous batching scheduler.
//!
//! On every engine step the scheduler decides, from the in-flight sequence
//! groups, which ones advance and by how many tokens, while reserving the KV
//! cache blocks those tokens will consume. Three budgets compete:
//!
//! - the megabatch: `max_num_batched_tokens` tokens per step,
//! - the sequence budget: `max_num_seqs` groups per padded prompt step,
//! - the paged KV block pool.
//!
//! Two regimes are supported. With dynamic split-fuse, generation is scheduled
//! first to protect tail latency of in-flight requests, then prompt chunks
//! fill whatever megabatch budget remains. Without it, a step is either a
//! padded prompt batch (tried first, since it admits fresh work) or a pure
//! generation batch.
//!
//! Priority is the position in the caller's list: the engine appends newly
//! admitted groups at the tail, and preemption only ever evicts groups behind
//! the one asking for room.
//!
//! # Example
//!
//! ```
//! use paged_scheduler::core::sequence::SequenceGroup;
//! use paged_scheduler::{Scheduler, SchedulerConfig};
//!
//! let config = SchedulerConfig {
//!     dynamic_split_fuse: false,
//!     max_num_batched_tokens: 32,
//!     max_num_seqs: 4,
//!     num_kv_blocks: 8,
//!     block_size: 4,
//!     enable_prefix_caching: false,
//! };
//! let mut scheduler = Scheduler::new(config).unwrap();
//!
//! let mut groups = vec![SequenceGroup::new(0, vec![1, 2, 3, 4, 5], 0)];
//! let output = scheduler.schedule(&mut groups);
//!
//! assert!(output.is_prompt);
//! assert_eq!(output.total_num_scheduled_tokens, 5);
//! ```

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::core::block_manager::BlockManager;
use crate::core::sequence::{SequenceGroup, SequenceId};
use crate::error::{Error, Result};

/// The per-step plan consumed by the model runner.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Positions of the scheduled groups in the input list, in scheduling
    /// order. Never contains duplicates.
    pub scheduled_group_ids: Vec<usize>,
    /// Snapshot of each scheduled sequence's block table, in logical order.
    /// Valid until the next `schedule()` call.
    pub block_tables: HashMap<SequenceId, Vec<usize>>,
    /// `src -> [dst...]` block copies the cache executor must perform before
    /// the forward pass.
    pub block_copy_map: HashMap<usize, Vec<usize>>,
    /// Total number of tokens scheduled across all groups and siblings.
    pub total_num_scheduled_tokens: usize,
    /// True iff this step is a dedicated, padded prompt step.
    pub is_prompt: bool,
    /// KV cache usage in percent, sampled after all decisions are made.
    pub cache_usage: f32,
}

impl SchedulerOutput {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether anything was scheduled.
    pub fn is_empty(&self) -> bool {
        self.scheduled_group_ids.is_empty()
    }

    /// Number of scheduled groups.
    pub fn num_scheduled_groups(&self) -> usize {
        self.scheduled_group_ids.len()
    }
}

/// Continuous batching scheduler.
///
/// `schedule()` is a synchronous step function: for its duration it owns the
/// group list and the block manager exclusively. Resource exhaustion is never
/// an error; the step simply produces a smaller (possibly empty) plan and the
/// engine retries on future steps.
pub struct Scheduler {
    config: SchedulerConfig,
    block_manager: BlockManager,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a degenerate block geometry and
    /// [`Error::SeqLimitExceedsTokenBudget`] when `max_num_seqs` exceeds
    /// `max_num_batched_tokens`.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if config.num_kv_blocks == 0 {
            return Err(Error::Config("num_kv_blocks must be positive".into()));
        }
        if config.max_num_seqs > config.max_num_batched_tokens {
            return Err(Error::SeqLimitExceedsTokenBudget {
                max_num_seqs: config.max_num_seqs,
                max_num_batched_tokens: config.max_num_batched_tokens,
            });
        }
        let block_manager = BlockManager::new(
            config.num_kv_blocks,
            config.enable_prefix_caching,
            config.block_size,
        );
        Ok(Self {
            config,
            block_manager,
        })
    }

    /// Plan one engine step.
    ///
    /// Priority is the list order at entry: lower index means higher priority.
    /// The caller must have consumed (or cleared) the previous step's
    /// scheduled tokens and removed finished groups before calling again.
    pub fn schedule(&mut self, sequence_groups: &mut [SequenceGroup]) -> SchedulerOutput {
        let mut output = SchedulerOutput::new();

        if self.config.dynamic_split_fuse {
            // Generation first: in-flight requests keep their latency even
            // when fresh prompts are queueing.
            self.schedule_generate_phase(sequence_groups, &mut output);
            self.schedule_prompt_phase_dynamic_split_fuse(sequence_groups, &mut output);
        } else {
            self.schedule_prompt_phase_vllm(sequence_groups, &mut output);
            if !output.is_prompt {
                self.schedule_generate_phase(sequence_groups, &mut output);
            }
        }

        for group in sequence_groups.iter_mut() {
            group.clear_waiting();
        }
        output.cache_usage = self.block_manager.get_used_percentage();
        output
    }

    // ========== Engine helpers ==========

    /// Get a sequence's current block table.
    pub fn get_block_table(&self, seq_id: SequenceId) -> &[usize] {
        self.block_manager.get_block_table(seq_id)
    }

    /// Check whether a sequence owns a block table.
    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.block_manager.has_block_table(seq_id)
    }

    /// Release all blocks owned by a sequence.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        self.block_manager.free_sequence(seq_id);
    }

    /// Share a parent's blocks with a forked child sequence.
    pub fn fork_sequence(&mut self, parent_id: SequenceId, child_id: SequenceId) {
        self.block_manager.fork_sequence(parent_id, child_id);
    }

    /// Reattach cached prefix blocks to a fresh request before scheduling.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        self.block_manager.restore_cached_blocks(group);
    }

    /// Get the scheduler configuration.
    pub fn get_config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get the block manager.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    // ========== Generation phase ==========

    /// Schedule generation tokens, splitting the remaining megabatch budget
    /// across each group's running siblings.
    ///
    /// Preempted groups mix with actively generating ones here: their prompt
    /// was already consumed, so after the rewind they simply have more than
    /// one token to (re)compute. They are retried at their own list position
    /// rather than jumping the queue.
    fn schedule_generate_phase(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) {
        for group_id in 0..sequence_groups.len() {
            {
                let group = &sequence_groups[group_id];
                if !group.can_generate_tokens() || group.is_waiting() {
                    continue;
                }
                assert!(!group.has_finished());
            }

            let num_running_seqs = sequence_groups[group_id].num_running_seqs();
            let tokens_in_megabatch = self
                .config
                .max_num_batched_tokens
                .saturating_sub(output.total_num_scheduled_tokens);
            let available_tokens_per_seq = tokens_in_megabatch / num_running_seqs;

            // Not even a single token per sibling fits; maybe a smaller group
            // further down still does.
            if available_tokens_per_seq == 0 {
                continue;
            }

            // More than one token per sibling is possible when earlier
            // preemption rewound this group's processed count.
            let num_available_tokens =
                sequence_groups[group_id].num_available_tokens_for_batching();
            let num_scheduled_tokens_per_seq = available_tokens_per_seq.min(num_available_tokens);
            sequence_groups[group_id].schedule_tokens(num_scheduled_tokens_per_seq);

            self.apply_preemption(group_id, sequence_groups);

            // Even after evicting everyone it may legally evict, the append
            // does not fit; back out and try the next group.
            if !self.block_manager.can_append_slots(&sequence_groups[group_id]) {
                sequence_groups[group_id].clear_scheduled_tokens();
                continue;
            }

            let copy_map = self.block_manager.append_slots(&sequence_groups[group_id]);

            let group = &sequence_groups[group_id];
            trace!(
                request_id = group.request_id(),
                tokens = num_scheduled_tokens_per_seq,
                siblings = num_running_seqs,
                "scheduled generation tokens"
            );
            output.scheduled_group_ids.push(group_id);
            output.total_num_scheduled_tokens += num_scheduled_tokens_per_seq * num_running_seqs;
            for seq in group.running_sequences() {
                output
                    .block_tables
                    .insert(seq.id(), self.block_manager.get_block_table(seq.id()).to_vec());
            }
            for (src, dst_indices) in copy_map {
                output
                    .block_copy_map
                    .entry(src)
                    .or_default()
                    .extend(dst_indices);
            }

            if output.total_num_scheduled_tokens == self.config.max_num_batched_tokens {
                break;
            }
        }
    }

    // ========== Prompt phases ==========

    /// Schedule whole prompts for a dedicated, padded prompt step.
    ///
    /// The model runner pads every prompt in the batch to the longest one, so
    /// the megabatch accounting is conservative against that worst case:
    /// `total = max_sequence_len * number_of_scheduled_groups`.
    fn schedule_prompt_phase_vllm(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) {
        assert!(
            !self.config.dynamic_split_fuse,
            "padded prompt scheduling is only valid without dynamic split-fuse"
        );
        assert!(
            output.scheduled_group_ids.is_empty(),
            "prompt phase must be scheduled first"
        );

        let mut num_running_sequence_groups = sequence_groups
            .iter()
            .filter(|group| group.can_generate_tokens())
            .count();
        let mut max_sequence_len = 0;

        for group_id in 0..sequence_groups.len() {
            {
                let group = &sequence_groups[group_id];
                if group.can_generate_tokens() || group.is_waiting() {
                    continue;
                }
                assert_eq!(
                    group.num_running_seqs(),
                    1,
                    "prompt phase requires exactly one running sequence per group"
                );
                if !self.config.enable_prefix_caching {
                    assert_eq!(
                        group.num_processed_tokens(),
                        0,
                        "prompts are scheduled in a single shot"
                    );
                }
            }

            let num_available_tokens_in_megabatch = self
                .config
                .max_num_batched_tokens
                .saturating_sub(output.total_num_scheduled_tokens);
            let sequence_len = sequence_groups[group_id].num_available_tokens_for_batching();
            max_sequence_len = max_sequence_len.max(sequence_len);

            assert!(
                sequence_len <= self.config.max_num_batched_tokens,
                "prompt of {sequence_len} tokens cannot fit a megabatch of {}",
                self.config.max_num_batched_tokens
            );

            if num_running_sequence_groups >= self.config.max_num_seqs {
                break;
            }
            if num_available_tokens_in_megabatch < max_sequence_len {
                break;
            }
            let num_required_blocks = sequence_len.div_ceil(self.config.block_size);
            if !self.block_manager.can_allocate_blocks(num_required_blocks) {
                break;
            }

            let group = &mut sequence_groups[group_id];
            let seq_id = group.sequences()[0].id();
            group.schedule_tokens(sequence_len);
            self.block_manager.append_slots(group);

            trace!(
                request_id = group.request_id(),
                tokens = sequence_len,
                "admitted prompt"
            );
            output.scheduled_group_ids.push(group_id);
            output
                .block_tables
                .insert(seq_id, self.block_manager.get_block_table(seq_id).to_vec());
            output.total_num_scheduled_tokens =
                max_sequence_len * output.scheduled_group_ids.len();
            output.is_prompt = true;

            num_running_sequence_groups += 1;
        }
    }

    /// Fill the remaining megabatch budget with prompt chunks.
    ///
    /// Each group gets at most the budget that is left and at most what the
    /// free block pool can back; a prompt may advance by a partial chunk and
    /// continue on later steps.
    fn schedule_prompt_phase_dynamic_split_fuse(
        &mut self,
        sequence_groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) {
        let block_size = self.config.block_size;

        for group_id in 0..sequence_groups.len() {
            let group = &sequence_groups[group_id];
            if group.can_generate_tokens() || group.is_waiting() {
                continue;
            }
            let num_running_seqs = group.num_running_seqs();
            assert_eq!(
                num_running_seqs, 1,
                "prompt phase requires exactly one running sequence per group"
            );
            let seq_id = group.sequences()[0].id();

            let tokens_in_megabatch = self
                .config
                .max_num_batched_tokens
                .saturating_sub(output.total_num_scheduled_tokens);
            let num_available_tokens = group.num_available_tokens_for_batching();
            let mut num_scheduled_tokens = tokens_in_megabatch.min(num_available_tokens);

            // Only schedule what the block pool can back: slots left in the
            // blocks already owned, plus whatever fresh blocks are grantable.
            let occupied_blocks = self
                .block_manager
                .get_number_of_blocks_occupied_by_sequence(group);
            let available_slots =
                (occupied_blocks * block_size).saturating_sub(group.num_processed_tokens());
            let required_slots = num_scheduled_tokens.saturating_sub(available_slots);
            let num_required_blocks = required_slots.div_ceil(block_size);
            let num_scheduled_blocks =
                num_required_blocks.min(self.block_manager.num_free_blocks());
            num_scheduled_tokens =
                num_scheduled_tokens.min(available_slots + num_scheduled_blocks * block_size);

            if num_scheduled_tokens > 0 {
                if num_scheduled_blocks > 0
                    && self
                        .block_manager
                        .allocate(seq_id, num_scheduled_blocks, group.prompt_ids())
                        .is_err()
                {
                    continue;
                }
                let group = &mut sequence_groups[group_id];
                group.schedule_tokens(num_scheduled_tokens);

                trace!(
                    request_id = group.request_id(),
                    tokens = num_scheduled_tokens,
                    blocks = num_scheduled_blocks,
                    "scheduled prompt chunk"
                );
                output.scheduled_group_ids.push(group_id);
                output
                    .block_tables
                    .insert(seq_id, self.block_manager.get_block_table(seq_id).to_vec());
                output.total_num_scheduled_tokens += num_scheduled_tokens * num_running_seqs;
            }

            if output.total_num_scheduled_tokens == self.config.max_num_batched_tokens {
                break;
            }
        }
    }

    // ========== Preemption ==========

    /// Evict lower-priority groups until the current group's append fits or
    /// nothing legal is left to evict.
    ///
    /// A victim must sit strictly behind the current group in the list. When
    /// the reverse scan reaches the current group itself, the eviction would
    /// be a cycle and the loop stops; the current group then simply does not
    /// run this step.
    fn apply_preemption(&mut self, group_id: usize, sequence_groups: &mut [SequenceGroup]) {
        while !self.block_manager.can_append_slots(&sequence_groups[group_id]) {
            let Some(victim_id) = Self::lowest_priority_group_id(sequence_groups) else {
                break;
            };
            if victim_id <= group_id {
                break;
            }
            let blocks_needed = self
                .block_manager
                .required_blocks_count(&sequence_groups[group_id]);
            if !self.preempt_by_recompute(&mut sequence_groups[victim_id], blocks_needed) {
                break;
            }
        }
    }

    /// Find the lowest-priority group that still holds reserved KV blocks.
    fn lowest_priority_group_id(sequence_groups: &[SequenceGroup]) -> Option<usize> {
        sequence_groups
            .iter()
            .rposition(|group| group.num_processed_tokens() > 0)
    }

    /// Evict blocks from a victim and rewind its processed count so the
    /// evicted tokens are recomputed when the victim is rescheduled.
    ///
    /// # Returns
    ///
    /// True iff the eviction actually freed blocks; a false return means
    /// further preemption attempts cannot make progress.
    fn preempt_by_recompute(&mut self, victim: &mut SequenceGroup, blocks_needed: usize) -> bool {
        let processed_tokens = victim.num_processed_tokens();
        let block_size = self.config.block_size;
        let prev_free_blocks = self.block_manager.num_free_blocks();
        let occupied_blocks = self
            .block_manager
            .get_number_of_blocks_occupied_by_sequence(victim);

        if occupied_blocks <= blocks_needed {
            // Releasing part of the victim would not be enough; drop it whole.
            let seq_ids: Vec<SequenceId> = victim.running_sequences().map(|s| s.id()).collect();
            for seq_id in seq_ids {
                self.block_manager.free_sequence(seq_id);
            }
            victim.preempt_tokens(processed_tokens);
            victim.set_waiting();
            debug!(
                request_id = victim.request_id(),
                preempted_tokens = processed_tokens,
                "fully preempted sequence group"
            );
            return self.block_manager.num_free_blocks() > prev_free_blocks;
        }

        let logical_blocks_released = self
            .block_manager
            .free_group_partially(victim, blocks_needed);

        let mut tokens_in_last_block = processed_tokens % block_size;
        if tokens_in_last_block == 0 {
            tokens_in_last_block = block_size;
        }
        let mut preempted_tokens =
            tokens_in_last_block + logical_blocks_released.saturating_sub(1) * block_size;

        // In padded prompt scheduling a prompt is computed in one shot, so a
        // rewind must never leave it half materialized.
        if !self.config.dynamic_split_fuse
            && processed_tokens - preempted_tokens < victim.prompt_len()
        {
            preempted_tokens = processed_tokens;
            let seq_id = victim.sequences()[0].id();
            self.block_manager.free_sequence(seq_id);
        }
        victim.preempt_tokens(preempted_tokens);
        victim.set_waiting();
        debug!(
            request_id = victim.request_id(),
            preempted_tokens,
            logical_blocks_released,
            "partially preempted sequence group"
        );
        logical_blocks_released > 0
    }
}
