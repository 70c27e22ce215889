//! Sequence and sequence-group tracking for inference requests.
//!
//! A [`SequenceGroup`] is one user request. It owns at least one [`Sequence`]
//! (siblings share the prompt prefix and diverge after a fork) and tracks how
//! far the KV cache has been materialized for the request:
//!
//! - `num_processed_tokens`: prompt and generated tokens whose KV state
//!   already lives in the cache;
//! - `num_scheduled_tokens`: tokens the scheduler committed to compute in the
//!   current step, per running sibling.
//!
//! Preemption rewinds `num_processed_tokens`; the rewound tokens are
//! recomputed when the group is rescheduled.

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Lifecycle state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Created, never scheduled yet.
    Waiting,
    /// Actively generating (or being prefilled).
    Running,
    /// Generation complete.
    Finished,
}

/// Reason for sequence completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Maximum token limit reached.
    MaxTokens,
    /// Aborted by user or system.
    Aborted,
}

/// A single generation trajectory.
///
/// The prompt lives on the owning [`SequenceGroup`]; a sequence only stores
/// the tokens generated after it. KV blocks owned by a sequence are tracked
/// and released by the block manager, never by the sequence itself.
#[derive(Debug, Clone)]
pub struct Sequence {
    /// Stable identifier, unique across the engine.
    seq_id: SequenceId,
    /// Generated token IDs.
    generated_ids: Vec<u32>,
    /// Current lifecycle state.
    status: SequenceStatus,
    /// Reason for finishing (if finished).
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    /// Create a new sequence in the `Waiting` state.
    pub fn new(seq_id: SequenceId) -> Self {
        Self {
            seq_id,
            generated_ids: Vec::new(),
            status: SequenceStatus::Waiting,
            finish_reason: None,
        }
    }

    /// Get the sequence ID.
    pub fn id(&self) -> SequenceId {
        self.seq_id
    }

    /// Get the generated token IDs.
    pub fn generated_ids(&self) -> &[u32] {
        &self.generated_ids
    }

    /// Get the number of generated tokens.
    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    /// Get the last generated token, if any.
    pub fn last_token(&self) -> Option<u32> {
        self.generated_ids.last().copied()
    }

    /// Append a generated token.
    pub fn append_token(&mut self, token_id: u32) {
        self.generated_ids.push(token_id);
    }

    /// Get the current lifecycle state.
    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    /// Check whether the sequence has finished.
    pub fn has_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    /// Get the finish reason (if finished).
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Mark the sequence as finished.
    pub fn finish(&mut self, reason: FinishReason) {
        self.status = SequenceStatus::Finished;
        self.finish_reason = Some(reason);
    }

    /// Create a sibling that shares this sequence's history up to now.
    ///
    /// The caller is responsible for mirroring the fork in the block manager
    /// so the two siblings share KV blocks copy-on-write.
    pub fn fork(&self, child_id: SequenceId) -> Self {
        Self {
            seq_id: child_id,
            generated_ids: self.generated_ids.clone(),
            status: self.status,
            finish_reason: self.finish_reason,
        }
    }

    pub(crate) fn set_running(&mut self) {
        if self.status == SequenceStatus::Waiting {
            self.status = SequenceStatus::Running;
        }
    }
}

/// One user request: a shared prompt plus one or more sibling sequences.
///
/// # Example
///
/// ```
/// use paged_scheduler::core::sequence::SequenceGroup;
///
/// let mut group = SequenceGroup::new(1, vec![10, 20, 30, 40], 0);
/// assert_eq!(group.prompt_len(), 4);
/// assert!(!group.can_generate_tokens());
///
/// // The scheduler commits the whole prompt, the runner consumes it.
/// group.schedule_tokens(4);
/// group.finish_iteration();
/// assert_eq!(group.num_processed_tokens(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    /// Identifier of the originating request.
    request_id: u64,
    /// Prompt token IDs, immutable after construction.
    prompt_ids: Vec<u32>,
    /// Sibling sequences; all share the prompt prefix.
    sequences: Vec<Sequence>,
    /// Prompt and generated tokens with materialized KV state.
    num_processed_tokens: usize,
    /// Tokens committed for the current step, per running sibling.
    num_scheduled_tokens: usize,
    /// One-step preemption latch. Set when the group is preempted mid-step so
    /// it cannot be rescheduled in the same step; cleared at step end.
    waiting: bool,
}

impl SequenceGroup {
    /// Create a new group with a single sequence.
    pub fn new(request_id: u64, prompt_ids: Vec<u32>, seq_id: SequenceId) -> Self {
        assert!(
            !prompt_ids.is_empty(),
            "prompt must contain at least one token"
        );
        Self {
            request_id,
            prompt_ids,
            sequences: vec![Sequence::new(seq_id)],
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            waiting: false,
        }
    }

    // ========== Getters ==========

    /// Get the request ID.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Get the prompt token IDs.
    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    /// Get the prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    /// Get the sibling sequences.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// Get mutable access to the sibling sequences.
    pub fn sequences_mut(&mut self) -> &mut [Sequence] {
        &mut self.sequences
    }

    /// Add a forked sibling to the group.
    pub fn add_sequence(&mut self, sequence: Sequence) {
        self.sequences.push(sequence);
    }

    /// Iterate over the siblings that have not finished.
    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|s| !s.has_finished())
    }

    /// Number of siblings that have not finished.
    pub fn num_running_seqs(&self) -> usize {
        self.running_sequences().count()
    }

    /// Check whether every sibling has finished.
    pub fn has_finished(&self) -> bool {
        self.sequences.iter().all(|s| s.has_finished())
    }

    /// Full token stream of one sibling: prompt followed by generated tokens.
    pub fn all_token_ids(&self, seq_index: usize) -> Vec<u32> {
        let mut tokens = self.prompt_ids.clone();
        tokens.extend(self.sequences[seq_index].generated_ids());
        tokens
    }

    // ========== Progress counters ==========

    /// Number of prompt and generated tokens with materialized KV state.
    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Tokens committed for the current step, per running sibling.
    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    /// Logical length of the request: prompt plus the longest live tail.
    pub fn context_len(&self) -> usize {
        let generated = self
            .running_sequences()
            .map(|s| s.generated_len())
            .max()
            .unwrap_or(0);
        self.prompt_len() + generated
    }

    /// Tokens present logically but not yet processed.
    ///
    /// For a generating group this is usually 1 (the freshly sampled token),
    /// but it grows after preemption rewinds `num_processed_tokens`.
    pub fn num_available_tokens_for_batching(&self) -> usize {
        debug_assert_eq!(self.num_scheduled_tokens, 0);
        self.context_len().saturating_sub(self.num_processed_tokens)
    }

    /// Check whether the prompt has been consumed and generation has begun.
    ///
    /// Stays true for preempted groups: their processed count was rewound but
    /// the generated tail still exists and only needs recomputation.
    pub fn can_generate_tokens(&self) -> bool {
        !self.has_finished() && self.context_len() > self.prompt_len()
    }

    /// Blocks needed to hold everything committed so far this step.
    pub fn num_logical_blocks(&self, block_size: usize) -> usize {
        (self.num_processed_tokens + self.num_scheduled_tokens).div_ceil(block_size)
    }

    // ========== Scheduling surface ==========

    /// Commit `num_tokens` tokens per running sibling for the current step.
    pub fn schedule_tokens(&mut self, num_tokens: usize) {
        self.num_scheduled_tokens += num_tokens;
        for seq in &mut self.sequences {
            if !seq.has_finished() {
                seq.set_running();
            }
        }
    }

    /// Drop the current step's commitment. Idempotent.
    pub fn clear_scheduled_tokens(&mut self) {
        self.num_scheduled_tokens = 0;
    }

    /// Consume the current step: the runner has materialized the scheduled
    /// tokens, so they move into the processed count.
    pub fn finish_iteration(&mut self) {
        self.num_processed_tokens += self.num_scheduled_tokens;
        self.num_scheduled_tokens = 0;
        debug_assert!(self.num_processed_tokens <= self.context_len());
    }

    /// Rewind the processed count by `num_tokens`; the evicted tokens must be
    /// recomputed when the group is rescheduled.
    pub fn preempt_tokens(&mut self, num_tokens: usize) {
        assert!(
            num_tokens <= self.num_processed_tokens,
            "cannot preempt more tokens than were processed"
        );
        self.num_processed_tokens -= num_tokens;
    }

    /// Set the processed count directly. Used when cached prefix blocks are
    /// reattached before the first scheduling of a request.
    pub fn update_processed_tokens(&mut self, num_tokens: usize) {
        self.num_processed_tokens = num_tokens;
    }

    // ========== Preemption latch ==========

    /// Latch the group out of scheduling for the rest of the current step.
    pub fn set_waiting(&mut self) {
        self.waiting = true;
    }

    /// Check whether the group was preempted earlier in the current step.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    /// Release the latch; called once per group at the end of every step.
    pub fn clear_waiting(&mut self) {
        self.waiting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_creation() {
        let group = SequenceGroup::new(7, vec![1, 2, 3], 42);

        assert_eq!(group.request_id(), 7);
        assert_eq!(group.prompt_len(), 3);
        assert_eq!(group.context_len(), 3);
        assert_eq!(group.num_running_seqs(), 1);
        assert_eq!(group.sequences()[0].id(), 42);
        assert_eq!(group.sequences()[0].status(), SequenceStatus::Waiting);
        assert!(!group.can_generate_tokens());
        assert!(!group.is_waiting());
    }

    #[test]
    #[should_panic(expected = "at least one token")]
    fn test_empty_prompt_rejected() {
        let _ = SequenceGroup::new(0, vec![], 0);
    }

    #[test]
    fn test_scheduling_promotes_sequences() {
        let mut group = SequenceGroup::new(0, vec![1, 2, 3, 4], 0);

        group.schedule_tokens(4);
        assert_eq!(group.num_scheduled_tokens(), 4);
        assert_eq!(group.sequences()[0].status(), SequenceStatus::Running);

        group.finish_iteration();
        assert_eq!(group.num_processed_tokens(), 4);
        assert_eq!(group.num_scheduled_tokens(), 0);
    }

    #[test]
    fn test_clear_scheduled_tokens_is_idempotent() {
        let mut group = SequenceGroup::new(0, vec![1, 2], 0);
        group.schedule_tokens(2);

        group.clear_scheduled_tokens();
        assert_eq!(group.num_scheduled_tokens(), 0);
        group.clear_scheduled_tokens();
        assert_eq!(group.num_scheduled_tokens(), 0);
        assert_eq!(group.num_processed_tokens(), 0);
    }

    #[test]
    fn test_can_generate_after_first_token() {
        let mut group = SequenceGroup::new(0, vec![1, 2, 3, 4], 0);
        group.schedule_tokens(4);
        group.finish_iteration();
        assert!(!group.can_generate_tokens());

        group.sequences_mut()[0].append_token(99);
        assert!(group.can_generate_tokens());
        assert_eq!(group.num_available_tokens_for_batching(), 1);
    }

    #[test]
    fn test_preemption_rewinds_processed_tokens() {
        let mut group = SequenceGroup::new(0, vec![1; 8], 0);
        group.schedule_tokens(8);
        group.finish_iteration();
        group.sequences_mut()[0].append_token(50);

        group.preempt_tokens(3);
        assert_eq!(group.num_processed_tokens(), 5);
        // The generated tail survives, so the group still generates.
        assert!(group.can_generate_tokens());
        assert_eq!(group.num_available_tokens_for_batching(), 4);
    }

    #[test]
    #[should_panic(expected = "cannot preempt")]
    fn test_preempt_more_than_processed_panics() {
        let mut group = SequenceGroup::new(0, vec![1, 2], 0);
        group.preempt_tokens(1);
    }

    #[test]
    fn test_waiting_latch() {
        let mut group = SequenceGroup::new(0, vec![1], 0);
        assert!(!group.is_waiting());

        group.set_waiting();
        assert!(group.is_waiting());

        group.clear_waiting();
        assert!(!group.is_waiting());
    }

    #[test]
    fn test_fork_shares_history() {
        let mut group = SequenceGroup::new(0, vec![1, 2, 3], 5);
        group.schedule_tokens(3);
        group.finish_iteration();
        group.sequences_mut()[0].append_token(77);

        let child = group.sequences()[0].fork(6);
        group.add_sequence(child);

        assert_eq!(group.num_running_seqs(), 2);
        assert_eq!(group.sequences()[1].id(), 6);
        assert_eq!(group.sequences()[1].generated_ids(), &[77]);
        assert_eq!(group.all_token_ids(1), vec![1, 2, 3, 77]);
    }

    #[test]
    fn test_finished_siblings_are_excluded() {
        let mut group = SequenceGroup::new(0, vec![1, 2], 0);
        let child = group.sequences()[0].fork(1);
        group.add_sequence(child);

        group.sequences_mut()[0].finish(FinishReason::EndOfSequence);
        assert_eq!(group.num_running_seqs(), 1);
        assert!(!group.has_finished());

        group.sequences_mut()[1].finish(FinishReason::MaxTokens);
        assert!(group.has_finished());
        assert!(!group.can_generate_tokens());
    }

    #[test]
    fn test_num_logical_blocks() {
        let mut group = SequenceGroup::new(0, vec![1; 10], 0);
        assert_eq!(group.num_logical_blocks(4), 0);

        group.schedule_tokens(10);
        assert_eq!(group.num_logical_blocks(4), 3);

        group.finish_iteration();
        assert_eq!(group.num_logical_blocks(4), 3);
    }
}
