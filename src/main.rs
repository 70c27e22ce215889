//! paged-scheduler CLI - a synthetic engine-loop simulator.
//!
//! Drives the scheduler against a randomized workload without a real model:
//! the "runner" simply consumes the scheduled tokens and the "sampler" appends
//! random tokens to fully materialized requests. Useful for observing how the
//! two batching regimes, preemption and prefix caching behave under different
//! pool sizes.
//!
//! ## Usage
//!
//! ```bash
//! # Padded prompt / generation steps
//! paged-scheduler --num-requests 64 --num-kv-blocks 256
//!
//! # Dynamic split-fuse with a shared prompt prefix and prefix caching
//! paged-scheduler --dynamic-split-fuse --enable-prefix-caching --shared-prefix-len 64
//! ```

use std::collections::VecDeque;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use paged_scheduler::core::sequence::{FinishReason, SequenceGroup};
use paged_scheduler::{Scheduler, SchedulerConfig};

const VOCAB_SIZE: u32 = 32000;
const EOS_PROBABILITY: f64 = 0.02;

/// paged-scheduler: continuous-batching scheduler simulator
#[derive(Parser, Debug)]
#[command(name = "paged-scheduler")]
#[command(version, about, long_about = None)]
struct Args {
    /// Interleave prompt chunks with generation in a single step
    #[arg(long)]
    dynamic_split_fuse: bool,

    /// Number of synthetic requests to run to completion
    #[arg(long, default_value = "64")]
    num_requests: usize,

    /// Minimum prompt length
    #[arg(long, default_value = "16")]
    min_prompt_len: usize,

    /// Maximum prompt length
    #[arg(long, default_value = "256")]
    max_prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_new_tokens: usize,

    /// Length of the prompt prefix shared by all requests
    #[arg(long, default_value = "0")]
    shared_prefix_len: usize,

    /// Requests admitted to the scheduler per step
    #[arg(long, default_value = "4")]
    arrivals_per_step: usize,

    /// Tokens per KV cache block
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Number of KV cache blocks
    #[arg(long, default_value = "512")]
    num_kv_blocks: usize,

    /// Megabatch token budget per step
    #[arg(long, default_value = "2048")]
    max_num_batched_tokens: usize,

    /// Maximum groups admitted in one padded prompt step
    #[arg(long, default_value = "256")]
    max_num_seqs: usize,

    /// Enable prefix caching
    #[arg(long)]
    enable_prefix_caching: bool,

    /// Random seed for reproducible workloads
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Load the scheduler configuration from a JSON file instead of flags
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

impl Args {
    fn scheduler_config(&self) -> anyhow::Result<SchedulerConfig> {
        match &self.config {
            Some(path) => Ok(SchedulerConfig::from_json_file(path)?),
            None => Ok(SchedulerConfig {
                dynamic_split_fuse: self.dynamic_split_fuse,
                max_num_batched_tokens: self.max_num_batched_tokens,
                max_num_seqs: self.max_num_seqs,
                num_kv_blocks: self.num_kv_blocks,
                block_size: self.block_size,
                enable_prefix_caching: self.enable_prefix_caching,
            }),
        }
    }
}

fn build_requests(args: &Args, rng: &mut StdRng) -> VecDeque<SequenceGroup> {
    let shared_prefix: Vec<u32> = (0..args.shared_prefix_len)
        .map(|_| rng.gen_range(0..VOCAB_SIZE))
        .collect();

    (0..args.num_requests as u64)
        .map(|request_id| {
            let prompt_len = rng.gen_range(args.min_prompt_len..=args.max_prompt_len).max(1);
            let mut prompt_ids = Vec::with_capacity(prompt_len);
            prompt_ids.extend(shared_prefix.iter().take(prompt_len - 1));
            while prompt_ids.len() < prompt_len {
                prompt_ids.push(rng.gen_range(0..VOCAB_SIZE));
            }
            SequenceGroup::new(request_id, prompt_ids, request_id)
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = args.scheduler_config()?;
    info!(?config, "starting simulation");

    let mut scheduler = Scheduler::new(config)?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut pending = build_requests(&args, &mut rng);
    let mut groups: Vec<SequenceGroup> = Vec::new();

    let mut steps = 0usize;
    let mut total_tokens = 0usize;
    let mut completed = 0usize;
    let mut partial_steps = 0usize;
    let mut idle_steps = 0usize;
    let start = Instant::now();

    while completed < args.num_requests {
        // Newly admitted requests go to the tail: admission order is priority.
        for _ in 0..args.arrivals_per_step {
            if let Some(mut group) = pending.pop_front() {
                scheduler.restore_cached_blocks(&mut group);
                groups.push(group);
            }
        }

        let output = scheduler.schedule(&mut groups);
        steps += 1;
        total_tokens += output.total_num_scheduled_tokens;
        if output.scheduled_group_ids.len() < groups.len() {
            partial_steps += 1;
        }

        if output.is_empty() {
            idle_steps += 1;
            if idle_steps > 100 {
                warn!(
                    in_flight = groups.len(),
                    "scheduler made no progress for 100 steps, aborting"
                );
                break;
            }
            continue;
        }
        idle_steps = 0;

        // The "runner": materialize whatever the scheduler committed.
        for &group_id in &output.scheduled_group_ids {
            groups[group_id].finish_iteration();
        }

        // The "sampler": fully materialized requests produce one more token,
        // hit the end-of-sequence lottery, or run into the length cap.
        for group in groups.iter_mut() {
            if group.has_finished() || group.num_available_tokens_for_batching() != 0 {
                continue;
            }
            let token = rng.gen_range(0..VOCAB_SIZE);
            group.sequences_mut()[0].append_token(token);

            let generated = group.sequences()[0].generated_len();
            let reason = if rng.gen_bool(EOS_PROBABILITY) {
                Some(FinishReason::EndOfSequence)
            } else if generated >= args.max_new_tokens {
                Some(FinishReason::MaxTokens)
            } else {
                None
            };
            if let Some(reason) = reason {
                let seq_ids: Vec<u64> = group.sequences().iter().map(|s| s.id()).collect();
                for seq in group.sequences_mut() {
                    seq.finish(reason);
                }
                for seq_id in seq_ids {
                    scheduler.free_sequence(seq_id);
                }
                completed += 1;
            }
        }
        groups.retain(|group| !group.has_finished());

        if steps % 50 == 0 {
            info!(
                step = steps,
                in_flight = groups.len(),
                pending = pending.len(),
                completed,
                cache_usage = format!("{:.1}%", output.cache_usage),
                "engine step"
            );
        }
    }

    let elapsed = start.elapsed();
    info!(
        steps,
        total_tokens,
        completed,
        partial_steps,
        ?elapsed,
        tokens_per_step = total_tokens as f64 / steps.max(1) as f64,
        "simulation complete"
    );
    Ok(())
}
