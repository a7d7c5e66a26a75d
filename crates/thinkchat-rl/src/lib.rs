//! thinkchat-rl: reinforcement learning for think/answer reasoning.
//!
//! ## Architecture
//!
//! 1. **Rewards**: a registry of named scoring functions, each normalized
//!    across the batch and summed into one signal per response
//! 2. **GRPO**: grouped sampling, chunk-relative advantages, clipped ratio
//!    against a frozen reference copy of the policy and a KL penalty

pub mod grpo;
pub mod reward;

pub use grpo::{
    clipped_surrogate_loss, group_advantages, kl_penalty, sequence_log_prob, GrpoStepStats,
    GrpoTrainer,
};
pub use reward::{
    extract_answer, normalize, AccuracyReward, FormatReward, RewardAggregator, RewardBreakdown,
    RewardFn,
};
