//! GRPO: Group Relative Policy Optimization
//!
//! One training step over a batch of prompts:
//! 1. Split the prompts into chunks of `group_size`
//! 2. Sample `group_size` chain-of-thought completions per prompt (no gradient)
//! 3. Score the chunk's responses and sum the normalized rewards
//! 4. Mean log-prob of each response's generated tokens under the frozen
//!    reference and the current policy
//! 5. Normalize the summed rewards across the chunk into advantages
//! 6. Clipped-ratio surrogate plus a `beta`-scaled KL term, then one AdamW step
//!
//! The reference policy is a deep copy of the policy's starting weights and
//! is never stepped. [`GrpoTrainer::for_tiny_lm`] takes that copy itself;
//! callers of [`GrpoTrainer::new`] supply it.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thinkchat_core::{GenerationConfig, GrpoConfig, Result, ThinkChatError, TokenCodec};
use thinkchat_train::logging::GRAD_NORM_WARN;
use thinkchat_train::model::{snapshot_varmap, token_log_probs};
use thinkchat_train::optim::{adamw, clipped_step};
use thinkchat_train::{CotGenerator, CotSample, ScoringModel, TinyLm};
use tracing::{debug, info, span, warn, Level};

use crate::reward::{normalize, RewardAggregator};

/// Chunk-level advantages: summed rewards normalized across the chunk.
///
/// Identical rewards give all-zero advantages.
pub fn group_advantages(rewards: &[f64]) -> Vec<f64> {
    normalize(rewards)
}

/// `-mean(min(r * A, clip(r, 1 - eps, 1 + eps) * A))` with `r = exp(current - reference)`.
///
/// All inputs are `[n]`; gradients flow through `current` only.
pub fn clipped_surrogate_loss(
    current: &Tensor,
    reference: &Tensor,
    advantages: &Tensor,
    eps_clip: f64,
) -> Result<Tensor> {
    let ratio = (current - reference.detach())?.exp()?;
    let clipped = ratio.clamp(1.0 - eps_clip, 1.0 + eps_clip)?;
    let unclipped_obj = (&ratio * advantages)?;
    let clipped_obj = (clipped * advantages)?;
    Ok(unclipped_obj.minimum(&clipped_obj)?.mean_all()?.neg()?)
}

/// `beta * mean(current - reference)`.
pub fn kl_penalty(current: &Tensor, reference: &Tensor, beta: f64) -> Result<Tensor> {
    Ok(((current - reference.detach())?.mean_all()? * beta)?)
}

/// Mean log-prob of the generated tokens of `sample`, teacher-forced.
///
/// A sample with nothing generated scores zero.
pub fn sequence_log_prob(model: &dyn ScoringModel, sample: &CotSample, eval: bool) -> Result<Tensor> {
    let ids = &sample.token_ids;
    let generated = ids.len().saturating_sub(sample.prompt_len);
    if generated == 0 || ids.len() < 2 {
        return Ok(Tensor::zeros((), DType::F32, model.device())?);
    }
    // Entry i of the per-token log-probs predicts ids[i + 1].
    let start = sample.prompt_len.max(1) - 1;
    let count = ids.len() - 1 - start;
    let lp = token_log_probs(model, ids, eval)?;
    Ok(lp.narrow(0, start, count)?.mean_all()?)
}

/// Per-step training statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpoStepStats {
    pub step: usize,
    /// Policy loss plus KL term, averaged over chunks.
    pub loss: f64,
    pub policy_loss: f64,
    /// Mean `current - reference` log-prob, unscaled.
    pub kl: f64,
    /// Mean of the summed raw rewards.
    pub mean_reward: f64,
    pub reward_std: f64,
    pub mean_ratio: f64,
    /// Pre-clip gradient norm, averaged over chunks.
    pub grad_norm: f64,
    pub num_responses: usize,
    pub num_chunks: usize,
}

/// Policy trainer over a frozen reference copy.
pub struct GrpoTrainer<'a> {
    policy: &'a dyn ScoringModel,
    reference: Box<dyn ScoringModel + 'a>,
    _reference_vars: Option<VarMap>,
    vars: Vec<Var>,
    codec: &'a dyn TokenCodec,
    rewards: RewardAggregator,
    optimizer: AdamW,
    config: GrpoConfig,
    generation: GenerationConfig,
    rng: StdRng,
    pub global_step: usize,
}

impl<'a> GrpoTrainer<'a> {
    /// Build a trainer over a caller-supplied reference.
    ///
    /// `reference` must be a frozen snapshot of `policy` taken before
    /// training (for example a model built over
    /// [`snapshot_varmap`](thinkchat_train::snapshot_varmap) of the policy
    /// varmap) and must not share `policy_vars`, the only parameters the
    /// optimizer updates. The ratio and KL terms are measured against it.
    pub fn new(
        policy: &'a dyn ScoringModel,
        reference: Box<dyn ScoringModel + 'a>,
        policy_vars: Vec<Var>,
        codec: &'a dyn TokenCodec,
        rewards: RewardAggregator,
        config: GrpoConfig,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        if rewards.is_empty() {
            return Err(ThinkChatError::InvalidConfig(
                "GRPO needs at least one reward function".into(),
            ));
        }
        let optimizer = adamw(policy_vars.clone(), config.learning_rate, 0.9, 0.999, 1e-8, 0.01)?;
        let generation = GenerationConfig {
            max_new_tokens: config.max_new_tokens,
            temperature: config.sampling.temperature,
            top_k: config.sampling.top_k,
            top_p: config.sampling.top_p,
            ..GenerationConfig::chain_of_thought()
        };
        Ok(Self {
            policy,
            reference,
            _reference_vars: None,
            vars: policy_vars,
            codec,
            rewards,
            optimizer,
            config,
            generation,
            rng: StdRng::seed_from_u64(seed),
            global_step: 0,
        })
    }

    /// Snapshot `varmap` into a second [`TinyLm`] that serves as the reference.
    pub fn for_tiny_lm(
        policy: &'a TinyLm,
        varmap: &VarMap,
        codec: &'a dyn TokenCodec,
        rewards: RewardAggregator,
        config: GrpoConfig,
        seed: u64,
    ) -> Result<Self> {
        let reference_vars = snapshot_varmap(varmap)?;
        let vb = VarBuilder::from_varmap(&reference_vars, DType::F32, policy.device());
        let reference = TinyLm::new(policy.config(), vb)?;
        let mut trainer = Self::new(
            policy,
            Box::new(reference),
            varmap.all_vars(),
            codec,
            rewards,
            config,
            seed,
        )?;
        trainer._reference_vars = Some(reference_vars);
        Ok(trainer)
    }

    pub fn config(&self) -> &GrpoConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        self.policy.device()
    }

    fn rollout(&mut self, prompts: &[String]) -> Result<Vec<CotSample>> {
        let generator = CotGenerator::new(self.policy, self.codec, self.generation.clone())?;
        let mut samples = Vec::with_capacity(prompts.len() * self.config.group_size);
        for prompt in prompts {
            samples.extend(generator.generate(prompt, self.config.group_size, &mut self.rng)?);
        }
        Ok(samples)
    }

    fn train_chunk(&mut self, prompts: &[String]) -> Result<GrpoStepStats> {
        let samples = self.rollout(prompts)?;
        let responses: Vec<&str> = samples.iter().map(|s| s.full_output.as_str()).collect();
        let breakdown = self.rewards.compute(&responses)?;
        let advantages = group_advantages(&breakdown.combined);

        let reference_lp = samples
            .iter()
            .map(|s| sequence_log_prob(self.reference.as_ref(), s, true))
            .collect::<Result<Vec<_>>>()?;
        let current_lp = samples
            .iter()
            .map(|s| sequence_log_prob(self.policy, s, false))
            .collect::<Result<Vec<_>>>()?;
        let reference_lp = Tensor::stack(&reference_lp, 0)?;
        let current_lp = Tensor::stack(&current_lp, 0)?;
        let adv: Vec<f32> = advantages.iter().map(|a| *a as f32).collect();
        let adv = Tensor::from_vec(adv, samples.len(), self.device())?;

        let policy_loss = clipped_surrogate_loss(&current_lp, &reference_lp, &adv, self.config.eps_clip)?;
        let kl_term = kl_penalty(&current_lp, &reference_lp, self.config.beta)?;
        let loss = (&policy_loss + &kl_term)?;

        let log_ratio = (current_lp.detach() - &reference_lp)?;
        let kl = log_ratio.mean_all()?.to_scalar::<f32>()? as f64;
        let mean_ratio = log_ratio.exp()?.mean_all()?.to_scalar::<f32>()? as f64;
        let loss_val = loss.to_scalar::<f32>()? as f64;
        let policy_loss_val = policy_loss.to_scalar::<f32>()? as f64;

        let grad_norm = clipped_step(
            &mut self.optimizer,
            &loss,
            &self.vars,
            self.config.max_grad_norm,
        )?;

        let totals = breakdown.raw_totals();
        let n = totals.len().max(1) as f64;
        let mean_reward = totals.iter().sum::<f64>() / n;
        let reward_std = (totals.iter().map(|r| (r - mean_reward).powi(2)).sum::<f64>() / n).sqrt();

        debug!(
            responses = samples.len(),
            finished = samples.iter().filter(|s| s.finished).count(),
            loss = loss_val,
            "GRPO chunk complete"
        );
        Ok(GrpoStepStats {
            step: self.global_step,
            loss: loss_val,
            policy_loss: policy_loss_val,
            kl,
            mean_reward,
            reward_std,
            mean_ratio,
            grad_norm,
            num_responses: samples.len(),
            num_chunks: 1,
        })
    }

    /// One GRPO step over `prompts`; every chunk gets its own optimizer update.
    pub fn train_step(&mut self, prompts: &[String]) -> Result<GrpoStepStats> {
        if prompts.is_empty() {
            return Err(ThinkChatError::Other("GRPO step needs at least one prompt".into()));
        }
        let span = span!(Level::INFO, "grpo_step", step = self.global_step);
        let _enter = span.enter();

        let group_size = self.config.group_size;
        let mut chunks = Vec::new();
        for chunk in prompts.chunks(group_size) {
            chunks.push(self.train_chunk(chunk)?);
        }

        let mean = |f: &dyn Fn(&GrpoStepStats) -> f64| average(&chunks, f);
        let stats = GrpoStepStats {
            step: self.global_step,
            loss: mean(&|s| s.loss),
            policy_loss: mean(&|s| s.policy_loss),
            kl: mean(&|s| s.kl),
            mean_reward: mean(&|s| s.mean_reward),
            reward_std: mean(&|s| s.reward_std),
            mean_ratio: mean(&|s| s.mean_ratio),
            grad_norm: mean(&|s| s.grad_norm),
            num_responses: chunks.iter().map(|s| s.num_responses).sum(),
            num_chunks: chunks.len(),
        };
        self.global_step += 1;
        log_grpo_step(&stats);
        Ok(stats)
    }

    /// Run `num_steps` steps over the same prompts.
    pub fn train(&mut self, prompts: &[String], num_steps: usize) -> Result<Vec<GrpoStepStats>> {
        (0..num_steps).map(|_| self.train_step(prompts)).collect()
    }
}

fn average(chunks: &[GrpoStepStats], f: &dyn Fn(&GrpoStepStats) -> f64) -> f64 {
    chunks.iter().map(f).sum::<f64>() / chunks.len().max(1) as f64
}

fn log_grpo_step(stats: &GrpoStepStats) {
    if !stats.loss.is_finite() {
        warn!(step = stats.step, loss = stats.loss, "GRPO loss is not finite");
        return;
    }
    info!(
        step = stats.step,
        loss = stats.loss,
        policy_loss = stats.policy_loss,
        kl = stats.kl,
        mean_reward = stats.mean_reward,
        reward_std = stats.reward_std,
        mean_ratio = stats.mean_ratio,
        grad_norm = stats.grad_norm,
        responses = stats.num_responses,
        "GRPO step completed"
    );
    if stats.grad_norm > GRAD_NORM_WARN {
        warn!(
            step = stats.step,
            grad_norm = stats.grad_norm,
            threshold = GRAD_NORM_WARN,
            "High gradient norm detected - potential instability"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    #[test]
    fn test_identical_rewards_give_zero_advantages() {
        let adv = group_advantages(&[0.7; 8]);
        assert!(adv.iter().all(|a| *a == 0.0));
    }

    #[test]
    fn test_surrogate_at_unit_ratio() -> Result<()> {
        let dev = Device::Cpu;
        let lp = Tensor::new(&[-1.0f32, -2.0, -3.0], &dev)?;
        let adv = Tensor::new(&[1.0f32, -1.0, 0.5], &dev)?;
        // ratio == 1 everywhere, so the loss is -mean(A).
        let loss = clipped_surrogate_loss(&lp, &lp, &adv, 0.2)?.to_scalar::<f32>()?;
        assert_relative_eq!(loss, -(1.0 - 1.0 + 0.5) / 3.0, epsilon = 1e-6);
        let kl = kl_penalty(&lp, &lp, 0.1)?.to_scalar::<f32>()?;
        assert_relative_eq!(kl, 0.0, epsilon = 1e-7);
        Ok(())
    }

    #[test]
    fn test_surrogate_clips_large_ratio() -> Result<()> {
        let dev = Device::Cpu;
        let current = Tensor::new(&[0.0f32], &dev)?;
        let reference = Tensor::new(&[-1.0f32], &dev)?;
        let adv = Tensor::new(&[2.0f32], &dev)?;
        // ratio = e > 1.2, positive advantage: clipped objective 1.2 * 2.
        let loss = clipped_surrogate_loss(&current, &reference, &adv, 0.2)?.to_scalar::<f32>()?;
        assert_relative_eq!(loss, -2.4, epsilon = 1e-5);

        let neg = Tensor::new(&[-2.0f32], &dev)?;
        // Negative advantage keeps the unclipped, more pessimistic term.
        let loss = clipped_surrogate_loss(&current, &reference, &neg, 0.2)?.to_scalar::<f32>()?;
        assert_relative_eq!(loss, 2.0 * std::f32::consts::E, epsilon = 1e-4);

        let kl = kl_penalty(&current, &reference, 0.5)?.to_scalar::<f32>()?;
        assert_relative_eq!(kl, 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_empty_generation_scores_zero() -> Result<()> {
        let cfg = thinkchat_core::ModelConfig {
            vocab_size: 16,
            dim: 4,
            hidden_dim: 4,
        };
        let (_vars, model) = thinkchat_train::build_tiny_lm(&cfg, &Device::Cpu)?;
        let sample = CotSample {
            full_output: String::new(),
            thought: String::new(),
            answer: String::new(),
            token_ids: vec![1, 2, 3],
            prompt_len: 3,
            finished: false,
        };
        let lp = sequence_log_prob(&model, &sample, true)?.to_scalar::<f32>()?;
        assert_eq!(lp, 0.0);

        let sample = CotSample {
            prompt_len: 1,
            ..sample
        };
        let lp = sequence_log_prob(&model, &sample, true)?.to_scalar::<f32>()?;
        assert!(lp < 0.0 && lp.is_finite());
        Ok(())
    }
}
