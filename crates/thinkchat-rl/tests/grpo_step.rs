//! End-to-end GRPO steps on the reference model.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use thinkchat_core::{GrpoConfig, ModelConfig, Result, SamplingConfig, TokenCodec};
use thinkchat_rl::{FormatReward, GrpoTrainer, RewardAggregator};
use thinkchat_train::{build_tiny_lm, snapshot_varmap, TinyLm};

const ALPHABET: &str = " abcdefghijklmnopqrstuvwxyz0123456789+=?:.<>/\nUA";
const OFFSET: u32 = 4;

/// One id per alphabet character; 0..4 are pad/unk/bos/eos.
struct CharCodec;

impl TokenCodec for CharCodec {
    fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .chars()
            .map(|c| ALPHABET.find(c).map_or(1, |i| i as u32 + OFFSET))
            .collect())
    }

    fn encode_fixed(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![2];
        ids.extend(self.encode_prompt(text)?);
        ids.push(3);
        ids.resize(ids.len().max(self.max_length()), 0);
        ids.truncate(self.max_length());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .map(|id| self.decode_token(*id))
            .collect::<Result<String>>()?
            .trim()
            .to_string())
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        Ok(id
            .checked_sub(OFFSET)
            .and_then(|i| ALPHABET.chars().nth(i as usize))
            .map(String::from)
            .unwrap_or_default())
    }

    fn vocab_size(&self) -> usize {
        ALPHABET.chars().count() + OFFSET as usize
    }

    fn max_length(&self) -> usize {
        96
    }

    fn pad_id(&self) -> u32 {
        0
    }

    fn eos_id(&self) -> u32 {
        3
    }
}

fn flat_params(varmap: &VarMap) -> Result<Vec<f32>> {
    let data = varmap.data().lock().expect("lock");
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    let mut out = Vec::new();
    for name in names {
        out.extend(data[name].as_tensor().flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(out)
}

fn config() -> GrpoConfig {
    GrpoConfig {
        group_size: 2,
        learning_rate: 1e-2,
        max_new_tokens: 6,
        sampling: SamplingConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        },
        ..Default::default()
    }
}

#[test]
fn grpo_step_updates_policy_only() -> Result<()> {
    let codec = CharCodec;
    let model_cfg = ModelConfig {
        vocab_size: codec.vocab_size(),
        dim: 16,
        hidden_dim: 32,
    };
    let (varmap, policy) = build_tiny_lm(&model_cfg, &Device::Cpu)?;
    let before = flat_params(&varmap)?;

    let mut rewards = RewardAggregator::new();
    rewards
        .register("length", |r: &str| r.len() as f64)
        .register("format", FormatReward);
    let mut trainer = GrpoTrainer::for_tiny_lm(&policy, &varmap, &codec, rewards, config(), 7)?;

    let prompts: Vec<String> = vec!["1+1?".into(), "2+2?".into(), "3+3?".into()];
    let stats = trainer.train_step(&prompts)?;

    // Two chunks: [p0, p1] and [p2], two samples per prompt.
    assert_eq!(stats.num_chunks, 2);
    assert_eq!(stats.num_responses, 6);
    assert!(stats.loss.is_finite());
    assert!(stats.grad_norm.is_finite());
    assert!(stats.mean_ratio > 0.0 && stats.mean_ratio.is_finite());
    assert_eq!(trainer.global_step, 1);

    let after = flat_params(&varmap)?;
    assert_ne!(before, after, "policy parameters should move");
    Ok(())
}

#[test]
fn reference_stays_frozen_across_steps() -> Result<()> {
    let codec = CharCodec;
    let model_cfg = ModelConfig {
        vocab_size: codec.vocab_size(),
        dim: 8,
        hidden_dim: 16,
    };
    let (varmap, policy) = build_tiny_lm(&model_cfg, &Device::Cpu)?;
    let ref_vars = snapshot_varmap(&varmap)?;
    let reference = TinyLm::new(
        &model_cfg,
        VarBuilder::from_varmap(&ref_vars, DType::F32, &Device::Cpu),
    )?;
    let ref_before = flat_params(&ref_vars)?;
    assert_eq!(ref_before, flat_params(&varmap)?);

    let mut rewards = RewardAggregator::new();
    rewards.register("length", |r: &str| r.len() as f64);
    let mut trainer = GrpoTrainer::new(
        &policy,
        Box::new(reference),
        varmap.all_vars(),
        &codec,
        rewards,
        config(),
        11,
    )?;
    let prompts = vec!["hi".to_string(), "yo".to_string()];
    let history = trainer.train(&prompts, 3)?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].step, 2);
    assert!(history.iter().all(|s| s.loss.is_finite()));
    assert_eq!(flat_params(&ref_vars)?, ref_before);
    assert_ne!(flat_params(&varmap)?, ref_before, "policy should have moved");
    Ok(())
}

#[test]
fn empty_registry_is_rejected() -> Result<()> {
    let codec = CharCodec;
    let model_cfg = ModelConfig {
        vocab_size: codec.vocab_size(),
        dim: 4,
        hidden_dim: 4,
    };
    let (varmap, policy) = build_tiny_lm(&model_cfg, &Device::Cpu)?;
    let result = GrpoTrainer::for_tiny_lm(
        &policy,
        &varmap,
        &codec,
        RewardAggregator::new(),
        config(),
        0,
    );
    assert!(result.is_err());
    Ok(())
}
