//! Centralized configuration management with TOML support.
//!
//! Every recognized option is an explicit field with a default. All structs
//! use `deny_unknown_fields`, so a misspelled or unsupported option is
//! rejected when the file is parsed instead of being silently ignored.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ThinkChatError};

fn invalid(msg: impl Into<String>) -> ThinkChatError {
    ThinkChatError::InvalidConfig(msg.into())
}

const CONCEPT_STEM: &str = "concept_data";
const CONFIG_STEM: &str = "config";

/// Concept tokenizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenizerConfig {
    /// Upper bound on the subword vocabulary; clipped for small corpora.
    pub vocab_size: usize,
    /// Exact length of every encoded sequence.
    pub max_length: usize,
    pub pad_token: String,
    pub unk_token: String,
    pub bos_token: String,
    pub eos_token: String,
    pub pad_id: u32,
    pub unk_id: u32,
    pub bos_id: u32,
    pub eos_id: u32,
    /// Longest subword piece the trainer may produce.
    pub max_piece_length: usize,
    /// Fraction of corpus characters that must be representable (0, 1].
    pub character_coverage: f64,
    /// File stem of the subword model inside a bundle (`<model_prefix>.json`).
    pub model_prefix: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            max_length: 8192,
            pad_token: "[PAD]".into(),
            unk_token: "[UNK]".into(),
            bos_token: "[BOS]".into(),
            eos_token: "[EOS]".into(),
            pad_id: 0,
            unk_id: 1,
            bos_id: 2,
            eos_id: 3,
            max_piece_length: 8,
            character_coverage: 1.0,
            model_prefix: "tokenizer".into(),
        }
    }
}

impl TokenizerConfig {
    /// Reserved tokens ordered by id.
    pub fn reserved_tokens(&self) -> Vec<(u32, String)> {
        let mut reserved = vec![
            (self.pad_id, self.pad_token.clone()),
            (self.unk_id, self.unk_token.clone()),
            (self.bos_id, self.bos_token.clone()),
            (self.eos_id, self.eos_token.clone()),
        ];
        reserved.sort_by_key(|(id, _)| *id);
        reserved
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(invalid("tokenizer.vocab_size must be > 0"));
        }
        if self.max_length < 2 {
            return Err(invalid(
                "tokenizer.max_length must be >= 2 to hold begin/end sentinels",
            ));
        }
        let mut ids: Vec<u32> = self.reserved_tokens().iter().map(|(id, _)| *id).collect();
        ids.dedup();
        if ids != [0, 1, 2, 3] {
            return Err(invalid(format!(
                "tokenizer special ids must be a permutation of 0..4, got pad={} unk={} bos={} eos={}",
                self.pad_id, self.unk_id, self.bos_id, self.eos_id
            )));
        }
        if !(self.character_coverage > 0.0 && self.character_coverage <= 1.0) {
            return Err(invalid(format!(
                "tokenizer.character_coverage ({}) must be in (0, 1]",
                self.character_coverage
            )));
        }
        if self.max_piece_length == 0 {
            return Err(invalid("tokenizer.max_piece_length must be > 0"));
        }
        if self.model_prefix.is_empty()
            || self.model_prefix.contains(['/', '\\'])
            || self.model_prefix == CONCEPT_STEM
            || self.model_prefix == CONFIG_STEM
        {
            return Err(invalid(format!(
                "tokenizer.model_prefix ({:?}) must be a plain file stem distinct from the bundle side files",
                self.model_prefix
            )));
        }
        Ok(())
    }
}

/// Next-token sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    /// Logits are divided by this value; must be > 0.
    pub temperature: f64,
    /// Keep only the k highest logits; 0 disables.
    pub top_k: usize,
    /// Nucleus mass in (0, 1]; 1.0 disables.
    pub top_p: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 0,
            top_p: 0.9,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(invalid(format!(
                "sampling temperature ({}) must be > 0",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(invalid(format!(
                "sampling top_p ({}) must be in (0, 1]",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Autoregressive generation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationConfig {
    /// Hard cap on total sequence length (prompt + generated).
    pub max_length: usize,
    /// Cap on generated tokens per sample.
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    /// CTRL-style penalty on already generated tokens; 1.0 disables.
    pub repetition_penalty: f64,
    /// When false, plain generation is greedy.
    pub do_sample: bool,
    pub num_return_sequences: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 2048,
            max_new_tokens: 1024,
            temperature: 0.8,
            top_k: 50,
            top_p: 0.95,
            repetition_penalty: 1.1,
            do_sample: true,
            num_return_sequences: 1,
        }
    }
}

impl GenerationConfig {
    /// Defaults used for think/answer generation.
    pub fn chain_of_thought() -> Self {
        Self {
            temperature: 0.7,
            top_k: 0,
            top_p: 0.9,
            repetition_penalty: 1.0,
            ..Self::default()
        }
    }

    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(invalid("generation.max_length must be > 0"));
        }
        if self.num_return_sequences == 0 {
            return Err(invalid("generation.num_return_sequences must be > 0"));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(invalid(format!(
                "generation.repetition_penalty ({}) must be > 0",
                self.repetition_penalty
            )));
        }
        self.sampling().validate()
    }
}

/// Group relative policy optimization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrpoConfig {
    /// Discount factor. Unused by the single-step objective; kept for
    /// multi-step extensions.
    pub gamma: f64,
    /// KL penalty coefficient.
    pub beta: f64,
    /// Ratio clip half-width.
    pub eps_clip: f64,
    /// Prompts per chunk and samples per prompt.
    pub group_size: usize,
    pub learning_rate: f64,
    /// Global gradient norm clip; 0 disables.
    pub max_grad_norm: f64,
    /// Generated tokens per sample during rollouts.
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
}

impl Default for GrpoConfig {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            beta: 0.1,
            eps_clip: 0.2,
            group_size: 4,
            learning_rate: 1e-6,
            max_grad_norm: 1.0,
            max_new_tokens: 256,
            sampling: SamplingConfig::default(),
        }
    }
}

impl GrpoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_size == 0 {
            return Err(invalid("grpo.group_size must be > 0"));
        }
        if !(self.eps_clip > 0.0 && self.eps_clip < 1.0) {
            return Err(invalid(format!(
                "grpo.eps_clip ({}) must be in (0, 1)",
                self.eps_clip
            )));
        }
        if self.beta < 0.0 {
            return Err(invalid(format!("grpo.beta ({}) must be >= 0", self.beta)));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(invalid(format!(
                "grpo.gamma ({}) must be in [0, 1]",
                self.gamma
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(invalid(format!(
                "grpo.learning_rate ({}) must be positive",
                self.learning_rate
            )));
        }
        self.sampling.validate()
    }
}

/// Teacher-to-student distillation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistillConfig {
    pub batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    /// Softmax temperature applied to both teacher and student logits.
    pub temperature: f64,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            num_epochs: 3,
            learning_rate: 1e-5,
            temperature: 1.0,
        }
    }
}

impl DistillConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("distill.batch_size must be > 0"));
        }
        if !(self.temperature > 0.0) {
            return Err(invalid(format!(
                "distill.temperature ({}) must be > 0",
                self.temperature
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(invalid("distill.learning_rate must be positive"));
        }
        Ok(())
    }
}

/// Supervised fine-tuning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SftConfig {
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub num_epochs: usize,
    /// Optimizer steps between loss logs.
    pub logging_steps: usize,
    /// Optimizer steps between evaluations.
    pub evaluation_steps: usize,
    /// Optimizer steps between checkpoints.
    pub save_steps: usize,
    pub shuffle: bool,
    pub seed: u64,
}

impl Default for SftConfig {
    fn default() -> Self {
        Self {
            train_batch_size: 16,
            eval_batch_size: 16,
            gradient_accumulation_steps: 2,
            learning_rate: 3e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            num_epochs: 1,
            logging_steps: 10,
            evaluation_steps: 100,
            save_steps: 1000,
            shuffle: true,
            seed: 42,
        }
    }
}

impl SftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(invalid("sft batch sizes must be > 0"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(invalid("sft.gradient_accumulation_steps must be > 0"));
        }
        if self.logging_steps == 0 || self.evaluation_steps == 0 || self.save_steps == 0 {
            return Err(invalid("sft step intervals must be > 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(invalid("sft.learning_rate must be positive"));
        }
        Ok(())
    }
}

/// Reference scoring model shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Must cover subword ids plus concept ids.
    pub vocab_size: usize,
    /// Embedding width.
    pub dim: usize,
    /// Hidden projection width.
    pub hidden_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            dim: 128,
            hidden_dim: 256,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.dim == 0 || self.hidden_dim == 0 {
            return Err(invalid("model dimensions must be > 0"));
        }
        Ok(())
    }
}

/// Device and process-group settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// `auto`, `cpu` or `cuda:N`.
    pub device: String,
    /// Data-parallel world size managed by an external launcher.
    pub world_size: usize,
    pub rank: usize,
    /// Seed for sampling and shuffling.
    pub seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: "auto".into(),
            world_size: 1,
            rank: 0,
            seed: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        crate::runtime::DeviceRequest::parse(&self.device)?;
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(invalid(format!(
                "runtime rank ({}) must be < world_size ({})",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackConfig {
    pub tokenizer: TokenizerConfig,
    pub model: ModelConfig,
    pub generation: GenerationConfig,
    pub grpo: GrpoConfig,
    pub distill: DistillConfig,
    pub sft: SftConfig,
    pub runtime: RuntimeConfig,
}

impl StackConfig {
    /// Load configuration from TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        crate::error::require_file(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| ThinkChatError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate all sub-configs.
    pub fn validate(&self) -> Result<()> {
        self.tokenizer.validate()?;
        self.model.validate()?;
        self.generation.validate()?;
        self.grpo.validate()?;
        self.distill.validate()?;
        self.sft.validate()?;
        self.runtime.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        assert!(StackConfig::default().validate().is_ok());
        assert!(GenerationConfig::chain_of_thought().validate().is_ok());
    }

    #[test]
    fn test_unknown_option_rejected() {
        let toml = r#"
            [tokenizer]
            vocab_size = 100
            vocab_sise = 200
        "#;
        let err = StackConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ThinkChatError::Toml(_)), "got {err}");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml = r#"
            [grpo]
            group_size = 2
            beta = 0.05
        "#;
        let cfg = StackConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.grpo.group_size, 2);
        assert_eq!(cfg.grpo.eps_clip, 0.2);
        assert_eq!(cfg.tokenizer.max_length, 8192);
    }

    #[test]
    fn test_invalid_special_ids() {
        let cfg = TokenizerConfig {
            bos_id: 7,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_model_prefix_must_be_a_plain_stem() {
        for prefix in ["", "sub/dir", "config", "concept_data"] {
            let cfg = TokenizerConfig {
                model_prefix: prefix.into(),
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "{prefix:?} accepted");
        }
        let cfg = TokenizerConfig {
            model_prefix: "conceptual".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_sampling() {
        let cfg = SamplingConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = SamplingConfig {
            top_p: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thinkchat.toml");
        let mut cfg = StackConfig::default();
        cfg.distill.num_epochs = 7;
        cfg.save(&path).unwrap();
        let loaded = StackConfig::from_file(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_missing_file() {
        let err = StackConfig::from_file("/nonexistent/thinkchat.toml").unwrap_err();
        assert!(matches!(err, ThinkChatError::NotFound { .. }));
    }
}
