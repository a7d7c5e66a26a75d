//! # thinkchat training library
//!
//! Everything that runs a scoring model:
//!
//! - **Sampling**: temperature, top-k and nucleus filtering over raw logits
//! - **Generation**: think/answer tracking decoder and plain EOS-terminated sampling
//! - **Fine-tuning**: masked next-token cross-entropy with gradient accumulation
//! - **Distillation**: batch-mean KL from a frozen teacher to a student
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::Device;
//! use thinkchat_core::{GenerationConfig, ModelConfig, TokenCodec};
//! use thinkchat_train::{build_tiny_lm, CotGenerator};
//!
//! # fn run(codec: &dyn TokenCodec) -> thinkchat_core::Result<()> {
//! let (_vars, model) = build_tiny_lm(&ModelConfig::default(), &Device::Cpu)?;
//! let generator = CotGenerator::new(&model, codec, GenerationConfig::chain_of_thought())?;
//! let samples = generator.generate("What is 2+2?", 4, &mut rand::thread_rng())?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod data;
pub mod distill;
pub mod generation;
pub mod logging;
pub mod model;
pub mod optim;
pub mod sampling;
pub mod sft;

pub use checkpoint::{load_checkpoint, read_meta, save_checkpoint, CheckpointMeta};
pub use data::{load_problems, DataLoader, Dataset, ReasoningDataset, ReasoningProblem};
pub use distill::{kl_divergence_loss, DistillEpochStats, DistillationTrainer};
pub use generation::{
    canonicalize_markers, format_prompt, generate_plain, CotGenerator, CotPhase, CotSample,
    CotState, Sentinel,
};
pub use model::{build_tiny_lm, snapshot_varmap, token_log_probs, ScoringModel, TinyLm};
pub use sampling::{sample_token, SamplingParams};
pub use sft::{lm_loss, SftStats, SftTrainer};
