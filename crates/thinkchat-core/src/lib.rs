//! Core types shared across thinkchat crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Explicit configuration structs with TOML support
//! - Runtime/device context with an explicit initialization guard
//! - The `TokenCodec` seam between tokenizers and generation/training code

pub mod codec;
pub mod config;
pub mod error;
pub mod runtime;

pub use codec::TokenCodec;
pub use config::{
    DistillConfig, GenerationConfig, GrpoConfig, ModelConfig, RuntimeConfig, SamplingConfig,
    SftConfig, StackConfig, TokenizerConfig,
};
pub use error::{Result, ThinkChatError};
pub use runtime::{DeviceRequest, RuntimeContext};
