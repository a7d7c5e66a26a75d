//! Token codec seam between the tokenizer and the training/generation code.

use crate::error::Result;

/// Text <-> token id conversion as seen by generation, datasets and RL.
pub trait TokenCodec {
    /// Encode a prompt without sentinels or padding.
    fn encode_prompt(&self, text: &str) -> Result<Vec<u32>>;

    /// Encode with begin/end sentinels, padded or truncated to the
    /// configured fixed length.
    fn encode_fixed(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text, dropping padding and sentinels.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Decode a single id for incremental output: untrimmed, sentinels empty.
    fn decode_token(&self, id: u32) -> Result<String>;

    /// Total id space, subword plus concept ids.
    fn vocab_size(&self) -> usize;

    /// Fixed encoding length.
    fn max_length(&self) -> usize;

    fn pad_id(&self) -> u32;

    fn eos_id(&self) -> u32;
}
