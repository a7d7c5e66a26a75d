//! Concept-aware subword tokenizer.
//!
//! A trained unigram subword model supplies the dense id range
//! `0..vocab_size`; registered concepts get ids right after it. Encoding
//! replaces every detected concept span with its concept id.

pub mod concept;
pub mod subword;
pub mod tokenizer;

pub use concept::{concept_key, concept_token, ConceptSpan, ConceptTable};
pub use subword::{SubwordModel, SubwordTrainer, TokenizersUnigramTrainer, UnigramModel};
pub use tokenizer::{effective_vocab_size, ConceptTokenizer, REASONING_MARKERS};
