//! Subword model collaborator backed by the HuggingFace tokenizers crate.
//!
//! The concept tokenizer only needs piece lookup, plain encoding and an opaque
//! serialized form, so the collaborator is hidden behind two small traits.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use thinkchat_core::{Result, ThinkChatError};
use tokenizers::models::unigram::{Unigram, UnigramTrainerBuilder};
use tokenizers::models::TrainerWrapper;
use tokenizers::pre_tokenizers::metaspace::Metaspace;
use tokenizers::{AddedToken, DecoderWrapper, PreTokenizerWrapper, Tokenizer};

/// Word-start marker produced by the Metaspace pre-tokenizer.
pub const WORD_MARKER: char = '\u{2581}';

/// Characters of `text` that a fully covering subword model must hold.
///
/// Spaces map to the word marker and line breaks are dropped; the marker is
/// always present for non-empty input.
pub fn corpus_alphabet(text: &str) -> BTreeSet<char> {
    let mut chars: BTreeSet<char> = text
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r'))
        .map(|c| if c == ' ' { WORD_MARKER } else { c })
        .collect();
    if !chars.is_empty() {
        chars.insert(WORD_MARKER);
    }
    chars
}

fn tokenization(context: &str, err: impl std::fmt::Display) -> ThinkChatError {
    ThinkChatError::Tokenization(format!("{}: {}", context, err))
}

/// A trained subword vocabulary with dense ids `0..vocab_size`.
pub trait SubwordModel: Send + Sync {
    /// Encode plain text (no concepts, no sentinels).
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Raw piece string for an id, including the word marker.
    fn piece(&self, id: u32) -> Option<String>;

    fn vocab_size(&self) -> usize;

    /// Write the model as an opaque blob.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Fits a [`SubwordModel`] from a corpus file (one text per line).
pub trait SubwordTrainer {
    /// `reserved` lists `(id, token)` pairs sorted by id starting at 0.
    fn train(
        &self,
        corpus: &Path,
        target_vocab_size: usize,
        coverage: f64,
        reserved: &[(u32, String)],
    ) -> Result<Box<dyn SubwordModel>>;
}

/// Unigram language-model tokenizer.
pub struct UnigramModel {
    inner: Tokenizer,
}

impl UnigramModel {
    /// Load from a `tokenizer.json` blob.
    pub fn from_file(path: &Path) -> Result<Self> {
        thinkchat_core::error::require_file(path)?;
        let inner = Tokenizer::from_file(path)
            .map_err(|e| tokenization(&format!("failed to load {}", path.display()), e))?;
        Ok(Self { inner })
    }
}

impl SubwordModel for UnigramModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| tokenization("encoding error", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn piece(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.inner
            .save(path, false)
            .map_err(|e| tokenization(&format!("failed to save {}", path.display()), e))
    }
}

/// Trains a [`UnigramModel`] with Metaspace word splitting.
#[derive(Debug, Clone)]
pub struct TokenizersUnigramTrainer {
    pub max_piece_length: usize,
    /// Must be one of the reserved tokens passed to `train`.
    pub unk_token: String,
}

impl Default for TokenizersUnigramTrainer {
    fn default() -> Self {
        Self {
            max_piece_length: 8,
            unk_token: "[UNK]".into(),
        }
    }
}

impl SubwordTrainer for TokenizersUnigramTrainer {
    fn train(
        &self,
        corpus: &Path,
        target_vocab_size: usize,
        coverage: f64,
        reserved: &[(u32, String)],
    ) -> Result<Box<dyn SubwordModel>> {
        let text = std::fs::read_to_string(corpus)?;

        // Full coverage: every corpus character becomes a required piece.
        let alphabet: HashSet<char> = if coverage >= 1.0 {
            corpus_alphabet(&text).into_iter().collect()
        } else {
            HashSet::new()
        };

        let special_tokens: Vec<AddedToken> = reserved
            .iter()
            .map(|(_, token)| AddedToken::from(token.clone(), true))
            .collect();
        // The unigram trainer lays special tokens out first, in order.
        let unk = reserved
            .iter()
            .any(|(_, token)| *token == self.unk_token)
            .then(|| self.unk_token.clone());

        let vocab_size = u32::try_from(target_vocab_size)
            .map_err(|_| ThinkChatError::InvalidConfig("vocab size exceeds u32".into()))?;
        let mut trainer: TrainerWrapper = UnigramTrainerBuilder::default()
            .show_progress(false)
            .vocab_size(vocab_size)
            .special_tokens(special_tokens)
            .unk_token(unk)
            .initial_alphabet(alphabet)
            .max_piece_length(self.max_piece_length)
            .build()
            .map_err(|e| tokenization("invalid trainer settings", e))?
            .into();

        let mut tokenizer = Tokenizer::new(Unigram::default());
        let pre_tokenizer: PreTokenizerWrapper = Metaspace::default().into();
        let decoder: DecoderWrapper = Metaspace::default().into();
        tokenizer.with_pre_tokenizer(pre_tokenizer);
        tokenizer.with_decoder(decoder);

        let corpus_file = corpus
            .to_str()
            .ok_or_else(|| ThinkChatError::Other("corpus path is not valid UTF-8".into()))?
            .to_string();
        tokenizer
            .train_from_files(&mut trainer, vec![corpus_file])
            .map_err(|e| tokenization("subword training failed", e))?;

        for (id, token) in reserved {
            if tokenizer.token_to_id(token) != Some(*id) {
                return Err(ThinkChatError::Tokenization(format!(
                    "reserved token {} did not land on id {}",
                    token, id
                )));
            }
        }

        tracing::debug!(
            vocab_size = tokenizer.get_vocab_size(true),
            target = target_vocab_size,
            "subword model trained"
        );
        Ok(Box::new(UnigramModel { inner: tokenizer }))
    }
}
