//! Concept-aware tokenizer: subword pieces interleaved with concept ids.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thinkchat_core::error::require_file;
use thinkchat_core::{Result, ThinkChatError, TokenCodec, TokenizerConfig};
use tracing::{debug, info};

use crate::concept::{ConceptSpan, ConceptTable};
use crate::subword::{
    corpus_alphabet, SubwordModel, SubwordTrainer, TokenizersUnigramTrainer, UnigramModel,
    WORD_MARKER,
};

pub const CONCEPT_FILE: &str = "concept_data.json";
pub const CONFIG_FILE: &str = "config.json";

/// Smallest vocabulary the trainer is asked for.
pub const MIN_VOCAB_SIZE: usize = 22;

/// Names of the reasoning sentinel concepts and their literal tags.
pub const REASONING_MARKERS: [(&str, &str); 4] = [
    ("THINK_START", "<think>"),
    ("THINK_END", "</think>"),
    ("ANSWER_START", "<answer>"),
    ("ANSWER_END", "</answer>"),
];

/// Vocabulary size actually requested from the subword trainer.
pub fn effective_vocab_size(configured: usize, unique_chars: usize) -> usize {
    configured.min(MIN_VOCAB_SIZE.max(2 * unique_chars))
}

/// Distinct characters the subword model must represent, with the same
/// filtering the trainer applies to its alphabet.
fn required_chars<S: AsRef<str>>(texts: &[S]) -> BTreeSet<char> {
    texts
        .iter()
        .flat_map(|t| corpus_alphabet(t.as_ref()))
        .collect()
}

/// Subword model file inside a bundle: `<model_prefix>.json`.
fn model_file(config: &TokenizerConfig) -> String {
    format!("{}.json", config.model_prefix)
}

#[derive(Serialize, Deserialize)]
struct ConceptData {
    concept_ids: BTreeMap<String, u32>,
    semantic_clusters: BTreeMap<String, BTreeSet<String>>,
}

/// Tokenizer combining a trained subword model with a concept table.
pub struct ConceptTokenizer {
    config: TokenizerConfig,
    subword: Option<Box<dyn SubwordModel>>,
    concepts: ConceptTable,
    trainer: Box<dyn SubwordTrainer>,
}

impl ConceptTokenizer {
    pub fn new(config: TokenizerConfig) -> Result<Self> {
        config.validate()?;
        let trainer = TokenizersUnigramTrainer {
            max_piece_length: config.max_piece_length,
            unk_token: config.unk_token.clone(),
        };
        Self::with_trainer(config, Box::new(trainer))
    }

    /// Use a custom subword trainer.
    pub fn with_trainer(
        config: TokenizerConfig,
        trainer: Box<dyn SubwordTrainer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            subword: None,
            concepts: ConceptTable::default(),
            trainer,
        })
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    pub fn concepts(&self) -> &ConceptTable {
        &self.concepts
    }

    pub fn is_initialized(&self) -> bool {
        self.subword.is_some()
    }

    fn model(&self) -> Result<&dyn SubwordModel> {
        self.subword
            .as_deref()
            .ok_or_else(|| ThinkChatError::not_initialized("tokenizer has no trained subword model"))
    }

    /// Size of the subword id range.
    pub fn subword_vocab_size(&self) -> Result<usize> {
        Ok(self.model()?.vocab_size())
    }

    /// Fit the subword vocabulary on `texts`.
    ///
    /// Existing concepts keep their allocation order and are moved to start
    /// right after the new subword range.
    pub fn train<S: AsRef<str>>(&mut self, texts: &[S]) -> Result<()> {
        let chars = required_chars(texts);
        let unique_chars = texts
            .iter()
            .flat_map(|t| t.as_ref().chars())
            .collect::<BTreeSet<char>>()
            .len();
        let vocab_size = effective_vocab_size(self.config.vocab_size, unique_chars);
        let reserved = self.config.reserved_tokens();
        if self.config.character_coverage >= 1.0 && vocab_size < chars.len() + reserved.len() {
            return Err(ThinkChatError::Tokenization(format!(
                "vocab size {} cannot cover {} characters plus {} reserved tokens",
                vocab_size,
                chars.len(),
                reserved.len()
            )));
        }

        // Removed when dropped, on success and on every error path.
        let mut corpus = tempfile::NamedTempFile::new()?;
        for text in texts {
            writeln!(corpus, "{}", text.as_ref())?;
        }
        corpus.flush()?;

        info!(
            texts = texts.len(),
            unique_chars,
            vocab_size,
            "training subword model"
        );
        let model = self.trainer.train(
            corpus.path(),
            vocab_size,
            self.config.character_coverage,
            &reserved,
        )?;
        self.concepts.rebase(model.vocab_size() as u32);
        self.subword = Some(model);
        Ok(())
    }

    /// Register a concept; returns its id. Requires a subword model.
    pub fn add_concept(&mut self, name: &str, related_terms: &[&str]) -> Result<u32> {
        self.model()?;
        let id = self.concepts.add(name, related_terms)?;
        debug!(concept = name, id, "concept registered");
        Ok(id)
    }

    /// Register the think/answer sentinel concepts.
    pub fn register_reasoning_markers(&mut self) -> Result<()> {
        for (name, tag) in REASONING_MARKERS {
            self.add_concept(name, &[tag])?;
        }
        Ok(())
    }

    pub fn concept_id(&self, name: &str) -> Option<u32> {
        self.concepts.id(name)
    }

    /// Sorted, non-overlapping concept spans in `text`.
    pub fn detect_concepts(&self, text: &str) -> Vec<ConceptSpan> {
        self.concepts.detect(text)
    }

    /// Occurrences of each concept in `text`.
    pub fn analyze_concepts(&self, text: &str) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for span in self.detect_concepts(text) {
            *counts.entry(span.concept).or_insert(0) += 1;
        }
        counts
    }

    /// Concept-aware encoding without sentinels or padding.
    pub fn encode_unpadded(&self, text: &str) -> Result<Vec<u32>> {
        let model = self.model()?;
        let mut ids = Vec::new();
        let mut last_end = 0;
        for span in self.detect_concepts(text) {
            if span.start > last_end {
                ids.extend(model.encode(&text[last_end..span.start])?);
            }
            match self.concepts.id(&span.concept) {
                Some(id) => ids.push(id),
                None => ids.extend(model.encode(&text[span.start..span.end])?),
            }
            last_end = span.end;
        }
        if last_end < text.len() {
            ids.extend(model.encode(&text[last_end..])?);
        }
        Ok(ids)
    }

    /// Encode to exactly `max_length` ids.
    ///
    /// Long inputs are truncated with the end sentinel forced into the last
    /// slot; short inputs are right-padded.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let body = self.encode_unpadded(text)?;
        let max_length = self.config.max_length;
        let mut ids = Vec::with_capacity(max_length.max(body.len() + 2));
        if add_special_tokens {
            ids.push(self.config.bos_id);
        }
        ids.extend(body);
        if add_special_tokens {
            ids.push(self.config.eos_id);
        }
        if ids.len() > max_length {
            ids.truncate(max_length - 1);
            ids.push(self.config.eos_id);
        } else {
            ids.resize(max_length, self.config.pad_id);
        }
        Ok(ids)
    }

    pub fn encode_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        add_special_tokens: bool,
    ) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|t| self.encode(t.as_ref(), add_special_tokens))
            .collect()
    }

    fn is_special(&self, id: u32) -> bool {
        id == self.config.pad_id || id == self.config.bos_id || id == self.config.eos_id
    }

    /// Raw text for one id, word marker untouched.
    fn piece(&self, model: &dyn SubwordModel, id: u32) -> String {
        if let Some(token) = self.concepts.token_of(id) {
            return token;
        }
        model
            .piece(id)
            .unwrap_or_else(|| self.config.unk_token.clone())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let model = self.model()?;
        let text: String = ids
            .iter()
            .filter(|id| !(skip_special_tokens && self.is_special(**id)))
            .map(|id| self.piece(model, *id))
            .collect();
        Ok(text.replace(WORD_MARKER, " ").trim().to_string())
    }

    /// Decode a single id for incremental generation.
    ///
    /// The word marker becomes a space and nothing is trimmed, so successive
    /// pieces concatenate into readable text. Sentinels decode to nothing.
    pub fn decode_token(&self, id: u32) -> Result<String> {
        let model = self.model()?;
        if self.is_special(id) {
            return Ok(String::new());
        }
        Ok(self.piece(model, id).replace(WORD_MARKER, " "))
    }

    pub fn decode_batch(&self, batch: &[Vec<u32>], skip_special_tokens: bool) -> Result<Vec<String>> {
        batch
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }

    /// Write `<model_prefix>.json`, `concept_data.json` and `config.json` to `dir`.
    pub fn save_pretrained<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let model = self.model()?;
        std::fs::create_dir_all(dir)?;

        model.save(&dir.join(model_file(&self.config)))?;

        let data = ConceptData {
            concept_ids: self
                .concepts
                .ids()
                .into_iter()
                .map(|(id, name)| (name.to_string(), id))
                .collect(),
            semantic_clusters: self
                .concepts
                .ids()
                .into_iter()
                .map(|(_, name)| {
                    let terms = self.concepts.terms(name).cloned().unwrap_or_default();
                    (name.to_string(), terms)
                })
                .collect(),
        };
        std::fs::write(dir.join(CONCEPT_FILE), serde_json::to_string_pretty(&data)?)?;
        std::fs::write(
            dir.join(CONFIG_FILE),
            serde_json::to_string_pretty(&self.config)?,
        )?;

        info!(path = %dir.display(), concepts = self.concepts.len(), "tokenizer saved");
        Ok(())
    }

    /// Load a bundle written by [`save_pretrained`](Self::save_pretrained).
    pub fn from_pretrained<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join(CONFIG_FILE);
        let concept_path = dir.join(CONCEPT_FILE);
        require_file(&config_path)?;
        let config: TokenizerConfig =
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let model_path = dir.join(model_file(&config));
        for path in [&concept_path, &model_path] {
            require_file(path)?;
        }

        let mut tokenizer = Self::new(config)?;
        let model = UnigramModel::from_file(&model_path)?;
        let base = model.vocab_size() as u32;
        tokenizer.subword = Some(Box::new(model));

        let data: ConceptData = serde_json::from_str(&std::fs::read_to_string(&concept_path)?)?;
        let mut ordered: Vec<(&String, &u32)> = data.concept_ids.iter().collect();
        ordered.sort_by_key(|(_, id)| **id);
        let mut concepts = ConceptTable::new(base);
        for (expected, (name, id)) in (base..).zip(ordered) {
            if *id != expected {
                return Err(ThinkChatError::Tokenization(format!(
                    "concept {} has id {}, expected {}",
                    name, id, expected
                )));
            }
            let terms: Vec<&str> = data
                .semantic_clusters
                .get(name)
                .map(|t| t.iter().map(String::as_str).collect())
                .unwrap_or_default();
            concepts.add(name, &terms)?;
        }
        tokenizer.concepts = concepts;

        info!(path = %dir.display(), "tokenizer loaded");
        Ok(tokenizer)
    }
}

impl TokenCodec for ConceptTokenizer {
    fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_unpadded(text)
    }

    fn encode_fixed(&self, text: &str) -> Result<Vec<u32>> {
        self.encode(text, true)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        ConceptTokenizer::decode(self, ids, true)
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        ConceptTokenizer::decode_token(self, id)
    }

    fn vocab_size(&self) -> usize {
        self.subword
            .as_ref()
            .map_or(0, |m| m.vocab_size() + self.concepts.len())
    }

    fn max_length(&self) -> usize {
        self.config.max_length
    }

    fn pad_id(&self) -> u32 {
        self.config.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.config.eos_id
    }
}
