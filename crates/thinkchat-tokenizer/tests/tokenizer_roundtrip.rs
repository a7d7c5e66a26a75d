//! End-to-end tests against a real trained subword model.

use std::path::Path;
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use thinkchat_core::{Result, TokenCodec, TokenizerConfig};
use thinkchat_tokenizer::{
    effective_vocab_size, ConceptTokenizer, SubwordModel, SubwordTrainer,
    TokenizersUnigramTrainer,
};

const CORPUS: &[&str] = &[
    "the cat sat on the mat",
    "a dog ran to the park and the cat ran home",
    "we solve the equation step by step",
    "if it rains then the grass is wet",
    "the sum of two and three is five",
];

fn small_config() -> TokenizerConfig {
    TokenizerConfig {
        vocab_size: 200,
        max_length: 64,
        ..Default::default()
    }
}

fn trained() -> Result<ConceptTokenizer> {
    let mut tok = ConceptTokenizer::new(small_config())?;
    tok.train(CORPUS)?;
    Ok(tok)
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Delegates to the unigram trainer and remembers each requested size.
struct RecordingTrainer {
    requested: Arc<Mutex<Vec<usize>>>,
    inner: TokenizersUnigramTrainer,
}

impl SubwordTrainer for RecordingTrainer {
    fn train(
        &self,
        corpus: &Path,
        target_vocab_size: usize,
        coverage: f64,
        reserved: &[(u32, String)],
    ) -> Result<Box<dyn SubwordModel>> {
        self.requested.lock().unwrap().push(target_vocab_size);
        self.inner.train(corpus, target_vocab_size, coverage, reserved)
    }
}

#[test]
fn two_sentence_corpus_clips_vocab() -> Result<()> {
    let texts = ["hello world", "good morning"];
    let unique: std::collections::BTreeSet<char> = texts.iter().flat_map(|t| t.chars()).collect();
    assert_eq!(unique.len(), 12);
    assert_eq!(effective_vocab_size(32000, unique.len()), 24);

    let requested = Arc::new(Mutex::new(Vec::new()));
    let trainer = RecordingTrainer {
        requested: Arc::clone(&requested),
        inner: TokenizersUnigramTrainer::default(),
    };
    let mut tok = ConceptTokenizer::with_trainer(
        TokenizerConfig {
            max_length: 16,
            ..Default::default()
        },
        Box::new(trainer),
    )?;
    tok.train(&texts)?;
    assert_eq!(*requested.lock().unwrap(), vec![24]);
    assert!(tok.subword_vocab_size()? <= 24);
    Ok(())
}

#[test]
fn reserved_ids_are_fixed() -> Result<()> {
    let tok = trained()?;
    let ids = tok.encode("the cat", true)?;
    assert_eq!(ids[0], 2);
    assert!(ids.contains(&3));
    assert_eq!(*ids.last().unwrap(), 0);
    Ok(())
}

#[test]
fn encode_decode_roundtrip() -> Result<()> {
    let tok = trained()?;
    for text in CORPUS {
        let ids = tok.encode(text, true)?;
        assert_eq!(ids.len(), 64);
        assert_eq!(normalize(&tok.decode(&ids, true)?), normalize(text));
    }
    Ok(())
}

#[test]
fn truncation_forces_eos() -> Result<()> {
    let tok = trained()?;
    let long = CORPUS.join(" ").repeat(3);
    let ids = tok.encode(&long, true)?;
    assert_eq!(ids.len(), 64);
    assert_eq!(ids[63], 3);
    let ids = tok.encode(&long, false)?;
    assert_eq!(ids.len(), 64);
    assert_eq!(ids[63], 3);
    Ok(())
}

#[test]
fn concepts_are_encoded_as_single_ids() -> Result<()> {
    let mut tok = trained()?;
    let base = tok.subword_vocab_size()? as u32;
    let math = tok.add_concept("math", &["equation", "sum"])?;
    assert_eq!(math, base);
    assert_eq!(tok.add_concept("math", &["solve"])?, math);
    assert_eq!(tok.add_concept("Math", &[])?, math);
    assert_eq!(TokenCodec::vocab_size(&tok), base as usize + 1);

    let ids = tok.encode("we solve the equation", true)?;
    assert_eq!(ids.iter().filter(|&&id| id == math).count(), 2);
    let text = tok.decode(&ids, true)?;
    assert!(text.contains("[CONCEPT_MATH]"), "decoded {:?}", text);

    let counts = tok.analyze_concepts("the sum and the equation");
    assert_eq!(counts.get("MATH"), Some(&2));
    Ok(())
}

#[test]
fn concept_ids_rebased_on_retrain() -> Result<()> {
    let mut tok = trained()?;
    tok.add_concept("animal", &["cat", "dog"])?;
    tok.add_concept("logic", &["if", "then"])?;
    tok.train(&CORPUS[..2])?;
    let base = tok.subword_vocab_size()? as u32;
    assert_eq!(tok.concept_id("animal"), Some(base));
    assert_eq!(tok.concept_id("logic"), Some(base + 1));
    Ok(())
}

#[test]
fn save_and_load_are_identical() -> Result<()> {
    let mut tok = trained()?;
    tok.add_concept("animal", &["cat", "dog"])?;
    tok.register_reasoning_markers()?;

    let dir = tempfile::tempdir()?;
    tok.save_pretrained(dir.path())?;
    for file in ["tokenizer.json", "concept_data.json", "config.json"] {
        assert!(dir.path().join(file).exists(), "{} missing", file);
    }
    let loaded = ConceptTokenizer::from_pretrained(dir.path())?;

    let samples = [
        "the cat sat <think>two and three</think><answer>five</answer>",
        "a dog ran to the park",
    ];
    for text in samples {
        let a = tok.encode(text, true)?;
        let b = loaded.encode(text, true)?;
        assert_eq!(a, b);
        assert_eq!(tok.decode(&a, true)?, loaded.decode(&b, true)?);
    }
    Ok(())
}

#[test]
fn model_prefix_names_the_subword_file() -> Result<()> {
    let mut tok = ConceptTokenizer::new(TokenizerConfig {
        model_prefix: "conceptual".into(),
        ..small_config()
    })?;
    tok.train(CORPUS)?;
    let dir = tempfile::tempdir()?;
    tok.save_pretrained(dir.path())?;
    assert!(dir.path().join("conceptual.json").exists());
    assert!(!dir.path().join("tokenizer.json").exists());

    let loaded = ConceptTokenizer::from_pretrained(dir.path())?;
    assert_eq!(loaded.config().model_prefix, "conceptual");
    assert_eq!(loaded.encode("the cat", true)?, tok.encode("the cat", true)?);

    std::fs::remove_file(dir.path().join("conceptual.json"))?;
    assert!(ConceptTokenizer::from_pretrained(dir.path()).is_err());
    Ok(())
}

#[test]
fn missing_bundle_file_is_not_found() -> Result<()> {
    let tok = trained()?;
    let dir = tempfile::tempdir()?;
    tok.save_pretrained(dir.path())?;
    std::fs::remove_file(dir.path().join("concept_data.json"))?;
    let err = ConceptTokenizer::from_pretrained(dir.path()).err().unwrap();
    assert!(matches!(err, thinkchat_core::ThinkChatError::NotFound { .. }));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn encoded_length_is_fixed(text in "[a-z ]{0,120}") {
        let tok = trained().unwrap();
        prop_assert_eq!(tok.encode(&text, true).unwrap().len(), 64);
        prop_assert_eq!(tok.encode(&text, false).unwrap().len(), 64);
    }

    #[test]
    fn spans_sorted_and_disjoint(text in "[a-z ]{0,80}") {
        let mut tok = trained().unwrap();
        tok.add_concept("animal", &["cat", "dog", "cat sat"]).unwrap();
        tok.add_concept("place", &["park", "mat", "home"]).unwrap();
        let spans = tok.detect_concepts(&text);
        for pair in spans.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start);
        }
        for span in &spans {
            let before = text[..span.start].chars().last();
            let after = text[span.end..].chars().next();
            prop_assert!(!before.is_some_and(|c| c.is_alphanumeric()));
            prop_assert!(!after.is_some_and(|c| c.is_alphanumeric()));
        }
    }
}
