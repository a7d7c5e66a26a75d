//! Autoregressive decoding with think/answer span tracking.
//!
//! Each sampled token is decoded on its own and fed to [`CotState`], which
//! moves through `Normal -> Thinking -> Normal -> Answering -> Done` when it
//! sees one of the four sentinels. A sentinel is recognised by its literal
//! tag (`<think>`) or by its concept token (`[CONCEPT_THINK_START]`).

use rand::Rng;
use thinkchat_core::{GenerationConfig, Result, TokenCodec};
use tracing::debug;

use crate::model::ScoringModel;
use crate::sampling::{apply_repetition_penalty, argmax, sample_token, SamplingParams};

/// Reasoning span delimiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    ThinkStart,
    ThinkEnd,
    AnswerStart,
    AnswerEnd,
}

impl Sentinel {
    pub const ALL: [Sentinel; 4] = [
        Sentinel::ThinkStart,
        Sentinel::ThinkEnd,
        Sentinel::AnswerStart,
        Sentinel::AnswerEnd,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Sentinel::ThinkStart => "<think>",
            Sentinel::ThinkEnd => "</think>",
            Sentinel::AnswerStart => "<answer>",
            Sentinel::AnswerEnd => "</answer>",
        }
    }

    pub fn concept_token(self) -> &'static str {
        match self {
            Sentinel::ThinkStart => "[CONCEPT_THINK_START]",
            Sentinel::ThinkEnd => "[CONCEPT_THINK_END]",
            Sentinel::AnswerStart => "[CONCEPT_ANSWER_START]",
            Sentinel::AnswerEnd => "[CONCEPT_ANSWER_END]",
        }
    }

    /// Sentinel spelled by one decoded token, if any.
    pub fn parse(decoded: &str) -> Option<Self> {
        let text = decoded.trim();
        Self::ALL
            .into_iter()
            .find(|s| text == s.tag() || text == s.concept_token())
    }
}

/// Rewrite concept-token spellings of the sentinels as literal tags.
pub fn canonicalize_markers(text: &str) -> String {
    Sentinel::ALL
        .iter()
        .fold(text.to_string(), |acc, s| acc.replace(s.concept_token(), s.tag()))
}

/// Below this temperature plain generation decodes greedily.
pub const GREEDY_TEMPERATURE: f64 = 1e-6;

/// Chat framing used for every prompt.
pub fn format_prompt(prompt: &str) -> String {
    format!("User: {}\nAssistant:", prompt)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CotPhase {
    Normal,
    Thinking,
    Answering,
    Done,
}

/// Per-sequence decoding state.
#[derive(Debug, Clone, Default)]
pub struct CotState {
    pub tokens: Vec<u32>,
    pub in_think: bool,
    pub in_answer: bool,
    pub thought: String,
    pub answer: String,
    pub finished: bool,
}

impl CotState {
    pub fn new(prompt_ids: Vec<u32>) -> Self {
        Self {
            tokens: prompt_ids,
            ..Default::default()
        }
    }

    pub fn phase(&self) -> CotPhase {
        if self.finished {
            CotPhase::Done
        } else if self.in_think {
            CotPhase::Thinking
        } else if self.in_answer {
            CotPhase::Answering
        } else {
            CotPhase::Normal
        }
    }

    /// Record one generated token and its decoded text.
    pub fn observe(&mut self, id: u32, decoded: &str) {
        self.tokens.push(id);
        if self.finished {
            return;
        }
        match Sentinel::parse(decoded) {
            Some(Sentinel::ThinkStart) => {
                self.in_think = true;
                self.in_answer = false;
                self.thought.clear();
            }
            Some(Sentinel::ThinkEnd) => self.in_think = false,
            Some(Sentinel::AnswerStart) => {
                self.in_answer = true;
                self.in_think = false;
                self.answer.clear();
            }
            Some(Sentinel::AnswerEnd) => {
                self.in_answer = false;
                self.finished = true;
            }
            None => {
                if self.in_think {
                    self.thought.push_str(decoded);
                } else if self.in_answer {
                    self.answer.push_str(decoded);
                }
            }
        }
    }
}

/// One finished chain-of-thought sample.
#[derive(Debug, Clone)]
pub struct CotSample {
    /// Prompt and continuation, sentinels spelled as literal tags.
    pub full_output: String,
    pub thought: String,
    pub answer: String,
    /// Prompt ids followed by generated ids.
    pub token_ids: Vec<u32>,
    pub prompt_len: usize,
    pub finished: bool,
}

impl CotSample {
    pub fn generated_ids(&self) -> &[u32] {
        &self.token_ids[self.prompt_len..]
    }
}

/// Chain-of-thought sampler over a scoring model and a codec.
pub struct CotGenerator<'a> {
    model: &'a dyn ScoringModel,
    codec: &'a dyn TokenCodec,
    config: GenerationConfig,
}

impl<'a> CotGenerator<'a> {
    pub fn new(
        model: &'a dyn ScoringModel,
        codec: &'a dyn TokenCodec,
        config: GenerationConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            codec,
            config,
        })
    }

    fn max_length(&self) -> usize {
        self.config.max_length.min(self.codec.max_length())
    }

    /// Draw `num_samples` independent completions for `prompt`.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        prompt: &str,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<Vec<CotSample>> {
        let mut prompt_ids = self.codec.encode_prompt(&format_prompt(prompt))?;
        if prompt_ids.is_empty() {
            prompt_ids.push(self.codec.pad_id());
        }
        let params = SamplingParams::from(&self.config.sampling());

        (0..num_samples)
            .map(|_| self.generate_one(prompt_ids.clone(), &params, rng))
            .collect()
    }

    fn generate_one<R: Rng + ?Sized>(
        &self,
        prompt_ids: Vec<u32>,
        params: &SamplingParams,
        rng: &mut R,
    ) -> Result<CotSample> {
        let prompt_len = prompt_ids.len();
        let max_length = self.max_length();
        let mut state = CotState::new(prompt_ids);

        for _ in 0..self.config.max_new_tokens {
            if state.finished || state.tokens.len() >= max_length {
                break;
            }
            let logits = self.model.last_logits(&state.tokens)?;
            let next = sample_token(&logits, params, rng)?;
            let decoded = self.codec.decode_token(next)?;
            state.observe(next, &decoded);
        }

        let full_output = canonicalize_markers(&self.codec.decode(&state.tokens)?);
        debug!(
            prompt_len,
            generated = state.tokens.len() - prompt_len,
            finished = state.finished,
            "cot sample complete"
        );
        Ok(CotSample {
            full_output,
            thought: state.thought.trim().to_string(),
            answer: state.answer.trim().to_string(),
            token_ids: state.tokens,
            prompt_len,
            finished: state.finished,
        })
    }
}

/// Plain sampling: stops on end-of-sequence or the length caps.
///
/// Returns `num_return_sequences` continuations, prompt excluded.
pub fn generate_plain<R: Rng + ?Sized>(
    model: &dyn ScoringModel,
    codec: &dyn TokenCodec,
    prompt_ids: &[u32],
    config: &GenerationConfig,
    rng: &mut R,
) -> Result<Vec<Vec<u32>>> {
    config.validate()?;
    let params = SamplingParams::from(&config.sampling());
    let max_length = config.max_length.min(codec.max_length());
    let eos = codec.eos_id();

    let mut outputs = Vec::with_capacity(config.num_return_sequences);
    for _ in 0..config.num_return_sequences {
        let mut tokens = if prompt_ids.is_empty() {
            vec![codec.pad_id()]
        } else {
            prompt_ids.to_vec()
        };
        let start = tokens.len();
        for _ in 0..config.max_new_tokens {
            if tokens.len() >= max_length {
                break;
            }
            let mut logits = model.last_logits(&tokens)?;
            apply_repetition_penalty(&mut logits, &tokens, config.repetition_penalty as f32);
            let next = if config.do_sample && config.temperature >= GREEDY_TEMPERATURE {
                sample_token(&logits, &params, rng)?
            } else {
                argmax(&logits)
            };
            if next == eos {
                break;
            }
            tokens.push(next);
        }
        outputs.push(tokens.split_off(start));
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut CotState, pieces: &[&str]) {
        for (i, piece) in pieces.iter().enumerate() {
            state.observe(i as u32, piece);
        }
    }

    #[test]
    fn test_literal_sentinel_sequence() {
        let mut state = CotState::default();
        feed(
            &mut state,
            &["<think>", "X", "</think>", "<answer>", "Y", "</answer>"],
        );
        assert_eq!(state.thought, "X");
        assert_eq!(state.answer, "Y");
        assert!(state.finished);
        assert_eq!(state.phase(), CotPhase::Done);
        assert_eq!(state.tokens.len(), 6);
    }

    #[test]
    fn test_concept_token_sentinels() {
        let mut state = CotState::default();
        feed(
            &mut state,
            &[
                "[CONCEPT_THINK_START]",
                " two",
                " plus",
                "[CONCEPT_THINK_END]",
                " ignored",
                "[CONCEPT_ANSWER_START]",
                " 4",
                "[CONCEPT_ANSWER_END]",
            ],
        );
        assert_eq!(state.thought.trim(), "two plus");
        assert_eq!(state.answer.trim(), "4");
        assert!(state.finished);
    }

    #[test]
    fn test_normal_tokens_discarded() {
        let mut state = CotState::default();
        feed(&mut state, &["hello", "<think>", "a"]);
        assert_eq!(state.phase(), CotPhase::Thinking);
        assert_eq!(state.thought, "a");
        assert!(state.answer.is_empty());
    }

    #[test]
    fn test_restart_clears_buffer() {
        let mut state = CotState::default();
        feed(&mut state, &["<think>", "old", "</think>", "<think>", "new"]);
        assert_eq!(state.thought, "new");
    }

    #[test]
    fn test_canonicalize_markers() {
        assert_eq!(
            canonicalize_markers("[CONCEPT_THINK_START]x[CONCEPT_THINK_END][CONCEPT_ANSWER_START]y[CONCEPT_ANSWER_END]"),
            "<think>x</think><answer>y</answer>"
        );
        assert_eq!(format_prompt("2+2?"), "User: 2+2?\nAssistant:");
    }
}
