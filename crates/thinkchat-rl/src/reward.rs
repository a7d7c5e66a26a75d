//! Reward functions and batch-level reward normalization.
//!
//! Every registered reward scores each response independently; the raw
//! scores of one name are then normalized across the batch, and the
//! normalized vectors are summed into one combined signal per response.

use std::collections::BTreeMap;

use thinkchat_core::{Result, ThinkChatError};
use thinkchat_train::Sentinel;
use tracing::{debug, warn};

/// Floor added to the standard deviation during normalization.
pub const NORMALIZE_EPS: f64 = 1e-8;

/// Anything that turns one response into a scalar score.
pub trait RewardFn: Send + Sync {
    fn score(&self, response: &str) -> f64;
}

impl<F> RewardFn for F
where
    F: Fn(&str) -> f64 + Send + Sync,
{
    fn score(&self, response: &str) -> f64 {
        self(response)
    }
}

/// `(v - mean) / (std + eps)` with the sample standard deviation.
///
/// Fewer than two values, or a standard deviation below `eps`, give all
/// zeros instead of amplifying noise.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std = variance.sqrt();
    if !std.is_finite() || std < NORMALIZE_EPS {
        return vec![0.0; n];
    }
    values.iter().map(|v| (v - mean) / (std + NORMALIZE_EPS)).collect()
}

/// Raw and normalized scores for one batch of responses.
#[derive(Debug, Clone, Default)]
pub struct RewardBreakdown {
    pub raw: BTreeMap<String, Vec<f64>>,
    pub normalized: BTreeMap<String, Vec<f64>>,
    /// Element-wise sum of the normalized vectors.
    pub combined: Vec<f64>,
}

impl RewardBreakdown {
    /// Sum of raw scores per response.
    pub fn raw_totals(&self) -> Vec<f64> {
        let n = self.combined.len();
        let mut totals = vec![0.0; n];
        for values in self.raw.values() {
            for (total, v) in totals.iter_mut().zip(values) {
                *total += v;
            }
        }
        totals
    }
}

/// Name -> reward function registry.
#[derive(Default)]
pub struct RewardAggregator {
    rewards: BTreeMap<String, Box<dyn RewardFn>>,
}

impl RewardAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format and accuracy rewards over `answers` (question -> answer).
    pub fn with_defaults(answers: BTreeMap<String, String>) -> Self {
        let mut aggregator = Self::new();
        aggregator.register("format", FormatReward);
        aggregator.register("accuracy", AccuracyReward::new(answers));
        aggregator
    }

    /// Add or replace the reward called `name`.
    pub fn register<R: RewardFn + 'static>(&mut self, name: &str, reward: R) -> &mut Self {
        if self.rewards.insert(name.to_string(), Box::new(reward)).is_some() {
            debug!(reward = name, "replaced reward function");
        }
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rewards.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    /// Score and normalize a batch.
    pub fn compute<S: AsRef<str>>(&self, responses: &[S]) -> Result<RewardBreakdown> {
        if self.rewards.is_empty() {
            return Err(ThinkChatError::InvalidConfig(
                "no reward functions registered".into(),
            ));
        }
        let mut breakdown = RewardBreakdown {
            combined: vec![0.0; responses.len()],
            ..Default::default()
        };
        for (name, reward) in &self.rewards {
            let raw: Vec<f64> = responses
                .iter()
                .map(|r| {
                    let score = reward.score(r.as_ref());
                    if score.is_finite() {
                        score
                    } else {
                        warn!(reward = %name, score, "non-finite reward replaced with 0");
                        0.0
                    }
                })
                .collect();
            let normalized = normalize(&raw);
            for (total, v) in breakdown.combined.iter_mut().zip(&normalized) {
                *total += v;
            }
            breakdown.raw.insert(name.clone(), raw);
            breakdown.normalized.insert(name.clone(), normalized);
        }
        Ok(breakdown)
    }
}

/// Text between the last answer-start tag and the first answer-end tag after it.
pub fn extract_answer(response: &str) -> Option<&str> {
    let open = Sentinel::AnswerStart.tag();
    let start = response.rfind(open)? + open.len();
    let end = response[start..].find(Sentinel::AnswerEnd.tag())?;
    Some(response[start..start + end].trim())
}

/// 1.0 when the response holds a think span followed by an answer span.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatReward;

impl RewardFn for FormatReward {
    fn score(&self, response: &str) -> f64 {
        let pos = |s: Sentinel| response.find(s.tag());
        match (
            pos(Sentinel::ThinkStart),
            pos(Sentinel::ThinkEnd),
            pos(Sentinel::AnswerStart),
            pos(Sentinel::AnswerEnd),
        ) {
            (Some(ts), Some(te), Some(a_s), Some(ae)) if ts < te && te <= a_s && a_s < ae => 1.0,
            _ => 0.0,
        }
    }
}

/// 1.0 when the extracted answer equals the expected answer for the question
/// in the response header.
///
/// The header is everything before `Assistant:`. When several known questions
/// occur in it, the longest wins.
#[derive(Debug, Clone, Default)]
pub struct AccuracyReward {
    answers: BTreeMap<String, String>,
}

impl AccuracyReward {
    pub fn new(answers: BTreeMap<String, String>) -> Self {
        Self { answers }
    }

    fn expected(&self, response: &str) -> Option<&str> {
        let header = response
            .find("Assistant:")
            .map_or(response, |end| &response[..end]);
        self.answers
            .iter()
            .filter(|(question, _)| !question.is_empty() && header.contains(question.as_str()))
            .max_by_key(|(question, _)| question.len())
            .map(|(_, answer)| answer.as_str())
    }
}

impl RewardFn for AccuracyReward {
    fn score(&self, response: &str) -> f64 {
        match (self.expected(response), extract_answer(response)) {
            (Some(expected), Some(answer)) if expected.trim() == answer => 1.0,
            _ => 0.0,
        }
    }
}
