//! Reasoning datasets and batching.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thinkchat_core::error::require_file;
use thinkchat_core::{Result, ThinkChatError, TokenCodec};

use crate::generation::{format_prompt, Sentinel};

/// A dataset of fixed-length token sequences.
pub trait Dataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_item(&self, idx: usize) -> &[u32];
}

/// One question with its worked reasoning and final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningProblem {
    pub question: String,
    pub thought: String,
    pub answer: String,
    /// Concept names the problem exercises.
    #[serde(default)]
    pub concepts: Vec<String>,
}

impl ReasoningProblem {
    /// `User: {q}\nAssistant: <think>{t}</think><answer>{a}</answer>`
    pub fn formatted(&self) -> String {
        format!(
            "{} {}{}{}{}{}{}",
            format_prompt(&self.question),
            Sentinel::ThinkStart.tag(),
            self.thought,
            Sentinel::ThinkEnd.tag(),
            Sentinel::AnswerStart.tag(),
            self.answer,
            Sentinel::AnswerEnd.tag(),
        )
    }
}

/// Read problems from a JSON-lines file; blank lines are skipped.
pub fn load_problems<P: AsRef<Path>>(path: P) -> Result<Vec<ReasoningProblem>> {
    let path = path.as_ref();
    require_file(path)?;
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                ThinkChatError::Other(format!("{}:{}: {}", path.display(), i + 1, e))
            })
        })
        .collect()
}

/// Problems encoded to the codec's fixed length.
pub struct ReasoningDataset {
    problems: Vec<ReasoningProblem>,
    sequences: Vec<Vec<u32>>,
}

impl ReasoningDataset {
    pub fn new(problems: Vec<ReasoningProblem>, codec: &dyn TokenCodec) -> Result<Self> {
        let sequences = problems
            .iter()
            .map(|p| codec.encode_fixed(&p.formatted()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            problems,
            sequences,
        })
    }

    pub fn problems(&self) -> &[ReasoningProblem] {
        &self.problems
    }

    pub fn questions(&self) -> Vec<String> {
        self.problems.iter().map(|p| p.question.clone()).collect()
    }

    /// Unshuffled `[b, max_length]` batches.
    pub fn batches(&self, batch_size: usize, device: &Device) -> DataLoader<'_> {
        DataLoader::new(self, batch_size, false, 0, device)
    }

    /// Question -> expected answer.
    pub fn answer_key(&self) -> BTreeMap<String, String> {
        self.problems
            .iter()
            .map(|p| (p.question.clone(), p.answer.clone()))
            .collect()
    }
}

impl Dataset for ReasoningDataset {
    fn len(&self) -> usize {
        self.sequences.len()
    }

    fn get_item(&self, idx: usize) -> &[u32] {
        &self.sequences[idx]
    }
}

/// Batched iterator producing `[batch, seq]` u32 tensors.
pub struct DataLoader<'a> {
    dataset: &'a dyn Dataset,
    batch_size: usize,
    indices: Vec<usize>,
    pos: usize,
    device: Device,
}

impl<'a> DataLoader<'a> {
    pub fn new(
        dataset: &'a dyn Dataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: &Device,
    ) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }
        Self {
            dataset,
            batch_size: batch_size.max(1),
            indices,
            pos: 0,
            device: device.clone(),
        }
    }

    pub fn n_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn make_batch(&self, batch_indices: &[usize]) -> Result<Tensor> {
        let seq_len = self.dataset.get_item(batch_indices[0]).len();
        let mut flat = Vec::with_capacity(batch_indices.len() * seq_len);
        for &idx in batch_indices {
            let item = self.dataset.get_item(idx);
            if item.len() != seq_len {
                return Err(ThinkChatError::Other(format!(
                    "sequence {} has length {}, expected {}",
                    idx,
                    item.len(),
                    seq_len
                )));
            }
            flat.extend_from_slice(item);
        }
        Ok(Tensor::from_vec(
            flat,
            (batch_indices.len(), seq_len),
            &self.device,
        )?)
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.indices.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.indices.len());
        let batch_indices = self.indices[self.pos..end].to_vec();
        self.pos = end;
        Some(self.make_batch(&batch_indices))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Character-level codec over lowercase ASCII for tests.
    pub struct ByteCodec {
        pub max_length: usize,
    }

    impl TokenCodec for ByteCodec {
        fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(|b| (b % 60) as u32 + 4).collect())
        }

        fn encode_fixed(&self, text: &str) -> Result<Vec<u32>> {
            let mut ids = vec![2];
            ids.extend(self.encode_prompt(text)?);
            ids.push(3);
            if ids.len() > self.max_length {
                ids.truncate(self.max_length - 1);
                ids.push(3);
            }
            ids.resize(self.max_length, 0);
            Ok(ids)
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().filter(|&&id| id >= 4).map(|_| 'x').collect())
        }

        fn decode_token(&self, id: u32) -> Result<String> {
            Ok(if id >= 4 { "x".into() } else { String::new() })
        }

        fn vocab_size(&self) -> usize {
            64
        }

        fn max_length(&self) -> usize {
            self.max_length
        }

        fn pad_id(&self) -> u32 {
            0
        }

        fn eos_id(&self) -> u32 {
            3
        }
    }

    pub fn problems() -> Vec<ReasoningProblem> {
        vec![
            ReasoningProblem {
                question: "2+2".into(),
                thought: "two and two".into(),
                answer: "4".into(),
                concepts: vec!["math".into()],
            },
            ReasoningProblem {
                question: "3+1".into(),
                thought: "three and one".into(),
                answer: "4".into(),
                concepts: vec![],
            },
            ReasoningProblem {
                question: "1+1".into(),
                thought: "one and one".into(),
                answer: "2".into(),
                concepts: vec![],
            },
        ]
    }

    #[test]
    fn test_formatted_problem() {
        assert_eq!(
            problems()[0].formatted(),
            "User: 2+2\nAssistant: <think>two and two</think><answer>4</answer>"
        );
    }

    #[test]
    fn test_loader_batches() -> Result<()> {
        let codec = ByteCodec { max_length: 24 };
        let ds = ReasoningDataset::new(problems(), &codec)?;
        assert_eq!(ds.batches(3, &Device::Cpu).n_batches(), 1);
        let loader = DataLoader::new(&ds, 2, true, 7, &Device::Cpu);
        assert_eq!(loader.n_batches(), 2);
        let batches: Vec<Tensor> = loader.collect::<Result<_>>()?;
        assert_eq!(batches[0].dims(), &[2, 24]);
        assert_eq!(batches[1].dims(), &[1, 24]);
        assert_eq!(ds.answer_key().get("1+1").map(String::as_str), Some("2"));
        Ok(())
    }

    #[test]
    fn test_load_problems_jsonl() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("problems.jsonl");
        let lines: Vec<String> = problems()
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<_, _>>()?;
        std::fs::write(&path, lines.join("\n\n"))?;
        assert_eq!(load_problems(&path)?, problems());

        std::fs::write(&path, "{not json}")?;
        assert!(load_problems(&path).is_err());
        Ok(())
    }
}
