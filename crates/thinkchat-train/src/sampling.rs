//! Next-token sampling: temperature, top-k, nucleus and repetition penalty.

use std::cmp::Ordering;

use rand::Rng;
use thinkchat_core::{Result, SamplingConfig, ThinkChatError};

/// Sampling parameters for one decode step.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        }
    }
}

impl From<&SamplingConfig> for SamplingParams {
    fn from(cfg: &SamplingConfig) -> Self {
        Self {
            temperature: cfg.temperature as f32,
            top_k: cfg.top_k,
            top_p: cfg.top_p as f32,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(ThinkChatError::InvalidConfig(format!(
                "temperature ({}) must be > 0",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ThinkChatError::InvalidConfig(format!(
                "top_p ({}) must be in (0, 1]",
                self.top_p
            )));
        }
        Ok(())
    }
}

fn descending(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Scaled logits with filtered entries set to negative infinity.
///
/// The highest logit always survives, so the candidate set is never empty.
pub fn filtered_logits(logits: &[f32], params: &SamplingParams) -> Vec<f32> {
    let mut scaled: Vec<f32> = logits.iter().map(|&l| l / params.temperature).collect();
    if scaled.is_empty() {
        return scaled;
    }

    // Top-k: everything strictly below the k-th value goes; ties stay.
    if params.top_k > 0 && params.top_k < scaled.len() {
        let mut sorted = scaled.clone();
        sorted.sort_unstable_by(|a, b| descending(*a, *b));
        let threshold = sorted[params.top_k - 1];
        for v in scaled.iter_mut() {
            if *v < threshold {
                *v = f32::NEG_INFINITY;
            }
        }
    }

    if params.top_p < 1.0 {
        let probs = softmax(&scaled);
        let mut order: Vec<usize> = (0..scaled.len()).collect();
        order.sort_by(|&a, &b| descending(scaled[a], scaled[b]));
        let mut cumulative = 0.0f64;
        for (rank, &idx) in order.iter().enumerate() {
            // Mass before this token decides; the top token is never removed.
            let before = cumulative;
            cumulative += probs[idx];
            if rank > 0 && before > params.top_p as f64 {
                scaled[idx] = f32::NEG_INFINITY;
            }
        }
    }
    scaled
}

/// Numerically stable softmax in f64; masked entries get zero mass.
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    if !max.is_finite() {
        let n = logits.len().max(1) as f64;
        return vec![1.0 / n; logits.len()];
    }
    let exps: Vec<f64> = logits.iter().map(|&l| (l as f64 - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value.
pub fn argmax(x: &[f32]) -> u32 {
    let mut best_idx = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in x.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    best_idx as u32
}

/// Draw one token id from `logits`.
pub fn sample_token<R: Rng + ?Sized>(
    logits: &[f32],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<u32> {
    params.validate()?;
    if logits.is_empty() {
        return Err(ThinkChatError::Other("cannot sample from empty logits".into()));
    }
    let probs = softmax(&filtered_logits(logits, params));
    let r: f64 = rng.gen();
    let mut cumulative = 0.0;
    let mut last_candidate = 0usize;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_candidate = i;
        if r < cumulative {
            return Ok(i as u32);
        }
    }
    // Rounding left r just above the total mass.
    Ok(last_candidate as u32)
}

/// CTRL-style penalty on ids already in `history`: positive logits are
/// divided by `penalty`, negative ones multiplied. `1.0` is a no-op.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    let mut seen = vec![false; logits.len()];
    for &id in history {
        let idx = id as usize;
        if idx < logits.len() && !seen[idx] {
            seen[idx] = true;
            let v = logits[idx];
            logits[idx] = if v > 0.0 { v / penalty } else { v * penalty };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.9, 0.5]), 1);
        assert_eq!(argmax(&[-1.0, -2.0, -0.5]), 2);
    }

    #[test]
    fn test_no_mask_without_filters() {
        let logits = vec![0.3, -1.0, 2.0, 0.0, 5.5];
        let params = SamplingParams::default();
        let filtered = filtered_logits(&logits, &params);
        assert!(filtered.iter().all(|v| v.is_finite()));
        let probs = softmax(&filtered);
        assert_relative_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(probs.iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_top_k_keeps_ties() {
        let logits = vec![1.0, 3.0, 3.0, 0.5];
        let params = SamplingParams {
            top_k: 1,
            ..Default::default()
        };
        let filtered = filtered_logits(&logits, &params);
        assert!(filtered[1].is_finite() && filtered[2].is_finite());
        assert!(filtered[0].is_infinite() && filtered[3].is_infinite());
    }

    #[test]
    fn test_top_p_keeps_top_token() {
        let logits = vec![10.0, 0.0, 0.0, 0.0];
        let params = SamplingParams {
            top_p: 0.01,
            ..Default::default()
        };
        let filtered = filtered_logits(&logits, &params);
        assert!(filtered[0].is_finite());
        assert_eq!(filtered.iter().filter(|v| v.is_finite()).count(), 1);
    }

    #[test]
    fn test_top_p_nucleus() {
        // probs ~ [0.5, 0.3, 0.2] after softmax of log-probs.
        let logits: Vec<f32> = [0.5f32, 0.3, 0.2].iter().map(|p| p.ln()).collect();
        let params = SamplingParams {
            top_p: 0.7,
            ..Default::default()
        };
        let filtered = filtered_logits(&logits, &params);
        assert!(filtered[0].is_finite());
        assert!(filtered[1].is_finite());
        assert!(filtered[2].is_infinite());
    }

    #[test]
    fn test_sampling_is_reproducible() -> Result<()> {
        let logits = vec![1.0, 1.1, 0.9, 1.05];
        let params = SamplingParams::default();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(
                sample_token(&logits, &params, &mut a)?,
                sample_token(&logits, &params, &mut b)?
            );
        }
        Ok(())
    }

    #[test]
    fn test_invalid_params_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let params = SamplingParams {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(sample_token(&[1.0, 2.0], &params, &mut rng).is_err());
    }

    #[test]
    fn test_repetition_penalty() {
        let mut logits = vec![2.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 0, 9], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
        let mut same = vec![2.0, -2.0];
        apply_repetition_penalty(&mut same, &[0, 1], 1.0);
        assert_eq!(same, vec![2.0, -2.0]);
    }

    proptest! {
        #[test]
        fn prop_candidate_set_never_empty(
            logits in proptest::collection::vec(-50.0f32..50.0, 1..64),
            top_k in 0usize..8,
            top_p in 0.001f32..1.0,
            temperature in 0.05f32..3.0,
            seed in any::<u64>(),
        ) {
            let params = SamplingParams { temperature, top_k, top_p };
            let filtered = filtered_logits(&logits, &params);
            prop_assert!(filtered.iter().any(|v| v.is_finite()));
            let mut rng = StdRng::seed_from_u64(seed);
            let id = sample_token(&logits, &params, &mut rng).unwrap() as usize;
            prop_assert!(id < logits.len());
            prop_assert!(filtered[id].is_finite());
        }
    }
}
