//! Scoring-model seam and a small reference language model.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use thinkchat_core::{ModelConfig, Result, ThinkChatError};

/// Anything that maps token ids to next-token logits.
pub trait ScoringModel {
    /// `[batch, seq]` u32 ids -> `[batch, seq, vocab]` logits, gradients tracked.
    fn forward(&self, ids: &Tensor) -> Result<Tensor>;

    fn device(&self) -> &Device;

    /// Evaluation mode: same logits, detached from the graph.
    fn forward_eval(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.forward(ids)?.detach())
    }

    /// Logits for the position after `ids`.
    fn last_logits(&self, ids: &[u32]) -> Result<Vec<f32>> {
        if ids.is_empty() {
            return Err(ThinkChatError::Other(
                "cannot score an empty prefix".into(),
            ));
        }
        let input = Tensor::new(ids, self.device())?.unsqueeze(0)?;
        let logits = self.forward_eval(&input)?;
        let last = logits.get(0)?.get(ids.len() - 1)?;
        Ok(last.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

/// Embedding + causal prefix mean + hidden projection + LM head.
///
/// Position `t` sees its own embedding plus the mean of embeddings `0..=t`,
/// which is enough context for the training loops to have something to learn.
pub struct TinyLm {
    embed: Embedding,
    hidden: Linear,
    head: Linear,
    device: Device,
    config: ModelConfig,
}

impl TinyLm {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let embed = embedding(config.vocab_size, config.dim, vb.pp("embed"))?;
        let hidden = linear(config.dim, config.hidden_dim, vb.pp("hidden"))?;
        let head = linear(config.hidden_dim, config.vocab_size, vb.pp("head"))?;
        Ok(Self {
            embed,
            hidden,
            head,
            device: vb.device().clone(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl ScoringModel for TinyLm {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let emb = self.embed.forward(ids)?;
        let (_batch, seq, _dim) = emb.dims3()?;
        let counts = Tensor::arange(1u32, seq as u32 + 1, &self.device)?
            .to_dtype(DType::F32)?
            .reshape((1, seq, 1))?;
        let context = emb.cumsum(1)?.broadcast_div(&counts)?;
        let h = (emb + context)?;
        let h = self.hidden.forward(&h)?.gelu()?;
        Ok(self.head.forward(&h)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Build a fresh [`TinyLm`] with its own parameter map.
pub fn build_tiny_lm(config: &ModelConfig, device: &Device) -> Result<(VarMap, TinyLm)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = TinyLm::new(config, vb)?;
    Ok((varmap, model))
}

/// Deep copy of every tensor in `varmap`; later updates to the source do not
/// reach the copy.
pub fn snapshot_varmap(varmap: &VarMap) -> Result<VarMap> {
    let snapshot = VarMap::new();
    {
        let source = varmap
            .data()
            .lock()
            .map_err(|_| ThinkChatError::Other("parameter map lock poisoned".into()))?;
        let mut target = snapshot
            .data()
            .lock()
            .map_err(|_| ThinkChatError::Other("parameter map lock poisoned".into()))?;
        for (name, var) in source.iter() {
            let copy = Var::from_tensor(&var.as_tensor().copy()?.detach())?;
            target.insert(name.clone(), copy);
        }
    }
    Ok(snapshot)
}

/// Per-position log-probabilities of the observed next tokens.
///
/// Returns `[seq - 1]` where entry `i` is `log p(ids[i + 1] | ids[..=i])`.
pub fn token_log_probs(model: &dyn ScoringModel, ids: &[u32], eval: bool) -> Result<Tensor> {
    if ids.len() < 2 {
        return Err(ThinkChatError::Other(
            "need at least two tokens to score a continuation".into(),
        ));
    }
    let input = Tensor::new(&ids[..ids.len() - 1], model.device())?.unsqueeze(0)?;
    let logits = if eval {
        model.forward_eval(&input)?
    } else {
        model.forward(&input)?
    };
    let log_probs = candle_nn::ops::log_softmax(&logits.squeeze(0)?, D::Minus1)?;
    let targets = Tensor::new(&ids[1..], model.device())?.unsqueeze(1)?;
    Ok(log_probs.gather(&targets, 1)?.squeeze(1)?)
}
