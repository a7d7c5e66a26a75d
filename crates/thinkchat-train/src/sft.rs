//! Supervised fine-tuning on fixed-length sequences.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Tensor, Var, D};
use candle_nn::{AdamW, VarMap};
use serde::Serialize;
use thinkchat_core::{ModelConfig, Result, SftConfig, ThinkChatError};
use tracing::info;

use crate::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::data::{DataLoader, Dataset};
use crate::logging::{log_epoch, log_evaluation, log_training_step, TrainingMetrics};
use crate::model::ScoringModel;
use crate::optim::{adamw, clipped_step};

pub const TRAINING_ARGS_FILE: &str = "training_args.json";

/// Mean next-token cross-entropy over non-pad targets of a `[batch, seq]` batch.
pub fn lm_loss(model: &dyn ScoringModel, batch: &Tensor, pad_id: u32, eval: bool) -> Result<Tensor> {
    let (_b, seq) = batch.dims2()?;
    if seq < 2 {
        return Err(ThinkChatError::Other(
            "sequences need at least two tokens".into(),
        ));
    }
    let inputs = batch.narrow(1, 0, seq - 1)?.contiguous()?;
    let targets = batch.narrow(1, 1, seq - 1)?.contiguous()?;

    let logits = if eval {
        model.forward_eval(&inputs)?
    } else {
        model.forward(&inputs)?
    };
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(2)?, 2)?
        .squeeze(2)?;

    let mask: Vec<f32> = targets
        .flatten_all()?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|id| if id == pad_id { 0.0 } else { 1.0 })
        .collect();
    let n_tokens: f32 = mask.iter().sum();
    let mask = Tensor::from_vec(mask, picked.shape(), picked.device())?;
    let total = (picked * mask)?.sum_all()?;
    Ok((total.neg()? / n_tokens.max(1.0) as f64)?)
}

/// Summary of a fine-tuning run.
#[derive(Debug, Clone)]
pub struct SftStats {
    pub steps: usize,
    pub epochs: usize,
    /// Mean loss of the last epoch.
    pub final_loss: f64,
    pub last_eval_loss: Option<f64>,
}

#[derive(Serialize)]
struct TrainingArgs<'a> {
    sft: &'a SftConfig,
    model: &'a ModelConfig,
    pad_id: u32,
}

/// Cross-entropy fine-tuning with gradient accumulation.
pub struct SftTrainer<'a> {
    model: &'a dyn ScoringModel,
    varmap: &'a VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    model_config: ModelConfig,
    config: SftConfig,
    pad_id: u32,
    output_dir: Option<PathBuf>,
    pub global_step: usize,
}

impl<'a> SftTrainer<'a> {
    pub fn new(
        model: &'a dyn ScoringModel,
        varmap: &'a VarMap,
        model_config: ModelConfig,
        config: SftConfig,
        pad_id: u32,
    ) -> Result<Self> {
        config.validate()?;
        let vars = varmap.all_vars();
        let optimizer = adamw(
            vars.clone(),
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.eps,
            config.weight_decay,
        )?;
        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            model_config,
            config,
            pad_id,
            output_dir: None,
            global_step: 0,
        })
    }

    /// Write checkpoints and `training_args.json` under `dir`.
    pub fn with_output_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.output_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn save(&self, name: &str, loss: f64) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            let meta = CheckpointMeta {
                model: self.model_config.clone(),
                step: self.global_step,
                loss,
            };
            save_checkpoint(self.varmap, &meta, dir.join(name))?;
        }
        Ok(())
    }

    fn write_training_args(&self) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir)?;
            let args = TrainingArgs {
                sft: &self.config,
                model: &self.model_config,
                pad_id: self.pad_id,
            };
            std::fs::write(
                dir.join(TRAINING_ARGS_FILE),
                serde_json::to_string_pretty(&args)?,
            )?;
        }
        Ok(())
    }

    /// Mean loss over `dataset` without gradient tracking.
    pub fn evaluate(&self, dataset: &dyn Dataset) -> Result<f64> {
        let loader = DataLoader::new(
            dataset,
            self.config.eval_batch_size,
            false,
            0,
            self.model.device(),
        );
        let mut total = 0.0;
        let mut n = 0usize;
        for batch in loader {
            let loss = lm_loss(self.model, &batch?, self.pad_id, true)?;
            total += loss.to_scalar::<f32>()? as f64;
            n += 1;
        }
        Ok(if n > 0 { total / n as f64 } else { 0.0 })
    }

    fn optimizer_step(
        &mut self,
        accumulated: Tensor,
        micro_batches: usize,
        tokens: usize,
        started: Instant,
    ) -> Result<f64> {
        let loss = (accumulated / micro_batches as f64)?;
        let grad_norm = clipped_step(
            &mut self.optimizer,
            &loss,
            &self.vars,
            self.config.max_grad_norm,
        )?;
        self.global_step += 1;
        let loss_val = loss.to_scalar::<f32>()? as f64;

        if self.global_step % self.config.logging_steps == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            let tokens_per_sec = if elapsed > 0.0 { tokens as f64 / elapsed } else { 0.0 };
            log_training_step(
                self.global_step,
                &TrainingMetrics::new(loss_val, self.config.learning_rate, grad_norm, tokens_per_sec),
            );
        }
        if self.global_step % self.config.save_steps == 0 {
            self.save(&format!("checkpoint-{}", self.global_step), loss_val)?;
        }
        Ok(loss_val)
    }

    /// Run `num_epochs` over `train`, evaluating on `eval` when given.
    pub fn train(&mut self, train: &dyn Dataset, eval: Option<&dyn Dataset>) -> Result<SftStats> {
        self.write_training_args()?;
        let accumulation = self.config.gradient_accumulation_steps;
        let mut final_loss = 0.0;
        let mut last_eval_loss = None;

        for epoch in 0..self.config.num_epochs {
            let loader = DataLoader::new(
                train,
                self.config.train_batch_size,
                self.config.shuffle,
                self.config.seed + epoch as u64,
                self.model.device(),
            );

            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0usize;
            let mut accumulated: Option<Tensor> = None;
            let mut micro = 0usize;
            let mut tokens = 0usize;
            let mut started = Instant::now();

            for batch in loader {
                let batch = batch?;
                tokens += batch.elem_count();
                let loss = lm_loss(self.model, &batch, self.pad_id, false)?;
                accumulated = Some(match accumulated.take() {
                    Some(acc) => (acc + loss)?,
                    None => loss,
                });
                micro += 1;

                if micro == accumulation {
                    if let Some(acc) = accumulated.take() {
                        epoch_loss += self.optimizer_step(acc, micro, tokens, started)?;
                        epoch_steps += 1;
                    }
                    micro = 0;
                    tokens = 0;
                    started = Instant::now();

                    if let Some(eval) = eval {
                        if self.global_step % self.config.evaluation_steps == 0 {
                            let eval_loss = self.evaluate(eval)?;
                            log_evaluation(self.global_step, eval_loss);
                            last_eval_loss = Some(eval_loss);
                        }
                    }
                }
            }
            // Flush a partial accumulation window at the end of the epoch.
            if let Some(acc) = accumulated.take() {
                epoch_loss += self.optimizer_step(acc, micro, tokens, started)?;
                epoch_steps += 1;
            }

            final_loss = if epoch_steps > 0 {
                epoch_loss / epoch_steps as f64
            } else {
                0.0
            };
            log_epoch("sft", epoch, final_loss, epoch_steps);
            self.save(&format!("checkpoint-epoch-{}", epoch), final_loss)?;
        }

        info!(steps = self.global_step, final_loss, "fine-tuning complete");
        Ok(SftStats {
            steps: self.global_step,
            epochs: self.config.num_epochs,
            final_loss,
            last_eval_loss,
        })
    }
}
