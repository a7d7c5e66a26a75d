//! Teacher-to-student distillation.
//!
//! Loss: KL(teacher || student) over temperature-scaled distributions with
//! batch-mean reduction. The teacher only runs in evaluation mode.

use candle_core::{Tensor, Var, D};
use candle_nn::{AdamW, Optimizer};
use thinkchat_core::{DistillConfig, Result};

use crate::data::{DataLoader, Dataset};
use crate::logging::log_epoch;
use crate::model::ScoringModel;
use crate::optim::{adamw, compute_grad_norm};

/// KL(teacher || student) summed over positions and vocabulary, divided by
/// the batch size and scaled by `temperature^2`.
///
/// Both inputs are `[batch, seq, vocab]`; teacher logits are detached.
pub fn kl_divergence_loss(
    teacher_logits: &Tensor,
    student_logits: &Tensor,
    temperature: f64,
) -> Result<Tensor> {
    let (batch, _seq, _vocab) = student_logits.dims3()?;
    let teacher_scaled = (teacher_logits.detach() / temperature)?;
    let student_scaled = (student_logits / temperature)?;

    let teacher_log_probs = candle_nn::ops::log_softmax(&teacher_scaled, D::Minus1)?;
    let teacher_probs = teacher_log_probs.exp()?;
    let student_log_probs = candle_nn::ops::log_softmax(&student_scaled, D::Minus1)?;

    // KL(P||Q) = sum(P * (log P - log Q))
    let kl = (teacher_probs * (teacher_log_probs - student_log_probs)?)?.sum_all()?;
    Ok((kl * (temperature * temperature / batch as f64))?)
}

/// Statistics for one distillation step.
#[derive(Debug, Clone)]
pub struct DistillStepStats {
    pub kl_loss: f64,
    pub grad_norm: f64,
}

/// Statistics for one epoch.
#[derive(Debug, Clone)]
pub struct DistillEpochStats {
    pub avg_loss: f64,
    pub steps: usize,
}

/// Trains `student` to match a frozen `teacher`.
pub struct DistillationTrainer<'a> {
    teacher: &'a dyn ScoringModel,
    student: &'a dyn ScoringModel,
    student_vars: Vec<Var>,
    optimizer: AdamW,
    config: DistillConfig,
    pub global_step: usize,
}

impl<'a> DistillationTrainer<'a> {
    /// `student_vars` are the only parameters the optimizer touches.
    pub fn new(
        teacher: &'a dyn ScoringModel,
        student: &'a dyn ScoringModel,
        student_vars: Vec<Var>,
        config: DistillConfig,
    ) -> Result<Self> {
        config.validate()?;
        let optimizer = adamw(
            student_vars.clone(),
            config.learning_rate,
            0.9,
            0.999,
            1e-8,
            0.01,
        )?;
        Ok(Self {
            teacher,
            student,
            student_vars,
            optimizer,
            config,
            global_step: 0,
        })
    }

    /// One optimizer step on a `[batch, seq]` batch of ids.
    pub fn train_step(&mut self, input_ids: &Tensor) -> Result<DistillStepStats> {
        let teacher_logits = self.teacher.forward_eval(input_ids)?;
        let student_logits = self.student.forward(input_ids)?;
        let loss = kl_divergence_loss(&teacher_logits, &student_logits, self.config.temperature)?;

        let grads = loss.backward()?;
        let grad_norm = compute_grad_norm(&grads, &self.student_vars)?;
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        Ok(DistillStepStats {
            kl_loss: loss.to_scalar::<f32>()? as f64,
            grad_norm,
        })
    }

    pub fn train_epoch(&mut self, dataset: &dyn Dataset, epoch: usize) -> Result<DistillEpochStats> {
        let loader = DataLoader::new(
            dataset,
            self.config.batch_size,
            true,
            epoch as u64,
            self.student.device(),
        );
        let mut total = 0.0;
        let mut steps = 0usize;
        for batch in loader {
            let stats = self.train_step(&batch?)?;
            total += stats.kl_loss;
            steps += 1;
        }
        let avg_loss = if steps > 0 { total / steps as f64 } else { 0.0 };
        log_epoch("distill", epoch, avg_loss, steps);
        Ok(DistillEpochStats { avg_loss, steps })
    }

    /// Run `num_epochs` epochs.
    pub fn train(&mut self, dataset: &dyn Dataset) -> Result<Vec<DistillEpochStats>> {
        (0..self.config.num_epochs)
            .map(|epoch| self.train_epoch(dataset, epoch))
            .collect()
    }
}
