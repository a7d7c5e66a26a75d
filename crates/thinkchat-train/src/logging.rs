//! Structured logging for training with tracing.
//!
//! JSON output for runs, pretty output for the console, and per-step
//! metrics with automatic warnings for divergence and gradient spikes.

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Gradient norm above which a step is flagged.
pub const GRAD_NORM_WARN: f64 = 10.0;

const DEFAULT_FILTER: &str =
    "info,thinkchat_train=info,thinkchat_rl=info,thinkchat_tokenizer=info,thinkchat_core=info";

/// Initialize structured logging.
///
/// Reads the filter from RUST_LOG, defaulting to info for our crates.
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let initialized = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok();
    if initialized {
        info!("Structured logging initialized");
    }
}

/// Initialize human-readable console logging.
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,thinkchat_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .try_init();
}

/// Metrics for one optimizer step.
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    pub loss: f64,
    pub learning_rate: f64,
    /// Gradient norm (L2) before clipping.
    pub grad_norm: f64,
    pub tokens_per_sec: f64,
}

impl TrainingMetrics {
    pub fn new(loss: f64, learning_rate: f64, grad_norm: f64, tokens_per_sec: f64) -> Self {
        Self {
            loss,
            learning_rate,
            grad_norm,
            tokens_per_sec,
        }
    }
}

/// Log a training step.
///
/// Emits an error for a non-finite loss and a warning for a gradient norm
/// above [`GRAD_NORM_WARN`].
pub fn log_training_step(step: usize, metrics: &TrainingMetrics) {
    let span = span!(Level::INFO, "training_step", step = step);
    let _enter = span.enter();

    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            step = step,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        loss = metrics.loss,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        tokens_per_sec = metrics.tokens_per_sec,
        "Training step completed"
    );

    if metrics.grad_norm > GRAD_NORM_WARN {
        warn!(
            grad_norm = metrics.grad_norm,
            step = step,
            threshold = GRAD_NORM_WARN,
            "High gradient norm detected - potential instability"
        );
    }

    debug!(step = step, perplexity = metrics.loss.exp(), "Training diagnostics");
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str, loss: f64) {
    info!(
        step = step,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log evaluation results.
pub fn log_evaluation(step: usize, eval_loss: f64) {
    info!(
        step = step,
        eval_loss = eval_loss,
        eval_perplexity = eval_loss.exp(),
        event = "evaluation",
        "Evaluation completed"
    );
}

/// Log the mean loss of a finished epoch.
pub fn log_epoch(kind: &str, epoch: usize, avg_loss: f64, steps: usize) {
    if !avg_loss.is_finite() {
        error!(kind, epoch, avg_loss, "Epoch loss is not finite");
        return;
    }
    info!(
        kind,
        epoch,
        avg_loss,
        steps,
        event = "epoch_complete",
        "Epoch completed"
    );
}
