//! Command-line entry points for thinkchat.
//!
//! Provides subcommands:
//! - train-tokenizer: Train a concept tokenizer bundle from a text corpus
//! - encode / decode: Inspect a tokenizer bundle
//! - generate: Chain-of-thought or plain sampling from a checkpoint
//! - sft: Supervised fine-tuning on reasoning problems
//! - grpo: Reinforcement learning with format and accuracy rewards
//! - distill: Teacher-to-student distillation

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use candle_core::Device;
use candle_nn::VarMap;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thinkchat_core::{GenerationConfig, ModelConfig, RuntimeContext, StackConfig, TokenCodec};
use thinkchat_rl::{GrpoTrainer, RewardAggregator};
use thinkchat_tokenizer::ConceptTokenizer;
use thinkchat_train::logging::{init_console_logging, init_logging};
use thinkchat_train::{
    build_tiny_lm, generate_plain, load_checkpoint, load_problems, read_meta, save_checkpoint,
    CheckpointMeta, CotGenerator, DistillationTrainer, ReasoningDataset, SftTrainer, TinyLm,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "thinkchat")]
#[command(about = "Concept-aware tokenizer and reasoning fine-tuning toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON logs instead of pretty console output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a tokenizer bundle from a corpus (one text per line)
    TrainTokenizer {
        #[arg(long)]
        corpus: PathBuf,

        /// Bundle output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Override the configured vocabulary size
        #[arg(long)]
        vocab_size: Option<usize>,

        /// Concepts as `name=term1,term2`
        #[arg(long = "concept")]
        concepts: Vec<String>,

        /// Skip registering the think/answer sentinel concepts
        #[arg(long)]
        no_reasoning_markers: bool,
    },

    /// Encode text to ids
    Encode {
        #[arg(short, long)]
        tokenizer: PathBuf,

        #[arg(long)]
        text: String,

        /// Skip sentinels and padding
        #[arg(long)]
        raw: bool,
    },

    /// Decode comma-separated ids to text
    Decode {
        #[arg(short, long)]
        tokenizer: PathBuf,

        #[arg(long)]
        ids: String,
    },

    /// Sample from a checkpoint
    Generate {
        #[arg(short, long)]
        tokenizer: PathBuf,

        /// Checkpoint directory
        #[arg(short = 'm', long)]
        checkpoint: PathBuf,

        #[arg(short, long)]
        prompt: String,

        #[arg(short = 'n', long, default_value = "1")]
        samples: usize,

        /// Plain EOS-terminated sampling instead of think/answer decoding
        #[arg(long)]
        plain: bool,
    },

    /// Supervised fine-tuning on a JSONL file of reasoning problems
    Sft {
        #[arg(short, long)]
        tokenizer: PathBuf,

        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        eval_data: Option<PathBuf>,

        /// Start from this checkpoint instead of fresh weights
        #[arg(short = 'm', long)]
        checkpoint: Option<PathBuf>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// GRPO on the questions of a JSONL file of reasoning problems
    Grpo {
        #[arg(short, long)]
        tokenizer: PathBuf,

        #[arg(short = 'm', long)]
        checkpoint: PathBuf,

        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value = "10")]
        steps: usize,

        /// Steps between checkpoints
        #[arg(long, default_value = "5")]
        save_every: usize,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Distill a teacher checkpoint into a fresh or existing student
    Distill {
        #[arg(short, long)]
        tokenizer: PathBuf,

        #[arg(long)]
        teacher: PathBuf,

        #[arg(long)]
        student: Option<PathBuf>,

        #[arg(long)]
        data: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_logging();
    } else {
        init_console_logging();
    }

    let config = match &cli.config {
        Some(path) => StackConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StackConfig::default(),
    };

    match cli.command {
        Commands::TrainTokenizer {
            corpus,
            output,
            vocab_size,
            concepts,
            no_reasoning_markers,
        } => train_tokenizer(
            &config,
            &corpus,
            &output,
            vocab_size,
            &concepts,
            !no_reasoning_markers,
        )?,

        Commands::Encode {
            tokenizer,
            text,
            raw,
        } => {
            let tok = load_tokenizer(&tokenizer)?;
            let ids = if raw {
                tok.encode_unpadded(&text)?
            } else {
                tok.encode(&text, true)?
            };
            println!("{}", serde_json::to_string(&ids)?);
        }

        Commands::Decode { tokenizer, ids } => {
            let tok = load_tokenizer(&tokenizer)?;
            let ids = parse_ids(&ids)?;
            println!("{}", tok.decode(&ids, true)?);
        }

        Commands::Generate {
            tokenizer,
            checkpoint,
            prompt,
            samples,
            plain,
        } => generate(&config, &tokenizer, &checkpoint, &prompt, samples, plain)?,

        Commands::Sft {
            tokenizer,
            data,
            eval_data,
            checkpoint,
            output,
        } => run_sft(
            &config,
            &tokenizer,
            &data,
            eval_data.as_deref(),
            checkpoint.as_deref(),
            &output,
        )?,

        Commands::Grpo {
            tokenizer,
            checkpoint,
            data,
            steps,
            save_every,
            output,
        } => run_grpo(
            &config,
            &tokenizer,
            &checkpoint,
            &data,
            steps,
            save_every,
            &output,
        )?,

        Commands::Distill {
            tokenizer,
            teacher,
            student,
            data,
            output,
        } => run_distill(&config, &tokenizer, &teacher, student.as_deref(), &data, &output)?,
    }

    Ok(())
}

fn device(config: &StackConfig) -> anyhow::Result<Device> {
    let mut runtime = RuntimeContext::new(&config.runtime)?;
    let device = runtime.initialize()?.clone();
    info!(device = ?device, rank = runtime.rank, world_size = runtime.world_size, "runtime ready");
    Ok(device)
}

fn load_tokenizer(dir: &Path) -> anyhow::Result<ConceptTokenizer> {
    ConceptTokenizer::from_pretrained(dir)
        .with_context(|| format!("Failed to load tokenizer bundle {}", dir.display()))
}

fn parse_ids(ids: &str) -> anyhow::Result<Vec<u32>> {
    ids.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().with_context(|| format!("invalid token id '{}'", s)))
        .collect()
}

/// `name=term1,term2` -> (name, terms)
fn parse_concept(spec: &str) -> anyhow::Result<(String, Vec<String>)> {
    let (name, terms) = spec.split_once('=').unwrap_or((spec, ""));
    let name = name.trim();
    if name.is_empty() {
        bail!("concept '{}' has no name", spec);
    }
    let terms = terms
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    Ok((name.to_string(), terms))
}

fn train_tokenizer(
    config: &StackConfig,
    corpus: &Path,
    output: &Path,
    vocab_size: Option<usize>,
    concepts: &[String],
    reasoning_markers: bool,
) -> anyhow::Result<()> {
    let mut tok_config = config.tokenizer.clone();
    if let Some(size) = vocab_size {
        tok_config.vocab_size = size;
    }
    let text = std::fs::read_to_string(corpus)
        .with_context(|| format!("Failed to read corpus {}", corpus.display()))?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

    println!("{}", "Training tokenizer...".yellow());
    let start = Instant::now();
    let mut tok = ConceptTokenizer::new(tok_config)?;
    tok.train(&lines)?;
    if reasoning_markers {
        tok.register_reasoning_markers()?;
    }
    for spec in concepts {
        let (name, terms) = parse_concept(spec)?;
        let terms: Vec<&str> = terms.iter().map(String::as_str).collect();
        tok.add_concept(&name, &terms)?;
    }
    tok.save_pretrained(output)?;

    println!(
        "{} Trained in {:.2}s: {} subwords + {} concepts -> {}",
        "✓".green(),
        start.elapsed().as_secs_f32(),
        tok.subword_vocab_size()?,
        tok.concepts().len(),
        output.display()
    );
    Ok(())
}

/// Fresh weights sized for `codec`, or a saved checkpoint.
fn load_or_build(
    config: &StackConfig,
    codec: &dyn TokenCodec,
    checkpoint: Option<&Path>,
    device: &Device,
) -> anyhow::Result<(VarMap, TinyLm, ModelConfig)> {
    let model_config = match checkpoint {
        Some(dir) => read_meta(dir)?.model,
        None => ModelConfig {
            vocab_size: codec.vocab_size().max(1),
            ..config.model.clone()
        },
    };
    if model_config.vocab_size < codec.vocab_size() {
        bail!(
            "model vocabulary ({}) is smaller than the tokenizer's ({})",
            model_config.vocab_size,
            codec.vocab_size()
        );
    }
    let (mut varmap, model) = build_tiny_lm(&model_config, device)?;
    if let Some(dir) = checkpoint {
        let meta = load_checkpoint(dir, &mut varmap)
            .with_context(|| format!("Failed to load checkpoint {}", dir.display()))?;
        info!(step = meta.step, loss = meta.loss, "checkpoint loaded");
    }
    Ok((varmap, model, model_config))
}

/// Think/answer settings with the configured length and sampling fields.
fn cot_generation_config(configured: &GenerationConfig) -> GenerationConfig {
    GenerationConfig {
        max_length: configured.max_length,
        max_new_tokens: configured.max_new_tokens,
        temperature: configured.temperature,
        top_k: configured.top_k,
        top_p: configured.top_p,
        ..GenerationConfig::chain_of_thought()
    }
}

fn generate(
    config: &StackConfig,
    tokenizer: &Path,
    checkpoint: &Path,
    prompt: &str,
    samples: usize,
    plain: bool,
) -> anyhow::Result<()> {
    let device = device(config)?;
    let tok = load_tokenizer(tokenizer)?;
    let (_varmap, model, _) = load_or_build(config, &tok, Some(checkpoint), &device)?;
    let mut rng = StdRng::seed_from_u64(config.runtime.seed);

    if plain {
        let gen_config = GenerationConfig {
            num_return_sequences: samples,
            ..config.generation.clone()
        };
        let prompt_ids = tok.encode_prompt(prompt)?;
        for (i, ids) in generate_plain(&model, &tok, &prompt_ids, &gen_config, &mut rng)?
            .iter()
            .enumerate()
        {
            println!("{} {}", format!("[{}]", i).cyan(), tok.decode(ids, true)?);
        }
        return Ok(());
    }

    let generator = CotGenerator::new(&model, &tok, cot_generation_config(&config.generation))?;
    for (i, sample) in generator.generate(prompt, samples, &mut rng)?.iter().enumerate() {
        println!("{}", format!("Sample {}", i).bold().cyan());
        println!("  {} {}", "Thought:".yellow(), sample.thought);
        println!("  {} {}", "Answer:".green(), sample.answer);
        if !sample.finished {
            println!("  {}", "(stopped before the answer closed)".dimmed());
        }
    }
    Ok(())
}

fn run_sft(
    config: &StackConfig,
    tokenizer: &Path,
    data: &Path,
    eval_data: Option<&Path>,
    checkpoint: Option<&Path>,
    output: &Path,
) -> anyhow::Result<()> {
    let device = device(config)?;
    let tok = load_tokenizer(tokenizer)?;
    let train_set = ReasoningDataset::new(load_problems(data)?, &tok)?;
    let eval_set = eval_data
        .map(|p| load_problems(p).and_then(|problems| ReasoningDataset::new(problems, &tok)))
        .transpose()?;
    let (varmap, model, model_config) = load_or_build(config, &tok, checkpoint, &device)?;

    let mut trainer = SftTrainer::new(
        &model,
        &varmap,
        model_config,
        config.sft.clone(),
        tok.pad_id(),
    )?
    .with_output_dir(output);
    let stats = trainer.train(
        &train_set,
        eval_set.as_ref().map(|d| d as &dyn thinkchat_train::Dataset),
    )?;
    println!(
        "{} {} steps, final loss {:.4}",
        "✓".green(),
        stats.steps,
        stats.final_loss
    );
    Ok(())
}

fn run_grpo(
    config: &StackConfig,
    tokenizer: &Path,
    checkpoint: &Path,
    data: &Path,
    steps: usize,
    save_every: usize,
    output: &Path,
) -> anyhow::Result<()> {
    let device = device(config)?;
    let tok = load_tokenizer(tokenizer)?;
    let dataset = ReasoningDataset::new(load_problems(data)?, &tok)?;
    let prompts = dataset.questions();
    let rewards = RewardAggregator::with_defaults(dataset.answer_key());
    let (varmap, model, model_config) = load_or_build(config, &tok, Some(checkpoint), &device)?;

    let mut trainer = GrpoTrainer::for_tiny_lm(
        &model,
        &varmap,
        &tok,
        rewards,
        config.grpo.clone(),
        config.runtime.seed,
    )?;
    let save_every = save_every.max(1);
    let mut last_loss = 0.0;
    for step in 1..=steps {
        let stats = trainer.train_step(&prompts)?;
        last_loss = stats.loss;
        if step % save_every == 0 {
            let meta = CheckpointMeta {
                model: model_config.clone(),
                step,
                loss: stats.loss,
            };
            save_checkpoint(&varmap, &meta, output.join(format!("checkpoint-{}", step)))?;
        }
    }
    let meta = CheckpointMeta {
        model: model_config,
        step: steps,
        loss: last_loss,
    };
    save_checkpoint(&varmap, &meta, output.join("final"))?;
    println!("{} {} GRPO steps, last loss {:.4}", "✓".green(), steps, last_loss);
    Ok(())
}

fn run_distill(
    config: &StackConfig,
    tokenizer: &Path,
    teacher: &Path,
    student: Option<&Path>,
    data: &Path,
    output: &Path,
) -> anyhow::Result<()> {
    let device = device(config)?;
    let tok = load_tokenizer(tokenizer)?;
    let dataset = ReasoningDataset::new(load_problems(data)?, &tok)?;
    let (_teacher_vars, teacher_model, _) = load_or_build(config, &tok, Some(teacher), &device)?;
    let (student_vars, student_model, student_config) =
        load_or_build(config, &tok, student, &device)?;

    let mut trainer = DistillationTrainer::new(
        &teacher_model,
        &student_model,
        student_vars.all_vars(),
        config.distill.clone(),
    )?;
    let epochs = trainer.train(&dataset)?;
    let final_loss = epochs.last().map_or(0.0, |e| e.avg_loss);
    let meta = CheckpointMeta {
        model: student_config,
        step: trainer.global_step,
        loss: final_loss,
    };
    save_checkpoint(&student_vars, &meta, output)?;
    println!(
        "{} {} epochs, final KL {:.4}",
        "✓".green(),
        epochs.len(),
        final_loss
    );
    Ok(())
}
