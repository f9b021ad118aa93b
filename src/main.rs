//! Classify-Eval CLI
//!
//! Label resolution and metric aggregation for LM classification benchmarks

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use classify_eval::{
    load_records, DatasetConfig, DatasetLoader, EvalRunner, LabelSpace, MetricRegistry,
    ResolutionLog, ScoreReport, StatConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "classify-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Markdown,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate dataset configurations
    Validate {
        /// Dataset configuration files (glob pattern)
        #[arg(long, default_value = "datasets/*.yaml")]
        dataset: String,
    },

    /// Print the resolved label of every generation record
    Resolve {
        /// Dataset configuration file
        #[arg(long)]
        dataset: String,

        /// Generation records (JSONL)
        #[arg(long)]
        input: String,

        /// Label space of the printed labels
        #[arg(long, default_value = "canonical")]
        space: LabelSpace,
    },

    /// Score generation records and report per-metric results
    Evaluate {
        /// Dataset configuration file
        #[arg(long)]
        dataset: String,

        /// Generation records (JSONL)
        #[arg(long)]
        input: String,

        /// Model identifier shown in the report
        #[arg(long, default_value = "unknown")]
        model: String,

        /// Output report file (stdout if omitted)
        #[arg(long)]
        output: Option<String>,

        /// Report format
        #[arg(long, value_enum, default_value = "text")]
        format: Format,

        /// Confidence level of the score margins
        #[arg(long, default_value = "0.95")]
        confidence: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { dataset } => validate(&dataset),
        Commands::Resolve {
            dataset,
            input,
            space,
        } => resolve(&dataset, &input, space),
        Commands::Evaluate {
            dataset,
            input,
            model,
            output,
            format,
            confidence,
        } => evaluate(&dataset, &input, &model, output.as_deref(), format, confidence),
    }
}

fn validate(pattern: &str) -> Result<()> {
    let loader = DatasetLoader::load_glob(pattern)
        .with_context(|| format!("Failed to load datasets from {pattern}"))?;
    if loader.is_empty() {
        anyhow::bail!("No dataset configurations match {pattern}");
    }

    for config in loader.iter() {
        let labels = config
            .validate()
            .with_context(|| format!("Dataset {} is invalid", config.name))?;
        println!(
            "{} ({}): {} classes, {} metrics, answer in paragraph {}, up to {} generated tokens",
            config.name,
            config.language,
            labels.num_classes(),
            config.task.metrics.len(),
            classify_eval::RawPredictionExtractor::from_config(config).answer_paragraph(),
            config.max_generated_tokens
        );
    }
    println!("{} dataset(s) valid", loader.len());
    Ok(())
}

fn runner(dataset: &str) -> Result<EvalRunner> {
    let config = DatasetConfig::load(dataset)
        .with_context(|| format!("Failed to load dataset {dataset}"))?;
    EvalRunner::new(config, MetricRegistry::builtin())
        .with_context(|| format!("Dataset {dataset} is invalid"))
}

fn resolve(dataset: &str, input: &str, space: LabelSpace) -> Result<()> {
    let runner = runner(dataset)?;
    let records =
        load_records(input).with_context(|| format!("Failed to read records from {input}"))?;

    let mut log = ResolutionLog::new();
    let labels = runner.resolve_records(&records, space, &mut log)?;
    for label in labels {
        println!("{label}");
    }

    let stats = log.stats();
    tracing::info!(
        records = records.len(),
        empty_outputs = stats.empty_outputs,
        unmatched = stats.unmatched,
        ambiguous = stats.ambiguous,
        truncated = stats.truncated,
        "Resolved records"
    );
    Ok(())
}

fn evaluate(
    dataset: &str,
    input: &str,
    model: &str,
    output: Option<&str>,
    format: Format,
    confidence: f64,
) -> Result<()> {
    if !(confidence > 0.0 && confidence < 1.0) {
        anyhow::bail!("Confidence must be in (0, 1), got {confidence}");
    }

    let runner = runner(dataset)?.with_stat_config(StatConfig {
        confidence,
        ..StatConfig::default()
    });
    let records =
        load_records(input).with_context(|| format!("Failed to read records from {input}"))?;
    tracing::info!(
        dataset = %runner.config().name,
        model = %model,
        records = records.len(),
        "Starting evaluation"
    );

    let outcome = runner.evaluate_records(&records)?;
    let report = ScoreReport::new(runner.config(), model, &outcome, confidence);
    let rendered = match format {
        Format::Json => report.to_json()?,
        Format::Markdown => report.to_markdown(),
        Format::Text => report.to_text(),
    };

    match output {
        Some(path) => {
            std::fs::write(path, rendered).with_context(|| format!("Failed to write {path}"))?;
            tracing::info!(path = %path, "Report written");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
