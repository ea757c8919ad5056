use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use refine_contracts::config::{PipelineSettings, RefineConfig};
use refine_contracts::models::{Capability, ModelSelection, ModelSelector, ModelSpec};
use refine_contracts::run_log::{RunEvent, RunLog};
use refine_contracts::SimilarityThreshold;
use refine_engine::{
    new_run_id, BackoffExecutor, EmbeddingProvider, KeywordDeduplicator, OpenAiClient,
    RefinePipeline,
};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "refine-rs",
    version,
    about = "Refine image prompts with deduplicated keywords"
)]
struct Cli {
    /// Chat model used for keyword extraction.
    #[arg(long, global = true)]
    text_model: Option<String>,
    /// Image model used by `generate`.
    #[arg(long, global = true)]
    image_model: Option<String>,
    /// Tracing filter when RUST_LOG is unset, e.g. `info` or `refine_engine=debug`.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Extract and deduplicate keywords for a prompt.
    Keywords(PromptArgs),
    /// Print the refined prompt without generating an image.
    Refine(PromptArgs),
    /// Refine the prompt and generate an image from it.
    Generate(GenerateArgs),
    /// Deduplicate a keyword list locally.
    Dedupe(DedupeArgs),
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    threshold: Option<f32>,
    /// Append run events to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    prompt: PromptArgs,
    /// Download the generated image to this path.
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct DedupeArgs {
    #[arg(long = "keyword", required = true)]
    keywords: Vec<String>,
    #[arg(long)]
    threshold: Option<f32>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("refine-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let models = ModelOverrides {
        text: cli.text_model,
        image: cli.image_model,
    };
    match cli.command {
        Command::Keywords(args) => run_keywords(&models, args),
        Command::Refine(args) => run_refine(&models, args),
        Command::Generate(args) => run_generate(&models, args),
        Command::Dedupe(args) => run_dedupe(args),
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

struct ModelOverrides {
    text: Option<String>,
    image: Option<String>,
}

/// Everything a network command needs, built before any request is sent.
struct Session {
    client: Arc<OpenAiClient>,
    settings: PipelineSettings,
    run_log: Option<RunLog>,
}

impl Session {
    fn open(models: &ModelOverrides, args: &PromptArgs) -> Result<Self> {
        let config = RefineConfig::from_env()?;
        let mut settings = config.settings;
        if let Some(value) = args.threshold {
            settings.threshold = SimilarityThreshold::new(value)?;
        }
        let run_log = args
            .events
            .as_ref()
            .map(|path| RunLog::new(path, new_run_id()));

        let selector = ModelSelector::default();
        let text_model = select_model(
            &selector,
            models.text.as_deref().or(settings.text_model.as_deref()),
            Capability::Keywords,
            run_log.as_ref(),
        )?;
        let image_model = select_model(
            &selector,
            models.image.as_deref().or(settings.image_model.as_deref()),
            Capability::Image,
            run_log.as_ref(),
        )?;

        let client = OpenAiClient::new(config.api_key, &settings, text_model, image_model)?;
        Ok(Self {
            client: Arc::new(client),
            settings,
            run_log,
        })
    }

    fn pipeline(&self) -> RefinePipeline<'static> {
        let pipeline = RefinePipeline::new(
            self.client.clone(),
            self.client.clone(),
            EmbeddingProvider::global_with(&self.settings.embedding_model_dir),
        )
        .with_threshold(self.settings.threshold)
        .with_backoff(BackoffExecutor::from_settings(self.settings.retry));
        match &self.run_log {
            Some(log) => pipeline.with_run_log(log.clone()),
            None => pipeline,
        }
    }
}

fn select_model(
    selector: &ModelSelector,
    requested: Option<&str>,
    capability: Capability,
    run_log: Option<&RunLog>,
) -> Result<ModelSpec> {
    let ModelSelection {
        model,
        fallback_reason,
        requested,
    } = selector
        .select(requested, capability)
        .map_err(anyhow::Error::msg)?;
    match (&requested, &fallback_reason) {
        (Some(_), Some(reason)) => warn!(model = %model.name, "{reason}"),
        _ => info!(model = %model.name, capability = %capability, "model selected"),
    }
    if let Some(log) = run_log {
        let event = RunEvent::ModelSelected {
            capability: capability.to_string(),
            model: model.name.clone(),
            fallback_reason,
        };
        if let Err(err) = log.record(&event) {
            warn!("failed to write run event: {err:#}");
        }
    }
    Ok(model)
}

fn run_keywords(models: &ModelOverrides, args: PromptArgs) -> Result<i32> {
    let session = Session::open(models, &args)?;
    let set = session.pipeline().collect_keywords(&args.prompt)?;
    let report = set.report.to_json();
    print_json(&json!({
        "prompt": args.prompt,
        "extracted_keywords": set.extracted,
        "keywords": report["kept"],
        "suppressed": report["suppressed"],
    }))?;
    Ok(0)
}

fn run_refine(models: &ModelOverrides, args: PromptArgs) -> Result<i32> {
    let session = Session::open(models, &args)?;
    let refined = session.pipeline().generate_refined_prompt(&args.prompt)?;
    print_json(&serde_json::to_value(&refined)?)?;
    Ok(0)
}

fn run_generate(models: &ModelOverrides, args: GenerateArgs) -> Result<i32> {
    let session = Session::open(models, &args.prompt)?;
    let generated = session.pipeline().refine_and_generate(&args.prompt.prompt)?;
    let mut payload = serde_json::to_value(&generated)?;
    if let Some(path) = &args.save {
        let bytes = session
            .client
            .download_image(&generated.image, path)
            .with_context(|| format!("failed to save image to {}", path.display()))?;
        info!(path = %path.display(), bytes, "image saved");
        if let Value::Object(map) = &mut payload {
            map.insert("saved_to".to_string(), json!(path_string(path)));
        }
    }
    print_json(&payload)?;
    Ok(0)
}

fn run_dedupe(args: DedupeArgs) -> Result<i32> {
    let settings = PipelineSettings::from_env()?;
    let threshold = match args.threshold {
        Some(value) => SimilarityThreshold::new(value)?,
        None => settings.threshold,
    };
    let keywords = normalize_keywords(args.keywords);
    let provider = EmbeddingProvider::global_with(&settings.embedding_model_dir);
    let report = KeywordDeduplicator::new(provider).report(&keywords, threshold)?;
    let mut payload = report.to_json();
    if let Value::Object(map) = &mut payload {
        map.insert("threshold".to_string(), json!(threshold.value()));
    }
    print_json(&payload)?;
    Ok(0)
}

fn normalize_keywords(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .map(|keyword| keyword.trim().to_string())
        .filter(|keyword| !keyword.is_empty())
        .collect()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() -> Result<()> {
        let cli = Cli::try_parse_from([
            "refine-rs",
            "refine",
            "--prompt",
            "A cat on a mat",
            "--text-model",
            "gpt-4o-mini",
            "--threshold",
            "0.9",
        ])?;
        assert_eq!(cli.text_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(cli.log_level, "info");
        let Command::Refine(args) = cli.command else {
            anyhow::bail!("expected refine command");
        };
        assert_eq!(args.prompt, "A cat on a mat");
        assert_eq!(args.threshold, Some(0.9));
        Ok(())
    }

    #[test]
    fn generate_accepts_save_path() -> Result<()> {
        let cli = Cli::try_parse_from([
            "refine-rs",
            "generate",
            "--prompt",
            "x",
            "--save",
            "out/image.png",
            "--events",
            "out/events.jsonl",
        ])?;
        let Command::Generate(args) = cli.command else {
            anyhow::bail!("expected generate command");
        };
        assert_eq!(args.save, Some(PathBuf::from("out/image.png")));
        assert_eq!(args.prompt.events, Some(PathBuf::from("out/events.jsonl")));
        Ok(())
    }

    #[test]
    fn dedupe_requires_a_keyword() {
        assert!(Cli::try_parse_from(["refine-rs", "dedupe"]).is_err());
    }

    #[test]
    fn dedupe_collects_repeated_keywords() -> Result<()> {
        let cli = Cli::try_parse_from([
            "refine-rs", "dedupe", "--keyword", "fog", "--keyword", " mist ", "--keyword", "  ",
        ])?;
        let Command::Dedupe(args) = cli.command else {
            anyhow::bail!("expected dedupe command");
        };
        assert_eq!(normalize_keywords(args.keywords), vec!["fog", "mist"]);
        Ok(())
    }

    #[test]
    fn unknown_model_falls_back_and_is_logged() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = RunLog::new(&path, "run-cli");
        let model = select_model(
            &ModelSelector::default(),
            Some("dall-e-9"),
            Capability::Image,
            Some(&log),
        )?;
        assert_eq!(model.name, "dall-e-3");

        let line: Value = serde_json::from_str(fs::read_to_string(&path)?.trim())?;
        assert_eq!(line["type"], "model_selected");
        assert_eq!(line["model"], "dall-e-3");
        assert_eq!(
            line["fallback_reason"],
            "Requested model 'dall-e-9' unavailable for capability 'image'."
        );
        Ok(())
    }

    #[test]
    fn known_model_is_used_as_requested() -> Result<()> {
        let model = select_model(
            &ModelSelector::default(),
            Some("gpt-4o"),
            Capability::Keywords,
            None,
        )?;
        assert_eq!(model.name, "gpt-4o");
        Ok(())
    }
}
