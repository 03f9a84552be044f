//! CLI binary for po-extract.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints the aggregated result.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use po_extract::progress::SinkError;
use po_extract::{
    extract_with_progress, AggregatedResult, ChunkConfig, ExtractionConfig, NoopProgressSink,
    ProgressEvent, ProgressSink, ProgressStage,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress sink using indicatif ────────────────────────────────────────────

/// Renders parse progress events as a spinner that turns into a chunk bar
/// once the chunk plan is known.
struct BarProgressSink {
    bar: ProgressBar,
}

impl BarProgressSink {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Reading document…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} chunks  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
    }
}

#[async_trait]
impl ProgressSink for BarProgressSink {
    async fn publish(&self, event: ProgressEvent) -> Result<(), SinkError> {
        match event.stage {
            ProgressStage::Start => self.bar.set_message("Starting…"),
            ProgressStage::Preprocess => self.bar.set_message("Normalising text…"),
            ProgressStage::Plan => {
                self.activate_bar(event.total.max(1));
                self.bar.println(format!(
                    "{} {}",
                    green("◆"),
                    bold(&format!("{} chunk(s) planned", event.total.max(1)))
                ));
            }
            ProgressStage::ChunkStart => {
                self.bar.set_message(format!("chunk {}", event.current + 1));
            }
            // Secondary chunks finish out of order; the primary one is
            // accounted for at finalize.
            ProgressStage::ChunkDone => self.bar.inc(1),
            ProgressStage::Finalize => {
                self.bar.set_position(event.total as u64);
                self.bar.set_message("Merging results…");
            }
            ProgressStage::Complete => self.bar.finish_and_clear(),
        }
        Ok(())
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract a PDF purchase order (JSON on stdout)
  poextract po-4471.pdf

  # Scanned order form, written to a file
  poextract --provider openai --model gpt-4.1-mini scan.jpg -o po.json

  # Smaller chunks for very long documents
  poextract --max-chunk-chars 6000 --overlap-chars 300 catalogue-order.txt

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory or file of libpdfium for PDF uploads
"#;

/// Extract structured purchase-order data from documents.
#[derive(Parser, Debug)]
#[command(
    name = "poextract",
    version,
    about = "Extract structured purchase-order data from PDF, image and text documents",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file path or HTTP/HTTPS URL.
    input: String,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "POEXTRACT_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Concurrent extraction calls per document.
    #[arg(short, long, env = "POEXTRACT_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Largest chunk, in characters.
    #[arg(long, env = "POEXTRACT_MAX_CHUNK_CHARS", default_value_t = 12_000)]
    max_chunk_chars: usize,

    /// Smallest chunk, in characters. Defaults to 2000, or the largest
    /// chunk size when that is smaller.
    #[arg(long, env = "POEXTRACT_MIN_CHUNK_CHARS")]
    min_chunk_chars: Option<usize>,

    /// Characters repeated at the start of each following chunk.
    #[arg(long, env = "POEXTRACT_OVERLAP_CHARS", default_value_t = 400)]
    overlap_chars: usize,

    /// Pull PO number, dates and totals out before extraction.
    #[arg(long, env = "POEXTRACT_ANCHORS")]
    anchors: bool,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "POEXTRACT_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "POEXTRACT_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "POEXTRACT_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per extraction call.
    #[arg(long, env = "POEXTRACT_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Confidence below which the result is flagged for review.
    #[arg(long, env = "POEXTRACT_REVIEW_THRESHOLD", default_value_t = 0.7)]
    review_threshold: f64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "POEXTRACT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "POEXTRACT_API_TIMEOUT", default_value_t = 90)]
    api_timeout: u64,

    /// Whole-document parse timeout in seconds.
    #[arg(long, env = "POEXTRACT_PARSE_TIMEOUT", default_value_t = 600)]
    parse_timeout: u64,

    /// Single-line JSON instead of pretty-printed.
    #[arg(long)]
    compact: bool,

    /// Disable progress bar.
    #[arg(long, env = "POEXTRACT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "POEXTRACT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "POEXTRACT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO logs would tear through the progress bar, so the bar wins
    // unless --verbose was given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli).await?;

    let sink: Arc<dyn ProgressSink> = if show_progress {
        BarProgressSink::new()
    } else {
        Arc::new(NoopProgressSink)
    };

    let result = extract_with_progress(&cli.input, &config, sink)
        .await
        .context("Extraction failed")?;

    let json = if cli.compact {
        serde_json::to_string(&result)
    } else {
        serde_json::to_string_pretty(&result)
    }
    .context("Failed to serialise result")?;

    match cli.output {
        Some(ref path) => tokio::fs::write(path, format!("{json}\n"))
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{json}"),
    }

    if !cli.quiet {
        print_summary(&result);
    }
    Ok(())
}

fn print_summary(result: &AggregatedResult) {
    let data = &result.extracted_data;
    let tick = if result.needs_review { red("⚠") } else { green("✔") };
    eprintln!(
        "{}  PO {}  {} line items  confidence {:.2}{}",
        tick,
        bold(&data.po_number),
        data.line_items.len(),
        result.confidence,
        if result.needs_review { "  (needs review)" } else { "" },
    );
    eprintln!(
        "   {} chunk(s)  {} failed  {} tokens in / {} out  {}ms",
        result.metadata.chunking.chunk_count,
        result.metadata.failed_calls,
        dim(&result.metadata.usage.prompt_tokens.to_string()),
        dim(&result.metadata.usage.completion_tokens.to_string()),
        result.metadata.duration_ms,
    );
    for issue in &result.issues {
        eprintln!("   {} {}", dim("•"), issue);
    }
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let min_chunk_chars = cli
        .min_chunk_chars
        .unwrap_or_else(|| ChunkConfig::default().min_chunk_chars.min(cli.max_chunk_chars));
    let mut builder = ExtractionConfig::builder()
        .concurrency(cli.concurrency)
        .max_chunk_chars(cli.max_chunk_chars)
        .min_chunk_chars(min_chunk_chars)
        .overlap_chars(cli.overlap_chars)
        .anchor_extraction(cli.anchors)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .review_threshold(cli.review_threshold)
        .download_timeout_secs(cli.download_timeout)
        .api_timeout_secs(cli.api_timeout)
        .parse_timeout_secs(cli.parse_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_max_chunk_lowers_default_minimum() {
        let cli = Cli::parse_from(["poextract", "--max-chunk-chars", "1500", "po.txt"]);
        let config = build_config(&cli).await.unwrap();
        assert_eq!(config.chunking.max_chunk_chars, 1500);
        assert_eq!(config.chunking.min_chunk_chars, 1500);
    }

    #[tokio::test]
    async fn explicit_minimum_is_kept() {
        let cli = Cli::parse_from([
            "poextract",
            "--max-chunk-chars",
            "6000",
            "--min-chunk-chars",
            "800",
            "po.txt",
        ]);
        let config = build_config(&cli).await.unwrap();
        assert_eq!(config.chunking.min_chunk_chars, 800);
    }
}
