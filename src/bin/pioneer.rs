//! CLI binary for pioneer-tables.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `PipelineConfig` and prints stage summaries.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pioneer_tables::{
    inspect_outline, plan_segments, run_pipeline, PipelineConfig, PipelineProgressCallback,
    ProgressCallback, StageName, StageVersions,
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
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar per stage, one log line per subject.
/// Subjects complete out of order under concurrency; the bar only counts.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: StageName, items: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} subjects  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(items as u64);
        self.bar.set_position(0);
        self.bar.set_style(style);
        self.bar.set_prefix(stage.to_string());
        self.bar.reset_eta();
    }

    fn on_stage_cached(&self, stage: StageName) {
        self.bar
            .println(format!("{} {}  {}", cyan("◆"), bold(stage.as_str()), dim("cached")));
        if stage == StageName::Normalize {
            self.bar.finish_and_clear();
        }
    }

    fn on_subject_start(&self, subject: &str) {
        self.bar.set_message(subject.to_string());
    }

    fn on_subject_complete(&self, subject: &str, cached: bool) {
        let note = if cached { dim("cached") } else { String::new() };
        self.bar
            .println(format!("  {} {:<32} {}", green("✓"), subject, note));
        self.bar.inc(1);
    }

    fn on_subject_error(&self, subject: &str, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {:<32} {}", red("✗"), subject, red(&msg)));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: StageName, succeeded: usize, total: usize) {
        self.bar.println(format!(
            "{} {}  {}/{}",
            if succeeded == total { green("✔") } else { cyan("⚠") },
            bold(stage.as_str()),
            succeeded,
            total
        ));
        if stage == StageName::Normalize {
            self.bar.finish_and_clear();
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full run into ./output
  pioneer book.pdf

  # Explicit output directory, first five pages are front matter
  pioneer book.pdf -o tables-out --start-page 6

  # Use a specific model
  pioneer --provider anthropic --model claude-sonnet-4-20250514 book.pdf

  # Show the bookmark tree and planned subjects (no API key needed)
  pioneer --inspect-only book.pdf

  # Force structured extraction to rerun after a prompt change
  pioneer --structure-version v2 book.pdf

OUTPUT LAYOUT:
  <out>/split/<key>.pdf, <out>/split/segments.json
  <out>/text/<key>.txt
  <out>/records/<key>.json
  <out>/tables/{personal,degrees,employment,visits,honors,parents}.csv
  <out>/.cache/<stage>/<entry>.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
"#;

/// Extract biography tables from a bookmarked PDF.
#[derive(Parser, Debug)]
#[command(
    name = "pioneer",
    version,
    about = "Extract biography tables from a bookmarked PDF",
    long_about = "Split a bookmarked biography collection into one document per subject, \
extract each subject's text, ask a language model for a structured record, and write six \
relational CSV tables. Every stage is cached and only reruns when its input or code version changes.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source PDF with a bookmark outline.
    input: PathBuf,

    /// Output directory.
    #[arg(short, long, env = "PIONEER_OUTPUT", default_value = "output")]
    output: PathBuf,

    /// First 1-indexed page that may belong to a subject.
    #[arg(long, env = "PIONEER_START_PAGE", default_value_t = 6)]
    start_page: usize,

    /// LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    /// Number of concurrent completion calls.
    #[arg(short, long, env = "PIONEER_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PIONEER_TEMPERATURE", default_value_t = 0.3)]
    temperature: f32,

    /// Max LLM output tokens per subject.
    #[arg(long, env = "PIONEER_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Completion attempts per subject.
    #[arg(long, env = "PIONEER_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Per-call completion timeout in seconds.
    #[arg(long, env = "PIONEER_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PIONEER_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Cache directory (default: <output>/.cache).
    #[arg(long, env = "PIONEER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Code version of the segment stage.
    #[arg(long, env = "PIONEER_SEGMENT_VERSION", default_value = "v1")]
    segment_version: String,

    /// Code version of the text stage.
    #[arg(long, env = "PIONEER_TEXT_VERSION", default_value = "v1")]
    text_version: String,

    /// Code version of the structured-extraction stage.
    #[arg(long, env = "PIONEER_STRUCTURE_VERSION", default_value = "v1")]
    structure_version: String,

    /// Code version of the normalize stage.
    #[arg(long, env = "PIONEER_NORMALIZE_VERSION", default_value = "v1")]
    normalize_version: String,

    /// Print the outline and planned subjects only.
    #[arg(long)]
    inspect_only: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "PIONEER_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PIONEER_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PIONEER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PIONEER_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs when active.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.inspect_only;
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

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let outline = inspect_outline(&cli.input)
            .await
            .context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&outline).context("Failed to serialize outline")?
            );
            return Ok(());
        }

        print!("{}", outline.render());
        match plan_segments(&outline.entries, outline.total_pages, cli.start_page) {
            Ok(segments) => {
                println!("\n{} subjects from page {}:", segments.len(), cli.start_page);
                for s in segments {
                    println!(
                        "  {:<32} {:>5}-{:<5} {}",
                        s.key,
                        s.first_page,
                        s.last_page,
                        dim(&s.title)
                    );
                }
            }
            Err(e) => println!("\n{} {}", red("✗"), e),
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new();
        Some(cb as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    // ── Run ──────────────────────────────────────────────────────────────
    let report = run_pipeline(&cli.input, &config)
        .await
        .context("Pipeline failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    }

    if !cli.quiet {
        for stage in &report.stages {
            let ok = stage.failures.is_empty();
            eprintln!(
                "{}  {}  {}",
                if ok { green("✔") } else { cyan("⚠") },
                stage.summary(),
                dim(&format!("{}ms", stage.duration_ms)),
            );
        }
        for failure in report.failures() {
            eprintln!("   {} {}", red("✗"), failure);
        }
        eprintln!(
            "   tables in {}  -  {}ms total",
            bold(&config.tables_dir().display().to_string()),
            report.total_duration_ms
        );
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .output_dir(&cli.output)
        .start_page(cli.start_page)
        .concurrency(cli.concurrency)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .max_attempts(cli.max_attempts)
        .api_timeout_secs(cli.api_timeout)
        .versions(StageVersions {
            segment: cli.segment_version.clone(),
            extract_text: cli.text_version.clone(),
            extract_structure: cli.structure_version.clone(),
            normalize: cli.normalize_version.clone(),
        });

    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref dir) = cli.cache_dir {
        builder = builder.cache_dir(dir);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
