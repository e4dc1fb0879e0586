mod config;
mod enrich;
mod error;
mod fetch;
mod filter;
mod llm;
mod output;
mod pagination;
mod parser;
mod record;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use config::{Overrides, RunConfig};
use fetch::{Backend, FetchRequest, PageFetcher};
use filter::Denylist;
use pagination::{PageRequest, RunPlan};
use parser::schema::ExtractionSchema;
use record::RecordDefaults;

const EXIT_INTERRUPTED: u8 = 130;

const DEFAULT_SCHEMA_FILE: &str = "doctolib_schema.json";

#[derive(Parser)]
#[command(name = "medscrape", about = "Practitioner listing scraper for medical directories")]
struct Cli {
    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape result pages and save JSON/CSV
    Run(RunArgs),
    /// Add ratings to a previously saved JSON result
    Enrich {
        /// JSON file written by `run`
        #[arg(short, long)]
        input: PathBuf,
        /// Output JSON (default: <input>_rated.json)
        #[arg(long)]
        json: Option<PathBuf>,
        /// Output CSV (default: <input>_rated.csv)
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Deterministic pseudo-ratings instead of live search
        #[arg(long)]
        mock_ratings: bool,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Generate an extraction schema from page 1 with the LLM endpoint
    Schema {
        /// Search results URL
        #[arg(short, long, required_unless_present = "show_default")]
        url: Option<String>,
        /// Where to save the schema
        #[arg(short, long, default_value = DEFAULT_SCHEMA_FILE)]
        out: PathBuf,
        /// Print the built-in schema and exit
        #[arg(long)]
        show_default: bool,
        #[arg(long, value_enum)]
        backend: Option<Backend>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Search results URL (any page= parameter is ignored)
    #[arg(short, long)]
    url: Option<String>,
    /// Number of result pages to scrape
    #[arg(short = 'n', long)]
    pages: Option<u32>,
    #[arg(long)]
    json: Option<PathBuf>,
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Skip JSON output
    #[arg(long)]
    no_json: bool,
    /// Skip CSV output
    #[arg(long)]
    no_csv: bool,
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    /// Run the browser without a window (webdriver backend)
    #[arg(long)]
    headless: bool,
    /// Extraction schema file (default: built-in schema)
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Delay between page loads in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Look up ratings after scraping
    #[arg(long)]
    ratings: bool,
    /// Deterministic pseudo-ratings (implies --ratings)
    #[arg(long)]
    mock_ratings: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            max_pages: self.pages,
            json_file: self.json.clone(),
            csv_file: self.csv.clone(),
            no_json: self.no_json,
            no_csv: self.no_csv,
            backend: self.backend,
            delay_ms: self.delay_ms,
            headless: self.headless,
            schema_file: self.schema.clone(),
            ratings: self.ratings,
            mock_ratings: self.mock_ratings,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing with what was collected");
            let _ = cancel_tx.send(true);
        }
    });

    let result = match cli.command {
        Commands::Run(args) => run(args, cancel_rx).await,
        Commands::Enrich {
            input,
            json,
            csv,
            mock_ratings,
            config,
        } => enrich(&input, json, csv, mock_ratings, config.as_deref(), cancel_rx).await,
        Commands::Schema {
            url,
            out,
            show_default,
            backend,
            config,
        } => {
            if show_default {
                println!("{}", serde_json::to_string_pretty(&ExtractionSchema::default())?);
                Ok(ExitCode::SUCCESS)
            } else {
                schema(url.unwrap_or_default(), &out, backend, config.as_deref()).await
            }
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RunConfig> {
    Ok(match path {
        Some(p) => RunConfig::load(p)?,
        None => RunConfig::default(),
    })
}

fn progress_bar(len: u64) -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

async fn run(args: RunArgs, mut cancel: watch::Receiver<bool>) -> anyhow::Result<ExitCode> {
    let mut cfg = load_config(args.config.as_deref())?;
    cfg.apply(args.overrides());
    cfg.validate()?;

    let schema = match &cfg.scraping.schema_file {
        Some(path) => ExtractionSchema::load(path)?,
        None => ExtractionSchema::default(),
    };
    let fetcher = fetch::build(
        cfg.scraping.backend,
        &cfg.scraping.webdriver_url,
        cfg.scraping.headless,
        cfg.scraping.page_timeout(),
    )?;
    let defaults = RecordDefaults {
        fallback_specialty: cfg.scraping.fallback_specialty.clone(),
    };
    let denylist = Denylist::with_extra(cfg.scraping.extra_denylist.iter().cloned());
    debug!("{} denylist entries", denylist.len());

    info!(
        "Scraping {} page(s) of {} with {:?} backend",
        cfg.max_pages, cfg.base_url, cfg.scraping.backend
    );
    let plan = RunPlan {
        base_url: cfg.base_url.clone(),
        max_pages: cfg.max_pages,
        delay: cfg.scraping.delay(),
        pre_render_script: cfg.scraping.pre_render_script.clone(),
        schema: Some(&schema),
        defaults: &defaults,
        denylist: &denylist,
    };

    let pb = progress_bar(u64::from(cfg.max_pages));
    let mut report = pagination::run(&fetcher, &plan, &pb, &mut cancel).await;
    pb.finish_and_clear();
    for p in &report.pages {
        match (&p.error, p.strategy) {
            (Some(e), _) => debug!("page {} ({}) failed: {}", p.page, p.url, e),
            (None, Some(s)) => debug!("page {} ({}): {} records, {} pass", p.page, p.url, p.records, s),
            (None, None) => debug!("page {} ({}): nothing extracted", p.page, p.url),
        }
    }

    if report.records.is_empty() {
        warn!("no practitioners found");
    } else if cfg.ratings.enabled && !report.interrupted {
        let source = enrich::AnyRatingSource::from_config(&cfg.ratings)?;
        enrich::enrich_records(&mut report.records, &source, cfg.ratings.delay(), &mut cancel).await;
    }

    print!(
        "{}",
        output::format_summary(&report.records, report.pages.len(), report.pages_failed())
    );

    let failures = output::write_outputs(&report.records, &cfg.output);
    let interrupted = report.interrupted || *cancel.borrow();
    Ok(exit_code(!failures.is_empty(), interrupted))
}

/// Persistence failure beats interruption; an interrupted run that saved its
/// partial result exits with 130.
fn exit_code(write_failed: bool, interrupted: bool) -> ExitCode {
    if write_failed {
        ExitCode::FAILURE
    } else if interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::SUCCESS
    }
}

/// `<dir>/<stem>_rated.<ext>` next to `input`.
fn rated_path(input: &Path, ext: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "practitioners".to_string());
    input.with_file_name(format!("{}_rated.{}", stem, ext))
}

async fn enrich(
    input: &Path,
    json: Option<PathBuf>,
    csv: Option<PathBuf>,
    mock_ratings: bool,
    config: Option<&Path>,
    mut cancel: watch::Receiver<bool>,
) -> anyhow::Result<ExitCode> {
    let mut cfg = load_config(config)?;
    cfg.ratings.enabled = true;
    cfg.ratings.mock |= mock_ratings;

    let mut records = output::load_json(input)?;
    info!("Loaded {} practitioners from {}", records.len(), input.display());
    if records.is_empty() {
        warn!("no practitioners found");
    }

    let source = enrich::AnyRatingSource::from_config(&cfg.ratings)?;
    enrich::enrich_records(&mut records, &source, cfg.ratings.delay(), &mut cancel).await;

    let targets = config::OutputConfig {
        json_file: Some(json.unwrap_or_else(|| rated_path(input, "json"))),
        csv_file: Some(csv.unwrap_or_else(|| rated_path(input, "csv"))),
    };
    print!("{}", output::format_summary(&records, 0, 0));
    let failures = output::write_outputs(&records, &targets);
    let interrupted = *cancel.borrow();
    Ok(exit_code(!failures.is_empty(), interrupted))
}

async fn schema(
    url: String,
    out: &Path,
    backend: Option<Backend>,
    config: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let mut cfg = load_config(config)?;
    cfg.apply(Overrides {
        url: Some(url),
        backend,
        ..Default::default()
    });
    cfg.validate()?;

    let fetcher = fetch::build(
        cfg.scraping.backend,
        &cfg.scraping.webdriver_url,
        cfg.scraping.headless,
        cfg.scraping.page_timeout(),
    )?;
    let req = FetchRequest {
        url: PageRequest::new(&cfg.base_url, 1).url(),
        pre_render_script: cfg.scraping.pre_render_script.clone(),
    };

    let schema = match fetcher.fetch(&req).await {
        Ok(page) => llm::generate_or_default(&cfg.llm.clone().resolve_key(), &page.html).await,
        Err(e) => {
            warn!("Failed to load sample page ({}), using built-in schema", e);
            ExtractionSchema::default()
        }
    };
    schema
        .save(out)
        .with_context(|| format!("saving schema to {}", out.display()))?;
    println!("Schema saved to {}", out.display());
    Ok(ExitCode::SUCCESS)
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
