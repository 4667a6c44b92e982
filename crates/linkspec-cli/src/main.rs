//! Linkspec CLI
//!
//! Command-line interface for:
//! - Discovering links between two JSON entity caches (`run`)
//! - Showing the execution plan chosen for a specification (`explain`)
//! - Parsing and validating specifications (`check`)
//! - Listing the measure catalog (`measures`)

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use linkspec_dsl::{parse_link_spec_with, LinkSpec};
use linkspec_engine::{
    discover_links, Cache, Execution, MemoryCache, Planner, PlannerKind, Registry, ReviewPolicy,
};

mod config;
mod output;

use config::RunConfig;
use output::{OutputFormat, RunOutput};

#[derive(Parser)]
#[command(name = "linkspec")]
#[command(
    author,
    version,
    about = "Linkspec: declarative link discovery between entity caches"
)]
struct Cli {
    /// Increase log verbosity (`-v` info, `-vv` debug). `RUST_LOG` wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover links between a source and a target cache.
    ///
    /// Prints accepted links as `source<TAB>target<TAB>score` lines (or JSON).
    /// With `--acceptance`, links between the verification and acceptance
    /// thresholds are set aside for review.
    Run {
        #[command(flatten)]
        inputs: SpecInputs,

        /// Acceptance threshold for the accepted / review split
        #[arg(long)]
        acceptance: Option<f64>,

        /// Verification threshold (defaults to acceptance - 0.1)
        #[arg(long, requires = "acceptance")]
        verification: Option<f64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Tsv)]
        format: OutputFormat,

        /// Write accepted links here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Write review links here (TSV only; JSON output embeds them)
        #[arg(long)]
        review_out: Option<PathBuf>,

        /// Print per-node statistics to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Show the execution plan for a specification.
    Explain {
        #[command(flatten)]
        inputs: SpecInputs,

        /// Source size to plan for when no source cache is given
        #[arg(long, default_value_t = 1000)]
        source_size: usize,

        /// Target size to plan for when no target cache is given
        #[arg(long, default_value_t = 1000)]
        target_size: usize,
    },

    /// Parse and validate a specification without running it.
    Check {
        /// Specification text
        spec: String,

        /// Source variable name
        #[arg(long, default_value = "x")]
        source_var: String,

        /// Target variable name
        #[arg(long, default_value = "y")]
        target_var: String,
    },

    /// List the measures known to the registry.
    Measures,
}

/// Where the specification, caches and engine options come from.
#[derive(Args, Debug, Default)]
struct SpecInputs {
    /// Run configuration file (JSON); flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Specification text
    #[arg(short, long)]
    spec: Option<String>,

    /// Read the specification from a file
    #[arg(long, conflicts_with = "spec")]
    spec_file: Option<PathBuf>,

    /// Source cache (JSON)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Target cache (JSON)
    #[arg(long)]
    target: Option<PathBuf>,

    /// Planner: `canonical` or `cost-based`
    #[arg(long)]
    planner: Option<PlannerKind>,

    /// Evaluate on a single thread
    #[arg(long)]
    sequential: bool,

    /// Abort evaluation after this many milliseconds
    #[arg(long)]
    time_budget_ms: Option<u64>,
}

impl SpecInputs {
    /// Merge flags over the config file.
    fn resolve(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(path) = &self.spec_file {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read spec {}", path.display()))?;
            config.spec = Some(text);
        }
        if let Some(spec) = &self.spec {
            config.spec = Some(spec.clone());
        }
        if self.source.is_some() {
            config.source = self.source.clone();
        }
        if self.target.is_some() {
            config.target = self.target.clone();
        }
        if let Some(planner) = self.planner {
            config.engine.planner = planner;
        }
        if self.sequential {
            config.engine.parallel = false;
        }
        if self.time_budget_ms.is_some() {
            config.engine.time_budget_ms = self.time_budget_ms;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            inputs,
            acceptance,
            verification,
            format,
            out,
            review_out,
            stats,
        } => {
            let mut config = inputs.resolve()?;
            if acceptance.is_some() {
                config.acceptance = acceptance;
                config.verification = verification;
            }
            cmd_run(&config, format, out.as_deref(), review_out.as_deref(), stats)?;
        }
        Commands::Explain {
            inputs,
            source_size,
            target_size,
        } => {
            let config = inputs.resolve()?;
            cmd_explain(&config, source_size, target_size)?;
        }
        Commands::Check {
            spec,
            source_var,
            target_var,
        } => {
            let config = RunConfig {
                spec: Some(spec),
                source_var: Some(source_var),
                target_var: Some(target_var),
                ..RunConfig::default()
            };
            cmd_check(&config)?;
        }
        Commands::Measures => cmd_measures(),
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_spec(config: &RunConfig) -> Result<LinkSpec> {
    let text = config
        .spec
        .as_deref()
        .ok_or_else(|| anyhow!("no specification given (use --spec, --spec-file or a config file)"))?;
    parse_link_spec_with(text.trim(), &config.parse_options()).context("invalid specification")
}

fn load_cache(path: Option<&Path>, role: &str) -> Result<MemoryCache> {
    let path = path.ok_or_else(|| anyhow!("no {role} cache given (use --{role} or a config file)"))?;
    let file = File::open(path)
        .with_context(|| format!("failed to open {role} cache {}", path.display()))?;
    let cache = MemoryCache::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to load {role} cache {}", path.display()))?;
    tracing::info!(role, entities = cache.len(), path = %path.display(), "cache loaded");
    Ok(cache)
}

fn cmd_run(
    config: &RunConfig,
    format: OutputFormat,
    out: Option<&Path>,
    review_out: Option<&Path>,
    stats: bool,
) -> Result<()> {
    let spec = parse_spec(config)?;
    let policy = config
        .acceptance
        .map(|acceptance| ReviewPolicy::new(acceptance, config.verification))
        .transpose()
        .context("invalid review thresholds")?;
    let source = load_cache(config.source.as_deref(), "source")?;
    let target = load_cache(config.target.as_deref(), "target")?;

    eprintln!(
        "{} {} ({} x {} entities)",
        "Linking".green().bold(),
        spec,
        source.len(),
        target.len()
    );
    let execution = discover_links(
        &spec,
        &source,
        &target,
        &Registry::with_defaults(),
        &config.engine,
    )
    .context("link discovery failed")?;

    if stats {
        print_stats(&execution);
    }

    let result = RunOutput::new(&execution, policy.as_ref());
    match out {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            result.write(format, &mut file)?;
            eprintln!("{} {}", "wrote".green().bold(), path.display().to_string().bold());
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            result.write(format, &mut lock)?;
            lock.flush()?;
        }
    }

    if let Some(path) = review_out {
        let mut file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        output::write_tsv(&result.review, &mut file)?;
    } else if !result.review.is_empty() && format == OutputFormat::Tsv {
        eprintln!(
            "{} {} links need review (use --review-out to keep them)",
            "info:".yellow().bold(),
            result.review.size()
        );
    }

    eprintln!(
        "{} {} accepted, {} for review in {:.3}s",
        "ok".green().bold(),
        result.accepted.size(),
        result.review.size(),
        execution.elapsed.as_secs_f64()
    );
    if execution.skipped_values() > 0 {
        eprintln!(
            "{} {} values could not be parsed and were skipped",
            "warning:".yellow().bold(),
            execution.skipped_values()
        );
    }
    Ok(())
}

fn print_stats(execution: &Execution) {
    eprintln!("{}", "Nodes".cyan().bold());
    for report in &execution.nodes {
        eprintln!(
            "  {:>4}  {:>8} pairs  {:>9.3}ms  {}{}",
            report.node.to_string(),
            report.output_size,
            report.elapsed.as_secs_f64() * 1000.0,
            report.expression,
            report
                .implementation
                .as_deref()
                .map(|name| format!("  [{name}]").dimmed().to_string())
                .unwrap_or_default()
        );
    }
}

fn cmd_explain(config: &RunConfig, source_size: usize, target_size: usize) -> Result<()> {
    let spec = parse_spec(config)?;
    let source_size = match config.source.as_deref() {
        Some(path) => load_cache(Some(path), "source")?.len(),
        None => source_size,
    };
    let target_size = match config.target.as_deref() {
        Some(path) => load_cache(Some(path), "target")?.len(),
        None => target_size,
    };
    let registry = Registry::with_defaults();
    let plan = Planner::new(&registry, config.engine.planner)
        .plan(&spec, source_size, target_size)
        .context("planning failed")?;
    print!("{plan}");
    Ok(())
}

fn cmd_check(config: &RunConfig) -> Result<()> {
    let spec = parse_spec(config)?;
    Registry::with_defaults()
        .validate(&spec)
        .context("specification uses an unknown measure")?;
    println!("{} {}", "ok".green().bold(), spec);
    println!(
        "  {} atomic measures, depth {}",
        spec.atoms().len(),
        spec.depth()
    );
    Ok(())
}

fn cmd_measures() {
    let registry = Registry::with_defaults();
    for measure in registry.measures() {
        let implementations = registry
            .implementations(measure)
            .unwrap_or_default()
            .iter()
            .map(|mapper| mapper.name().to_string())
            .collect::<Vec<_>>();
        if implementations.is_empty() {
            println!("{}  {}", measure, "(declared, no implementation)".dimmed());
        } else {
            println!("{}  {}", measure.bold(), implementations.join(", "));
        }
    }
}
