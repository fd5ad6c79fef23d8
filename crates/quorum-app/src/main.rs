//! Command-line runner: builds a world from a profile or TOML file, steps it
//! for the requested number of cycles, and streams per-cycle rows to CSV.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use quorum_core::{QuorumConfig, World};
use quorum_storage::StoragePipeline;
use std::{fs, path::PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "quorum",
    version,
    about = "Deterministic quorum-sensing simulation of bioluminescent cells"
)]
struct Cli {
    /// Number of cycles to run.
    #[arg(long, default_value_t = 1_000)]
    cycles: u64,

    /// RNG seed; omit for a fresh entropy seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Named parameter bundle used when no config file is given.
    #[arg(long, value_enum, default_value = "capped")]
    profile: Profile,

    /// Optional TOML file overriding the profile's configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// CSV output path for per-cycle rows.
    #[arg(long, default_value = "quorum.csv")]
    output: PathBuf,

    /// Log a progress line every N cycles (0 disables).
    #[arg(long, default_value_t = 100)]
    log_every: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Profile {
    /// Health capped at the maximum, periodic culling, clustered food.
    Capped,
    /// Reproduce-and-reset health policy, no culling, uniform food.
    Reproducing,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let pipeline = StoragePipeline::new(&cli.output)
        .with_context(|| format!("opening output file {}", cli.output.display()))?;
    let mut world = World::with_persistence(config, Box::new(pipeline))?;
    info!(
        cycles = cli.cycles,
        cells = world.cell_count(),
        output = %cli.output.display(),
        "starting run",
    );

    for _ in 0..cli.cycles {
        let summary = world.step();
        if cli.log_every > 0 && summary.cycle.0.is_multiple_of(cli.log_every) {
            info!(
                cycle = summary.cycle.0,
                cells = summary.cells,
                luminescent = summary.luminescent,
                food = summary.food,
                hormones = summary.hormones,
                "progress",
            );
        }
    }

    if let Some(summary) = world.history().last() {
        info!(
            cycle = summary.cycle.0,
            cells = summary.cells,
            luminescent = summary.luminescent,
            dark = summary.dark,
            births = summary.births,
            deaths = summary.deaths,
            "run complete",
        );
    }
    // Dropping the world joins the storage worker after a final flush.
    drop(world);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

fn build_config(cli: &Cli) -> Result<QuorumConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => match cli.profile {
            Profile::Capped => QuorumConfig::capped(),
            Profile::Reproducing => QuorumConfig::reproducing(),
        },
    };
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    config
        .validate()
        .context("configuration rejected by validation")?;
    Ok(config)
}
