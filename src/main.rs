use anyhow::{Context, Result};
use clap::Parser;
use hmirror::{Backup, Config, logger, manifest};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Mirror a source tree and keep hardlinked snapshots of tracked files.
#[derive(Parser, Debug)]
#[command(name = "hm", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension).
    config: Option<PathBuf>,
    /// Configuration file, when not given positionally.
    #[arg(short = 'c', long = "config", value_name = "CONFIG")]
    config_flag: Option<PathBuf>,
    /// Log intended actions without changing anything.
    #[arg(short = 'n', long)]
    dry_run: bool,
    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
    /// Regenerate missing increment manifests instead of running a backup.
    #[arg(long)]
    rebuild_manifests: bool,
    /// Overwrite existing manifests when rebuilding.
    #[arg(long, requires = "rebuild_manifests")]
    force: bool,
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.debug);

    let Some(config_path) = cli.config.clone().or_else(|| cli.config_flag.clone()) else {
        eprintln!("hm requires a configuration file. See 'hm --help' for usage.");
        process::exit(1);
    };
    if !config_path.is_file() {
        eprintln!("Configuration file {} not found", config_path.display());
        process::exit(1);
    }

    if let Err(e) = run(&cli, config_path) {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: &Cli, config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration {}", config_path.display()))?;

    if cli.rebuild_manifests {
        let rebuilt = manifest::rebuild_manifests(&config.dist, cli.force)
            .with_context(|| format!("failed to rebuild manifests under {}", config.dist.display()))?;
        info!("Rebuilt {rebuilt} manifest(s)");
        return Ok(());
    }

    Backup::new(config)
        .dry_run(cli.dry_run)
        .run()
        .context("backup aborted")?;
    Ok(())
}
