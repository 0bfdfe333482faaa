//! bean-fetch
//!
//! Usage:
//!   bean-fetch -c config.toml fetch
//!   bean-fetch -c config.toml parse --output ledger.beancount
//!   bean-fetch -c config.toml list

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bean_fetch::archive::{ArchiveKey, ArchiveStore};
use bean_fetch::config::Config;
use bean_fetch::pipeline::{fetch_and_archive, replay_and_parse};
use bean_fetch::venues::VenueRegistry;

/// Fetch venue transactions into a content-addressed archive and replay them
/// into beancount entries.
#[derive(Parser, Debug)]
#[command(name = "bean-fetch", version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "BEAN_FETCH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch every configured venue and archive the results
    Fetch,

    /// Replay the archive and print ledger entries
    Parse {
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List archive entries from their file names
    List,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bean_fetch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    let store = ArchiveStore::new(&config.archive_dir);
    info!(archive = %store.root().display(), venues = ?config.venue_ids(), "config loaded");

    match cli.command {
        Commands::Fetch => fetch(&config, &store),
        Commands::Parse { output } => parse(&config, &store, output),
        Commands::List => list(&store),
    }
}

fn fetch(config: &Config, store: &ArchiveStore) -> Result<ExitCode> {
    let registry = VenueRegistry::from_config(config).context("failed to set up venues")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;

    let report = runtime
        .block_on(fetch_and_archive(&registry, store))
        .context("archive write failed; run aborted")?;

    println!("{}", report);
    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn parse(config: &Config, store: &ArchiveStore, output: Option<PathBuf>) -> Result<ExitCode> {
    let registry = VenueRegistry::from_config(config).context("failed to set up venues")?;
    let report = replay_and_parse(&registry, store)
        .with_context(|| format!("failed to list archive {}", store.root().display()))?;

    let mut ledger = String::new();
    for entry in report.ledger() {
        ledger.push_str(&entry.to_string());
        ledger.push('\n');
    }

    // stdout carries the ledger itself unless --output is given
    match output {
        Some(path) => {
            std::fs::write(&path, ledger)
                .with_context(|| format!("failed to write {}", path.display()))?;
            print!("{}", report);
        }
        None => {
            std::io::stdout()
                .write_all(ledger.as_bytes())
                .context("failed to write ledger to stdout")?;
            eprint!("{}", report);
        }
    }
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn list(store: &ArchiveStore) -> Result<ExitCode> {
    let paths = store
        .list()
        .with_context(|| format!("failed to list archive {}", store.root().display()))?;

    let mut foreign = 0usize;
    for path in &paths {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        match ArchiveKey::from_file_name(&name) {
            Some(key) => println!(
                "{:<12} {:<12} {}  {}",
                key.venue,
                key.kind,
                key.timestamp.format("%Y-%m-%d %H:%M:%S"),
                &key.hash[..12.min(key.hash.len())]
            ),
            None => foreign += 1,
        }
    }
    println!("{} entries", paths.len() - foreign);
    if foreign > 0 {
        println!("{} files not named like archive entries", foreign);
    }
    Ok(ExitCode::SUCCESS)
}
