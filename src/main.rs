//! # snapvault CLI
//!
//! Thin command layer over the library: create a repository, serve it over
//! the framed RPC transport, list its snapshots, or run a verification
//! sweep. All repository logic lives in the library crate.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use snapvault::error::Result;
use snapvault::server::RpcServer;
use snapvault::{config, Front, Repository};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// snapvault — a content-addressed snapshot repository
#[derive(Parser, Debug)]
#[command(
    name = "snapvault",
    version,
    about = "A content-addressed snapshot repository with deduplicated blob storage",
    long_about = "snapvault stores immutable snapshots of logical file trees as \
                  deduplicated, content-addressed blobs. Snapshots form named \
                  sessions that extend linearly; incremental snapshots inherit \
                  their base's tree and override entries by addition, replacement, \
                  or removal. The repository can be served to remote clients over \
                  a framed JSON-RPC transport."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Repository root directory
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to configuration file (overrides default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new repository
    Init,

    /// Serve the repository over the framed RPC transport
    Serve {
        /// Listen address (overrides configuration)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// List all snapshots (optionally filtered by session)
    List {
        /// Filter snapshots by session name
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Verify every blob and every snapshot seal in the repository
    Verify,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("{} {}", colored::Colorize::red("error:"), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "snapvault=debug"
    } else {
        "snapvault=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Init => cmd_init(&cli.repo),
        Command::Serve { listen } => cmd_serve(&cli, listen.as_deref()),
        Command::List { session } => cmd_list(&cli.repo, session.as_deref()),
        Command::Verify => cmd_verify(&cli.repo),
    }
}

// ─── Command Implementations ────────────────────────────────────────────────

fn cmd_init(repo_path: &Path) -> Result<()> {
    Repository::create(repo_path)?;
    eprintln!(
        "{} Initialized repository at {}",
        colored::Colorize::green("✓"),
        repo_path.display(),
    );
    eprintln!("  Serve it with:");
    eprintln!(
        "  {} snapvault --repo {} serve",
        colored::Colorize::bold("$"),
        repo_path.display(),
    );
    Ok(())
}

fn cmd_serve(cli: &Cli, listen: Option<&str>) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let repo_path = if cli.repo == Path::new(".") {
        config.repo_path.clone()
    } else {
        cli.repo.clone()
    };
    let listen = listen.unwrap_or(&config.listen);

    let repo = Repository::open(&repo_path)?;
    eprintln!(
        "{} Serving {} on {}",
        colored::Colorize::bold(colored::Colorize::cyan("▶")),
        repo_path.display(),
        colored::Colorize::bold(listen),
    );

    let server = RpcServer::new(repo, Duration::from_secs(config.read_timeout_secs));
    server.bind_and_serve(listen)
}

fn cmd_list(repo_path: &Path, session: Option<&str>) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let front = Front::new(repo.clone());
    let ids = front.get_session_ids(session)?;

    if ids.is_empty() {
        eprintln!("No snapshots found.");
        return Ok(());
    }

    eprintln!(
        "{:>6}  {:20}  {:>8}  {:14}  {}",
        "Id", "Session", "Entries", "Fingerprint", "Date"
    );
    eprintln!("{}", "─".repeat(76));

    for id in &ids {
        let mut reader = repo.get_session(*id)?;
        let entries = reader.raw_bloblist()?.len();
        let date = reader
            .client_value("date")
            .and_then(|v| v.as_str())
            .unwrap_or("-")
            .to_string();
        eprintln!(
            "{:>6}  {:20}  {:>8}  {:14}  {}",
            id,
            reader.client_data().name,
            entries,
            &reader.fingerprint()[..12],
            date,
        );
    }

    eprintln!();
    eprintln!("  {} snapshot(s)", ids.len());
    Ok(())
}

fn cmd_verify(repo_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut front = Front::new(repo.clone());

    let total = front.init_verify_blobs()?;
    let pb = create_verify_progress(total as u64);
    loop {
        let batch = front.verify_some_blobs()?;
        if batch.is_empty() {
            break;
        }
        pb.inc(batch.len() as u64);
    }
    pb.finish_and_clear();
    eprintln!(
        "  {} {} blob(s) verified",
        colored::Colorize::green("✓"),
        total,
    );

    let ids = repo.get_all_sessions()?;
    for id in &ids {
        repo.get_session(*id)?.verify_integrity()?;
    }
    eprintln!(
        "  {} {} snapshot seal(s) verified",
        colored::Colorize::green("✓"),
        ids.len(),
    );
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn create_verify_progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} Verifying [{bar:30.cyan/dim}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━╸─"),
    );
    pb
}
