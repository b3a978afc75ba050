use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use itertools::Itertools;
use mimalloc::MiMalloc;
use miniprof_core::{
    DEFAULT_TRIVIAL_DURATION_THRESHOLD_MS, FileStorage, ListOptions, MemoryStorage, MiniProfiler,
    Position, ProfilerOptions, RenderOptions, Storage,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

mod demo;
mod show;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Profile web requests as timing trees and inspect stored profiles.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a small profiled web app
    ///
    /// Every page request is profiled and the viewer popup is embedded in
    /// the page. Profiles are kept in memory unless a storage directory is
    /// given.
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,

        /// Keep profiles as JSON files in this directory
        #[arg(long)]
        storage_dir: Option<PathBuf>,

        /// Self-time (ms) at or below which a step counts as trivial
        #[arg(long, default_value_t = DEFAULT_TRIVIAL_DURATION_THRESHOLD_MS)]
        trivial_threshold: f64,

        /// Screen corner of the viewer popup
        #[arg(long, value_enum, default_value_t = Corner::Left)]
        position: Corner,

        /// Show trivial steps in the viewer
        #[arg(long)]
        show_trivial: bool,

        /// Expand child steps in the viewer
        #[arg(long)]
        show_children: bool,

        /// Number of profiles the viewer keeps listed
        #[arg(long, default_value_t = 15)]
        max_traces: usize,

        /// Start with the viewer hidden
        #[arg(long)]
        start_hidden: bool,

        /// Open the app in the default browser
        #[arg(long)]
        open: bool,
    },

    /// Print the timing tree of a stored profile
    Show {
        /// Profile JSON file
        path: PathBuf,

        /// Print the profile as pretty JSON instead
        #[arg(long)]
        json: bool,
    },

    /// List the profiles stored in a directory, newest first
    List {
        /// Storage directory written by `serve --storage-dir`
        dir: PathBuf,

        /// Maximum number of profiles listed
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Corner {
    Left,
    Right,
}

impl From<Corner> for Position {
    fn from(corner: Corner) -> Self {
        match corner {
            Corner::Left => Position::Left,
            Corner::Right => Position::Right,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `show --json` output stays clean for piping.
    const CRATES: &[&str] = &["miniprof", "miniprof_core", "miniprof_schemas", "miniprof_web"];
    let level = cli.verbose.tracing_level_filter();
    let allowlist = CRATES.iter().map(|c| format!("{c}={level}")).join(",");
    let filter = EnvFilter::new(format!("warn,{allowlist}"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    match cli.command {
        Commands::Serve {
            addr,
            storage_dir,
            trivial_threshold,
            position,
            show_trivial,
            show_children,
            max_traces,
            start_hidden,
            open,
        } => {
            let storage: Arc<dyn Storage> = match storage_dir {
                Some(dir) => Arc::new(
                    FileStorage::open(&dir)
                        .with_context(|| format!("opening {}", dir.display()))?,
                ),
                None => Arc::new(MemoryStorage::new()),
            };
            let mp = MiniProfiler::with_shared_storage(storage)
                .with_options(ProfilerOptions {
                    trivial_duration_threshold_ms: trivial_threshold,
                    ..ProfilerOptions::default()
                })
                .with_render(RenderOptions {
                    position: position.into(),
                    show_trivial,
                    show_children,
                    max_traces,
                    start_hidden,
                    ..RenderOptions::default()
                });

            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(demo::run(mp, addr, open))
        }
        Commands::Show { path, json } => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let profile = miniprof_schemas::Profile::from_slice(&bytes)
                .with_context(|| format!("decoding {}", path.display()))?;
            if json {
                println!("{}", profile.to_json_pretty()?);
            } else {
                print!("{}", show::render_tree(&profile));
            }
            Ok(())
        }
        Commands::List { dir, limit } => {
            let storage = FileStorage::open(&dir)?;
            let options = ListOptions {
                max_results: limit,
                ..ListOptions::default()
            };
            print!("{}", show::render_listing(&storage, &options)?);
            Ok(())
        }
    }
}
