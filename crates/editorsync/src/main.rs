use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use editorsync::config::Config;
use editorsync::error::Result;
use editorsync::projector::Projector;
use editorsync::protocol::Outgoing;
use editorsync::push::{self, BuildOptions, PushOptions};
use editorsync::reconciler::{Event, Reconciler};
use editorsync::server::Endpoint;
use editorsync::sourcemap::SourcemapWriter;

#[derive(Parser)]
#[command(name = "editorsync", version, about = "Mirror a remote editor's tree into local script files")]
struct Cli {
    /// Directory the editor tree is mirrored into.
    #[arg(long = "sync-dir")]
    sync_dir: Option<PathBuf>,
    /// Port serving both transport variants.
    #[arg(long)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Push local sources into the editor, then exit.
    Push {
        /// Source directory to push.
        #[arg(short = 's', long)]
        source: Option<PathBuf>,
        /// Dotted destination path, e.g. ReplicatedStorage.Packages.
        #[arg(short = 'd', long)]
        destination: Option<String>,
        /// Allow the editor to replace existing instances at the destination.
        #[arg(long)]
        destructive: bool,
        /// Resolve sources through a rojo project manifest.
        #[arg(long)]
        rojo: bool,
        /// Explicit manifest path (defaults to default.project.json).
        #[arg(long = "rojo-project")]
        rojo_project: Option<PathBuf>,
        /// Do not ask the editor for a push config.
        #[arg(long = "no-place-config")]
        no_place_config: bool,
    },
    /// Build a snapshot of local sources and seed the editor, then exit.
    Build {
        #[arg(long = "sync-dir")]
        sync_dir: Option<PathBuf>,
        #[arg(long)]
        rojo: bool,
        #[arg(long = "rojo-project")]
        rojo_project: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load_or_default(Path::new(".")) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("editorsync: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(sync_dir) = cli.sync_dir {
        config.sync_dir = sync_dir;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    init_tracing(config.debug);

    let outcome = match cli.command {
        None => run_daemon(config).await,
        Some(Command::Push {
            source,
            destination,
            destructive,
            rojo,
            rojo_project,
            no_place_config,
        }) => {
            push::run_push(
                &config,
                PushOptions {
                    source,
                    destination,
                    destructive,
                    rojo,
                    rojo_project,
                    no_place_config,
                },
            )
            .await
        }
        Some(Command::Build {
            sync_dir,
            rojo,
            rojo_project,
        }) => {
            if let Some(sync_dir) = sync_dir {
                config.sync_dir = sync_dir;
            }
            push::run_build(&config, BuildOptions { rojo, rojo_project }).await
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    // An unwritable sync dir or an unbindable port is fatal at startup.
    let projector = Projector::new(&config.sync_dir, config.script_extension)?;
    let base_dir = std::env::current_dir()?;
    let sourcemap = SourcemapWriter::new(config.sourcemap_path.clone(), base_dir);

    let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
    let endpoint = Endpoint::bind(
        config.port,
        Some(Outgoing::RequestSnapshot),
        event_tx.clone(),
    )
    .await?;
    let outbound = endpoint.outbound();

    let reconciler = Reconciler::new(
        config,
        projector,
        sourcemap,
        outbound,
        event_rx,
        event_tx.clone(),
    );
    let reconciler_task = tokio::spawn(reconciler.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received; shutting down");
    let _ = event_tx.send(Event::Shutdown);
    let _ = reconciler_task.await;
    endpoint.shutdown().await;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
