//! tether: command-line front end for the session-sync engine.
//!
//! Live commands hold one engine connection for as long as they run; storage
//! commands only touch `~/.tether` (or `$TETHER_HOME`) and work offline.
//!
//! ## Subcommands
//!
//! - `tail`: connect, track sessions, print engine events as JSON lines
//! - `send`: send one chat message and optionally wait for the reply
//! - `history`, `metadata`, `clear`, `archive`: inspect or reset local storage
//! - `health`: probe the backend's HTTP `/health` endpoint
//! - `config`: print the effective configuration

mod live;
mod logging;
mod output;
mod store;

use clap::{Parser, Subcommand};
use tether_core::{load_engine_config, EngineConfig, StorageConfig};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Resilient chat session sync")]
#[command(version)]
struct Cli {
    /// WebSocket endpoint, overriding config and TETHER_ENDPOINT
    #[arg(long, global = true, value_name = "URL")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print engine events until interrupted
    Tail {
        /// Session to track (repeatable)
        #[arg(long = "session", value_name = "ID")]
        sessions: Vec<String>,

        /// Project the tracked sessions belong to; enables persistence
        #[arg(long, value_name = "PATH")]
        project: Option<String>,
    },

    /// Send a chat message
    Send {
        /// Project path the message is about
        #[arg(long, value_name = "PATH")]
        project: String,

        /// Existing session; defaults to the project's last session
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Start a new session even if one can be resumed
        #[arg(long, conflicts_with = "session")]
        new_session: bool,

        /// Return after the server acknowledges instead of waiting for the reply
        #[arg(long)]
        no_wait: bool,

        content: String,
    },

    /// Print stored messages for a project's session
    History {
        #[arg(value_name = "PROJECT_PATH")]
        project: String,

        /// Defaults to the session recorded in metadata
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// Print the project's validated session metadata
    Metadata {
        #[arg(value_name = "PROJECT_PATH")]
        project: String,
    },

    /// Delete all stored data for a project
    Clear {
        #[arg(value_name = "PROJECT_PATH")]
        project: String,
    },

    /// Move the project's current session into its archive
    Archive {
        #[arg(value_name = "PROJECT_PATH")]
        project: String,
    },

    /// Probe the backend health endpoint
    Health,

    /// Print the effective configuration (secrets omitted)
    Config,
}

fn main() {
    let cli = Cli::parse();
    let storage = StorageConfig::default();
    let _logging_guard = logging::init(&storage);

    let mut config = load_engine_config(&storage);
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = Some(endpoint);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            eprintln!("tether: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli.command, config, storage)) {
        tracing::error!(error = %e, "tether command failed");
        eprintln!("tether: {e}");
        std::process::exit(1);
    }
}

async fn run(
    command: Commands,
    config: EngineConfig,
    storage: StorageConfig,
) -> tether_core::Result<()> {
    match command {
        Commands::Tail { sessions, project } => {
            config.validate()?;
            live::tail(config, storage, sessions, project).await
        }
        Commands::Send {
            project,
            session,
            new_session,
            no_wait,
            content,
        } => {
            config.validate()?;
            let session = if new_session {
                live::SessionChoice::New
            } else {
                session.map_or(live::SessionChoice::Resume, live::SessionChoice::Existing)
            };
            live::send(config, storage, &project, session, &content, !no_wait).await
        }
        Commands::History { project, session } => store::history(storage, &project, session),
        Commands::Metadata { project } => store::metadata(storage, &project),
        Commands::Clear { project } => store::clear(storage, &project),
        Commands::Archive { project } => store::archive(storage, &project),
        Commands::Health => live::health(&config).await,
        Commands::Config => output::print_json(&EngineConfig {
            auth_token: None,
            ..config
        }),
    }
}
