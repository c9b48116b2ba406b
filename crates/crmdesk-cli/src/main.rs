//! crmdesk - command line inbox for the customer-service queue.
//!
//! Sign in once with `crmdesk login`; every other command reuses the stored
//! session and renews it transparently while the refresh credential is valid.

mod commands;

use std::io;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crmdesk_core::auth::{open_credential_store, SnapshotStore};
use crmdesk_core::config::{CredentialBackend, API_URL_ENV};
use crmdesk_core::models::ConversationId;
use crmdesk_core::{ApiClient, Config, SessionStore};

// ============================================================================
// Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "crmdesk", version, about = "Command line inbox for the crmdesk customer-service queue")]
struct Cli {
    /// Backend base URL, e.g. https://crm.example.com/api
    #[arg(long, global = true, env = API_URL_ENV)]
    api_url: Option<String>,

    /// Where to keep credentials: keyring, file or memory
    #[arg(long, global = true)]
    credential_store: Option<CredentialBackend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session
    Login {
        /// Username or email; prompted for when omitted
        #[arg(long, short)]
        username: Option<String>,
    },
    /// Sign out and delete stored credentials
    Logout,
    /// Show the signed-in agent
    Whoami,
    /// List the service queue
    Queue(QueueArgs),
    /// Assign a conversation to yourself
    Take { id: ConversationId },
    /// Mark a conversation as resolved
    Resolve { id: ConversationId },
    /// Close a conversation
    Close { id: ConversationId },
    /// Mark a conversation as read
    Read { id: ConversationId },
    /// Mark a conversation as unread
    Unread { id: ConversationId },
    /// Send a text message to the contact
    Send { id: ConversationId, text: String },
    /// Hand a conversation over to another sector or agent
    Transfer(TransferArgs),
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    /// Service status (TODOS for every status)
    #[arg(long, default_value = "ABERTA")]
    pub status: String,

    /// Service mode (TODOS for every mode)
    #[arg(long)]
    pub mode: Option<String>,

    /// Priority (TODAS for every priority)
    #[arg(long)]
    pub priority: Option<String>,

    /// Only conversations marked unread
    #[arg(long)]
    pub unread: bool,

    /// Search contact name or number
    #[arg(long, short)]
    pub search: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long)]
    pub page_size: Option<u32>,

    /// Print the raw page as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    pub id: ConversationId,

    /// Reason recorded with the transfer
    #[arg(long)]
    pub reason: String,

    /// Target sector id
    #[arg(long)]
    pub sector: Option<i64>,

    /// Target agent id
    #[arg(long)]
    pub agent: Option<i64>,
}

// ============================================================================
// Entry point
// ============================================================================

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG to control the level (e.g. RUST_LOG=crmdesk_core=debug).
fn init_tracing() -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", commands::describe_error(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        })
        .with_api_url_override(cli.api_url);
    if let Some(backend) = cli.credential_store {
        config.credential_backend = backend;
    }
    info!(api_url = %config.api_base_url(), backend = %config.credential_backend, "Starting");

    let credentials = open_credential_store(&config)?;
    let api = ApiClient::new(&config, credentials)?;
    let snapshots = match config.data_dir() {
        Ok(dir) => SnapshotStore::new(&dir),
        Err(e) => {
            warn!(error = %e, "No data directory, session will not persist");
            SnapshotStore::ephemeral()
        }
    };
    let session = Arc::new(SessionStore::new(api, snapshots));
    let _expiry_watch = session.spawn_expiry_watch();

    let mut events = session.api().gateway().subscribe();
    let result = commands::dispatch(cli.command, &session, &config).await;
    commands::report_session_events(&mut events);
    result
}
