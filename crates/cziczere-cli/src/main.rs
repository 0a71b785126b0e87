//! cziczere: command-line client for the sync engine.
//!
//! ## Subcommands
//!
//! - `config`: print the effective configuration
//! - `watch`: stream state snapshots as JSON lines until interrupted
//! - `remember`, `chat`, `atmosphere`: session-backed operations
//! - `analyze`, `rephrase`, `export`, `audio`: one-shot backend calls

use clap::{Parser, Subcommand};
use cziczere_sync::engine::api::RateLimiter;
use cziczere_sync::{
    ApplicationSnapshot, ConnectionState, HttpApi, SseDocumentFeed, StaticCredentials, SyncConfig, SyncError,
    SyncResult, SyncSession, Token, TungsteniteConnector, UserId,
};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cziczere")]
#[command(about = "Cziczere memory garden sync client")]
#[command(version)]
struct Cli {
    /// Config file (default: <config_dir>/cziczere/sync.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Signed-in user id
    #[arg(long, env = "CZICZERE_USER", global = true)]
    user: Option<String>,

    /// Bearer token for the channel, feeds and backend calls
    #[arg(long, env = "CZICZERE_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Seconds to wait for the session to come up
    #[arg(long, default_value = "15", global = true)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// Stream state snapshots as JSON lines until Ctrl-C
    Watch {
        /// Print whole snapshots instead of a summary
        #[arg(long)]
        full: bool,
    },

    /// Add a memory and print the authoritative record
    Remember {
        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// Send a chat message and print the reply
    Chat {
        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// Print the garden atmosphere
    Atmosphere {
        /// Bypass the cache
        #[arg(long)]
        force: bool,
    },

    /// Ask the backend for a new insight
    Analyze {
        #[arg(long, default_value = "weekly")]
        kind: String,
    },

    /// Rephrase text poetically
    Rephrase {
        #[arg(value_name = "TEXT")]
        text: String,
    },

    /// Export the garden as an image
    Export,

    /// Audio narration for an insight
    Audio {
        #[arg(value_name = "INSIGHT_ID")]
        insight_id: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> SyncResult<()> {
    let config = SyncConfig::load(cli.config.as_deref())?;
    let wait = Duration::from_secs(cli.wait_secs);
    let credentials = Arc::new(StaticCredentials::new(
        cli.token.clone().map(Token::new),
        cli.user.clone().map(UserId::new),
    ));

    match cli.command {
        Commands::Config => print_json(&config),
        Commands::Watch { full } => {
            let session = start_session(&config, &credentials)?;
            watch(&session, full).await;
            session.shutdown().await;
            Ok(())
        }
        Commands::Remember { text } => {
            let session = start_session(&config, &credentials)?;
            wait_until(&session, wait, |s| s.identity.is_some()).await?;
            let record = session.create_memory_optimistic(&text).await;
            session.shutdown().await;
            print_json(&record?)
        }
        Commands::Chat { text } => {
            let session = start_session(&config, &credentials)?;
            wait_until(&session, wait, |s| s.connection == ConnectionState::Connected).await?;
            let reply = session.send_chat(&text).await;
            session.shutdown().await;
            println!("{}", reply?.content);
            Ok(())
        }
        Commands::Atmosphere { force } => {
            let session = start_session(&config, &credentials)?;
            wait_until(&session, wait, |s| s.identity.is_some()).await?;
            let atmosphere = session.refresh_atmosphere(force).await;
            session.shutdown().await;
            print_json(&atmosphere?)
        }
        Commands::Analyze { kind } => {
            let (api, token) = one_shot(&config, &cli.token)?;
            print_json(&api.analyze_memories(&token, &kind).await?)
        }
        Commands::Rephrase { text } => {
            let (api, token) = one_shot(&config, &cli.token)?;
            print_json(&api.poetic_rephrasing(&token, &text).await?)
        }
        Commands::Export => {
            let (api, token) = one_shot(&config, &cli.token)?;
            print_json(&api.export_garden(&token).await?)
        }
        Commands::Audio { insight_id } => {
            let (api, token) = one_shot(&config, &cli.token)?;
            print_json(&api.get_insight_audio(&token, &insight_id).await?)
        }
    }
}

fn http_api(config: &SyncConfig) -> HttpApi {
    HttpApi::new(&config.api_base, RateLimiter::new(config.requests_per_minute, config.requests_per_hour))
}

fn one_shot(config: &SyncConfig, token: &Option<String>) -> SyncResult<(HttpApi, Token)> {
    let token = token
        .clone()
        .filter(|t| !t.is_empty())
        .map(Token::new)
        .ok_or_else(|| SyncError::Auth("--token or CZICZERE_TOKEN is required".into()))?;
    Ok((http_api(config), token))
}

fn start_session(config: &SyncConfig, credentials: &Arc<StaticCredentials>) -> SyncResult<SyncSession> {
    let mut feed = SseDocumentFeed::new(&config.feed_url, credentials.clone());
    if let Some(limit) = config.feed_limit {
        feed = feed.with_limit(limit);
    }
    SyncSession::start(
        config.clone(),
        credentials.clone(),
        Arc::new(TungsteniteConnector),
        Arc::new(feed),
        Arc::new(http_api(config)),
    )
}

async fn wait_until(
    session: &SyncSession,
    wait: Duration,
    ready: impl Fn(&ApplicationSnapshot) -> bool,
) -> SyncResult<()> {
    let mut states = session.subscribe();
    let reached = tokio::time::timeout(wait, states.wait_for(|s| ready(s))).await;
    match reached {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(SyncError::Cancelled),
        Err(_) => {
            let snapshot = session.snapshot();
            if snapshot.identity.is_none() {
                return Err(SyncError::Auth("--user or CZICZERE_USER is required".into()));
            }
            Err(SyncError::Other(format!(
                "session not ready after {}s (connection {})",
                wait.as_secs(),
                snapshot.connection
            )))
        }
    }
}

async fn watch(session: &SyncSession, full: bool) {
    let mut states = session.subscribe();
    loop {
        let snapshot = states.borrow_and_update().clone();
        let line = if full {
            serde_json::to_string(&*snapshot)
        } else {
            serde_json::to_string(&serde_json::json!({
                "revision": snapshot.revision,
                "identity": snapshot.identity,
                "connection": snapshot.connection,
                "memories": snapshot.memories.len(),
                "insights": snapshot.insights.len(),
                "loading": snapshot.memories_loading || snapshot.insights_loading,
                "error": snapshot.error,
            }))
        };
        match line {
            Ok(line) => println!("{}", line),
            Err(e) => error!("snapshot encode failed: {}", e),
        }

        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> SyncResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
