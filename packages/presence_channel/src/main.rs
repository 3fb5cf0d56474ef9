use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use presence_channel::config::{FileConfig, load_config};
use presence_channel::credential::TOKEN_KEY;
use presence_channel::{
    ChannelConfig, Credential, CredentialStore, Handlers, MemoryCredentialStore, PresenceClient,
    StorageScope,
};

#[derive(Parser)]
#[command(name = "presence-watch")]
#[command(about = "Follow presence and entity changes on a server-push channel")]
struct Args {
    /// Config file (TOML); PRESENCE_ environment variables override it
    #[arg(short, long, default_value = "presence.toml")]
    config: PathBuf,

    /// Access token
    #[arg(long, conflicts_with = "token_file")]
    token: Option<String>,

    /// File holding the access token; re-read after a fatal auth error
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Only log entity changes of this type (repeatable)
    #[arg(short, long = "entity-type")]
    entity_types: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "presence_channel=debug,presence_watch=debug"
    } else {
        "presence_channel=info,presence_watch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let fc: FileConfig = load_config(&args.config)
        .extract()
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;
    let config = ChannelConfig::from_file(&fc.channel);
    let max_credential_len = config.max_credential_len;

    let store = Arc::new(MemoryCredentialStore::new());
    let client = PresenceClient::connect_http(config, store.clone())
        .context("failed to build HTTP client")?;
    client.set_handlers(watch_handlers(&args.entity_types)).await;

    let (auth_tx, _) = watch::channel(false);
    bootstrap(&args, store.as_ref(), &auth_tx, max_credential_len)?;
    client.start(auth_tx.subscribe());

    let mut users = client.connected_users();
    let mut state = client.connection_state();
    let mut fatal = client.fatal_errors();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            changed = users.changed() => {
                if changed.is_err() {
                    break;
                }
                let names: Vec<String> = users
                    .borrow_and_update()
                    .iter()
                    .map(|u| u.display_name().or(u.id.as_deref()).unwrap_or("?").to_string())
                    .collect();
                info!(count = names.len(), users = ?names, "presence changed");
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(state = ?current, "connection state changed");
            }
            signal = fatal.recv() => match signal {
                Ok(e) => {
                    error!(error = %e, "fatal authentication error, restarting session");
                    client.shutdown().await;
                    bootstrap(&args, store.as_ref(), &auth_tx, max_credential_len)?;
                    client.start(auth_tx.subscribe());
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    let metrics = client.metrics();
    info!(metrics = %serde_json::to_string(&metrics)?, "final channel metrics");
    Ok(())
}

/// Seed the store from the command line and publish the resulting auth flag.
/// An oversized token leaves the session logged out so a bad token file
/// cannot put the watcher into a restart loop.
fn bootstrap(
    args: &Args,
    store: &dyn CredentialStore,
    auth_tx: &watch::Sender<bool>,
    max_credential_len: usize,
) -> Result<()> {
    let token = match (&args.token, &args.token_file) {
        (Some(token), _) => Some(token.trim().to_string()),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read token file {}", path.display()))?
                .trim()
                .to_string(),
        ),
        (None, None) => None,
    };

    let authenticated = match token.filter(|t| !t.is_empty()) {
        Some(token) if Credential::new(token.as_str()).is_oversized(max_credential_len) => {
            error!(
                length = Credential::new(token.as_str()).len(),
                "token exceeds the maximum length, staying logged out"
            );
            false
        }
        Some(token) => {
            store.set(StorageScope::Persistent, TOKEN_KEY, token);
            true
        }
        None => {
            warn!("no token given, waiting unauthenticated");
            false
        }
    };

    auth_tx.send_replace(authenticated);
    Ok(())
}

fn watch_handlers(entity_types: &[String]) -> Handlers {
    let handlers = Handlers::new()
        .on_entity_changed(|event| {
            info!(
                entity_type = %event.entity_type,
                action = ?event.action,
                entity_id = ?event.entity_id.as_ref().map(ToString::to_string),
                "entity changed"
            );
        })
        .on_user_connected(|user| {
            info!(user_id = %user.user_id, username = ?user.username, "user connected");
        })
        .on_user_disconnected(|user| {
            info!(user_id = %user.user_id, username = ?user.username, "user disconnected");
        })
        .on_new_message(|message| {
            info!(
                chat_id = %message.chat_id,
                sender = %message.sender_name,
                "new message"
            );
        });

    if entity_types.is_empty() {
        handlers
    } else {
        handlers.with_entity_types(entity_types.iter().cloned())
    }
}
