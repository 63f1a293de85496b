//! Standalone sync server for collaborative note editing.
//!
//! Configuration comes from the environment:
//!
//! | Variable          | Meaning                                   | Default          |
//! |-------------------|-------------------------------------------|------------------|
//! | `VELLUM_BIND`     | listen address                            | `127.0.0.1:9090` |
//! | `VELLUM_DATA_DIR` | RocksDB directory                         | `vellum_data`    |
//! | `VELLUM_TOKENS`   | comma-separated `token:user_id:username`  | empty            |
//!
//! Logging goes through env_logger; set `RUST_LOG=info` (or finer) to see
//! connection traffic.

use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

use vellum_collab::auth::StaticTokenAuthenticator;
use vellum_collab::server::{CollabServer, ServerConfig};
use vellum_collab::storage::{NoteStore, StoreConfig};
use vellum_core::UserIdentity;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let bind_addr =
        std::env::var("VELLUM_BIND").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let data_dir =
        std::env::var("VELLUM_DATA_DIR").unwrap_or_else(|_| "vellum_data".to_string());

    let store_config = StoreConfig {
        path: data_dir.into(),
        ..Default::default()
    };
    let store = match NoteStore::open(store_config) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open note store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let authenticator = Arc::new(StaticTokenAuthenticator::new());
    if let Ok(spec) = std::env::var("VELLUM_TOKENS") {
        for entry in spec.split(',').filter(|s| !s.is_empty()) {
            match parse_token_entry(entry) {
                Some((token, user)) => {
                    info!("Registered token for {}", user.username);
                    authenticator.register(token, user);
                }
                None => warn!("Skipping malformed token entry '{}'", entry),
            }
        }
    }

    let config = ServerConfig {
        bind_addr,
        ..Default::default()
    };
    let server = CollabServer::new(config, Arc::clone(&store), authenticator);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    if let Err(e) = store.flush() {
        warn!("Flush on shutdown failed: {}", e);
    }
    ExitCode::SUCCESS
}

/// Parse one `token:user_id:username` entry.
fn parse_token_entry(entry: &str) -> Option<(String, UserIdentity)> {
    let mut parts = entry.splitn(3, ':');
    let token = parts.next()?.trim();
    let user_id = parts.next()?.trim().parse::<Uuid>().ok()?;
    let username = parts.next()?.trim();
    if token.is_empty() || username.is_empty() {
        return None;
    }
    Some((token.to_string(), UserIdentity::with_id(user_id, username)))
}
