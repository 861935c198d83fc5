//! Geomark command-line client
//!
//! Talks to the location bookmarking backend through the authenticated
//! request pipeline:
//! 1. Loads config and session secrets
//! 2. Seeds the refresh cookie into the transport's cookie jar
//! 3. Runs one command; expired access tokens are refreshed transparently
//! 4. Exits with status 2 if the session could not be renewed

mod commands;
mod config;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use auth_pipeline::{AuthClient, PipelineConfig};
use session::{
    AccessCredential, CredentialProvider, LogoutReason, MemoryCredentialStore, SessionStatus,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{RefreshCookie, ReqwestTransport};

use crate::commands::Cli;
use crate::config::Config;

/// Exit status when the session ended and the user must log in again.
const EXIT_SESSION_EXPIRED: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr so stdout stays clean for command output
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = Cli::parse(&args)?;

    let prometheus = if cli.metrics {
        Some(metrics::install_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        refresh_cookie = config.session.refresh_cookie.is_some(),
        access_token = config.session.access_token.is_some(),
        "configuration loaded"
    );

    let cookie = config.session.refresh_cookie.clone().map(|value| RefreshCookie {
        name: config.session.cookie_name.clone(),
        value,
    });
    let transport = ReqwestTransport::new(&config.api.base_url, config.api.timeout(), cookie.as_ref())
        .context("failed to build http transport")?;

    let store: Arc<dyn CredentialProvider> = Arc::new(MemoryCredentialStore::new());
    let client = AuthClient::new(
        Arc::new(transport),
        store,
        PipelineConfig {
            refresh_timeout: config.api.refresh_timeout(),
        },
    );
    if let Some(token) = &config.session.access_token {
        client.login(AccessCredential::new(token.expose().clone()));
    }

    // Upstream logout signal
    let mut events = client.session_events();
    let watcher = tokio::spawn(async move {
        while events.changed().await.is_ok() {
            let status = events.borrow_and_update().clone();
            if let SessionStatus::LoggedOut { reason } = status {
                warn!(reason = reason.label(), "session ended, login required");
            }
        }
    });

    let outcome = commands::run(&client, cli.command).await;
    watcher.abort();

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }

    let expired = client.session_status()
        == SessionStatus::LoggedOut {
            reason: LogoutReason::RefreshFailed,
        };

    match outcome {
        Ok(Some(output)) => println!("{output}"),
        Ok(None) => {}
        Err(e) if expired => warn!(error = %e, "command failed after session termination"),
        Err(e) => return Err(e),
    }

    if expired {
        eprintln!("session expired: log in again to continue");
        std::process::exit(EXIT_SESSION_EXPIRED);
    }
    Ok(())
}
