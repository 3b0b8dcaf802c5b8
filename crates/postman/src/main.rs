mod bootstrap;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use postman_core::config::load_layered;
use postman_core::settings::{Command, Settings};
use postman_runtime::daemon::{Daemon, DaemonOptions};
use postman_runtime::discovery::TmuxNodeDirectory;
use postman_runtime::events::{DaemonEvent, EventKind};
use postman_runtime::layout::SessionLayout;
use postman_runtime::lock::ContextLock;
use postman_runtime::pane::{TmuxTransport, DEFAULT_COMMAND_TIMEOUT};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();
    let base_dir = settings.resolved_base_dir();

    bootstrap::ensure_directories(&base_dir)?;
    let log_file: Option<PathBuf> = match settings.command {
        Command::Run { .. } => Some(
            settings
                .log_file
                .clone()
                .unwrap_or_else(|| bootstrap::default_log_file(&base_dir)),
        ),
        Command::Send { .. } => settings.log_file.clone(),
    };
    bootstrap::setup_logging(settings.effective_log_level(), log_file.as_deref())?;
    bootstrap::install_panic_hook();

    match settings.command.clone() {
        Command::Run { node, events_json } => run(&settings, node, events_json).await,
        Command::Send {
            from,
            to,
            session,
            body,
        } => send(&settings, &from, &to, &session, body),
    }
}

async fn run(settings: &Settings, node: Option<String>, events_json: bool) -> Result<()> {
    tracing::info!("postman v{} starting", env!("CARGO_PKG_VERSION"));

    let context_dir = settings.context_dir();
    let _lock = ContextLock::acquire(&context_dir)?;

    let cwd = std::env::current_dir()?;
    let config_paths = settings.config_paths(&cwd);
    let config = load_layered(&config_paths).context("failed to load configuration")?;
    tracing::info!(
        context = %settings.context_id,
        dir = %context_dir.display(),
        edges = config.edges.len(),
        "configuration loaded"
    );

    let transport = Arc::new(TmuxTransport::new(DEFAULT_COMMAND_TIMEOUT));
    let directory = Arc::new(TmuxNodeDirectory::new(transport.clone(), &context_dir));
    let daemon = Daemon::new(
        DaemonOptions {
            context_id: settings.context_id.clone(),
            context_dir,
            config_paths,
            node,
        },
        config,
        transport,
        directory,
    )?;

    let cancel = CancellationToken::new();
    let (mut rx, handle) = daemon.start(cancel.clone());

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => report(&event, events_json),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                tracing::info!("Ctrl+C received; shutting down");
                handle.shutdown();
            }
        }
    }

    handle.join().await;
    Ok(())
}

fn report(event: &DaemonEvent, events_json: bool) {
    if events_json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialise event"),
        }
        return;
    }

    let details = serde_json::Value::Object(event.details.clone());
    match event.kind {
        EventKind::Error => tracing::warn!(%details, "{}", event.message),
        EventKind::MessageReceived | EventKind::ConfigUpdate => {
            tracing::info!(%details, "{}", event.message)
        }
        EventKind::StatusUpdate | EventKind::EdgeUpdate | EventKind::PaneStatusUpdate => {
            tracing::debug!(%details, "{}", event.message)
        }
    }
}

fn send(settings: &Settings, from: &str, to: &str, session: &str, body: Option<String>) -> Result<()> {
    let body = match body {
        Some(body) => body,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read message body from stdin")?;
            buf
        }
    };

    let layout = SessionLayout::for_session(&settings.context_dir(), session);
    layout.ensure::<&str>(&[])?;
    let path = layout.post_message(&settings.context_id, from, to, &body, Utc::now())?;

    tracing::info!(from, to, path = %path.display(), "message posted");
    println!("{}", path.display());
    Ok(())
}
