// draftline entry point: a headless live-draft client.
//
// Startup sequence:
// 1. Initialize tracing (log to file; stdout carries the draft feed)
// 2. Load config and credentials
// 3. Build the collaborator client and the WebSocket connector
// 4. Probe push updates, falling back to polling
// 5. Start the live draft session
// 6. Print view updates, read commands from stdin until quit or Ctrl+C
// 7. Stop the session

use std::sync::Arc;

use anyhow::Context;
use draftline_app::api::HttpDraftApi;
use draftline_app::config;
use draftline_app::connection::ConnectionSettings;
use draftline_app::session::{Command, LiveDraft, SessionConfig};
use draftline_app::transport::TungsteniteConnector;
use draftline_app::updates;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("draftline starting up");

    let config = config::load_config().context("failed to load configuration")?;
    let identity = config.identity().context("missing credentials")?;
    info!(
        "Config loaded: draft {} as {}, server {}",
        config.draft_id, identity.user_id, config.server.ws_url
    );

    let api = Arc::new(HttpDraftApi::new(
        config.server.api_url.clone(),
        identity.token.clone(),
    ));
    let connector = Arc::new(TungsteniteConnector::new(Some(identity.token.clone())));
    let settings = ConnectionSettings {
        url: live_url(&config.server.ws_url, &config.draft_id),
        draft_id: config.draft_id.clone(),
        reconnect: config.reconnect.clone(),
        heartbeat: config.heartbeat,
    };

    let source = updates::select_updates(connector, api.clone(), settings, &config.transport).await;
    let (draft, mut view_rx) =
        LiveDraft::start(SessionConfig::new(&config, &identity), source, api);

    let printer = tokio::spawn(async move {
        while let Some(update) = view_rx.recv().await {
            println!("{update}");
        }
    });

    println!("commands: pick <item>, start, bg, fg, reconnect, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Reading stdin failed: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(Command::Quit) => break,
                    Ok(command) => {
                        if draft.send(command).await.is_err() {
                            error!("Live draft session stopped unexpectedly");
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
        }
    }

    draft.stop().await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;

    info!("draftline shut down cleanly");
    Ok(())
}

/// The live channel for one draft: the configured endpoint with the draft id
/// as a query parameter.
fn live_url(ws_url: &str, draft_id: &str) -> String {
    let separator = if ws_url.contains('?') { '&' } else { '?' };
    format!("{ws_url}{separator}draftId={draft_id}")
}

/// Initialize tracing to log to a file (stdout is the draft feed).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("draftline.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("draftline_app=info,draftline_core=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
