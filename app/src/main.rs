mod state;

use anyhow::Context;
use comet_config::LoggingConfig;
use comet_core::{ActionId, Event};
use comet_runtime::{EventFilter, RenderSink, Runtime, SessionId, ViewId, ViewSnapshot};
use state::AppState;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(config.append)
                .truncate(!config.append)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// Headless front end: renders views as log lines.
struct LogSink;

impl RenderSink for LogSink {
    fn view_refreshed(&self, view: &ViewSnapshot) {
        let shown = view.cache.as_ref().map(|cache| cache.ids().len()).unwrap_or(0);
        tracing::info!(
            session = %view.session,
            view = %view.id,
            title = %view.kind.title(),
            messages = shown,
            "view refreshed"
        );
    }

    fn view_failed(&self, session: SessionId, view: ViewId, error: &str) {
        tracing::warn!(session = %session, view = %view, "view refresh failed: {error}");
    }

    fn draft_sent(&self, session: SessionId, view: ViewId, action: ActionId) {
        tracing::info!(session = %session, view = %view, action = %action, "message sent");
    }

    fn draft_failed(&self, session: SessionId, view: ViewId, action: ActionId, reason: &str) {
        tracing::error!(session = %session, view = %view, action = %action, "send failed: {reason}");
    }
}

/// An address or `mailto:` argument opens a composer instead of the default
/// views.
fn open_first_window(runtime: &Runtime, argument: Option<&str>) -> anyhow::Result<SessionId> {
    match argument {
        Some(mailto) => {
            let (session, _) = runtime
                .sessions
                .open_mailto(mailto)
                .with_context(|| format!("open composer for {mailto}"))?;
            Ok(session)
        }
        None => runtime
            .sessions
            .open_window(true)
            .context("open startup window"),
    }
}

/// Logs to stderr until the configured subscriber is installed.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config_manager, config) =
        tracing::subscriber::with_default(bootstrap_subscriber(), AppState::load_config)?;
    init_tracing(&config.logging)?;
    tracing::debug!(config = %config_manager.config_path().display(), "configuration loaded");

    let app_state = AppState::initialize(config_manager, config, Arc::new(LogSink))
        .await
        .context("failed to initialize Comet app state")?;
    let runtime = &app_state.runtime;

    let mut warnings = runtime
        .bus
        .subscribe("app", EventFilter::only([comet_core::EventKind::PollWarning]))
        .context("subscribe to poll warnings")?;

    open_first_window(runtime, std::env::args().nth(1).as_deref())?;
    tracing::info!(
        auto_poll = app_state.config.poll.auto_poll,
        interval_secs = app_state.config.poll.interval_secs,
        watching = ?runtime.poll.watched_path(),
        "comet ready"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                break;
            }
            event = warnings.recv() => match event {
                Some(Event::PollWarning { consecutive_failures, reason }) => {
                    tracing::warn!(
                        target: "comet::notice",
                        consecutive_failures,
                        "mail store cannot be checked for new mail: {reason}"
                    );
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    runtime.shutdown().await;
    Ok(())
}
