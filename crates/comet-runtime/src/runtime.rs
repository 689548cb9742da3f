use crate::actions::ActionManager;
use crate::bus::NotificationBus;
use crate::poll::{PollLoop, Watermark};
use crate::session::{RenderSink, SessionController};
use crate::transport::Transport;
use comet_config::AppConfig;
use comet_storage::MailStore;
use std::sync::Arc;

/// Everything the orchestration core runs on, built in dependency order.
///
/// There is no global instance; the binary owns one and hands out clones
/// of the pieces it needs.
pub struct Runtime {
    pub bus: NotificationBus,
    pub actions: ActionManager,
    pub poll: PollLoop,
    pub sessions: SessionController,
}

impl Runtime {
    /// Starts the bus, the action manager, the poll loop and the session
    /// controller, in that order. Must be called within a Tokio runtime.
    pub fn start(
        config: &AppConfig,
        store: Arc<dyn MailStore>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn RenderSink>,
    ) -> Self {
        let bus = NotificationBus::new();
        let watermark = Watermark::new();
        let actions = ActionManager::new(
            store.clone(),
            transport,
            bus.clone(),
            watermark.clone(),
            &config.actions,
            config.tags.clone(),
        );
        let poll = PollLoop::start(store.clone(), bus.clone(), watermark, &config.poll);
        let sessions = SessionController::new(
            store,
            bus.clone(),
            actions.clone(),
            sink,
            config,
        );
        tracing::info!("runtime started");

        Self {
            bus,
            actions,
            poll,
            sessions,
        }
    }

    /// Tears down in reverse: no more polls, no more actions (pending ones
    /// are cancelled, running ones finish), no more windows, then the bus.
    pub async fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        self.poll.shutdown().await;
        self.actions.close().await;
        self.sessions.close_all_windows().await;
        self.bus.close();
        tracing::info!("runtime stopped");
    }
}
