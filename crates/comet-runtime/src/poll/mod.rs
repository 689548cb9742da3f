//! Background detection of store changes made by other processes.
//!
//! Polls are started by the timer, by [`PollLoop::request_poll`] and by the
//! optional store watcher. All of them raise the same `requested` flag, so any
//! number of triggers arriving while a poll runs yields one follow-up poll.

mod watcher;
mod watermark;

pub use watermark::Watermark;

use crate::bus::NotificationBus;
use crate::error::PollError;
use chrono::Utc;
use comet_config::PollConfig;
use comet_core::{Event, Revision};
use comet_storage::{MailStore, StorageError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use watcher::StoreWatcher;

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub last_revision: Option<Revision>,
    pub in_flight: bool,
    pub paused_depth: u32,
    pub requested: bool,
    pub auto_poll: bool,
    pub consecutive_failures: u32,
    pub polls_completed: u64,
}

#[derive(Debug, Default)]
struct PollState {
    in_flight: bool,
    paused_depth: u32,
    requested: bool,
    auto_poll: bool,
    consecutive_failures: u32,
    warned: bool,
    polls_completed: u64,
    stopped: bool,
}

struct PollShared {
    store: Arc<dyn MailStore>,
    bus: NotificationBus,
    watermark: Watermark,
    state: Mutex<PollState>,
    wake: Notify,
    warning_threshold: u32,
}

pub struct PollLoop {
    shared: Arc<PollShared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    watcher: Option<StoreWatcher>,
}

impl PollLoop {
    /// Spawns the poll task. The first revision read from the store becomes
    /// the baseline and is not reported as a change.
    pub fn start(
        store: Arc<dyn MailStore>,
        bus: NotificationBus,
        watermark: Watermark,
        config: &PollConfig,
    ) -> Self {
        let shared = Arc::new(PollShared {
            store,
            bus,
            watermark,
            state: Mutex::new(PollState {
                auto_poll: config.auto_poll,
                ..PollState::default()
            }),
            wake: Notify::new(),
            warning_threshold: config.failure_warning_threshold,
        });

        let watcher = if config.watch_store {
            shared.store.watch_path().and_then(|path| {
                let trigger = shared.clone();
                match StoreWatcher::start(&path, move || trigger.request()) {
                    Ok(watcher) => Some(watcher),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), "cannot watch store: {err}");
                        None
                    }
                }
            })
        } else {
            None
        };

        let period = config.interval();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(shared.clone(), period, shutdown_rx));
        tracing::info!(
            interval_secs = config.interval_secs,
            auto_poll = config.auto_poll,
            watching = watcher.is_some(),
            "poll loop started"
        );

        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
            watcher,
        }
    }

    /// Asks for a poll as soon as the loop is idle and not paused.
    pub fn request_poll(&self) -> Result<(), PollError> {
        if self.shared.lock().stopped {
            return Err(PollError::Stopped);
        }
        self.shared.request();
        Ok(())
    }

    /// Suppresses polling until a matching [`resume`](Self::resume). Nests.
    pub fn pause(&self) {
        let mut state = self.shared.lock();
        state.paused_depth += 1;
        tracing::debug!(depth = state.paused_depth, "poll loop paused");
    }

    pub fn resume(&self) -> Result<(), PollError> {
        let mut state = self.shared.lock();
        if state.paused_depth == 0 {
            return Err(PollError::NotPaused);
        }
        state.paused_depth -= 1;
        tracing::debug!(depth = state.paused_depth, "poll loop resumed");
        if state.paused_depth == 0 && state.requested {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Pauses until the guard is dropped.
    pub fn pause_guard(&self) -> PauseGuard<'_> {
        self.pause();
        PauseGuard { poll: self }
    }

    pub fn set_auto_poll(&self, enabled: bool) {
        self.shared.lock().auto_poll = enabled;
        tracing::info!(enabled, "automatic polling toggled");
    }

    pub fn status(&self) -> PollStatus {
        let state = self.shared.lock();
        PollStatus {
            last_revision: self.shared.watermark.get(),
            in_flight: state.in_flight,
            paused_depth: state.paused_depth,
            requested: state.requested,
            auto_poll: state.auto_poll,
            consecutive_failures: state.consecutive_failures,
            polls_completed: state.polls_completed,
        }
    }

    pub fn watched_path(&self) -> Option<&std::path::Path> {
        self.watcher.as_ref().map(StoreWatcher::path)
    }

    /// Stops the loop and waits for a poll in progress to finish.
    pub async fn shutdown(&self) {
        self.shared.lock().stopped = true;
        let _ = self.shutdown.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!("poll task ended abnormally: {err}");
            }
            tracing::info!("poll loop stopped");
        }
    }
}

pub struct PauseGuard<'a> {
    poll: &'a PollLoop,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.poll.resume() {
            tracing::warn!("pause guard released an unpaused loop: {err}");
        }
    }
}

async fn run(shared: Arc<PollShared>, period: Option<Duration>, mut shutdown: watch::Receiver<bool>) {
    match shared.store.current_revision().await {
        Ok(revision) => {
            shared.watermark.observe(revision);
            tracing::debug!(%revision, "poll baseline read");
        }
        Err(err) => tracing::warn!("could not read initial store revision: {err}"),
    }

    let mut ticker = period.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        if *shutdown.borrow() {
            break;
        }
        if shared.begin_poll() {
            shared.poll_once().await;
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = shared.wake.notified() => {}
            _ = next_tick(&mut ticker) => {
                if shared.lock().auto_poll {
                    shared.request();
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl PollShared {
    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request(&self) {
        self.lock().requested = true;
        self.wake.notify_one();
    }

    fn begin_poll(&self) -> bool {
        let mut state = self.lock();
        if !state.requested || state.in_flight || state.paused_depth > 0 || state.stopped {
            return false;
        }
        state.requested = false;
        state.in_flight = true;
        true
    }

    async fn poll_once(&self) {
        self.bus.publish(Event::PollTick { at: Utc::now() });
        let result = self.check().await;

        let mut state = self.lock();
        state.in_flight = false;
        state.polls_completed += 1;
        match result {
            Ok(changed) => {
                if state.consecutive_failures > 0 {
                    tracing::info!(failures = state.consecutive_failures, "polling recovered");
                }
                state.consecutive_failures = 0;
                state.warned = false;
                if let Some(revision) = changed {
                    tracing::info!(%revision, "store changed");
                    self.bus.publish(Event::StoreChanged { revision });
                }
            }
            Err(err) => {
                state.consecutive_failures += 1;
                state.requested = false;
                if err.is_unavailable() {
                    tracing::warn!(failures = state.consecutive_failures, "store unavailable, poll skipped: {err}");
                } else {
                    tracing::error!(failures = state.consecutive_failures, "poll failed: {err}");
                }
                let threshold = self.warning_threshold;
                if threshold > 0 && state.consecutive_failures >= threshold && !state.warned {
                    state.warned = true;
                    tracing::error!(
                        failures = state.consecutive_failures,
                        "polling keeps failing: {err}"
                    );
                    self.bus.publish(Event::PollWarning {
                        consecutive_failures: state.consecutive_failures,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Refreshes the store and returns the new revision if it moved.
    async fn check(&self) -> Result<Option<Revision>, StorageError> {
        self.store.refresh().await?;
        let current = self.store.current_revision().await?;
        Ok(self.watermark.observe(current).then_some(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use chrono::Utc;
    use comet_core::{EventKind, MessageId, MessageRecord, ThreadId};
    use comet_storage::MemoryStore;
    use tokio::time::{sleep, timeout};

    fn record(id: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId::from(id),
            thread: ThreadId::from("t"),
            folder: "inbox".to_string(),
            tags: ["inbox".to_string()].into_iter().collect(),
            subject: String::new(),
            date: Utc::now(),
        }
    }

    fn manual() -> PollConfig {
        PollConfig {
            interval_secs: 0,
            auto_poll: false,
            failure_warning_threshold: 3,
            watch_store: false,
        }
    }

    async fn wait_for_polls(poll: &PollLoop, count: u64) {
        timeout(Duration::from_secs(5), async {
            while poll.status().polls_completed < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("polls completed in time");
    }

    #[tokio::test]
    async fn unchanged_store_publishes_no_change() {
        let store = MemoryStore::with_messages([record("1")]);
        let bus = NotificationBus::new();
        let mut changes = bus
            .subscribe("test", EventFilter::only([EventKind::StoreChanged]))
            .expect("subscribed");
        let poll = PollLoop::start(Arc::new(store), bus, Watermark::new(), &manual());

        for round in 1..=3 {
            poll.request_poll().expect("requested");
            wait_for_polls(&poll, round).await;
        }
        assert!(changes.try_recv().is_none());
        poll.shutdown().await;
    }

    #[tokio::test]
    async fn external_write_is_reported_once() {
        let store = MemoryStore::with_messages([record("1")]);
        let bus = NotificationBus::new();
        let mut changes = bus
            .subscribe("test", EventFilter::only([EventKind::StoreChanged]))
            .expect("subscribed");
        let poll = PollLoop::start(Arc::new(store.clone()), bus, Watermark::new(), &manual());
        poll.request_poll().expect("requested");
        wait_for_polls(&poll, 1).await;

        store.external().add_tag(&MessageId::from("1"), "flagged");
        poll.request_poll().expect("requested");
        wait_for_polls(&poll, 2).await;
        poll.request_poll().expect("requested");
        wait_for_polls(&poll, 3).await;

        assert!(matches!(changes.try_recv(), Some(Event::StoreChanged { .. })));
        assert!(changes.try_recv().is_none());
        poll.shutdown().await;
    }

    #[tokio::test]
    async fn nested_pauses_coalesce_into_one_poll() {
        let store = MemoryStore::new();
        let bus = NotificationBus::new();
        let poll = PollLoop::start(Arc::new(store), bus, Watermark::new(), &manual());

        poll.pause();
        poll.pause();
        for _ in 0..5 {
            poll.request_poll().expect("requested");
        }
        poll.resume().expect("resumed");
        sleep(Duration::from_millis(30)).await;
        assert_eq!(poll.status().polls_completed, 0);

        poll.resume().expect("resumed");
        wait_for_polls(&poll, 1).await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(poll.status().polls_completed, 1);
        assert_eq!(poll.resume(), Err(PollError::NotPaused));
        poll.shutdown().await;
    }

    #[tokio::test]
    async fn pause_guard_resumes_on_drop() {
        let poll = PollLoop::start(
            Arc::new(MemoryStore::new()),
            NotificationBus::new(),
            Watermark::new(),
            &manual(),
        );
        {
            let _guard = poll.pause_guard();
            assert_eq!(poll.status().paused_depth, 1);
        }
        assert_eq!(poll.status().paused_depth, 0);
        poll.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_failures_warn_once() {
        let store = MemoryStore::new();
        store.set_available(false);
        let bus = NotificationBus::new();
        let mut warnings = bus
            .subscribe("test", EventFilter::only([EventKind::PollWarning]))
            .expect("subscribed");
        let poll = PollLoop::start(Arc::new(store.clone()), bus, Watermark::new(), &manual());

        for round in 1..=5 {
            poll.request_poll().expect("requested");
            wait_for_polls(&poll, round).await;
        }
        assert_eq!(poll.status().consecutive_failures, 5);
        match warnings.try_recv() {
            Some(Event::PollWarning {
                consecutive_failures,
                ..
            }) => assert_eq!(consecutive_failures, 3),
            other => panic!("expected a warning, got {other:?}"),
        }
        assert!(warnings.try_recv().is_none());

        store.set_available(true);
        poll.request_poll().expect("requested");
        wait_for_polls(&poll, 6).await;
        assert_eq!(poll.status().consecutive_failures, 0);
        poll.shutdown().await;
    }

    #[tokio::test]
    async fn timer_polls_when_auto_poll_is_on() {
        let config = PollConfig {
            interval_secs: 1,
            auto_poll: true,
            ..manual()
        };
        let poll = PollLoop::start(
            Arc::new(MemoryStore::new()),
            NotificationBus::new(),
            Watermark::new(),
            &config,
        );
        timeout(Duration::from_secs(3), async {
            while poll.status().polls_completed == 0 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timer fired");
        poll.shutdown().await;
        assert_eq!(poll.request_poll(), Err(PollError::Stopped));
    }
}
