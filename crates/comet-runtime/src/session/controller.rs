use super::view::{self, Routing};
use super::{
    parse_mailto, worker, CloseMode, QueryResult, RenderSink, ResultCache, Selection, SessionId,
    ViewId, ViewKind, ViewSnapshot, ViewSpec,
};
use crate::actions::ActionManager;
use crate::bus::{EventFilter, NotificationBus, SubscriptionId};
use crate::error::SessionError;
use comet_config::{AppConfig, NamedQuery, StartupConfig};
use comet_core::{
    ActionId, ActionKind, ActionPayload, ActionRequest, ComposedMessage, Event, MessageId,
    Revision,
};
use comet_storage::{MailStore, StorageError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns every window's view stack.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<ControllerShared>,
}

pub(super) struct ControllerShared {
    store: Arc<dyn MailStore>,
    bus: NotificationBus,
    actions: ActionManager,
    sink: Arc<dyn RenderSink>,
    pub(super) debounce: Duration,
    startup: StartupConfig,
    saved_searches: Vec<NamedQuery>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

#[derive(Default)]
struct Session {
    views: Vec<ViewState>,
    focused: Option<ViewId>,
}

struct ViewState {
    id: ViewId,
    kind: ViewKind,
    invincible: bool,
    cache: Option<ResultCache>,
    /// Set when an overlapping change was routed here after the last refresh.
    dirty: bool,
    known_revision: Option<Revision>,
    /// Bumped on every invalidation; a refresh started under an older
    /// generation does not clear the dirty flag.
    generation: u64,
    pending_send: Option<ActionId>,
    failed_send: Option<ActionId>,
    last_error: Option<String>,
    subscription: SubscriptionId,
    stop: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl ViewState {
    fn is_stale(&self) -> bool {
        self.dirty || self.cache.is_none()
    }
}

pub(super) enum Delivery {
    Ignored,
    Invalidated,
    SendFinished {
        action: ActionId,
        failure: Option<String>,
    },
}

impl SessionController {
    pub fn new(
        store: Arc<dyn MailStore>,
        bus: NotificationBus,
        actions: ActionManager,
        sink: Arc<dyn RenderSink>,
        config: &AppConfig,
    ) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                store,
                bus,
                actions,
                sink,
                debounce: config.views.debounce(),
                startup: config.startup.clone(),
                saved_searches: config.saved_searches.clone(),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Opens a window. With `defaults` the configured startup views are
    /// pushed as invincible views and the first one is focused.
    pub fn open_window(&self, defaults: bool) -> Result<SessionId, SessionError> {
        let session = SessionId::new();
        self.shared.lock().insert(session, Session::default());
        tracing::info!(session = %session, defaults, "window opened");

        if defaults {
            let mut specs = Vec::new();
            if self.shared.startup.show_saved_searches {
                specs.push(
                    ViewSpec::new(ViewKind::SavedSearches {
                        searches: self.shared.saved_searches.clone(),
                    })
                    .invincible(),
                );
            }
            for startup in &self.shared.startup.queries {
                specs.push(
                    ViewSpec::new(ViewKind::thread_list(&startup.name, &startup.query))
                        .invincible(),
                );
            }

            let mut first = None;
            for spec in specs {
                let view = self.push_view(session, spec)?;
                first.get_or_insert(view);
            }
            if let Some(first) = first {
                self.focus_view(session, first)?;
            }
        }
        Ok(session)
    }

    /// Opens a window holding only a composer addressed from `mailto`.
    pub fn open_mailto(&self, mailto: &str) -> Result<(SessionId, ViewId), SessionError> {
        let draft = parse_mailto(mailto)?;
        let session = self.open_window(false)?;
        let view = self.push_view(session, ViewSpec::new(ViewKind::composer(draft)))?;
        Ok((session, view))
    }

    /// Appends a view, focuses it and starts keeping it fresh.
    pub fn push_view(&self, session: SessionId, spec: ViewSpec) -> Result<ViewId, SessionError> {
        let mut sessions = self.shared.lock();
        let state = sessions
            .get_mut(&session)
            .ok_or(SessionError::UnknownSession(session))?;

        let view = ViewId::new();
        let subscription = self.shared.bus.subscribe(
            format!("view {view}"),
            EventFilter::only(spec.kind.event_filter()),
        )?;
        let subscription_id = subscription.id();
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(worker::run(
            self.shared.clone(),
            session,
            view,
            subscription,
            stop_rx,
        ));

        tracing::debug!(session = %session, view = %view, title = %spec.kind.title(), "view pushed");
        state.views.push(ViewState {
            id: view,
            kind: spec.kind,
            invincible: spec.invincible,
            cache: None,
            dirty: false,
            known_revision: None,
            generation: 0,
            pending_send: None,
            failed_send: None,
            last_error: None,
            subscription: subscription_id,
            stop,
            worker: Some(handle),
        });
        state.focused = Some(view);
        Ok(view)
    }

    /// Closes one view. An implicit close of an invincible view is refused.
    /// Closing the focused view moves focus to its predecessor.
    pub fn close_view(
        &self,
        session: SessionId,
        view: ViewId,
        mode: CloseMode,
    ) -> Result<(), SessionError> {
        let removed = {
            let mut sessions = self.shared.lock();
            let state = sessions
                .get_mut(&session)
                .ok_or(SessionError::UnknownSession(session))?;
            let index = state
                .views
                .iter()
                .position(|candidate| candidate.id == view)
                .ok_or(SessionError::UnknownView(view))?;
            if state.views[index].invincible && mode == CloseMode::Implicit {
                return Err(SessionError::ViewInvincible(view));
            }

            let removed = state.views.remove(index);
            if state.focused == Some(view) {
                state.focused = match index {
                    0 => state.views.first().map(|next| next.id),
                    _ => Some(state.views[index - 1].id),
                };
            }
            removed
        };

        tracing::debug!(session = %session, view = %view, ?mode, "view closed");
        // The worker winds down on its own.
        drop(self.shared.detach(removed));
        Ok(())
    }

    /// Closes every view that is not invincible and returns the ids it
    /// closed. Views closed concurrently meanwhile are skipped.
    pub fn close_all(&self, session: SessionId) -> Result<Vec<ViewId>, SessionError> {
        let closable = {
            let sessions = self.shared.lock();
            let state = sessions
                .get(&session)
                .ok_or(SessionError::UnknownSession(session))?;
            state
                .views
                .iter()
                .filter(|view| !view.invincible)
                .map(|view| view.id)
                .collect::<Vec<_>>()
        };
        let mut closed = Vec::with_capacity(closable.len());
        for view in closable {
            match self.close_view(session, view, CloseMode::Implicit) {
                Ok(()) => closed.push(view),
                Err(SessionError::UnknownView(_)) => {
                    tracing::debug!(session = %session, view = %view, "view already closed");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(closed)
    }

    pub fn focus_view(&self, session: SessionId, view: ViewId) -> Result<(), SessionError> {
        let mut sessions = self.shared.lock();
        let state = sessions
            .get_mut(&session)
            .ok_or(SessionError::UnknownSession(session))?;
        if !state.views.iter().any(|candidate| candidate.id == view) {
            return Err(SessionError::UnknownView(view));
        }
        state.focused = Some(view);
        Ok(())
    }

    /// Detaches every view of the window from the bus and waits for their
    /// workers to stop.
    pub async fn close_window(&self, session: SessionId) -> Result<(), SessionError> {
        let state = self
            .shared
            .lock()
            .remove(&session)
            .ok_or(SessionError::UnknownSession(session))?;
        let views = state.views.len();
        self.shared.stop_views(state.views).await;
        tracing::info!(session = %session, views, "window closed");
        Ok(())
    }

    pub async fn close_all_windows(&self) {
        let sessions = self.shared.lock().drain().collect::<Vec<_>>();
        for (session, state) in sessions {
            self.shared.stop_views(state.views).await;
            tracing::info!(session = %session, "window closed");
        }
    }

    /// Re-queries the view now.
    pub async fn refresh_view(
        &self,
        session: SessionId,
        view: ViewId,
    ) -> Result<ViewSnapshot, SessionError> {
        self.shared.refresh(session, view).await?;
        self.view(session, view)
    }

    /// Replaces a composer's draft.
    pub fn update_draft(
        &self,
        session: SessionId,
        view: ViewId,
        draft: ComposedMessage,
    ) -> Result<(), SessionError> {
        let mut sessions = self.shared.lock();
        let state = view_mut(&mut sessions, session, view)?;
        match &mut state.kind {
            ViewKind::Composer { draft: current, .. } => {
                *current = draft;
                Ok(())
            }
            _ => Err(SessionError::NotAComposer(view)),
        }
    }

    /// Submits the composer's draft for sending. The composer keeps its
    /// draft; the outcome is reported to the render sink.
    pub fn send_draft(&self, session: SessionId, view: ViewId) -> Result<ActionId, SessionError> {
        let mut sessions = self.shared.lock();
        let state = view_mut(&mut sessions, session, view)?;
        let ViewKind::Composer { draft, in_reply_to } = &state.kind else {
            return Err(SessionError::NotAComposer(view));
        };

        // Submitted under the session lock so the outcome cannot be routed
        // before the composer knows which action to wait for.
        let action = self.shared.actions.submit(ActionRequest::send(
            draft.clone(),
            in_reply_to.iter().cloned(),
        ))?;
        state.pending_send = Some(action);
        state.failed_send = None;
        tracing::info!(session = %session, view = %view, action = %action, "draft submitted");
        Ok(action)
    }

    /// Submits an action over messages shown by a view. The view is
    /// re-queried first unless its cache was read at the store's current
    /// revision, so the targets never come from outdated results.
    pub async fn submit_for_view(
        &self,
        session: SessionId,
        view: ViewId,
        kind: ActionKind,
        payload: ActionPayload,
        selection: Selection,
    ) -> Result<ActionId, SessionError> {
        let cached = {
            let mut sessions = self.shared.lock();
            let state = view_mut(&mut sessions, session, view)?;
            match &state.cache {
                Some(cache) if !state.dirty => Some((cache.ids(), cache.revision)),
                _ => None,
            }
        };
        // A change may be visible in the store before its notification
        // reached this view's worker.
        let current = self.shared.store.current_revision().await?;

        let shown = match cached {
            Some((ids, revision)) if revision == Some(current) => ids,
            _ => {
                tracing::debug!(view = %view, "revalidating stale view before acting");
                self.shared
                    .refresh(session, view)
                    .await?
                    .into_iter()
                    .flat_map(|result| result.ids)
                    .collect::<BTreeSet<_>>()
            }
        };

        let targets = match selection {
            Selection::All => shown,
            Selection::Ids(chosen) => chosen.intersection(&shown).cloned().collect(),
        };
        Ok(self
            .shared
            .actions
            .submit(ActionRequest::new(kind, targets, payload))?)
    }

    pub fn view(&self, session: SessionId, view: ViewId) -> Result<ViewSnapshot, SessionError> {
        let sessions = self.shared.lock();
        let state = sessions
            .get(&session)
            .ok_or(SessionError::UnknownSession(session))?;
        state
            .views
            .iter()
            .find(|candidate| candidate.id == view)
            .map(|found| snapshot(session, state, found))
            .ok_or(SessionError::UnknownView(view))
    }

    /// The window's views in stack order.
    pub fn views(&self, session: SessionId) -> Result<Vec<ViewSnapshot>, SessionError> {
        let sessions = self.shared.lock();
        let state = sessions
            .get(&session)
            .ok_or(SessionError::UnknownSession(session))?;
        Ok(state
            .views
            .iter()
            .map(|view| snapshot(session, state, view))
            .collect())
    }

    pub fn focused(&self, session: SessionId) -> Result<Option<ViewId>, SessionError> {
        self.shared
            .lock()
            .get(&session)
            .map(|state| state.focused)
            .ok_or(SessionError::UnknownSession(session))
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut sessions = self.shared.lock().keys().copied().collect::<Vec<_>>();
        sessions.sort();
        sessions
    }
}

impl ControllerShared {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops event delivery to a removed view and signals its worker.
    fn detach(&self, view: ViewState) -> Option<JoinHandle<()>> {
        self.bus.detach(view.subscription);
        let _ = view.stop.send(true);
        view.worker
    }

    async fn stop_views(&self, views: Vec<ViewState>) {
        let handles = views
            .into_iter()
            .filter_map(|view| self.detach(view))
            .collect::<Vec<_>>();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("view worker ended abnormally: {err}");
            }
        }
    }

    /// Applies a bus event to one view's state.
    pub(super) fn deliver(&self, session: SessionId, view: ViewId, event: &Event) -> Delivery {
        let delivery = {
            let mut sessions = self.lock();
            let Ok(state) = view_mut(&mut sessions, session, view) else {
                return Delivery::Ignored;
            };
            match view::route(&state.kind, state.cache.as_ref(), state.pending_send, event) {
                Routing::Ignore => Delivery::Ignored,
                Routing::Invalidate(revision) => {
                    state.dirty = true;
                    state.generation += 1;
                    if revision.is_some() {
                        state.known_revision = revision;
                    }
                    Delivery::Invalidated
                }
                Routing::SendFinished { action, failure } => {
                    state.pending_send = None;
                    state.failed_send = failure.as_ref().map(|_| action);
                    Delivery::SendFinished { action, failure }
                }
            }
        };

        if let Delivery::SendFinished { action, failure } = &delivery {
            match failure {
                None => {
                    tracing::info!(view = %view, action = %action, "draft sent");
                    self.sink.draft_sent(session, view, *action);
                }
                Some(reason) => {
                    tracing::warn!(view = %view, action = %action, "draft not sent: {reason}");
                    self.sink.draft_failed(session, view, *action, reason);
                }
            }
        }
        delivery
    }

    /// Re-runs the view's queries and caches the results unless the view
    /// was invalidated again meanwhile. Returns what the store answered
    /// either way.
    pub(super) async fn refresh(
        &self,
        session: SessionId,
        view: ViewId,
    ) -> Result<Vec<QueryResult>, SessionError> {
        let (queries, generation) = {
            let mut sessions = self.lock();
            let state = view_mut(&mut sessions, session, view)?;
            (state.kind.queries(), state.generation)
        };

        match self.read(&queries).await {
            Ok((results, revision)) => {
                let snapshot = {
                    let mut sessions = self.lock();
                    let Some(session_state) = sessions.get_mut(&session) else {
                        return Ok(results);
                    };
                    let focused = session_state.focused;
                    let Some(state) = session_state
                        .views
                        .iter_mut()
                        .find(|candidate| candidate.id == view)
                    else {
                        return Ok(results);
                    };
                    if state.generation == generation {
                        state.cache = Some(ResultCache {
                            results: results.clone(),
                            revision,
                        });
                        state.dirty = false;
                        state.last_error = None;
                    } else {
                        tracing::debug!(view = %view, "refresh overtaken by a newer change");
                    }
                    snapshot_with_focus(session, focused, state)
                };
                self.sink.view_refreshed(&snapshot);
                Ok(results)
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(view = %view, "view refresh failed: {message}");
                if let Ok(state) = view_mut(&mut self.lock(), session, view) {
                    state.last_error = Some(message.clone());
                }
                self.sink.view_failed(session, view, &message);
                Err(err.into())
            }
        }
    }

    async fn read(
        &self,
        queries: &[String],
    ) -> Result<(Vec<QueryResult>, Option<Revision>), StorageError> {
        let revision = self.store.current_revision().await?;
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            let ids: Vec<MessageId> = self.store.query(query).await?;
            results.push(QueryResult {
                query: query.clone(),
                ids,
            });
        }
        Ok((results, Some(revision)))
    }
}

fn view_mut<'a>(
    sessions: &'a mut HashMap<SessionId, Session>,
    session: SessionId,
    view: ViewId,
) -> Result<&'a mut ViewState, SessionError> {
    sessions
        .get_mut(&session)
        .ok_or(SessionError::UnknownSession(session))?
        .views
        .iter_mut()
        .find(|candidate| candidate.id == view)
        .ok_or(SessionError::UnknownView(view))
}

fn snapshot(session: SessionId, state: &Session, view: &ViewState) -> ViewSnapshot {
    snapshot_with_focus(session, state.focused, view)
}

fn snapshot_with_focus(session: SessionId, focused: Option<ViewId>, view: &ViewState) -> ViewSnapshot {
    ViewSnapshot {
        session,
        id: view.id,
        kind: view.kind.clone(),
        invincible: view.invincible,
        focused: focused == Some(view.id),
        stale: view.is_stale(),
        cache: view.cache.clone(),
        known_revision: view.known_revision,
        pending_send: view.pending_send,
        failed_send: view.failed_send,
        last_error: view.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::Watermark;
    use crate::session::NullRenderSink;
    use crate::transport::UnconfiguredTransport;
    use chrono::Utc;
    use comet_config::ActionsConfig;
    use comet_core::{MessageRecord, ThreadId};
    use comet_storage::MemoryStore;
    use tokio::time::{sleep, timeout};

    fn record(id: &str, tags: &[&str]) -> MessageRecord {
        MessageRecord {
            id: MessageId::from(id),
            thread: ThreadId::from(format!("t{id}").as_str()),
            folder: "inbox".to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            subject: format!("subject {id}"),
            date: Utc::now(),
        }
    }

    fn controller(store: &MemoryStore, bus: &NotificationBus) -> SessionController {
        let config = AppConfig::default();
        let actions = ActionManager::new(
            Arc::new(store.clone()),
            Arc::new(UnconfiguredTransport),
            bus.clone(),
            Watermark::new(),
            &ActionsConfig::default(),
            config.tags.clone(),
        );
        SessionController::new(
            Arc::new(store.clone()),
            bus.clone(),
            actions,
            Arc::new(NullRenderSink),
            &config,
        )
    }

    async fn wait_fresh(sessions: &SessionController, session: SessionId, view: ViewId) -> ViewSnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = sessions.view(session, view).expect("view exists");
                if !snapshot.stale {
                    return snapshot;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("view refreshed in time")
    }

    #[tokio::test]
    async fn default_window_opens_invincible_startup_views() {
        let store = MemoryStore::with_messages([record("1", &["inbox"])]);
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);

        let session = sessions.open_window(true).expect("window opened");
        let views = sessions.views(session).expect("views");
        assert_eq!(views.len(), 1);
        assert!(views[0].invincible);
        assert!(views[0].focused);
        assert_eq!(bus.subscriber_count(), 1);

        let fresh = wait_fresh(&sessions, session, views[0].id).await;
        let cache = fresh.cache.expect("cache filled");
        assert_eq!(cache.results[0].ids, vec![MessageId::from("1")]);
    }

    #[tokio::test]
    async fn closing_focused_view_focuses_predecessor() {
        let store = MemoryStore::new();
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(false).expect("window opened");

        let first = sessions
            .push_view(session, ViewSpec::new(ViewKind::thread_list("a", "tag:a")))
            .expect("pushed");
        let second = sessions
            .push_view(session, ViewSpec::new(ViewKind::thread_list("b", "tag:b")))
            .expect("pushed");
        assert_eq!(sessions.focused(session).expect("session"), Some(second));

        sessions
            .close_view(session, second, CloseMode::Implicit)
            .expect("closed");
        assert_eq!(sessions.focused(session).expect("session"), Some(first));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn invincible_view_refuses_implicit_close_only() {
        let store = MemoryStore::new();
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(false).expect("window opened");
        let view = sessions
            .push_view(
                session,
                ViewSpec::new(ViewKind::thread_list("inbox", "tag:inbox")).invincible(),
            )
            .expect("pushed");

        let err = sessions
            .close_view(session, view, CloseMode::Implicit)
            .expect_err("refused");
        assert!(matches!(err, SessionError::ViewInvincible(id) if id == view));
        sessions
            .close_view(session, view, CloseMode::Explicit)
            .expect("explicit close");
        assert!(sessions.views(session).expect("views").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bulk_close_tolerates_views_closed_concurrently() {
        let store = MemoryStore::new();
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(false).expect("window opened");
        let views = (0..50)
            .map(|n| {
                sessions
                    .push_view(
                        session,
                        ViewSpec::new(ViewKind::thread_list(format!("q{n}"), format!("tag:q{n}"))),
                    )
                    .expect("pushed")
            })
            .collect::<Vec<_>>();

        let racer = {
            let sessions = sessions.clone();
            let views = views.clone();
            tokio::task::spawn_blocking(move || {
                views
                    .iter()
                    .rev()
                    .filter(|view| {
                        sessions
                            .close_view(session, **view, CloseMode::Explicit)
                            .is_ok()
                    })
                    .count()
            })
        };
        let closed = sessions.close_all(session).expect("bulk close completes");
        let closed_by_racer = racer.await.expect("racer finished");

        assert_eq!(closed.len() + closed_by_racer, views.len());
        assert!(sessions.views(session).expect("views").is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stale_view_is_requeried_before_acting() {
        let store = MemoryStore::with_messages([record("1", &["inbox"])]);
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(false).expect("window opened");
        let view = sessions
            .push_view(session, ViewSpec::new(ViewKind::thread_list("inbox", "tag:inbox")))
            .expect("pushed");
        wait_fresh(&sessions, session, view).await;

        // Appears on disk and becomes visible after a refresh, but the view
        // has not heard about it.
        store.external().insert(record("2", &["inbox"]));
        store.refresh().await.expect("refreshed");
        bus.publish(Event::StoreChanged {
            revision: store.current_revision().await.expect("revision"),
        });

        timeout(Duration::from_secs(5), async {
            while !sessions.view(session, view).expect("view").stale {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .ok();

        let action = sessions
            .submit_for_view(
                session,
                view,
                ActionKind::Archive,
                ActionPayload::Archive,
                Selection::All,
            )
            .await
            .expect("submitted");
        let done = timeout(Duration::from_secs(5), sessions.shared.actions.wait(action))
            .await
            .expect("finished")
            .expect("tracked");
        assert_eq!(done.targets().len(), 2);
    }

    #[tokio::test]
    async fn change_not_yet_routed_still_forces_a_requery() {
        let store = MemoryStore::with_messages([record("1", &["inbox"])]);
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(false).expect("window opened");
        let view = sessions
            .push_view(session, ViewSpec::new(ViewKind::thread_list("inbox", "tag:inbox")))
            .expect("pushed");
        wait_fresh(&sessions, session, view).await;

        let writer = store.external();
        writer.remove_tag(&MessageId::from("1"), "inbox");
        writer.insert(record("2", &["inbox"]));
        store.refresh().await.expect("refreshed");
        bus.publish(Event::StoreChanged {
            revision: store.current_revision().await.expect("revision"),
        });

        let action = sessions
            .submit_for_view(
                session,
                view,
                ActionKind::Archive,
                ActionPayload::Archive,
                Selection::All,
            )
            .await
            .expect("submitted");
        let submitted = sessions.shared.actions.action(action).expect("tracked");
        assert_eq!(
            submitted.targets().iter().collect::<Vec<_>>(),
            vec![&MessageId::from("2")]
        );
    }

    #[tokio::test]
    async fn selection_is_limited_to_shown_messages() {
        let store = MemoryStore::with_messages([record("1", &["inbox"]), record("2", &[])]);
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(false).expect("window opened");
        let view = sessions
            .push_view(session, ViewSpec::new(ViewKind::thread_list("inbox", "tag:inbox")))
            .expect("pushed");
        wait_fresh(&sessions, session, view).await;

        let chosen = ["1", "2"].map(MessageId::from).into_iter().collect();
        let action = sessions
            .submit_for_view(
                session,
                view,
                ActionKind::Delete,
                ActionPayload::Delete,
                Selection::Ids(chosen),
            )
            .await
            .expect("submitted");
        let submitted = sessions.shared.actions.action(action).expect("tracked");
        assert_eq!(
            submitted.targets().iter().collect::<Vec<_>>(),
            vec![&MessageId::from("1")]
        );
    }

    #[tokio::test]
    async fn mailto_opens_a_composer_window() {
        let store = MemoryStore::new();
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let (session, view) = sessions
            .open_mailto("mailto:bob@example.com?subject=Hi")
            .expect("opened");
        let snapshot = sessions.view(session, view).expect("view");
        match snapshot.kind {
            ViewKind::Composer { draft, .. } => assert_eq!(draft.subject, "Hi"),
            other => panic!("expected composer, got {other:?}"),
        }
        assert!(sessions.open_mailto("mailto:").is_err());
        assert_eq!(sessions.sessions().len(), 1);
    }

    #[tokio::test]
    async fn close_window_leaves_no_subscriptions() {
        let store = MemoryStore::new();
        let bus = NotificationBus::new();
        let sessions = controller(&store, &bus);
        let session = sessions.open_window(true).expect("window opened");
        sessions
            .push_view(session, ViewSpec::new(ViewKind::thread_list("all", "*")))
            .expect("pushed");
        assert_eq!(bus.subscriber_count(), 2);

        sessions.close_window(session).await.expect("closed");
        assert_eq!(bus.subscriber_count(), 0);
        assert!(matches!(
            sessions.views(session),
            Err(SessionError::UnknownSession(_))
        ));
    }
}
