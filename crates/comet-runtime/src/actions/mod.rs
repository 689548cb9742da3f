//! User-initiated mutations against the mail store.
//!
//! Every action runs on its own task. Actions sharing a target run one at a
//! time in submission order; disjoint actions run concurrently. Completion,
//! successful or not, is announced on the bus with the action's targets as
//! the event scope before the next action on those targets may start.

mod apply;
mod history;
mod queue;

pub use history::HistoryEntry;

use crate::bus::NotificationBus;
use crate::error::{ActionError, ExecutionError};
use crate::poll::Watermark;
use crate::transport::Transport;
use apply::{apply, inverse_kind};
use chrono::Utc;
use comet_config::{ActionsConfig, TagConfig};
use comet_core::{
    Action, ActionId, ActionOutcome, ActionPayload, ActionRequest, ActionState, Event, MessageId,
    Revision, Scope,
};
use comet_storage::{Commit, MailStore};
use history::UndoHistory;
use queue::TargetQueues;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone)]
pub struct ActionManager {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn MailStore>,
    transport: Arc<dyn Transport>,
    bus: NotificationBus,
    watermark: Watermark,
    tags: TagConfig,
    state: Mutex<ManagerState>,
    /// Signalled whenever an action finishes or is cancelled.
    turn: Notify,
}

struct ManagerState {
    actions: HashMap<ActionId, Tracked>,
    queues: TargetQueues,
    history: UndoHistory,
    tasks: HashMap<ActionId, JoinHandle<()>>,
    /// Done and cancelled actions, oldest first.
    finished: VecDeque<ActionId>,
    retain: usize,
    closing: bool,
}

struct Tracked {
    action: Action,
    /// Targets holding a ticket. A deferred revert may narrow its request
    /// once resolved; the tickets still cover what was submitted.
    enqueued: BTreeSet<MessageId>,
    revert_requested: bool,
}

struct Executed {
    request: ActionRequest,
    undo: Option<ActionRequest>,
    commit: Option<Commit>,
}

impl ActionManager {
    pub fn new(
        store: Arc<dyn MailStore>,
        transport: Arc<dyn Transport>,
        bus: NotificationBus,
        watermark: Watermark,
        config: &ActionsConfig,
        tags: TagConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                transport,
                bus,
                watermark,
                tags,
                state: Mutex::new(ManagerState {
                    actions: HashMap::new(),
                    queues: TargetQueues::default(),
                    history: UndoHistory::new(config.history_limit, config.undo_window()),
                    tasks: HashMap::new(),
                    finished: VecDeque::new(),
                    retain: config.history_limit.max(1),
                    closing: false,
                }),
                turn: Notify::new(),
            }),
        }
    }

    /// Queues a mutation and returns at once. Must be called within a Tokio
    /// runtime.
    pub fn submit(&self, request: ActionRequest) -> Result<ActionId, ActionError> {
        if matches!(request.payload, ActionPayload::Revert { .. }) {
            return Err(ActionError::InvalidPayload);
        }
        let mut state = self.shared.lock();
        self.enqueue(&mut state, request)
    }

    /// Submits the inverse of `id`.
    ///
    /// A finished action is reverted from the undo history. An action that
    /// has not finished yet gets a deferred revert queued behind it on the
    /// same targets, resolved once it completes.
    pub fn undo(&self, id: ActionId) -> Result<ActionId, ActionError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.closing {
            return Err(ActionError::ShuttingDown);
        }
        let tracked = state
            .actions
            .get_mut(&id)
            .ok_or(ActionError::UnknownAction(id))?;
        if tracked.revert_requested {
            return Err(ActionError::NoUndoAvailable(id));
        }

        let request = match tracked.action.state {
            ActionState::Done => state
                .history
                .take(id)
                .ok_or(ActionError::NoUndoAvailable(id))?,
            ActionState::Pending | ActionState::Running => {
                let kind =
                    inverse_kind(tracked.action.kind()).ok_or(ActionError::NoUndoAvailable(id))?;
                ActionRequest::new(
                    kind,
                    tracked.action.targets().clone(),
                    ActionPayload::Revert { of: id },
                )
            }
            ActionState::Failed | ActionState::Cancelled => {
                return Err(ActionError::NoUndoAvailable(id))
            }
        };

        tracked.revert_requested = true;
        let undo_id = self.enqueue(state, request)?;
        tracing::info!(action = %id, undo = %undo_id, "undo submitted");
        Ok(undo_id)
    }

    /// Withdraws an action that has not started executing.
    pub fn cancel(&self, id: ActionId) -> Result<(), ActionError> {
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let tracked = state
                .actions
                .get(&id)
                .ok_or(ActionError::UnknownAction(id))?;
            if tracked.action.state != ActionState::Pending {
                return Err(ActionError::AlreadyRunning(id));
            }
            self.shared.cancel_pending(state, id);
        }
        self.shared.turn.notify_waiters();
        Ok(())
    }

    /// Submits a failed or cancelled action's request again, under a new id.
    /// A failed send carries its composed message along.
    pub fn resubmit(&self, id: ActionId) -> Result<ActionId, ActionError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let tracked = state
            .actions
            .get(&id)
            .ok_or(ActionError::UnknownAction(id))?;
        let resubmittable = matches!(
            tracked.action.state,
            ActionState::Failed | ActionState::Cancelled
        ) && !matches!(tracked.action.request.payload, ActionPayload::Revert { .. });
        if !resubmittable {
            return Err(ActionError::NotResubmittable(id));
        }

        let request = tracked.action.request.clone();
        let new_id = self.enqueue(state, request)?;
        state.actions.remove(&id);
        tracing::info!(action = %id, resubmitted = %new_id, "action resubmitted");
        Ok(new_id)
    }

    /// Forgets a finished action, typically a failure the user acknowledged.
    pub fn dismiss(&self, id: ActionId) -> Result<(), ActionError> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let tracked = state
            .actions
            .get(&id)
            .ok_or(ActionError::UnknownAction(id))?;
        if !tracked.action.state.is_finished() {
            return Err(ActionError::AlreadyRunning(id));
        }
        state.actions.remove(&id);
        state.history.take(id);
        Ok(())
    }

    pub fn action(&self, id: ActionId) -> Option<Action> {
        self.shared
            .lock()
            .actions
            .get(&id)
            .map(|tracked| tracked.action.clone())
    }

    /// Every tracked action, in submission order.
    pub fn actions(&self) -> Vec<Action> {
        let mut actions = self
            .shared
            .lock()
            .actions
            .values()
            .map(|tracked| tracked.action.clone())
            .collect::<Vec<_>>();
        actions.sort_by_key(|action| action.submitted_at);
        actions
    }

    pub fn failed(&self) -> Vec<Action> {
        self.actions()
            .into_iter()
            .filter(|action| action.state == ActionState::Failed)
            .collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.lock().history.entries()
    }

    /// Waits until `id` reaches a terminal state and returns its final snapshot.
    pub async fn wait(&self, id: ActionId) -> Result<Action, ActionError> {
        loop {
            let notified = self.shared.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.lock();
                let tracked = state
                    .actions
                    .get(&id)
                    .ok_or(ActionError::UnknownAction(id))?;
                if tracked.action.state.is_finished() {
                    return Ok(tracked.action.clone());
                }
            }
            notified.await;
        }
    }

    pub fn is_closing(&self) -> bool {
        self.shared.lock().closing
    }

    /// Refuses new work, cancels pending actions and waits for running ones.
    pub async fn close(&self) {
        let handles = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            state.closing = true;
            let pending = state
                .actions
                .iter()
                .filter(|(_, tracked)| tracked.action.state == ActionState::Pending)
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in &pending {
                self.shared.cancel_pending(state, *id);
            }
            tracing::info!(cancelled = pending.len(), "action manager closing");
            state
                .tasks
                .drain()
                .map(|(_, handle)| handle)
                .collect::<Vec<_>>()
        };
        self.shared.turn.notify_waiters();

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("action task ended abnormally: {err}");
            }
        }
        self.shared.lock().history.clear();
        tracing::info!("action manager closed");
    }

    fn enqueue(
        &self,
        state: &mut ManagerState,
        request: ActionRequest,
    ) -> Result<ActionId, ActionError> {
        if !request.payload.matches(request.kind) {
            return Err(ActionError::InvalidPayload);
        }
        if request.targets.is_empty() && !matches!(request.payload, ActionPayload::Send { .. }) {
            return Err(ActionError::EmptyTargets);
        }
        if state.closing {
            return Err(ActionError::ShuttingDown);
        }

        let id = Uuid::new_v4();
        state.queues.enqueue(id, &request.targets);
        tracing::debug!(action = %id, kind = ?request.kind, targets = request.targets.len(), "action submitted");
        let enqueued = request.targets.clone();
        state.actions.insert(
            id,
            Tracked {
                enqueued,
                action: Action {
                    id,
                    request,
                    state: ActionState::Pending,
                    undo: None,
                    error: None,
                    submitted_at: Utc::now(),
                    finished_at: None,
                },
                revert_requested: false,
            },
        );
        let handle = tokio::spawn(run(self.shared.clone(), id));
        state.tasks.insert(id, handle);
        Ok(id)
    }
}

async fn run(shared: Arc<Shared>, id: ActionId) {
    let Some(request) = shared.wait_turn(id).await else {
        return;
    };
    let result = shared.execute(id, request).await;
    shared.finish(id, result);
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until `id` heads every target queue, then marks it running.
    /// Returns `None` when the action was withdrawn meanwhile.
    async fn wait_turn(&self, id: ActionId) -> Option<ActionRequest> {
        loop {
            let notified = self.turn.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut guard = self.lock();
                let state = &mut *guard;
                let Some(tracked) = state.actions.get_mut(&id) else {
                    state.tasks.remove(&id);
                    return None;
                };
                if tracked.action.state != ActionState::Pending {
                    state.tasks.remove(&id);
                    return None;
                }
                if state.queues.is_head(id, &tracked.enqueued) {
                    tracked.action.state = ActionState::Running;
                    tracing::debug!(action = %id, "action running");
                    return Some(tracked.action.request.clone());
                }
            }
            notified.await;
        }
    }

    async fn execute(&self, id: ActionId, request: ActionRequest) -> Result<Executed, ExecutionError> {
        let request = match request.payload {
            ActionPayload::Revert { of } => self
                .lock()
                .history
                .take(of)
                .ok_or(ExecutionError::NothingToRevert(of))?,
            _ => request,
        };

        if let ActionPayload::Send { message } = &request.payload {
            self.transport.send(message).await?;
            tracing::info!(action = %id, "message sent");
            if request.targets.is_empty() {
                return Ok(Executed {
                    request,
                    undo: None,
                    commit: None,
                });
            }
            // The message is out; failing to mark replies must not fail the send.
            return match self.write(&request).await {
                Ok((_, commit)) => Ok(Executed {
                    request,
                    undo: None,
                    commit: Some(commit),
                }),
                Err(err) => {
                    tracing::warn!(action = %id, "sent message but could not mark replies: {err}");
                    Ok(Executed {
                        request,
                        undo: None,
                        commit: None,
                    })
                }
            };
        }

        let (undo, commit) = self.write(&request).await?;
        Ok(Executed {
            request,
            undo,
            commit: Some(commit),
        })
    }

    async fn write(
        &self,
        request: &ActionRequest,
    ) -> Result<(Option<ActionRequest>, Commit), ExecutionError> {
        let mut tx = self.store.begin_write().await?;
        match apply(tx.as_mut(), request, &self.tags).await {
            Ok(undo) => {
                let commit = tx.commit().await?;
                Ok((undo, commit))
            }
            Err(err) => {
                if let Err(abort_err) = tx.abort().await {
                    tracing::warn!("failed to abort transaction: {abort_err}");
                }
                Err(err)
            }
        }
    }

    fn finish(&self, id: ActionId, result: Result<Executed, ExecutionError>) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.tasks.remove(&id);
            let Some(tracked) = state.actions.get_mut(&id) else {
                return;
            };

            let (outcome, revision) = match result {
                Ok(executed) => {
                    let revision = executed.commit.map(|commit| {
                        self.watermark.note_commit(commit);
                        commit.current
                    });
                    tracked.action.request = executed.request;
                    tracked.action.undo = executed.undo.clone();
                    tracked.action.state = ActionState::Done;
                    if let Some(undo) = executed.undo {
                        for evicted in state.history.push(id, undo) {
                            tracing::debug!(action = %evicted, "undo history entry evicted");
                        }
                    }
                    tracing::info!(action = %id, kind = ?tracked.action.kind(), "action completed");
                    (ActionOutcome::Success, revision)
                }
                Err(err) => {
                    let reason = err.to_string();
                    tracing::warn!(action = %id, kind = ?tracked.action.kind(), "action failed: {reason}");
                    tracked.action.state = ActionState::Failed;
                    tracked.action.error = Some(reason.clone());
                    (ActionOutcome::Failed { reason }, None)
                }
            };
            tracked.action.finished_at = Some(Utc::now());

            let action = tracked.action.clone();
            let enqueued = std::mem::take(&mut tracked.enqueued);
            self.announce(&action, outcome, revision);
            state.queues.remove(id, &enqueued);
            if action.state == ActionState::Done {
                state.finished.push_back(id);
                prune(state);
            }
        }
        self.turn.notify_waiters();
    }

    fn cancel_pending(&self, state: &mut ManagerState, id: ActionId) {
        let Some(tracked) = state.actions.get_mut(&id) else {
            return;
        };
        tracked.action.state = ActionState::Cancelled;
        tracked.action.finished_at = Some(Utc::now());
        let action = tracked.action.clone();
        let enqueued = std::mem::take(&mut tracked.enqueued);
        state.queues.remove(id, &enqueued);
        tracing::info!(action = %id, "action cancelled");
        self.announce(&action, ActionOutcome::Cancelled, None);
        state.finished.push_back(id);
        prune(state);
    }

    fn announce(&self, action: &Action, outcome: ActionOutcome, revision: Option<Revision>) {
        self.bus.publish(Event::ActionCompleted {
            id: action.id,
            kind: action.kind(),
            scope: Scope::Targets(action.targets().clone()),
            outcome,
            revision,
        });
    }
}

/// Keeps at most `retain` done or cancelled actions around. Failed actions
/// stay until dismissed or resubmitted.
fn prune(state: &mut ManagerState) {
    while state.finished.len() > state.retain {
        let Some(oldest) = state.finished.pop_front() else {
            break;
        };
        let revert_queued = state
            .actions
            .get(&oldest)
            .is_some_and(|tracked| tracked.revert_requested);
        if revert_queued && state.history.contains(oldest) {
            state.finished.push_back(oldest);
            break;
        }
        state.actions.remove(&oldest);
        state.history.take(oldest);
    }
}
