use comet_core::ActionId;
use comet_storage::StorageError;
use thiserror::Error;

use crate::session::{SessionId, ViewId};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("notification bus is closed")]
    Closed,
}

/// Rejections of action manager requests. None of them changes any state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("unknown action {0}")]
    UnknownAction(ActionId),
    #[error("action {0} has no undo available")]
    NoUndoAvailable(ActionId),
    #[error("action {0} is already running")]
    AlreadyRunning(ActionId),
    #[error("action {0} did not fail and cannot be resubmitted")]
    NotResubmittable(ActionId),
    #[error("action has no targets")]
    EmptyTargets,
    #[error("payload does not match the action kind")]
    InvalidPayload,
    #[error("action manager is shutting down")]
    ShuttingDown,
}

/// Why an action failed while executing; recorded on the action.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Store(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("action {0} left nothing to revert")]
    NothingToRevert(ActionId),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("poll loop is not paused")]
    NotPaused,
    #[error("poll loop has stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("unknown view {0}")]
    UnknownView(ViewId),
    #[error("view {0} is invincible and only closes on explicit request")]
    ViewInvincible(ViewId),
    #[error("view {0} is not a composer")]
    NotAComposer(ViewId),
    #[error("invalid mailto: {0}")]
    InvalidMailto(String),
    #[error(transparent)]
    Store(#[from] StorageError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
