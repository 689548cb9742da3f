//! Windows, their view stacks, and keeping every view coherent with the store.

mod controller;
mod mailto;
mod view;
mod worker;

pub use controller::SessionController;
pub use mailto::parse_mailto;
pub use view::{
    CloseMode, QueryResult, ResultCache, Selection, ViewKind, ViewSnapshot, ViewSpec,
};

use comet_core::ActionId;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ViewId(Uuid);

impl ViewId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Rendering collaborator. Calls arrive on view worker tasks and must not block.
pub trait RenderSink: Send + Sync {
    fn view_refreshed(&self, _view: &ViewSnapshot) {}

    fn view_failed(&self, _session: SessionId, _view: ViewId, _error: &str) {}

    fn draft_sent(&self, _session: SessionId, _view: ViewId, _action: ActionId) {}

    fn draft_failed(&self, _session: SessionId, _view: ViewId, _action: ActionId, _reason: &str) {}
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRenderSink;

impl RenderSink for NullRenderSink {}
