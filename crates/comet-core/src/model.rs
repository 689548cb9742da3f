use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Opaque message identifier issued by the mail store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Opaque thread identifier issued by the mail store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Change token of the mail store. Two revisions can only be compared for
/// equality: a different token means "something changed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// The set of identifiers an event or action concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Unknown extent; always assumed to overlap.
    Global,
    Targets(BTreeSet<MessageId>),
}

impl Scope {
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        match self {
            Self::Global => true,
            Self::Targets(targets) => targets.contains(id),
        }
    }

    /// Whether any of `ids` falls inside this scope.
    pub fn overlaps<'a>(&self, ids: impl IntoIterator<Item = &'a MessageId>) -> bool {
        match self {
            Self::Global => true,
            Self::Targets(targets) => ids.into_iter().any(|id| targets.contains(id)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub thread: ThreadId,
    pub folder: String,
    pub tags: BTreeSet<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
}

impl MessageRecord {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl MailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }
}

/// A message ready to hand to the transport. Encoding is the transport's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComposedMessage {
    pub from: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub subject: String,
    pub body: String,
}

pub type ActionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Tag,
    Untag,
    Move,
    Delete,
    Send,
    MarkRead,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDestination {
    Folder(String),
    /// Per-message folders; produced when undoing a move.
    PerMessage(std::collections::BTreeMap<MessageId, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ActionPayload {
    Tag { tag: String },
    Untag { tag: String },
    Move { destination: MoveDestination },
    Delete,
    Send { message: ComposedMessage },
    MarkRead,
    Archive,
    /// Inverse of another action, resolved once that action has completed.
    Revert { of: ActionId },
}

impl ActionPayload {
    pub fn matches(&self, kind: ActionKind) -> bool {
        matches!(
            (self, kind),
            (Self::Tag { .. }, ActionKind::Tag)
                | (Self::Untag { .. }, ActionKind::Untag)
                | (Self::Move { .. }, ActionKind::Move)
                | (Self::Delete, ActionKind::Delete)
                | (Self::Send { .. }, ActionKind::Send)
                | (Self::MarkRead, ActionKind::MarkRead)
                | (Self::Archive, ActionKind::Archive)
                | (Self::Revert { .. }, _)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub targets: BTreeSet<MessageId>,
    pub payload: ActionPayload,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, targets: BTreeSet<MessageId>, payload: ActionPayload) -> Self {
        Self {
            kind,
            targets,
            payload,
        }
    }

    pub fn tag<I: IntoIterator<Item = MessageId>>(targets: I, tag: impl Into<String>) -> Self {
        Self::new(
            ActionKind::Tag,
            targets.into_iter().collect(),
            ActionPayload::Tag { tag: tag.into() },
        )
    }

    pub fn untag<I: IntoIterator<Item = MessageId>>(targets: I, tag: impl Into<String>) -> Self {
        Self::new(
            ActionKind::Untag,
            targets.into_iter().collect(),
            ActionPayload::Untag { tag: tag.into() },
        )
    }

    pub fn move_to<I: IntoIterator<Item = MessageId>>(
        targets: I,
        folder: impl Into<String>,
    ) -> Self {
        Self::new(
            ActionKind::Move,
            targets.into_iter().collect(),
            ActionPayload::Move {
                destination: MoveDestination::Folder(folder.into()),
            },
        )
    }

    pub fn delete<I: IntoIterator<Item = MessageId>>(targets: I) -> Self {
        Self::new(
            ActionKind::Delete,
            targets.into_iter().collect(),
            ActionPayload::Delete,
        )
    }

    pub fn mark_read<I: IntoIterator<Item = MessageId>>(targets: I) -> Self {
        Self::new(
            ActionKind::MarkRead,
            targets.into_iter().collect(),
            ActionPayload::MarkRead,
        )
    }

    pub fn archive<I: IntoIterator<Item = MessageId>>(targets: I) -> Self {
        Self::new(
            ActionKind::Archive,
            targets.into_iter().collect(),
            ActionPayload::Archive,
        )
    }

    /// `in_reply_to` are the messages that get the replied tag once the
    /// transport accepted the message.
    pub fn send<I: IntoIterator<Item = MessageId>>(message: ComposedMessage, in_reply_to: I) -> Self {
        Self::new(
            ActionKind::Send,
            in_reply_to.into_iter().collect(),
            ActionPayload::Send { message },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl ActionState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ActionOutcome {
    Success,
    Failed { reason: String },
    Cancelled,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Snapshot of a tracked action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    #[serde(flatten)]
    pub request: ActionRequest,
    pub state: ActionState,
    pub undo: Option<ActionRequest>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        self.request.kind
    }

    pub fn targets(&self) -> &BTreeSet<MessageId> {
        &self.request.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> BTreeSet<MessageId> {
        raw.iter().map(|id| MessageId::from(*id)).collect()
    }

    #[test]
    fn global_scope_overlaps_everything() {
        let scope = Scope::Global;
        assert!(scope.overlaps(&ids(&["1"])));
        assert!(scope.contains(&MessageId::from("anything")));
    }

    #[test]
    fn targeted_scope_requires_shared_identifier() {
        let scope = Scope::Targets(ids(&["1", "2"]));
        assert!(scope.overlaps(&ids(&["2", "9"])));
        assert!(!scope.overlaps(&ids(&["8", "9"])));
        assert!(!scope.overlaps(&BTreeSet::new()));
    }

    #[test]
    fn revert_payload_fits_any_kind() {
        let payload = ActionPayload::Revert { of: Uuid::new_v4() };
        assert!(payload.matches(ActionKind::Untag));
        assert!(payload.matches(ActionKind::Move));
        assert!(!ActionPayload::Delete.matches(ActionKind::Archive));
    }

    #[test]
    fn action_serializes_request_inline() {
        let action = Action {
            id: Uuid::new_v4(),
            request: ActionRequest::tag([MessageId::from("42")], "flagged"),
            state: ActionState::Pending,
            undo: None,
            error: None,
            submitted_at: Utc::now(),
            finished_at: None,
        };
        let json = serde_json::to_value(&action).expect("action serialized");
        assert_eq!(json["kind"], "tag");
        assert_eq!(json["payload"]["tag"], "flagged");
        assert_eq!(json["targets"][0], "42");
    }
}
