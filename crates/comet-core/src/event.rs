use crate::{ActionId, ActionKind, ActionOutcome, Revision, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static GLOBAL_SCOPE: Scope = Scope::Global;

/// Notifications carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// The store changed in an unknown way, detected by polling.
    StoreChanged { revision: Revision },
    /// An action finished, successfully or not.
    ActionCompleted {
        id: ActionId,
        kind: ActionKind,
        scope: Scope,
        outcome: ActionOutcome,
        /// Store revision after the commit, when there was one.
        revision: Option<Revision>,
    },
    /// A poll started.
    PollTick { at: DateTime<Utc> },
    /// Polling has failed repeatedly; emitted once per failure streak.
    PollWarning {
        consecutive_failures: u32,
        reason: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StoreChanged { .. } => EventKind::StoreChanged,
            Event::ActionCompleted { .. } => EventKind::ActionCompleted,
            Event::PollTick { .. } => EventKind::PollTick,
            Event::PollWarning { .. } => EventKind::PollWarning,
        }
    }

    /// The identifiers the event concerns, for events that concern the store.
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            Event::StoreChanged { .. } => Some(&GLOBAL_SCOPE),
            Event::ActionCompleted { scope, .. } => Some(scope),
            Event::PollTick { .. } | Event::PollWarning { .. } => None,
        }
    }

    /// The store revision this event makes known, if any.
    pub fn revision(&self) -> Option<Revision> {
        match self {
            Event::StoreChanged { revision } => Some(*revision),
            Event::ActionCompleted { revision, .. } => *revision,
            Event::PollTick { .. } | Event::PollWarning { .. } => None,
        }
    }

    /// Whether the event means store contents may differ from what was read before.
    pub fn invalidates(&self) -> bool {
        match self {
            Event::StoreChanged { .. } => true,
            Event::ActionCompleted { outcome, .. } => outcome.is_success(),
            Event::PollTick { .. } | Event::PollWarning { .. } => false,
        }
    }
}

/// Event kinds for subscription filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    StoreChanged,
    ActionCompleted,
    PollTick,
    PollWarning,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::StoreChanged,
        EventKind::ActionCompleted,
        EventKind::PollTick,
        EventKind::PollWarning,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageId;
    use uuid::Uuid;

    #[test]
    fn store_changed_is_global() {
        let event = Event::StoreChanged {
            revision: Revision::from_raw(3),
        };
        assert!(event.scope().expect("scope").is_global());
        assert!(event.invalidates());
    }

    #[test]
    fn failed_actions_do_not_invalidate() {
        let event = Event::ActionCompleted {
            id: Uuid::new_v4(),
            kind: ActionKind::Tag,
            scope: Scope::Targets([MessageId::from("42")].into_iter().collect()),
            outcome: ActionOutcome::Failed {
                reason: "store unavailable".to_string(),
            },
            revision: None,
        };
        assert_eq!(event.kind(), EventKind::ActionCompleted);
        assert!(!event.invalidates());
        assert!(event.revision().is_none());
    }

    #[test]
    fn tick_has_no_scope() {
        let event = Event::PollTick { at: Utc::now() };
        assert!(event.scope().is_none());
    }
}
