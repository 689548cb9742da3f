use super::{SessionId, ViewId};
use comet_config::NamedQuery;
use comet_core::{
    ActionId, ComposedMessage, Event, EventKind, MessageId, Revision, Scope, ThreadId,
};
use serde::Serialize;
use std::collections::BTreeSet;

/// What a view shows. Views are a closed set; behaviour lives in the free
/// functions of this module rather than behind a trait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewKind {
    ThreadList {
        name: String,
        query: String,
    },
    ThreadDetail {
        thread: ThreadId,
    },
    Composer {
        draft: ComposedMessage,
        /// Messages that get the replied tag once the draft is sent.
        in_reply_to: BTreeSet<MessageId>,
    },
    SavedSearches {
        searches: Vec<NamedQuery>,
    },
}

impl ViewKind {
    pub fn thread_list(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self::ThreadList {
            name: name.into(),
            query: query.into(),
        }
    }

    pub fn composer(draft: ComposedMessage) -> Self {
        Self::Composer {
            draft,
            in_reply_to: BTreeSet::new(),
        }
    }

    pub fn title(&self) -> String {
        match self {
            Self::ThreadList { name, .. } => name.clone(),
            Self::ThreadDetail { thread } => format!("thread {thread}"),
            Self::Composer { draft, .. } if draft.subject.is_empty() => "new message".to_string(),
            Self::Composer { draft, .. } => draft.subject.clone(),
            Self::SavedSearches { .. } => "saved searches".to_string(),
        }
    }

    /// Store queries backing the view, in display order.
    pub fn queries(&self) -> Vec<String> {
        match self {
            Self::ThreadList { query, .. } => vec![query.clone()],
            Self::ThreadDetail { thread } => vec![format!("thread:{thread}")],
            Self::Composer { .. } => Vec::new(),
            Self::SavedSearches { searches } => {
                searches.iter().map(|search| search.query.clone()).collect()
            }
        }
    }

    pub(crate) fn event_filter(&self) -> Vec<EventKind> {
        match self {
            Self::Composer { .. } => vec![EventKind::ActionCompleted],
            _ => vec![EventKind::StoreChanged, EventKind::ActionCompleted],
        }
    }
}

/// A view to push, with its bulk-close protection.
#[derive(Debug, Clone)]
pub struct ViewSpec {
    pub kind: ViewKind,
    pub invincible: bool,
}

impl ViewSpec {
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            invincible: false,
        }
    }

    pub fn invincible(mut self) -> Self {
        self.invincible = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// The user closed this very view.
    Explicit,
    /// Bulk or programmatic close; invincible views refuse it.
    Implicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Ids(BTreeSet<MessageId>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultCache {
    pub results: Vec<QueryResult>,
    /// Store revision current when the results were read.
    pub revision: Option<Revision>,
}

impl ResultCache {
    pub fn ids(&self) -> BTreeSet<MessageId> {
        self.results
            .iter()
            .flat_map(|result| result.ids.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub session: SessionId,
    pub id: ViewId,
    pub kind: ViewKind,
    pub invincible: bool,
    pub focused: bool,
    /// An overlapping change was routed here since the last refresh, or the
    /// cache was never filled. A clear flag does not prove the cache matches
    /// the store's current revision.
    pub stale: bool,
    pub cache: Option<ResultCache>,
    pub known_revision: Option<Revision>,
    pub pending_send: Option<ActionId>,
    pub failed_send: Option<ActionId>,
    pub last_error: Option<String>,
}

/// Whether `scope` may touch anything the view shows.
///
/// Query-backed lists cannot prove disjointness: a change to any message may
/// make it start or stop matching. A thread detail view can, as its members
/// only change through the listed identifiers.
pub(crate) fn may_overlap(kind: &ViewKind, cache: Option<&ResultCache>, scope: &Scope) -> bool {
    match (kind, scope) {
        (_, Scope::Global) => true,
        (ViewKind::Composer { .. }, Scope::Targets(_)) => false,
        (ViewKind::ThreadDetail { .. }, Scope::Targets(targets)) => match cache {
            Some(cache) => cache
                .results
                .iter()
                .any(|result| result.ids.iter().any(|id| targets.contains(id))),
            None => true,
        },
        (ViewKind::ThreadList { .. } | ViewKind::SavedSearches { .. }, Scope::Targets(_)) => true,
    }
}

/// What a routed event means for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Routing {
    Ignore,
    /// The cache must be revalidated.
    Invalidate(Option<Revision>),
    SendFinished {
        action: ActionId,
        failure: Option<String>,
    },
}

pub(crate) fn route(
    kind: &ViewKind,
    cache: Option<&ResultCache>,
    pending_send: Option<ActionId>,
    event: &Event,
) -> Routing {
    if let (Some(pending), Event::ActionCompleted { id, outcome, .. }) = (pending_send, event) {
        if *id == pending {
            let failure = match outcome {
                comet_core::ActionOutcome::Success => None,
                comet_core::ActionOutcome::Failed { reason } => Some(reason.clone()),
                comet_core::ActionOutcome::Cancelled => Some("cancelled".to_string()),
            };
            return Routing::SendFinished {
                action: *id,
                failure,
            };
        }
    }

    if !event.invalidates() {
        return Routing::Ignore;
    }
    match event.scope() {
        Some(scope) if may_overlap(kind, cache, scope) => Routing::Invalidate(event.revision()),
        _ => Routing::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comet_core::{ActionKind, ActionOutcome};
    use uuid::Uuid;

    fn ids(raw: &[&str]) -> BTreeSet<MessageId> {
        raw.iter().map(|id| MessageId::from(*id)).collect()
    }

    fn cache(raw: &[&str]) -> ResultCache {
        ResultCache {
            results: vec![QueryResult {
                query: "thread:t1".to_string(),
                ids: raw.iter().map(|id| MessageId::from(*id)).collect(),
            }],
            revision: None,
        }
    }

    fn completed(id: ActionId, targets: &[&str], outcome: ActionOutcome) -> Event {
        Event::ActionCompleted {
            id,
            kind: ActionKind::Tag,
            scope: Scope::Targets(ids(targets)),
            outcome,
            revision: Some(Revision::from_raw(9)),
        }
    }

    #[test]
    fn thread_detail_ignores_disjoint_actions() {
        let kind = ViewKind::ThreadDetail {
            thread: ThreadId::from("t1"),
        };
        let cached = cache(&["1", "2"]);
        let disjoint = completed(Uuid::new_v4(), &["9"], ActionOutcome::Success);
        let touching = completed(Uuid::new_v4(), &["2", "9"], ActionOutcome::Success);

        assert_eq!(route(&kind, Some(&cached), None, &disjoint), Routing::Ignore);
        assert_eq!(
            route(&kind, Some(&cached), None, &touching),
            Routing::Invalidate(Some(Revision::from_raw(9)))
        );
        // Without a cache nothing can be proven.
        assert!(matches!(
            route(&kind, None, None, &disjoint),
            Routing::Invalidate(_)
        ));
    }

    #[test]
    fn lists_treat_every_successful_action_as_overlapping() {
        let kind = ViewKind::thread_list("inbox", "tag:inbox");
        let event = completed(Uuid::new_v4(), &["9"], ActionOutcome::Success);
        assert!(matches!(route(&kind, Some(&cache(&["1"])), None, &event), Routing::Invalidate(_)));
    }

    #[test]
    fn failed_actions_and_ticks_do_not_invalidate() {
        let kind = ViewKind::thread_list("inbox", "tag:inbox");
        let failed = completed(
            Uuid::new_v4(),
            &["1"],
            ActionOutcome::Failed {
                reason: "offline".to_string(),
            },
        );
        assert_eq!(route(&kind, None, None, &failed), Routing::Ignore);
        let tick = Event::PollTick { at: chrono::Utc::now() };
        assert_eq!(route(&kind, None, None, &tick), Routing::Ignore);
    }

    #[test]
    fn composer_only_follows_its_own_send() {
        let kind = ViewKind::composer(ComposedMessage::default());
        let send = Uuid::new_v4();
        let other = completed(Uuid::new_v4(), &["1"], ActionOutcome::Success);
        let mine = completed(
            send,
            &[],
            ActionOutcome::Failed {
                reason: "smtp down".to_string(),
            },
        );

        assert_eq!(route(&kind, None, Some(send), &other), Routing::Ignore);
        assert_eq!(
            route(&kind, None, Some(send), &mine),
            Routing::SendFinished {
                action: send,
                failure: Some("smtp down".to_string()),
            }
        );
    }

    #[test]
    fn thread_detail_queries_its_thread() {
        let kind = ViewKind::ThreadDetail {
            thread: ThreadId::from("abc"),
        };
        assert_eq!(kind.queries(), vec!["thread:abc".to_string()]);
    }
}
