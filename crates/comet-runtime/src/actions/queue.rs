use comet_core::{ActionId, MessageId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// FIFO ticket queue per message.
///
/// An action enqueues on every target when submitted and may run once it is
/// at the head of all of them. Same-target actions therefore run in
/// submission order and partially overlapping sets cannot deadlock.
#[derive(Debug, Default)]
pub(crate) struct TargetQueues {
    queues: BTreeMap<MessageId, VecDeque<ActionId>>,
}

impl TargetQueues {
    pub(crate) fn enqueue(&mut self, id: ActionId, targets: &BTreeSet<MessageId>) {
        for target in targets {
            self.queues.entry(target.clone()).or_default().push_back(id);
        }
    }

    pub(crate) fn is_head(&self, id: ActionId, targets: &BTreeSet<MessageId>) -> bool {
        targets.iter().all(|target| {
            self.queues
                .get(target)
                .and_then(|queue| queue.front())
                .is_some_and(|head| *head == id)
        })
    }

    /// Drops every ticket `id` holds, wherever it sits in the queues.
    pub(crate) fn remove(&mut self, id: ActionId, targets: &BTreeSet<MessageId>) {
        for target in targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.retain(|queued| *queued != id);
                if queue.is_empty() {
                    self.queues.remove(target);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ids(raw: &[&str]) -> BTreeSet<MessageId> {
        raw.iter().map(|id| MessageId::from(*id)).collect()
    }

    #[test]
    fn overlapping_actions_wait_their_turn() {
        let mut queues = TargetQueues::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queues.enqueue(first, &ids(&["1", "2"]));
        queues.enqueue(second, &ids(&["2", "3"]));

        assert!(queues.is_head(first, &ids(&["1", "2"])));
        assert!(!queues.is_head(second, &ids(&["2", "3"])));

        queues.remove(first, &ids(&["1", "2"]));
        assert!(queues.is_head(second, &ids(&["2", "3"])));
        queues.remove(second, &ids(&["2", "3"]));
        assert!(queues.is_empty());
    }

    #[test]
    fn disjoint_actions_are_both_ready() {
        let mut queues = TargetQueues::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queues.enqueue(a, &ids(&["1"]));
        queues.enqueue(b, &ids(&["2"]));
        assert!(queues.is_head(a, &ids(&["1"])));
        assert!(queues.is_head(b, &ids(&["2"])));
    }

    #[test]
    fn cancelled_ticket_in_the_middle_unblocks_successor() {
        let mut queues = TargetQueues::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [a, b, c] {
            queues.enqueue(id, &ids(&["7"]));
        }
        queues.remove(b, &ids(&["7"]));
        queues.remove(a, &ids(&["7"]));
        assert!(queues.is_head(c, &ids(&["7"])));
    }

    #[test]
    fn actions_without_targets_never_wait() {
        let queues = TargetQueues::default();
        assert!(queues.is_head(Uuid::new_v4(), &BTreeSet::new()));
    }
}
