use comet_core::Revision;
use comet_storage::Commit;
use std::sync::{Arc, Mutex, MutexGuard};

/// Last store revision known to the process.
///
/// The poll loop compares fresh revisions against it. The action manager
/// advances it past its own commits so they are not reported again as
/// external changes.
#[derive(Debug, Clone, Default)]
pub struct Watermark {
    last: Arc<Mutex<Option<Revision>>>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Revision> {
        *self.lock()
    }

    /// Advances only when nothing happened between the last observed revision
    /// and the commit; otherwise the foreign change is still reported.
    pub fn note_commit(&self, commit: Commit) -> bool {
        let mut last = self.lock();
        if *last == Some(commit.previous) && commit.changed() {
            *last = Some(commit.current);
            return true;
        }
        false
    }

    /// Records `current` and returns whether it differs from a previously
    /// known revision.
    pub fn observe(&self, current: Revision) -> bool {
        let mut last = self.lock();
        match last.replace(current) {
            Some(previous) => previous != current,
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Revision>> {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(raw: u64) -> Revision {
        Revision::from_raw(raw)
    }

    #[test]
    fn first_observation_is_not_a_change() {
        let watermark = Watermark::new();
        assert!(!watermark.observe(rev(4)));
        assert!(!watermark.observe(rev(4)));
        assert!(watermark.observe(rev(5)));
    }

    #[test]
    fn own_commit_advances_the_mark() {
        let watermark = Watermark::new();
        watermark.observe(rev(1));
        assert!(watermark.note_commit(Commit {
            previous: rev(1),
            current: rev(2),
        }));
        assert!(!watermark.observe(rev(2)));
    }

    #[test]
    fn interleaved_foreign_change_is_still_reported() {
        let watermark = Watermark::new();
        watermark.observe(rev(1));
        // Another process wrote revision 2 before our commit landed on top.
        assert!(!watermark.note_commit(Commit {
            previous: rev(2),
            current: rev(3),
        }));
        assert!(watermark.observe(rev(3)));
    }
}
