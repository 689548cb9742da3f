use crate::query::sort_newest_first;
use crate::{Commit, MailStore, Query, StorageError, WriteTransaction};
use async_trait::async_trait;
use comet_core::{MessageId, MessageRecord, Revision};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// In-process store.
///
/// Writes from other processes land in the *disk* state through an
/// [`ExternalWriter`] and only become visible to readers after
/// [`MailStore::refresh`], the way a reopened database would show them.
/// Commits made through [`MailStore::begin_write`] are visible immediately.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    visible: Snapshot,
    disk: Snapshot,
    offline: bool,
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    revision: u64,
    messages: BTreeMap<MessageId, MessageRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(records: impl IntoIterator<Item = MessageRecord>) -> Self {
        let messages = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect::<BTreeMap<_, _>>();
        let snapshot = Snapshot {
            revision: 0,
            messages,
        };
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                visible: snapshot.clone(),
                disk: snapshot,
                offline: false,
            })),
        }
    }

    /// Handle simulating another process writing to the store.
    pub fn external(&self) -> ExternalWriter {
        ExternalWriter {
            inner: self.inner.clone(),
        }
    }

    /// While offline every call fails with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.lock().offline = !available;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        lock_inner(&self.inner)
    }

    fn online(&self) -> Result<MutexGuard<'_, MemoryInner>, StorageError> {
        let guard = self.lock();
        if guard.offline {
            return Err(offline());
        }
        Ok(guard)
    }
}

fn lock_inner(inner: &Mutex<MemoryInner>) -> MutexGuard<'_, MemoryInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn offline() -> StorageError {
    StorageError::Unavailable("memory store is offline".to_string())
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn query(&self, expr: &str) -> Result<Vec<MessageId>, StorageError> {
        let query = Query::parse(expr)?;
        let inner = self.online()?;
        let mut hits = inner
            .visible
            .messages
            .values()
            .filter(|record| query.matches(record))
            .collect::<Vec<_>>();
        sort_newest_first(&mut hits);
        Ok(hits.into_iter().map(|record| record.id.clone()).collect())
    }

    async fn message(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError> {
        Ok(self.online()?.visible.messages.get(id).cloned())
    }

    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StorageError> {
        drop(self.online()?);
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            staged: BTreeMap::new(),
            ops: Vec::new(),
            finished: false,
        }))
    }

    async fn current_revision(&self) -> Result<Revision, StorageError> {
        Ok(Revision::from_raw(self.online()?.visible.revision))
    }

    async fn refresh(&self) -> Result<(), StorageError> {
        let mut inner = self.online()?;
        inner.visible = inner.disk.clone();
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    AddTag(MessageId, String),
    RemoveTag(MessageId, String),
    SetFolder(MessageId, String),
}

impl Op {
    fn target(&self) -> &MessageId {
        match self {
            Op::AddTag(id, _) | Op::RemoveTag(id, _) | Op::SetFolder(id, _) => id,
        }
    }

    fn apply(&self, record: &mut MessageRecord) {
        match self {
            Op::AddTag(_, tag) => {
                record.tags.insert(tag.clone());
            }
            Op::RemoveTag(_, tag) => {
                record.tags.remove(tag);
            }
            Op::SetFolder(_, folder) => record.folder = folder.clone(),
        }
    }
}

/// Stages operations and replays them onto the disk state at commit, so
/// concurrent external edits to other fields survive.
struct MemoryTransaction {
    inner: Arc<Mutex<MemoryInner>>,
    staged: BTreeMap<MessageId, MessageRecord>,
    ops: Vec<Op>,
    finished: bool,
}

impl MemoryTransaction {
    fn staged(&mut self, id: &MessageId) -> Result<&mut MessageRecord, StorageError> {
        if !self.staged.contains_key(id) {
            let record = {
                let inner = lock_inner(&self.inner);
                if inner.offline {
                    return Err(offline());
                }
                inner
                    .disk
                    .messages
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StorageError::NotFound(id.clone()))?
            };
            self.staged.insert(id.clone(), record);
        }
        self.staged
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    fn stage(&mut self, op: Op) -> Result<bool, StorageError> {
        let record = self.staged(op.target())?;
        let before = (record.tags.clone(), record.folder.clone());
        op.apply(record);
        let changed = before != (record.tags.clone(), record.folder.clone());
        if changed {
            self.ops.push(op);
        }
        Ok(changed)
    }
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    async fn message(&mut self, id: &MessageId) -> Result<MessageRecord, StorageError> {
        self.staged(id).map(|record| record.clone())
    }

    async fn add_tag(&mut self, id: &MessageId, tag: &str) -> Result<bool, StorageError> {
        self.stage(Op::AddTag(id.clone(), tag.to_string()))
    }

    async fn remove_tag(&mut self, id: &MessageId, tag: &str) -> Result<bool, StorageError> {
        self.stage(Op::RemoveTag(id.clone(), tag.to_string()))
    }

    async fn set_folder(
        &mut self,
        id: &MessageId,
        folder: &str,
    ) -> Result<Option<String>, StorageError> {
        let previous = self.staged(id)?.folder.clone();
        let moved = self.stage(Op::SetFolder(id.clone(), folder.to_string()))?;
        Ok(moved.then_some(previous))
    }

    async fn commit(mut self: Box<Self>) -> Result<Commit, StorageError> {
        self.finished = true;
        let mut inner = lock_inner(&self.inner);
        if inner.offline {
            return Err(offline());
        }

        let previous = Revision::from_raw(inner.disk.revision);
        if self.ops.is_empty() {
            return Ok(Commit {
                previous,
                current: previous,
            });
        }

        if let Some(missing) = self
            .ops
            .iter()
            .map(Op::target)
            .find(|id| !inner.disk.messages.contains_key(*id))
        {
            return Err(StorageError::NotFound(missing.clone()));
        }

        for op in &self.ops {
            if let Some(record) = inner.disk.messages.get_mut(op.target()) {
                op.apply(record);
            }
        }
        inner.disk.revision += 1;
        inner.visible = inner.disk.clone();

        Ok(Commit {
            previous,
            current: Revision::from_raw(inner.disk.revision),
        })
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            tracing::debug!(ops = self.ops.len(), "discarding uncommitted memory transaction");
        }
    }
}

/// Writes to the store the way another process would: changes stay invisible
/// until the store is refreshed.
#[derive(Clone)]
pub struct ExternalWriter {
    inner: Arc<Mutex<MemoryInner>>,
}

impl ExternalWriter {
    pub fn insert(&self, record: MessageRecord) {
        self.write(|disk| {
            disk.messages.insert(record.id.clone(), record);
            true
        });
    }

    pub fn add_tag(&self, id: &MessageId, tag: &str) -> bool {
        self.write(|disk| {
            disk.messages
                .get_mut(id)
                .map(|record| record.tags.insert(tag.to_string()))
                .unwrap_or(false)
        })
    }

    pub fn remove_tag(&self, id: &MessageId, tag: &str) -> bool {
        self.write(|disk| {
            disk.messages
                .get_mut(id)
                .map(|record| record.tags.remove(tag))
                .unwrap_or(false)
        })
    }

    pub fn set_folder(&self, id: &MessageId, folder: &str) -> bool {
        self.write(|disk| match disk.messages.get_mut(id) {
            Some(record) if record.folder != folder => {
                record.folder = folder.to_string();
                true
            }
            _ => false,
        })
    }

    fn write(&self, change: impl FnOnce(&mut Snapshot) -> bool) -> bool {
        let mut inner = lock_inner(&self.inner);
        let changed = change(&mut inner.disk);
        if changed {
            inner.disk.revision += 1;
        }
        changed
    }
}
