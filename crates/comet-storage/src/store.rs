use crate::StorageError;
use async_trait::async_trait;
use comet_core::{MessageId, MessageRecord, Revision};
use std::path::PathBuf;

/// Revisions on both sides of a commit. Equal when nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub previous: Revision,
    pub current: Revision,
}

impl Commit {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Narrow access to the mail store. Implementations keep no caches; callers
/// are responsible for freshness.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Identifiers matching `expr`, newest first.
    async fn query(&self, expr: &str) -> Result<Vec<MessageId>, StorageError>;

    async fn message(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError>;

    /// Dropping the transaction without committing aborts it.
    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StorageError>;

    async fn current_revision(&self) -> Result<Revision, StorageError>;

    /// Makes changes written by other processes visible.
    async fn refresh(&self) -> Result<(), StorageError>;

    /// On-disk location worth watching for external changes.
    fn watch_path(&self) -> Option<PathBuf> {
        None
    }
}

#[async_trait]
pub trait WriteTransaction: Send {
    async fn message(&mut self, id: &MessageId) -> Result<MessageRecord, StorageError>;

    /// Returns whether the message changed.
    async fn add_tag(&mut self, id: &MessageId, tag: &str) -> Result<bool, StorageError>;

    /// Returns whether the message changed.
    async fn remove_tag(&mut self, id: &MessageId, tag: &str) -> Result<bool, StorageError>;

    /// Returns the previous folder when the message moved.
    async fn set_folder(
        &mut self,
        id: &MessageId,
        folder: &str,
    ) -> Result<Option<String>, StorageError>;

    async fn commit(self: Box<Self>) -> Result<Commit, StorageError>;

    async fn abort(self: Box<Self>) -> Result<(), StorageError>;
}
