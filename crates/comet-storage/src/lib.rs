mod error;
mod memory;
mod query;
mod sqlite;
mod store;

pub use error::StorageError;
pub use memory::{ExternalWriter, MemoryStore};
pub use query::{Clause, Query, Term};
pub use sqlite::SqliteStore;
pub use store::{Commit, MailStore, WriteTransaction};
