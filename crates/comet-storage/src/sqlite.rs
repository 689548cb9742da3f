use crate::{Commit, MailStore, Query, StorageError, Term, WriteTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comet_core::{MessageId, MessageRecord, Revision, ThreadId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// SQLite-backed store. Other processes may write the same file; their
/// changes show up through the shared revision counter.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
    /// SQLite allows one writer; holding this avoids busy upgrades between
    /// our own transactions.
    writer: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .pragma("temp_store", "memory");

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(path = %db_path.display(), "opened sqlite mail store");

        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Adds or replaces a message the way an indexer process would.
    pub async fn import_message(&self, record: &MessageRecord) -> Result<Revision, StorageError> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, thread_id, folder, subject, date)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
              thread_id = excluded.thread_id,
              folder = excluded.folder,
              subject = excluded.subject,
              date = excluded.date
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.thread.as_str())
        .bind(&record.folder)
        .bind(&record.subject)
        .bind(record.date.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM message_tags WHERE message_id = ?1")
            .bind(record.id.as_str())
            .execute(&mut *tx)
            .await?;

        for tag in &record.tags {
            sqlx::query("INSERT INTO message_tags (message_id, tag) VALUES (?1, ?2)")
                .bind(record.id.as_str())
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        let revision = bump_revision(&mut tx).await?;
        tx.commit().await?;
        Ok(revision)
    }

    fn row_to_message(row: &SqliteRow, tags: Vec<String>) -> Result<MessageRecord, StorageError> {
        let id: String = row.try_get("id")?;
        let thread: String = row.try_get("thread_id")?;
        let date_raw: String = row.try_get("date")?;

        Ok(MessageRecord {
            id: MessageId::new(id),
            thread: ThreadId::new(thread),
            folder: row.try_get("folder")?,
            tags: tags.into_iter().collect(),
            subject: row.try_get("subject")?,
            date: parse_datetime(&date_raw, "messages.date")?,
        })
    }
}

#[async_trait]
impl MailStore for SqliteStore {
    async fn query(&self, expr: &str) -> Result<Vec<MessageId>, StorageError> {
        let query = Query::parse(expr)?;
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT m.id FROM messages m WHERE ");

        for (index, clause) in query.clauses().iter().enumerate() {
            if index > 0 {
                builder.push(" AND ");
            }
            if clause.negated {
                builder.push("NOT ");
            }
            match &clause.term {
                Term::All => {
                    builder.push("(1 = 1)");
                }
                Term::Tag(tag) => {
                    builder.push(
                        "EXISTS (SELECT 1 FROM message_tags t WHERE t.message_id = m.id AND t.tag = ",
                    );
                    builder.push_bind(tag.clone());
                    builder.push(")");
                }
                Term::Folder(folder) => {
                    builder.push("(m.folder = ");
                    builder.push_bind(folder.clone());
                    builder.push(")");
                }
                Term::Id(id) => {
                    builder.push("(m.id = ");
                    builder.push_bind(id.as_str().to_string());
                    builder.push(")");
                }
                Term::Thread(thread) => {
                    builder.push("(m.thread_id = ");
                    builder.push_bind(thread.as_str().to_string());
                    builder.push(")");
                }
                Term::Text(text) => {
                    builder.push("(instr(lower(m.subject), ");
                    builder.push_bind(text.clone());
                    builder.push(") > 0)");
                }
            }
        }
        builder.push(" ORDER BY m.date DESC, m.id ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map(MessageId::new)
                    .map_err(StorageError::from)
            })
            .collect()
    }

    async fn message(&self, id: &MessageId) -> Result<Option<MessageRecord>, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        load_message(&mut conn, id).await
    }

    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StorageError> {
        let writer = self.writer.clone().lock_owned().await;
        let tx = self.pool.begin().await.map_err(unavailable)?;
        Ok(Box::new(SqliteTransaction {
            tx,
            changed: false,
            _writer: writer,
        }))
    }

    async fn current_revision(&self) -> Result<Revision, StorageError> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        read_revision(&mut conn).await
    }

    async fn refresh(&self) -> Result<(), StorageError> {
        // Every read sees the latest commit already; only check reachability.
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    fn watch_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    changed: bool,
    _writer: OwnedMutexGuard<()>,
}

impl SqliteTransaction {
    async fn require(&mut self, id: &MessageId) -> Result<MessageRecord, StorageError> {
        load_message(&mut self.tx, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }
}

#[async_trait]
impl WriteTransaction for SqliteTransaction {
    async fn message(&mut self, id: &MessageId) -> Result<MessageRecord, StorageError> {
        self.require(id).await
    }

    async fn add_tag(&mut self, id: &MessageId, tag: &str) -> Result<bool, StorageError> {
        self.require(id).await?;
        let result =
            sqlx::query("INSERT OR IGNORE INTO message_tags (message_id, tag) VALUES (?1, ?2)")
                .bind(id.as_str())
                .bind(tag)
                .execute(&mut *self.tx)
                .await?;
        let changed = result.rows_affected() > 0;
        self.changed |= changed;
        Ok(changed)
    }

    async fn remove_tag(&mut self, id: &MessageId, tag: &str) -> Result<bool, StorageError> {
        self.require(id).await?;
        let result = sqlx::query("DELETE FROM message_tags WHERE message_id = ?1 AND tag = ?2")
            .bind(id.as_str())
            .bind(tag)
            .execute(&mut *self.tx)
            .await?;
        let changed = result.rows_affected() > 0;
        self.changed |= changed;
        Ok(changed)
    }

    async fn set_folder(
        &mut self,
        id: &MessageId,
        folder: &str,
    ) -> Result<Option<String>, StorageError> {
        let current = self.require(id).await?;
        if current.folder == folder {
            return Ok(None);
        }

        sqlx::query("UPDATE messages SET folder = ?1 WHERE id = ?2")
            .bind(folder)
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
        self.changed = true;
        Ok(Some(current.folder))
    }

    async fn commit(self: Box<Self>) -> Result<Commit, StorageError> {
        let SqliteTransaction {
            mut tx,
            changed,
            _writer,
        } = *self;

        let previous = read_revision(&mut tx).await?;
        let current = if changed {
            bump_revision(&mut tx).await?
        } else {
            previous
        };
        tx.commit().await.map_err(unavailable)?;

        Ok(Commit { previous, current })
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn load_message(
    conn: &mut sqlx::SqliteConnection,
    id: &MessageId,
) -> Result<Option<MessageRecord>, StorageError> {
    let Some(row) = sqlx::query(
        "SELECT id, thread_id, folder, subject, date FROM messages WHERE id = ?1",
    )
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let tags = sqlx::query("SELECT tag FROM message_tags WHERE message_id = ?1 ORDER BY tag")
        .bind(id.as_str())
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|tag_row| tag_row.try_get::<String, _>("tag"))
        .collect::<Result<Vec<_>, _>>()?;

    SqliteStore::row_to_message(&row, tags).map(Some)
}

async fn read_revision(conn: &mut sqlx::SqliteConnection) -> Result<Revision, StorageError> {
    let row = sqlx::query("SELECT value FROM meta WHERE key = 'revision'")
        .fetch_one(&mut *conn)
        .await
        .map_err(unavailable)?;
    let value: i64 = row.try_get("value")?;
    Ok(Revision::from_raw(value as u64))
}

async fn bump_revision(tx: &mut Transaction<'static, Sqlite>) -> Result<Revision, StorageError> {
    sqlx::query("UPDATE meta SET value = value + 1 WHERE key = 'revision'")
        .execute(&mut **tx)
        .await?;
    read_revision(tx).await
}

fn unavailable(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::RowNotFound => StorageError::Data("store metadata is missing".to_string()),
        other => StorageError::Unavailable(other.to_string()),
    }
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, minutes_ago: i64, folder: &str, tags: &[&str]) -> MessageRecord {
        MessageRecord {
            id: MessageId::from(id),
            thread: ThreadId::from("thread-a"),
            folder: folder.to_string(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            subject: format!("Status report {id}"),
            date: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    async fn seeded(dir: &Path) -> SqliteStore {
        let store = SqliteStore::connect(&dir.join("mail.sqlite3"))
            .await
            .expect("store opened");
        store
            .import_message(&record("1", 30, "inbox", &["inbox"]))
            .await
            .expect("imported");
        store
            .import_message(&record("2", 10, "inbox", &["inbox", "unread"]))
            .await
            .expect("imported");
        store
            .import_message(&record("3", 20, "work", &[]))
            .await
            .expect("imported");
        store
    }

    #[tokio::test]
    async fn query_translates_clauses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(dir.path()).await;

        let inbox = store.query("tag:inbox -tag:unread").await.expect("query ran");
        assert_eq!(inbox, vec![MessageId::from("1")]);

        let all = store.query("*").await.expect("query ran");
        assert_eq!(
            all,
            vec![MessageId::from("2"), MessageId::from("3"), MessageId::from("1")]
        );

        let text = store.query("report folder:work").await.expect("query ran");
        assert_eq!(text, vec![MessageId::from("3")]);
    }

    #[tokio::test]
    async fn invalid_query_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(dir.path()).await;
        let err = store.query("colour:red").await.expect_err("rejected");
        assert!(matches!(err, StorageError::QueryInvalid(_)));
    }

    #[tokio::test]
    async fn commit_bumps_revision_only_on_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(dir.path()).await;

        let mut tx = store.begin_write().await.expect("transaction");
        assert!(!tx.add_tag(&MessageId::from("1"), "inbox").await.expect("tagged"));
        let idle = tx.commit().await.expect("committed");
        assert!(!idle.changed());

        let mut tx = store.begin_write().await.expect("transaction");
        assert!(tx.add_tag(&MessageId::from("1"), "flagged").await.expect("tagged"));
        assert_eq!(
            tx.set_folder(&MessageId::from("1"), "archive")
                .await
                .expect("moved")
                .as_deref(),
            Some("inbox")
        );
        let commit = tx.commit().await.expect("committed");
        assert!(commit.changed());
        assert_eq!(store.current_revision().await.expect("revision"), commit.current);

        let message = store
            .message(&MessageId::from("1"))
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(message.folder, "archive");
        assert!(message.has_tag("flagged"));
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_no_trace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(dir.path()).await;
        let before = store.current_revision().await.expect("revision");

        let mut tx = store.begin_write().await.expect("transaction");
        tx.remove_tag(&MessageId::from("2"), "unread")
            .await
            .expect("untagged");
        tx.abort().await.expect("aborted");

        assert_eq!(store.current_revision().await.expect("revision"), before);
        assert_eq!(
            store.query("tag:unread").await.expect("query ran"),
            vec![MessageId::from("2")]
        );
    }

    #[tokio::test]
    async fn unknown_message_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = seeded(dir.path()).await;
        let mut tx = store.begin_write().await.expect("transaction");
        let err = tx
            .remove_tag(&MessageId::from("nope"), "inbox")
            .await
            .expect_err("missing");
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
