use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub version: u32,
    pub poll: PollConfig,
    pub actions: ActionsConfig,
    pub tags: TagConfig,
    pub views: ViewsConfig,
    pub startup: StartupConfig,
    pub saved_searches: Vec<NamedQuery>,
    pub store: StoreConfig,
    pub smtp: Option<SmtpConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Seconds between automatic polls, 0 disables the timer.
    pub interval_secs: u64,
    pub auto_poll: bool,
    pub failure_warning_threshold: u32,
    /// Also poll when the store's files change on disk.
    pub watch_store: bool,
}

impl PollConfig {
    /// Timer period, or `None` when only explicit and watcher triggers poll.
    /// Ticks are still ignored while `auto_poll` is off.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            auto_poll: true,
            failure_warning_threshold: 5,
            watch_store: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub history_limit: usize,
    pub undo_window_secs: u64,
}

impl ActionsConfig {
    pub fn undo_window(&self) -> Duration {
        Duration::from_secs(self.undo_window_secs)
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            undo_window_secs: 600,
        }
    }
}

/// Tags the built-in actions operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    pub inbox: String,
    pub unread: String,
    pub deleted: String,
    pub replied: String,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            inbox: "inbox".to_string(),
            unread: "unread".to_string(),
            deleted: "deleted".to_string(),
            replied: "replied".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewsConfig {
    pub debounce_ms: u64,
}

impl ViewsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self { debounce_ms: 150 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub query: String,
}

impl NamedQuery {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub show_saved_searches: bool,
    pub queries: Vec<NamedQuery>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            show_saved_searches: false,
            queries: vec![NamedQuery::new("inbox", "tag:inbox")],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Relative names are resolved against the data directory.
    pub file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            file_name: "comet.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    /// Environment variable that overrides the keychain password. Otherwise
    /// the password is read from the OS keychain, service `comet`, account
    /// `smtp:<username>@<host>`.
    pub password_env: Option<String>,
    pub from: Option<String>,
}

fn default_smtp_port() -> u16 {
    465
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
    pub file: Option<PathBuf>,
    pub append: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            file: None,
            append: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            poll: PollConfig::default(),
            actions: ActionsConfig::default(),
            tags: TagConfig::default(),
            views: ViewsConfig::default(),
            startup: StartupConfig::default(),
            saved_searches: vec![
                NamedQuery::new("inbox", "tag:inbox"),
                NamedQuery::new("unread", "tag:unread"),
                NamedQuery::new("flagged", "tag:flagged"),
            ],
            store: StoreConfig::default(),
            smtp: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.actions.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "actions.history_limit must be at least 1".to_string(),
            ));
        }
        if self.store.file_name.trim().is_empty() {
            return Err(ConfigError::Invalid("store.file_name is empty".to_string()));
        }
        for query in self.startup.queries.iter().chain(&self.saved_searches) {
            if query.query.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "query `{}` has an empty expression",
                    query.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [poll]
            interval_secs = 30

            [[startup.queries]]
            name = "work"
            query = "folder:work"
            "#,
        )
        .expect("config parsed");

        assert_eq!(config.poll.interval_secs, 30);
        assert!(config.poll.auto_poll);
        assert_eq!(config.startup.queries, vec![NamedQuery::new("work", "folder:work")]);
        assert_eq!(config.tags.unread, "unread");
        assert!(config.smtp.is_none());
    }

    #[test]
    fn zero_interval_disables_the_timer() {
        let mut poll = PollConfig::default();
        assert_eq!(poll.interval(), Some(Duration::from_secs(60)));
        poll.auto_poll = false;
        assert_eq!(poll.interval(), Some(Duration::from_secs(60)));
        poll.interval_secs = 0;
        assert_eq!(poll.interval(), None);
    }


    #[test]
    fn empty_startup_query_is_rejected() {
        let mut config = AppConfig::default();
        config.startup.queries.push(NamedQuery::new("broken", "  "));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
