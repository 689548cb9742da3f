use crate::StorageError;
use comet_core::{MessageId, MessageRecord, ThreadId};
use std::fmt;
use std::str::FromStr;

/// Parsed query expression. Clauses are ANDed.
///
/// ```text
/// tag:inbox -tag:deleted folder:work
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub negated: bool,
    pub term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    All,
    Tag(String),
    Folder(String),
    Id(MessageId),
    Thread(ThreadId),
    /// Case-insensitive subject match.
    Text(String),
}

impl Query {
    pub fn parse(expr: &str) -> Result<Self, StorageError> {
        let clauses = expr
            .split_whitespace()
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;

        if clauses.is_empty() {
            return Err(StorageError::QueryInvalid("empty query".to_string()));
        }

        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn matches(&self, record: &MessageRecord) -> bool {
        self.clauses.iter().all(|clause| clause.matches(record))
    }
}

impl FromStr for Query {
    type Err = StorageError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        Self::parse(expr)
    }
}

impl Clause {
    fn matches(&self, record: &MessageRecord) -> bool {
        let hit = match &self.term {
            Term::All => true,
            Term::Tag(tag) => record.has_tag(tag),
            Term::Folder(folder) => &record.folder == folder,
            Term::Id(id) => &record.id == id,
            Term::Thread(thread) => &record.thread == thread,
            Term::Text(text) => record.subject.to_lowercase().contains(text.as_str()),
        };
        hit != self.negated
    }
}

fn parse_clause(token: &str) -> Result<Clause, StorageError> {
    let (negated, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };

    if body.is_empty() {
        return Err(StorageError::QueryInvalid(format!("dangling `-` in `{token}`")));
    }

    if body == "*" {
        return Ok(Clause {
            negated,
            term: Term::All,
        });
    }

    let term = match body.split_once(':') {
        Some((prefix, value)) => {
            if value.is_empty() {
                return Err(StorageError::QueryInvalid(format!(
                    "missing value for `{prefix}:`"
                )));
            }
            match prefix {
                "tag" | "is" => Term::Tag(value.to_string()),
                "folder" => Term::Folder(value.to_string()),
                "id" => Term::Id(MessageId::new(value)),
                "thread" => Term::Thread(ThreadId::new(value)),
                other => {
                    return Err(StorageError::QueryInvalid(format!(
                        "unknown prefix `{other}:`"
                    )))
                }
            }
        }
        None => Term::Text(body.to_lowercase()),
    };

    Ok(Clause { negated, term })
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, clause) in self.clauses.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            if clause.negated {
                f.write_str("-")?;
            }
            match &clause.term {
                Term::All => f.write_str("*")?,
                Term::Tag(tag) => write!(f, "tag:{tag}")?,
                Term::Folder(folder) => write!(f, "folder:{folder}")?,
                Term::Id(id) => write!(f, "id:{id}")?,
                Term::Thread(thread) => write!(f, "thread:{thread}")?,
                Term::Text(text) => f.write_str(text)?,
            }
        }
        Ok(())
    }
}

/// Result order shared by every store: newest first, ties by id.
pub(crate) fn sort_newest_first(records: &mut [&MessageRecord]) {
    records.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
}
