use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Fires a callback when the store's files change on disk.
///
/// The store's parent directory is watched so that sidecar files written
/// next to it (journals, write-ahead logs) count as well.
pub(crate) struct StoreWatcher {
    _watcher: Mutex<RecommendedWatcher>,
    path: PathBuf,
}

impl StoreWatcher {
    pub(crate) fn start(
        path: &Path,
        on_change: impl Fn() + Send + 'static,
    ) -> notify::Result<Self> {
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let stem = path.file_name().map(OsString::from).unwrap_or_default();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) if touches_store(&event, &stem) => on_change(),
                Ok(_) => {}
                Err(err) => tracing::warn!("store watcher error: {err}"),
            },
            Config::default(),
        )?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        tracing::debug!(path = %path.display(), "watching store for external changes");

        Ok(Self {
            _watcher: Mutex::new(watcher),
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn touches_store(event: &Event, stem: &OsString) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    relevant
        && event.paths.iter().any(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().starts_with(&*stem.to_string_lossy()))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn sidecar_files_count_as_store_changes() {
        let stem = OsString::from("comet.sqlite3");
        assert!(touches_store(
            &event(EventKind::Modify(ModifyKind::Any), "/data/comet.sqlite3-wal"),
            &stem
        ));
        assert!(touches_store(
            &event(EventKind::Create(CreateKind::File), "/data/comet.sqlite3"),
            &stem
        ));
    }

    #[test]
    fn unrelated_files_and_access_events_are_ignored() {
        let stem = OsString::from("comet.sqlite3");
        assert!(!touches_store(
            &event(EventKind::Modify(ModifyKind::Any), "/data/other.db"),
            &stem
        ));
        assert!(!touches_store(
            &event(EventKind::Access(notify::event::AccessKind::Any), "/data/comet.sqlite3"),
            &stem
        ));
    }
}
