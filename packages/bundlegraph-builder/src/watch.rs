//! Watch registry
//!
//! Owns the set of watched input files and the batch of recently changed
//! URLs. Change events arrive asynchronously at any time; the runner drains
//! the batch at the start of the next build, so bursts of changes coalesce
//! into at most one follow-up rebuild.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::debug;
use url::Url;

use crate::fs::{FileChange, FileSystem};

type InputChangeCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct WatchRegistry {
    watched: Mutex<FxHashSet<String>>,
    recently_changed: Mutex<Vec<Url>>,
    on_input_change: Mutex<Option<InputChangeCallback>>,
}

impl WatchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(WatchRegistry::default())
    }

    /// Wire this registry into a filesystem's change events. Call once.
    pub fn subscribe(self: Arc<Self>, fs: &FileSystem) {
        let registry = self;
        fs.add_change_listener(Arc::new(move |change| {
            registry.file_did_change(change);
        }));
    }

    /// The rebuilder (or any caller) learns about changes to watched inputs
    /// through this callback.
    pub fn set_on_input_change(&self, callback: InputChangeCallback) {
        *self.on_input_change.lock() = Some(callback);
    }

    /// Start watching a URL. Returns true the first time it is seen.
    pub fn ensure_watching(&self, url: &Url) -> bool {
        self.watched.lock().insert(url.as_str().to_string())
    }

    pub fn is_watched(&self, url: &Url) -> bool {
        self.watched.lock().contains(url.as_str())
    }

    pub fn file_did_change(&self, change: &FileChange) {
        if !self.is_watched(&change.url) {
            return;
        }
        debug!(url = %change.url, "watched input changed");
        let mut recent = self.recently_changed.lock();
        if !recent.contains(&change.url) {
            recent.push(change.url.clone());
        }
        drop(recent);
        let callback = self.on_input_change.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Drain the batch of changes accumulated since the last build started.
    pub fn take_recent_changes(&self) -> FxHashSet<Url> {
        self.recently_changed.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileChangeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn change(url: &str) -> FileChange {
        FileChange {
            url: Url::parse(url).unwrap(),
            kind: FileChangeKind::Write,
        }
    }

    #[test]
    fn test_unwatched_changes_are_ignored() {
        let registry = WatchRegistry::new();
        registry.file_did_change(&change("https://local/a.js"));
        assert!(registry.take_recent_changes().is_empty());
    }

    #[test]
    fn test_watched_changes_coalesce() {
        let registry = WatchRegistry::new();
        let url = Url::parse("https://local/a.js").unwrap();
        assert!(registry.ensure_watching(&url));
        assert!(!registry.ensure_watching(&url));

        registry.file_did_change(&change("https://local/a.js"));
        registry.file_did_change(&change("https://local/a.js"));
        let batch = registry.take_recent_changes();
        assert_eq!(batch.len(), 1);
        assert!(registry.take_recent_changes().is_empty());
    }

    #[test]
    fn test_input_change_callback_fires() {
        let registry = WatchRegistry::new();
        let url = Url::parse("https://local/a.js").unwrap();
        registry.ensure_watching(&url);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        registry.set_on_input_change(Arc::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.file_did_change(&change("https://local/a.js"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
