use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher as _;
use rayon::prelude::*;
use similar::DiffTag;
use similar::TextDiff;

use crate::core::display_path;
use crate::core::normalize_path;
use crate::core::ChangeEvent;
use crate::core::ChangeKind;
use crate::core::LineDiff;
use crate::error::RippleError;
use crate::languages::discover_all;
use crate::languages::is_skipped_dir_name;
use crate::languages::is_source_file;
use crate::languages::Lang;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE }
    }
}

/// In-memory mirror of every file the language plugins would discover.
///
/// The cache is the sole owner of its strings; change events carry copies.
#[derive(Debug, Default)]
pub struct ContentCache {
    files: HashMap<PathBuf, String>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every discoverable source file, reading in parallel.
    pub fn load(langs: &[Lang], dirs: &[PathBuf]) -> Self {
        let loaded: Vec<(PathBuf, String)> = discover_all(langs, dirs)
            .into_par_iter()
            .filter_map(|path| match fs::read_to_string(&path) {
                Ok(content) => Some((path, content)),
                Err(source) => {
                    let err = RippleError::UnreadableFile { path, source };
                    log::debug!("Skipping during content load: {}", err);
                    None
                }
            })
            .collect();

        let cache = Self { files: loaded.into_iter().collect() };
        log::info!(
            "Cached {} file(s), {} line(s) of source.",
            cache.files.len(),
            cache.total_lines()
        );
        cache
    }

    pub fn get(&self, path: &Path) -> Option<&str> {
        self.files.get(path).map(|s| s.as_str())
    }

    pub fn insert(&mut self, path: PathBuf, content: String) {
        self.files.insert(path, content);
    }

    pub fn remove(&mut self, path: &Path) -> Option<String> {
        self.files.remove(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_lines(&self) -> usize {
        self.files.values().map(|c| c.lines().count()).sum()
    }
}

/// Line-level diff with 1-based numbering.
///
/// `Added`/`Changed` entries number lines in the new content, `Removed`
/// entries in the old content.
pub fn diff_lines(old: &str, new: &str) -> Vec<LineDiff> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let diff = TextDiff::from_lines(old, new);
    let mut out = Vec::new();

    for op in diff.ops() {
        let old_range = op.old_range();
        let new_range = op.new_range();

        match op.tag() {
            DiffTag::Equal => {}
            DiffTag::Delete => {
                for i in old_range {
                    out.push(LineDiff::removed(i + 1, old_lines[i].to_string()));
                }
            }
            DiffTag::Insert => {
                for i in new_range {
                    out.push(LineDiff::added(i + 1, new_lines[i].to_string()));
                }
            }
            DiffTag::Replace => {
                let pairs = old_range.len().min(new_range.len());

                for offset in 0..pairs {
                    let (o, n) = (old_range.start + offset, new_range.start + offset);
                    out.push(LineDiff::changed(
                        n + 1,
                        old_lines[o].to_string(),
                        new_lines[n].to_string(),
                    ));
                }

                for o in old_range.start + pairs..old_range.end {
                    out.push(LineDiff::removed(o + 1, old_lines[o].to_string()));
                }

                for n in new_range.start + pairs..new_range.end {
                    out.push(LineDiff::added(n + 1, new_lines[n].to_string()));
                }
            }
        }
    }

    out
}

/// Classify a debounced path against the content cache, producing a change
/// event and updating the cache, or `None` when nothing relevant changed.
pub fn classify_change(
    cache: &mut ContentCache,
    canonical_root: &Path,
    path: &Path,
) -> Option<ChangeEvent> {
    let display = display_path(path, canonical_root);

    if !path.exists() {
        // Only meaningful if we ever knew the file.
        let old = cache.remove(path)?;
        let diff = diff_lines(&old, "");
        return Some(ChangeEvent::new(
            path.to_path_buf(),
            display,
            ChangeKind::Deleted,
            Some(old),
            None,
            diff,
        ));
    }

    let new = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(source) => {
            let err = RippleError::UnreadableFile { path: path.to_path_buf(), source };
            log::debug!("Ignoring change: {}", err);
            return None;
        }
    };

    match cache.get(path) {
        None => {
            let diff = diff_lines("", &new);
            cache.insert(path.to_path_buf(), new.clone());
            Some(ChangeEvent::new(
                path.to_path_buf(),
                display,
                ChangeKind::Added,
                None,
                Some(new),
                diff,
            ))
        }
        Some(old) if old == new => None,
        Some(old) => {
            let old = old.to_string();
            let diff = diff_lines(&old, &new);
            cache.insert(path.to_path_buf(), new.clone());
            Some(ChangeEvent::new(
                path.to_path_buf(),
                display,
                ChangeKind::Modified,
                Some(old),
                Some(new),
                diff,
            ))
        }
    }
}

enum WatchMsg {
    Raw(PathBuf),
    Shutdown,
}

/// Recursive watcher over the source roots with per-path debouncing.
///
/// Bursts of raw notifications within the debounce window coalesce into one
/// classified event per path, emitted in the order the timers fire. The
/// sink runs on the debounce thread; the session composes
/// apply-to-graph-then-notify inside it.
pub struct ProjectWatcher {
    tx: Sender<WatchMsg>,
    handle: Option<JoinHandle<()>>,
    _notify: RecommendedWatcher,
}

impl ProjectWatcher {
    pub fn spawn(
        roots: &[PathBuf],
        canonical_root: PathBuf,
        cache: ContentCache,
        config: WatchConfig,
        sink: Box<dyn Fn(ChangeEvent) + Send>,
    ) -> notify::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();

        let raw_tx = tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) if is_mutation(&event.kind) => {
                    for path in event.paths {
                        let _ = raw_tx.send(WatchMsg::Raw(path));
                    }
                }
                Ok(_) => {}
                Err(err) => log::warn!("Watch error: {}", err),
            })?;

        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            log::info!("Watching {} recursively.", root.display());
        }

        let debounce = config.debounce;
        let handle =
            thread::spawn(move || debounce_loop(rx, cache, canonical_root, debounce, sink));

        Ok(Self { tx, handle: Some(handle), _notify: watcher })
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        // Pending debounce timers die with the loop.
        let _ = self.tx.send(WatchMsg::Shutdown);

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn is_mutation(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    )
}

fn is_watchable(path: &Path) -> bool {
    let in_skipped = path
        .components()
        .any(|c| c.as_os_str().to_str().map(is_skipped_dir_name).unwrap_or(false));

    !in_skipped && Lang::of(path).is_some() && is_source_file(path)
}

fn debounce_loop(
    rx: crossbeam_channel::Receiver<WatchMsg>,
    mut cache: ContentCache,
    canonical_root: PathBuf,
    debounce: Duration,
    sink: Box<dyn Fn(ChangeEvent) + Send>,
) {
    const IDLE: Duration = Duration::from_secs(60);
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let timeout = pending
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE);

        match rx.recv_timeout(timeout) {
            Ok(WatchMsg::Raw(path)) => {
                let path = normalize_path(&path);

                if is_watchable(&path) {
                    // Repeated events within the window coalesce to the last.
                    pending.insert(path, Instant::now() + debounce);
                }
            }
            Ok(WatchMsg::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            pending.remove(&path);

            if let Some(event) = classify_change(&mut cache, &canonical_root, &path) {
                sink(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;
    use crate::core::LineDiffKind;

    #[test]
    fn diff_classifies_added_removed_changed() {
        let old = "a\nb\nc\n";
        let new = "a\nB\nc\nd\n";

        let diff = diff_lines(old, new);

        assert!(diff.contains(&LineDiff::changed(2, "b".to_string(), "B".to_string())));
        assert!(diff.contains(&LineDiff::added(4, "d".to_string())));
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn diff_removed_lines_use_old_numbering() {
        let old = "a\nb\nc\n";
        let new = "a\nc\n";

        let diff = diff_lines(old, new);
        assert_eq!(diff, vec![LineDiff::removed(2, "b".to_string())]);
    }

    #[test]
    fn diff_of_identical_content_is_empty() {
        assert!(diff_lines("a\nb\n", "a\nb\n").is_empty());
    }

    #[test]
    fn classify_added_modified_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let path = root.join("main.ts");
        let mut cache = ContentCache::new();

        fs::write(&path, "let x = 1;\n").unwrap();
        let added = classify_change(&mut cache, &root, &path).unwrap();
        assert_eq!(added.kind, ChangeKind::Added);
        assert_eq!(added.display_path, "main.ts");
        assert!(added.old_content.is_none());

        // Unchanged content is dropped silently.
        assert!(classify_change(&mut cache, &root, &path).is_none());

        fs::write(&path, "let x = 2;\n").unwrap();
        let modified = classify_change(&mut cache, &root, &path).unwrap();
        assert_eq!(modified.kind, ChangeKind::Modified);
        assert_eq!(modified.diff.len(), 1);
        assert_eq!(modified.diff[0].kind, LineDiffKind::Changed);
        assert_eq!(modified.diff[0].line, 1);

        fs::remove_file(&path).unwrap();
        let deleted = classify_change(&mut cache, &root, &path).unwrap();
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert_eq!(deleted.old_content.as_deref(), Some("let x = 2;\n"));

        // A second delete has nothing left to report.
        assert!(classify_change(&mut cache, &root, &path).is_none());
    }

    #[test]
    fn content_cache_loads_discoverable_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        fs::write(root.join("a.ts"), "one\ntwo\n").unwrap();
        fs::write(root.join("b.ts"), "three\n").unwrap();
        fs::write(root.join("node_modules/dep/c.ts"), "skipped\n").unwrap();

        let cache = ContentCache::load(&[Lang::TypeScript], &[root.clone()]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_lines(), 3);
        assert!(cache.get(&root.join("node_modules/dep/c.ts")).is_none());
    }

    #[test]
    fn burst_of_writes_debounces_to_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let root = normalize_path(dir.path());
        let path = root.join("main.ts");
        fs::write(&path, "v0\n").unwrap();

        let cache = ContentCache::load(&[Lang::TypeScript], &[root.clone()]);
        let (tx, rx) = mpsc::channel();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();

        let watcher = ProjectWatcher::spawn(
            &[root.clone()],
            root.clone(),
            cache,
            WatchConfig { debounce: Duration::from_millis(400) },
            Box::new(move |event| {
                sink_events.lock().unwrap().push(event);
                let _ = tx.send(());
            }),
        )
        .unwrap();

        // Ten writes inside the window must coalesce into one event.
        for i in 1..=10 {
            fs::write(&path, format!("v{}\n", i)).unwrap();
            thread::sleep(Duration::from_millis(20));
        }

        rx.recv_timeout(Duration::from_secs(10)).expect("debounced event");
        thread::sleep(Duration::from_millis(600));
        drop(watcher);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Modified);
        assert_eq!(events[0].new_content.as_deref(), Some("v10\n"));
    }
}
