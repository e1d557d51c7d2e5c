use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use path_slash::PathExt;
use serde::Serialize;

/// How severe the blast radius of a change is, judged by the number of
/// impacted files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Classify a total impacted-file count.
    pub fn of_impacted(total: usize) -> Self {
        match total {
            0 => Self::None,
            1..=4 => Self::Low,
            5..=9 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// The kind of on-disk mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LineDiffKind {
    Added,
    Removed,
    Changed,
}

/// A single line-level difference between two revisions of a file.
///
/// `line` is 1-based and refers to the new content for `Added` and
/// `Changed` entries and to the old content for `Removed` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineDiff {
    pub line: usize,
    pub kind: LineDiffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

impl LineDiff {
    pub fn added(line: usize, new: String) -> Self {
        Self { line, kind: LineDiffKind::Added, old: None, new: Some(new) }
    }

    pub fn removed(line: usize, old: String) -> Self {
        Self { line, kind: LineDiffKind::Removed, old: Some(old), new: None }
    }

    pub fn changed(line: usize, old: String, new: String) -> Self {
        Self { line, kind: LineDiffKind::Changed, old: Some(old), new: Some(new) }
    }
}

/// A debounced, classified filesystem mutation, ready for the incremental
/// updater and any subscribed observers.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub display_path: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    pub diff: Vec<LineDiff>,
    pub timestamp_ms: u64,
}

impl ChangeEvent {
    pub fn new(
        path: PathBuf,
        display_path: String,
        kind: ChangeKind,
        old_content: Option<String>,
        new_content: Option<String>,
        diff: Vec<LineDiff>,
    ) -> Self {
        Self { path, display_path, kind, old_content, new_content, diff, timestamp_ms: epoch_ms() }
    }
}

/// What a single application of a change event did to the graph.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub path: PathBuf,
    pub display_path: String,
    pub kind: ChangeKind,
    pub added_edges: Vec<(PathBuf, PathBuf)>,
    pub removed_edges: Vec<(PathBuf, PathBuf)>,
    pub edges_changed: bool,
    pub affected_files: Vec<PathBuf>,
    pub invalidated_memos: usize,
}

/// Milliseconds since the Unix epoch, for timestamps that leave the process.
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Normalise a path to the host platform's absolute form.
///
/// Falls back to lexical cleanup when the path does not (yet) exist, so
/// deleted files keep a stable identity.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();

    match dunce::canonicalize(path) {
        Ok(path) => path,
        Err(_) => lexical_clean(path),
    }
}

/// Render a file identifier as a forward-slash path relative to `root`.
///
/// Identifiers outside `root` (which should not happen) render absolute.
pub fn display_path<P: AsRef<Path>, R: AsRef<Path>>(path: P, root: R) -> String {
    let path = path.as_ref();
    path.strip_prefix(root.as_ref()).unwrap_or(path).to_slash_lossy().to_string()
}

fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            _ => out.push(component),
        }
    }

    out
}
