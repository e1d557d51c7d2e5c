use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use counter::Counter;
use git2::Commit;
use git2::Repository;
use itertools::Itertools;
use serde::Serialize;

use crate::core::epoch_ms;
use crate::error::RippleError;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CouplingOptions {
    pub max_commits: usize,
    pub min_support: usize,
    pub min_confidence: f64,
    pub max_files_per_commit: usize,
}

impl Default for CouplingOptions {
    fn default() -> Self {
        Self { max_commits: 500, min_support: 3, min_confidence: 0.3, max_files_per_commit: 20 }
    }
}

/// Two files that keep changing in the same commits.
///
/// `file1 < file2` is canonical; confidence is the co-change count divided
/// by the larger of the two individual change counts.
#[derive(Debug, Clone, Serialize)]
pub struct FileCoupling {
    pub file1: String,
    pub file2: String,
    pub co_change_count: usize,
    pub file1_changes: usize,
    pub file2_changes: usize,
    pub confidence: f64,
    pub support: usize,
}

impl FileCoupling {
    pub fn other_side(&self, file: &str) -> Option<&str> {
        if self.file1 == file {
            Some(&self.file2)
        } else if self.file2 == file {
            Some(&self.file1)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CouplingResult {
    pub couplings: Vec<FileCoupling>,
    pub by_file: HashMap<String, Vec<FileCoupling>>,
    pub commits_analysed: usize,
    pub analysed_at_ms: u64,
}

impl CouplingResult {
    pub fn empty() -> Self {
        Self {
            couplings: Vec::new(),
            by_file: HashMap::new(),
            commits_analysed: 0,
            analysed_at_ms: epoch_ms(),
        }
    }

    /// Couplings involving `file`, sorted by confidence descending.
    pub fn for_file(&self, file: &str) -> &[FileCoupling] {
        self.by_file.get(file).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// Mines commit history for co-change couplings, with a per-root result
/// cache.
///
/// A missing repository is not an error: the empty result is cached for the
/// same window so the probe is not repeated on every query.
pub struct CouplingMiner {
    root: PathBuf,
    cache: Mutex<Option<(Instant, Arc<CouplingResult>)>>,
}

impl CouplingMiner {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf(), cache: Mutex::new(None) }
    }

    /// Drop the cached result (used on graph rebuild).
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap() = None;
    }

    pub fn mine(&self, opts: &CouplingOptions) -> Arc<CouplingResult> {
        {
            let cache = self.cache.lock().unwrap();

            if let Some((at, result)) = cache.as_ref() {
                if at.elapsed() < CACHE_TTL {
                    return result.clone();
                }
            }
        }

        let result = Arc::new(match self.mine_uncached(opts) {
            Ok(result) => result,
            Err(err) => {
                let err = RippleError::VcsUnavailable(err.to_string());
                log::warn!("Change-coupling analysis skipped: {}", err);
                CouplingResult::empty()
            }
        });

        *self.cache.lock().unwrap() = Some((Instant::now(), result.clone()));
        result
    }

    fn mine_uncached(&self, opts: &CouplingOptions) -> Result<CouplingResult, git2::Error> {
        let repo = Repository::discover(&self.root)?;
        let mut revwalk = repo.revwalk()?;
        revwalk.push_head()?;

        let mut file_changes: Counter<String> = Counter::new();
        let mut pair_counts: Counter<(String, String)> = Counter::new();
        let mut commits_analysed = 0;

        for oid in revwalk.take(opts.max_commits) {
            let commit = repo.find_commit(oid?)?;
            commits_analysed += 1;

            let files: Vec<String> = commit_files(&repo, &commit)?
                .into_iter()
                .filter(|f| is_coupling_candidate(f))
                .sorted()
                .dedup()
                .collect();

            if files.is_empty() || files.len() > opts.max_files_per_commit {
                continue;
            }

            file_changes.update(files.iter().cloned());

            // Single-file commits still feed the per-file counters above.
            pair_counts.update(
                files.iter().tuple_combinations().map(|(a, b)| (a.clone(), b.clone())),
            );
        }

        let mut couplings = Vec::new();

        for ((file1, file2), &co_change_count) in pair_counts.iter() {
            let file1_changes = file_changes[file1];
            let file2_changes = file_changes[file2];
            let confidence = co_change_count as f64 / file1_changes.max(file2_changes) as f64;

            if co_change_count >= opts.min_support && confidence >= opts.min_confidence {
                couplings.push(FileCoupling {
                    file1: file1.clone(),
                    file2: file2.clone(),
                    co_change_count,
                    file1_changes,
                    file2_changes,
                    confidence,
                    support: co_change_count,
                });
            }
        }

        couplings.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (&a.file1, &a.file2).cmp(&(&b.file1, &b.file2)))
        });

        let mut by_file: HashMap<String, Vec<FileCoupling>> = HashMap::new();

        for coupling in &couplings {
            by_file.entry(coupling.file1.clone()).or_default().push(coupling.clone());
            by_file.entry(coupling.file2.clone()).or_default().push(coupling.clone());
        }

        log::info!(
            "Mined {} coupling(s) from {} commit(s).",
            couplings.len(),
            commits_analysed
        );

        Ok(CouplingResult { couplings, by_file, commits_analysed, analysed_at_ms: epoch_ms() })
    }
}

/// The repository-relative paths a commit touched, from the tree diff
/// against its first parent. Merge commits yield nothing; the statistics
/// they would add are dominated by their parents' own commits.
fn commit_files(repo: &Repository, commit: &Commit<'_>) -> Result<Vec<String>, git2::Error> {
    let parents = commit.parents().collect_vec();
    let new_tree = commit.tree()?;

    let diff = match parents.len() {
        0 => repo.diff_tree_to_tree(None, Some(&new_tree), None),
        1 => {
            let old_tree = parents[0].tree()?;
            repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)
        }
        _ => return Ok(Vec::new()),
    }?;

    let mut files = Vec::new();

    for delta in diff.deltas() {
        let path = delta.new_file().path().or_else(|| delta.old_file().path());

        if let Some(path) = path.and_then(|p| p.to_str()) {
            files.push(path.to_string());
        }
    }

    Ok(files)
}

/// Lock files, assets and other non-source artifacts would swamp the
/// statistics; drop them before counting.
fn is_coupling_candidate(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();

    const LOCK_FILES: &[&str] =
        &["package-lock.json", "yarn.lock", "pnpm-lock.yaml", "cargo.lock", "poetry.lock", "go.sum"];
    const BINARY_EXTS: &[&str] = &[
        ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".webp", ".woff", ".woff2", ".ttf",
        ".otf", ".eot", ".zip", ".gz", ".tar", ".tgz", ".bz2", ".7z", ".pdf",
    ];

    !(LOCK_FILES.contains(&name.as_str())
        || name.ends_with(".lock")
        || name.ends_with(".map")
        || name.ends_with(".d.ts")
        || name.contains(".min.")
        || BINARY_EXTS.iter().any(|ext| name.ends_with(ext)))
}
