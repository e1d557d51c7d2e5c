use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools;
use serde::Serialize;

use crate::core::display_path;
use crate::core::RiskLevel;
use crate::languages::Lang;

/// The dependency graph of a project's internal files.
///
/// Pure data: a set of nodes plus forward (imports) and reverse
/// (imported-by) adjacency, maintained as exact transposes of each other.
/// Mutation happens only during the initial build and through the
/// incremental updater.
#[derive(Debug, Clone)]
pub struct DepGraph {
    project_root: PathBuf,
    source_roots: Vec<PathBuf>,
    languages: Vec<Lang>,
    files: HashSet<PathBuf>,
    forward: HashMap<PathBuf, Vec<PathBuf>>,
    reverse: HashMap<PathBuf, Vec<PathBuf>>,
}

impl DepGraph {
    pub fn new(project_root: PathBuf, source_roots: Vec<PathBuf>, languages: Vec<Lang>) -> Self {
        Self {
            project_root,
            source_roots,
            languages,
            files: HashSet::new(),
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The canonical source root used for relative-path display.
    pub fn canonical_root(&self) -> &Path {
        self.source_roots.first().map(|p| p.as_path()).unwrap_or(&self.project_root)
    }

    pub fn source_roots(&self) -> &[PathBuf] {
        &self.source_roots
    }

    pub fn languages(&self) -> &[Lang] {
        &self.languages
    }

    pub fn contains<P: AsRef<Path>>(&self, file: P) -> bool {
        self.files.contains(file.as_ref())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter()
    }

    pub fn edge_count(&self) -> usize {
        self.forward.values().map(|v| v.len()).sum()
    }

    /// Files this file imports.
    pub fn forward<P: AsRef<Path>>(&self, file: P) -> &[PathBuf] {
        self.forward.get(file.as_ref()).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Files that import this file.
    pub fn reverse<P: AsRef<Path>>(&self, file: P) -> &[PathBuf] {
        self.reverse.get(file.as_ref()).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn display_path<P: AsRef<Path>>(&self, file: P) -> String {
        display_path(file, self.canonical_root())
    }

    /// Insert a node with no edges. Returns false when already present.
    pub fn insert_file(&mut self, file: PathBuf) -> bool {
        if self.files.insert(file.clone()) {
            self.forward.entry(file.clone()).or_default();
            self.reverse.entry(file).or_default();
            true
        } else {
            false
        }
    }

    /// Replace the forward edges of `file`, keeping the reverse map in sync.
    ///
    /// Targets not currently in the node set are dropped. Returns the
    /// (added, removed) edge targets.
    pub fn set_forward_edges(
        &mut self,
        file: &Path,
        targets: Vec<PathBuf>,
    ) -> (Vec<PathBuf>, Vec<PathBuf>) {
        debug_assert!(self.files.contains(file));

        let new: Vec<PathBuf> =
            targets.into_iter().filter(|t| self.files.contains(t)).unique().collect();
        let old = self.forward.get(file).cloned().unwrap_or_default();

        let old_set: HashSet<&PathBuf> = old.iter().collect();
        let new_set: HashSet<&PathBuf> = new.iter().collect();

        let added: Vec<PathBuf> = new.iter().filter(|t| !old_set.contains(t)).cloned().collect();
        let removed: Vec<PathBuf> = old.iter().filter(|t| !new_set.contains(t)).cloned().collect();

        for target in &removed {
            if let Some(sources) = self.reverse.get_mut(target) {
                sources.retain(|s| s != file);
            }
        }

        for target in &added {
            let sources = self.reverse.entry(target.clone()).or_default();
            if !sources.iter().any(|s| s == file) {
                sources.push(file.to_path_buf());
            }
        }

        self.forward.insert(file.to_path_buf(), new);
        (added, removed)
    }

    /// Remove a node and unlink it from both adjacency directions.
    pub fn remove_file(&mut self, file: &Path) -> bool {
        if !self.files.remove(file) {
            return false;
        }

        for target in self.forward.remove(file).unwrap_or_default() {
            if let Some(sources) = self.reverse.get_mut(&target) {
                sources.retain(|s| s != file);
            }
        }

        for source in self.reverse.remove(file).unwrap_or_default() {
            if let Some(targets) = self.forward.get_mut(&source) {
                targets.retain(|t| t != file);
            }
        }

        true
    }

    /// The reverse-transitive closure of `file`, including `file` itself.
    pub fn reverse_closure(&self, file: &Path) -> HashSet<PathBuf> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();

        if !self.files.contains(file) {
            return seen;
        }

        seen.insert(file.to_path_buf());
        queue.push_back(file.to_path_buf());

        while let Some(current) = queue.pop_front() {
            for source in self.reverse(&current) {
                if seen.insert(source.clone()) {
                    queue.push_back(source.clone());
                }
            }
        }

        seen
    }

    /// The most-imported files, ranked by reverse degree.
    pub fn hub_files(&self, top_n: usize) -> Vec<HubFile> {
        self.files
            .iter()
            .map(|f| (f, self.reverse(f).len()))
            .sorted_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)))
            .take(top_n)
            .map(|(f, count)| HubFile {
                file: f.clone(),
                display_path: self.display_path(f),
                dependent_count: count,
                risk: RiskLevel::of_impacted(count),
            })
            .collect()
    }

    /// Verify the mutual-adjacency invariant; returns the violations.
    ///
    /// Cheap enough to run after tests and in debug assertions, not on the
    /// query path.
    pub fn adjacency_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for (source, targets) in &self.forward {
            for target in targets {
                if !self.reverse(target).contains(source) {
                    violations.push(format!(
                        "forward edge {} -> {} missing from reverse map",
                        source.display(),
                        target.display()
                    ));
                }
            }
        }

        for (target, sources) in &self.reverse {
            for source in sources {
                if !self.forward(source).contains(target) {
                    violations.push(format!(
                        "reverse edge {} <- {} missing from forward map",
                        target.display(),
                        source.display()
                    ));
                }
            }
        }

        violations
    }
}

/// A file with an unusually large in-degree; changes to it are high-risk.
#[derive(Debug, Clone, Serialize)]
pub struct HubFile {
    pub file: PathBuf,
    pub display_path: String,
    pub dependent_count: usize,
    pub risk: RiskLevel,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn graph_of(edges: &[(&str, &[&str])]) -> DepGraph {
        let mut graph = DepGraph::new(PathBuf::from("/proj"), vec![PathBuf::from("/proj")], vec![]);

        for (file, _) in edges {
            graph.insert_file(PathBuf::from(format!("/proj/{}", file)));
        }

        for (file, targets) in edges {
            let targets = targets.iter().map(|t| PathBuf::from(format!("/proj/{}", t))).collect();
            graph.set_forward_edges(Path::new(&format!("/proj/{}", file)), targets);
        }

        graph
    }

    pub(crate) fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/proj/{}", name))
    }

    #[test]
    fn forward_and_reverse_stay_transposed() {
        let graph = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);

        assert_eq!(graph.forward(p("a")), &[p("b")]);
        assert_eq!(graph.reverse(p("b")), &[p("a")]);
        assert_eq!(graph.reverse(p("c")), &[p("b")]);
        assert!(graph.adjacency_violations().is_empty());
    }

    #[test]
    fn set_forward_edges_reports_delta() {
        let mut graph = graph_of(&[("a", &["b", "c"]), ("b", &[]), ("c", &[]), ("d", &[])]);

        let (added, removed) = graph.set_forward_edges(&p("a"), vec![p("c"), p("d")]);
        assert_eq!(added, vec![p("d")]);
        assert_eq!(removed, vec![p("b")]);
        assert_eq!(graph.reverse(p("b")), &[] as &[PathBuf]);
        assert_eq!(graph.reverse(p("d")), &[p("a")]);
        assert!(graph.adjacency_violations().is_empty());
    }

    #[test]
    fn edges_to_unknown_targets_are_dropped() {
        let mut graph = graph_of(&[("a", &[]), ("b", &[])]);

        let (added, _) = graph.set_forward_edges(&p("a"), vec![p("b"), p("ghost")]);
        assert_eq!(added, vec![p("b")]);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn remove_unlinks_both_directions() {
        let mut graph = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);

        assert!(graph.remove_file(&p("b")));
        assert!(!graph.contains(p("b")));
        assert_eq!(graph.forward(p("a")), &[] as &[PathBuf]);
        assert_eq!(graph.reverse(p("c")), &[] as &[PathBuf]);
        assert!(graph.adjacency_violations().is_empty());

        // Idempotent under replay.
        assert!(!graph.remove_file(&p("b")));
    }

    #[test]
    fn reverse_closure_walks_transitively() {
        let graph = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[]), ("d", &[])]);

        let closure = graph.reverse_closure(&p("c"));
        assert_eq!(closure, [p("a"), p("b"), p("c")].into_iter().collect());
        assert!(graph.reverse_closure(&p("ghost")).is_empty());
    }

    #[test]
    fn hub_ranking_by_reverse_degree() {
        let graph =
            graph_of(&[("u", &["h"]), ("v", &["h"]), ("w", &["h"]), ("h", &[]), ("x", &["u"])]);

        let hubs = graph.hub_files(1);
        assert_eq!(hubs.len(), 1);
        assert_eq!(hubs[0].file, p("h"));
        assert_eq!(hubs[0].dependent_count, 3);
        assert_eq!(hubs[0].risk, RiskLevel::Low);
    }

    #[test]
    fn self_import_is_stored() {
        let mut graph = graph_of(&[("a", &[])]);

        graph.set_forward_edges(&p("a"), vec![p("a")]);
        assert_eq!(graph.forward(p("a")), &[p("a")]);
        assert_eq!(graph.reverse(p("a")), &[p("a")]);
        assert!(graph.adjacency_violations().is_empty());
    }
}
