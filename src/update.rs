use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools;

use crate::core::ChangeEvent;
use crate::core::ChangeKind;
use crate::core::UpdateSummary;
use crate::graph::DepGraph;
use crate::imports::parse_imports;
use crate::imports::ConfigCache;
use crate::languages::Lang;
use crate::memo::ImpactMemo;
use crate::scc::SccResult;

/// Apply a single file change to the graph, recomputing SCCs and
/// invalidating exactly the memo entries the change can reach.
///
/// All three kinds are idempotent under replay, and the forward/reverse
/// transposition invariant holds on every exit path. A file that is added
/// while pre-existing files already name it in source keeps those importers
/// unchanged until their own next event or a full rebuild.
pub fn apply_change(
    graph: &mut DepGraph,
    scc: &mut SccResult,
    memo: &mut ImpactMemo,
    configs: &ConfigCache,
    event: &ChangeEvent,
) -> UpdateSummary {
    let path = &event.path;

    match event.kind {
        ChangeKind::Deleted => apply_removal(graph, scc, memo, path, event),
        ChangeKind::Added | ChangeKind::Modified => {
            apply_upsert(graph, scc, memo, configs, path, event)
        }
    }
}

fn apply_upsert(
    graph: &mut DepGraph,
    scc: &mut SccResult,
    memo: &mut ImpactMemo,
    configs: &ConfigCache,
    path: &PathBuf,
    event: &ChangeEvent,
) -> UpdateSummary {
    let inserted = graph.insert_file(path.clone());
    let parsed = reparse(graph, configs, path, event.new_content.as_deref());
    let (added, removed) = graph.set_forward_edges(path, parsed);

    let edges_changed = !added.is_empty() || !removed.is_empty();
    let affected = graph.reverse_closure(path).into_iter().sorted().collect_vec();

    let invalidated = if edges_changed || inserted {
        *scc = SccResult::compute(graph);
        memo.invalidate(affected.iter())
    } else {
        0
    };

    log::debug!(
        "Applied {} to {}: +{} -{} edge(s), {} memo(s) invalidated.",
        event.kind,
        event.display_path,
        added.len(),
        removed.len(),
        invalidated
    );

    UpdateSummary {
        path: path.clone(),
        display_path: graph.display_path(path),
        kind: event.kind,
        added_edges: added.into_iter().map(|t| (path.clone(), t)).collect(),
        removed_edges: removed.into_iter().map(|t| (path.clone(), t)).collect(),
        edges_changed: edges_changed || inserted,
        affected_files: affected,
        invalidated_memos: invalidated,
    }
}

fn apply_removal(
    graph: &mut DepGraph,
    scc: &mut SccResult,
    memo: &mut ImpactMemo,
    path: &PathBuf,
    event: &ChangeEvent,
) -> UpdateSummary {
    if !graph.contains(path) {
        // Replay of an already-applied delete.
        return UpdateSummary {
            path: path.clone(),
            display_path: event.display_path.clone(),
            kind: event.kind,
            added_edges: Vec::new(),
            removed_edges: Vec::new(),
            edges_changed: false,
            affected_files: Vec::new(),
            invalidated_memos: 0,
        };
    }

    // The closure must be taken on the graph as it stands before deletion;
    // afterwards the dependents are unreachable from `path`.
    let affected = graph.reverse_closure(path).into_iter().sorted().collect_vec();

    let mut removed_edges: Vec<(PathBuf, PathBuf)> =
        graph.forward(path).iter().map(|t| (path.clone(), t.clone())).collect();
    removed_edges.extend(graph.reverse(path).iter().map(|s| (s.clone(), path.clone())));

    graph.remove_file(path);
    *scc = SccResult::compute(graph);
    let invalidated = memo.invalidate(affected.iter());

    log::debug!(
        "Removed {} from the graph: -{} edge(s), {} memo(s) invalidated.",
        event.display_path,
        removed_edges.len(),
        invalidated
    );

    UpdateSummary {
        path: path.clone(),
        display_path: event.display_path.clone(),
        kind: event.kind,
        added_edges: Vec::new(),
        removed_edges,
        edges_changed: true,
        affected_files: affected,
        invalidated_memos: invalidated,
    }
}

/// Re-parse a file's imports, keeping only targets the graph knows about.
fn reparse(
    graph: &DepGraph,
    configs: &ConfigCache,
    path: &Path,
    content: Option<&str>,
) -> Vec<PathBuf> {
    let lang = match Lang::of(path) {
        Some(lang) => lang,
        None => return Vec::new(),
    };

    parse_imports(lang, path, content, graph.project_root(), graph.source_roots(), configs)
        .into_iter()
        .filter(|t| graph.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::core::normalize_path;
    use crate::impact::analyze;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        graph: DepGraph,
        scc: SccResult,
        memo: ImpactMemo,
        configs: ConfigCache,
    }

    impl Fixture {
        /// A real on-disk TypeScript project, graph built from its imports.
        fn new(files: &[(&str, &str)]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = normalize_path(dir.path());

            for (name, content) in files {
                fs::write(root.join(name), content).unwrap();
            }

            let configs = ConfigCache::new();
            let mut graph =
                DepGraph::new(root.clone(), vec![root.clone()], vec![Lang::TypeScript]);

            for (name, _) in files {
                graph.insert_file(root.join(name));
            }

            for (name, _) in files {
                let path = root.join(name);
                let deps =
                    parse_imports(Lang::TypeScript, &path, None, &root, &[root.clone()], &configs);
                graph.set_forward_edges(&path, deps);
            }

            let scc = SccResult::compute(&graph);
            Self { _dir: dir, root, graph, scc, memo: ImpactMemo::default(), configs }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.join(name)
        }

        fn event(&self, name: &str, kind: ChangeKind, new_content: Option<&str>) -> ChangeEvent {
            let path = self.path(name);

            if let Some(content) = new_content {
                fs::write(&path, content).unwrap();
            } else if kind == ChangeKind::Deleted {
                let _ = fs::remove_file(&path);
            }

            ChangeEvent::new(
                path,
                name.to_string(),
                kind,
                None,
                new_content.map(|c| c.to_string()),
                Vec::new(),
            )
        }

        fn apply(&mut self, event: &ChangeEvent) -> UpdateSummary {
            let summary =
                apply_change(&mut self.graph, &mut self.scc, &mut self.memo, &self.configs, event);
            assert!(self.graph.adjacency_violations().is_empty());
            summary
        }
    }

    fn chain() -> Fixture {
        Fixture::new(&[
            ("a.ts", "import './b';\n"),
            ("b.ts", "import './c';\n"),
            ("c.ts", "export {};\n"),
        ])
    }

    #[test]
    fn modify_removes_stale_edges_and_invalidates_memos() {
        // S3: warm the memo, then drop b's import of c.
        let mut fx = chain();

        let c_path = fx.path("c.ts");
        analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &c_path, None).unwrap();
        let c_path = fx.path("c.ts");
        let cached =
            analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &c_path, None).unwrap();
        assert!(cached.from_cache);

        let event = fx.event("b.ts", ChangeKind::Modified, Some("export {};\n"));
        let summary = fx.apply(&event);

        assert!(summary.edges_changed);
        assert_eq!(summary.removed_edges, vec![(fx.path("b.ts"), fx.path("c.ts"))]);
        assert!(summary.invalidated_memos >= 1);

        let c_path = fx.path("c.ts");
        let fresh =
            analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &c_path, None).unwrap();
        assert!(!fresh.from_cache);
        assert!(fresh.direct_dependents.is_empty());
        assert_eq!(fresh.total_impacted, 0);
        assert_eq!(fresh.risk, crate::core::RiskLevel::None);

        let a_path = fx.path("a.ts");
        let a = analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &a_path, None).unwrap();
        assert!(a.direct_dependents.is_empty());

        let b_path = fx.path("b.ts");
        let b = analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &b_path, None).unwrap();
        assert_eq!(b.direct_dependents, vec!["a.ts"]);
    }

    #[test]
    fn add_links_the_new_file_forward() {
        // S6: a new file d importing b.
        let mut fx = chain();

        let event = fx.event("d.ts", ChangeKind::Added, Some("import './b';\n"));
        let summary = fx.apply(&event);

        assert_eq!(fx.graph.file_count(), 4);
        assert_eq!(summary.added_edges, vec![(fx.path("d.ts"), fx.path("b.ts"))]);

        let reverse: Vec<&Path> = fx.graph.reverse(fx.path("b.ts")).iter().map(|p| p.as_path()).collect();
        assert_eq!(reverse.len(), 2);
        assert!(reverse.contains(&fx.path("a.ts").as_path()));
        assert!(reverse.contains(&fx.path("d.ts").as_path()));

        let b_path = fx.path("b.ts");
        let b = analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &b_path, None).unwrap();
        assert_eq!(b.direct_dependents, vec!["a.ts", "d.ts"]);
        assert_eq!(b.total_impacted, 2);
    }

    #[test]
    fn add_of_known_file_degrades_to_modify() {
        let mut fx = chain();

        let event = fx.event("b.ts", ChangeKind::Added, Some("export {};\n"));
        let summary = fx.apply(&event);

        assert_eq!(fx.graph.file_count(), 3);
        assert_eq!(summary.removed_edges, vec![(fx.path("b.ts"), fx.path("c.ts"))]);
    }

    #[test]
    fn remove_unlinks_both_directions_and_hits_closure() {
        let mut fx = chain();

        let c_path = fx.path("c.ts");
        analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &c_path, None).unwrap();

        let event = fx.event("b.ts", ChangeKind::Deleted, None);
        let summary = fx.apply(&event);

        assert!(!fx.graph.contains(fx.path("b.ts")));
        assert_eq!(summary.removed_edges.len(), 2);
        // a and b were the reverse closure of b before deletion.
        assert_eq!(summary.affected_files, vec![fx.path("a.ts"), fx.path("b.ts")]);
        // The memo entry for c indexed b through its impact set.
        assert_eq!(summary.invalidated_memos, 1);
        assert_eq!(fx.scc.scc_count(), 2);
    }

    #[test]
    fn replayed_events_are_idempotent() {
        let mut fx = chain();

        let add = fx.event("d.ts", ChangeKind::Added, Some("import './b';\n"));
        fx.apply(&add);
        let second = fx.apply(&add);

        assert!(second.added_edges.is_empty());
        assert!(second.removed_edges.is_empty());
        assert_eq!(fx.graph.file_count(), 4);

        let delete = fx.event("d.ts", ChangeKind::Deleted, None);
        fx.apply(&delete);
        let replayed = fx.apply(&delete);

        assert!(!replayed.edges_changed);
        assert_eq!(fx.graph.file_count(), 3);
    }

    #[test]
    fn unchanged_imports_leave_memo_and_scc_alone() {
        let mut fx = chain();

        let c_path = fx.path("c.ts");
        analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &c_path, None).unwrap();

        // A comment-only edit keeps the same resolved imports.
        let event = fx.event("b.ts", ChangeKind::Modified, Some("// note\nimport './c';\n"));
        let summary = fx.apply(&event);

        assert!(!summary.edges_changed);
        assert_eq!(summary.invalidated_memos, 0);

        let c_path = fx.path("c.ts");
        let again =
            analyze(&fx.graph, Some(&fx.scc), &mut fx.memo, &c_path, None).unwrap();
        assert!(again.from_cache);
    }

    #[test]
    fn incremental_matches_scratch_rebuild() {
        // Apply a sequence of events, then rebuild from the final disk
        // state; files, edges and SCCs must agree.
        let mut fx = chain();

        fx.apply(&fx.event("d.ts", ChangeKind::Added, Some("import './a';\nimport './c';\n")));
        fx.apply(&fx.event("b.ts", ChangeKind::Modified, Some("import './c';\nimport './a';\n")));
        fx.apply(&fx.event("c.ts", ChangeKind::Deleted, None));

        let rebuilt = Fixture::new(&[
            ("a.ts", "import './b';\n"),
            ("b.ts", "import './c';\nimport './a';\n"),
            ("d.ts", "import './a';\nimport './c';\n"),
        ]);

        // Same node set.
        let mut incremental: Vec<String> =
            fx.graph.files().map(|f| fx.graph.display_path(f)).collect();
        let mut scratch: Vec<String> =
            rebuilt.graph.files().map(|f| rebuilt.graph.display_path(f)).collect();
        incremental.sort();
        scratch.sort();
        assert_eq!(incremental, scratch);

        // Same edges.
        for name in ["a.ts", "b.ts", "d.ts"] {
            let mut left: Vec<String> = fx
                .graph
                .forward(fx.path(name))
                .iter()
                .map(|f| fx.graph.display_path(f))
                .collect();
            let mut right: Vec<String> = rebuilt
                .graph
                .forward(rebuilt.path(name))
                .iter()
                .map(|f| rebuilt.graph.display_path(f))
                .collect();
            left.sort();
            right.sort();
            assert_eq!(left, right, "forward edges of {}", name);
        }

        assert_eq!(fx.scc.scc_count(), rebuilt.scc.scc_count());
        assert_eq!(fx.scc.cyclic_scc_count(), rebuilt.scc.cyclic_scc_count());
    }
}
