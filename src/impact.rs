use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

use itertools::Itertools;
use serde::Serialize;

use crate::core::display_path;
use crate::core::RiskLevel;
use crate::error::Result;
use crate::error::RippleError;
use crate::graph::DepGraph;
use crate::history::CouplingResult;
use crate::languages::classify_layer;
use crate::languages::Layer;
use crate::memo::ImpactMemo;
use crate::memo::MemoEntry;
use crate::scc::SccResult;

const MAX_COUPLING_HINTS: usize = 5;

/// The answer to "if this file changes, what else is affected?".
///
/// File lists leave the core as forward-slash paths relative to the
/// canonical source root, sorted for stable output.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactReport {
    pub file: PathBuf,
    pub display_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<Layer>,
    pub risk: RiskLevel,
    pub direct_dependents: Vec<String>,
    pub transitive_dependents: Vec<String>,
    pub total_impacted: usize,
    pub cascade_levels: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circular_cluster: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scc_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cyclic_scc_count: Option<usize>,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub couplings: Option<Vec<CouplingHint>>,
}

/// A historically co-changing file that no import edge explains.
#[derive(Debug, Clone, Serialize)]
pub struct CouplingHint {
    pub file: String,
    pub confidence: f64,
    pub co_changes: usize,
}

/// Analyse the impact of changing `file`, consulting the memo cache first.
///
/// The only error is [`RippleError::FileNotInGraph`]; coupling enrichment
/// failures never surface.
pub fn analyze(
    graph: &DepGraph,
    scc: Option<&SccResult>,
    memo: &mut ImpactMemo,
    file: &Path,
    couplings: Option<&CouplingResult>,
) -> Result<ImpactReport> {
    if !graph.contains(file) {
        return Err(RippleError::FileNotInGraph { path: file.to_path_buf() });
    }

    let mut report = match memo.get(file) {
        Some(entry) => {
            let entry = entry.clone();
            from_cache_entry(graph, scc, file, entry)
        }
        None => {
            let (report, entry) = compute(graph, scc, file);
            memo.set(file.to_path_buf(), entry);
            report
        }
    };

    if let Some(couplings) = couplings {
        report.couplings = Some(hidden_couplings(graph, file, couplings));
    }

    Ok(report)
}

/// Fast path: reconstitute a report from a memo entry.
///
/// Direct dependents are recomputed from the live reverse edges (the cached
/// set is the transitive closure); the cyclic cluster is re-read from the
/// live SCC result.
fn from_cache_entry(
    graph: &DepGraph,
    scc: Option<&SccResult>,
    file: &Path,
    entry: MemoEntry,
) -> ImpactReport {
    let direct: HashSet<PathBuf> = graph.reverse(file).iter().cloned().collect();
    let transitive: Vec<&PathBuf> =
        entry.impact_set.iter().filter(|f| !direct.contains(*f)).collect();

    let cluster = circular_cluster(scc, file);

    ImpactReport {
        file: file.to_path_buf(),
        display_path: graph.display_path(file),
        layer: classify_layer(&graph.display_path(file)),
        risk: entry.risk,
        direct_dependents: to_display(graph, direct.iter()),
        transitive_dependents: to_display(graph, transitive.into_iter()),
        total_impacted: entry.impact_set.len(),
        cascade_levels: entry
            .cascade_levels
            .iter()
            .map(|(f, l)| (graph.display_path(f), *l))
            .collect(),
        circular_cluster: cluster.map(|c| to_display(graph, c.iter())),
        scc_count: scc.map(|s| s.scc_count()),
        cyclic_scc_count: scc.map(|s| s.cyclic_scc_count()),
        from_cache: true,
        couplings: None,
    }
}

/// Slow path: SCC-aware reverse BFS, falling back to a plain reverse walk
/// when no SCC result is attached.
fn compute(graph: &DepGraph, scc: Option<&SccResult>, file: &Path) -> (ImpactReport, MemoEntry) {
    let levels = match scc.and_then(|s| s.component_of(&file.to_path_buf()).map(|c| (s, c))) {
        Some((scc, component)) => condensed_levels(scc, file, component),
        None => plain_levels(graph, file),
    };

    let cluster = circular_cluster(scc, file);

    let mut direct: HashSet<PathBuf> = graph.reverse(file).iter().cloned().collect();
    if let Some(cluster) = &cluster {
        direct.extend(cluster.iter().cloned());
    }
    direct.remove(file);

    let transitive: Vec<PathBuf> =
        levels.keys().filter(|f| !direct.contains(*f)).cloned().collect();

    let impact_set: Vec<PathBuf> = direct.iter().chain(transitive.iter()).cloned().collect();
    let total = impact_set.len();
    let risk = RiskLevel::of_impacted(total);

    let entry = MemoEntry {
        impact_set,
        direct_count: direct.len(),
        transitive_count: transitive.len(),
        risk,
        cascade_levels: levels.clone(),
        computed_at: Instant::now(),
    };

    let report = ImpactReport {
        file: file.to_path_buf(),
        display_path: graph.display_path(file),
        layer: classify_layer(&graph.display_path(file)),
        risk,
        direct_dependents: to_display(graph, direct.iter()),
        transitive_dependents: to_display(graph, transitive.iter()),
        total_impacted: total,
        cascade_levels: levels.iter().map(|(f, l)| (graph.display_path(f), *l)).collect(),
        circular_cluster: cluster.map(|c| to_display(graph, c.iter())),
        scc_count: scc.map(|s| s.scc_count()),
        cyclic_scc_count: scc.map(|s| s.cyclic_scc_count()),
        from_cache: false,
        couplings: None,
    };

    (report, entry)
}

/// Cascade levels via BFS over the condensed reverse edges.
///
/// Every other file of the subject's SCC is level 0; files of an SCC at
/// condensed distance d are level d. The subject itself is excluded.
fn condensed_levels(scc: &SccResult, file: &Path, component: usize) -> HashMap<PathBuf, usize> {
    let mut component_level: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::new();

    component_level.insert(component, 0);
    queue.push_back(component);

    while let Some(current) = queue.pop_front() {
        let next_level = component_level[&current] + 1;

        for &dependent in &scc.condensed.reverse[current] {
            if !component_level.contains_key(&dependent) {
                component_level.insert(dependent, next_level);
                queue.push_back(dependent);
            }
        }
    }

    let mut levels = HashMap::new();

    for (&ci, &level) in &component_level {
        for member in &scc.condensed.nodes[ci].files {
            if member.as_path() != file {
                levels.insert(member.clone(), level);
            }
        }
    }

    levels
}

fn plain_levels(graph: &DepGraph, file: &Path) -> HashMap<PathBuf, usize> {
    let mut levels: HashMap<PathBuf, usize> = HashMap::new();
    let mut queue = VecDeque::new();

    levels.insert(file.to_path_buf(), 0);
    queue.push_back(file.to_path_buf());

    while let Some(current) = queue.pop_front() {
        let next_level = levels[&current] + 1;

        for dependent in graph.reverse(&current) {
            if !levels.contains_key(dependent) {
                levels.insert(dependent.clone(), next_level);
                queue.push_back(dependent.clone());
            }
        }
    }

    levels.remove(file);
    levels
}

/// The other members of the subject's SCC, iff that SCC is cyclic.
fn circular_cluster(scc: Option<&SccResult>, file: &Path) -> Option<Vec<PathBuf>> {
    let scc = scc?;
    let component = scc.component_of(&file.to_path_buf())?;
    let node = &scc.condensed.nodes[component];

    if !node.is_cyclic {
        return None;
    }

    Some(node.files.iter().filter(|f| f.as_path() != file).cloned().collect())
}

/// Up to five highest-confidence couplings whose other side shares no
/// import edge with the subject: hidden dependencies only.
fn hidden_couplings(graph: &DepGraph, file: &Path, couplings: &CouplingResult) -> Vec<CouplingHint> {
    let rel = display_path(file, graph.project_root());

    let linked: HashSet<String> = graph
        .forward(file)
        .iter()
        .chain(graph.reverse(file).iter())
        .map(|f| display_path(f, graph.project_root()))
        .collect();

    couplings
        .for_file(&rel)
        .iter()
        .filter_map(|c| {
            let other = c.other_side(&rel)?;

            if linked.contains(other) {
                None
            } else {
                Some(CouplingHint {
                    file: other.to_string(),
                    confidence: c.confidence,
                    co_changes: c.co_change_count,
                })
            }
        })
        .take(MAX_COUPLING_HINTS)
        .collect()
}

fn to_display<'a, I>(graph: &DepGraph, files: I) -> Vec<String>
where
    I: Iterator<Item = &'a PathBuf>,
{
    files.map(|f| graph.display_path(f)).sorted().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::graph_of;
    use crate::graph::tests::p;

    fn analyze_fresh(graph: &DepGraph, file: &Path) -> (ImpactReport, ImpactMemo) {
        let scc = SccResult::compute(graph);
        let mut memo = ImpactMemo::default();
        let report = analyze(graph, Some(&scc), &mut memo, file, None).unwrap();
        (report, memo)
    }

    #[test]
    fn unknown_file_is_a_typed_error() {
        let graph = graph_of(&[("a", &[])]);
        let mut memo = ImpactMemo::default();

        let err = analyze(&graph, None, &mut memo, &p("ghost"), None).unwrap_err();
        assert!(matches!(err, RippleError::FileNotInGraph { .. }));
    }

    #[test]
    fn minimal_chain_levels_and_risk() {
        // S1: a -> b -> c.
        let graph = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let (report, _) = analyze_fresh(&graph, &p("c"));

        assert_eq!(report.direct_dependents, vec!["b"]);
        assert_eq!(report.transitive_dependents, vec!["a"]);
        assert_eq!(report.total_impacted, 2);
        assert_eq!(report.risk, RiskLevel::Low);
        assert_eq!(report.cascade_levels.get("b"), Some(&1));
        assert_eq!(report.cascade_levels.get("a"), Some(&2));
        assert!(report.circular_cluster.is_none());
        assert!(!report.from_cache);
    }

    #[test]
    fn cycle_members_are_level_zero() {
        // S2: x -> y -> z -> x.
        let graph = graph_of(&[("x", &["y"]), ("y", &["z"]), ("z", &["x"])]);
        let (report, _) = analyze_fresh(&graph, &p("x"));

        assert_eq!(report.direct_dependents, vec!["y", "z"]);
        assert!(report.transitive_dependents.is_empty());
        assert_eq!(report.total_impacted, 2);
        assert_eq!(report.circular_cluster, Some(vec!["y".to_string(), "z".to_string()]));
        assert_eq!(report.cascade_levels.get("y"), Some(&0));
        assert_eq!(report.cascade_levels.get("z"), Some(&0));
    }

    #[test]
    fn second_query_hits_the_memo() {
        let graph = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let scc = SccResult::compute(&graph);
        let mut memo = ImpactMemo::default();

        let first = analyze(&graph, Some(&scc), &mut memo, &p("c"), None).unwrap();
        let second = analyze(&graph, Some(&scc), &mut memo, &p("c"), None).unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.direct_dependents, first.direct_dependents);
        assert_eq!(second.transitive_dependents, first.transitive_dependents);
        assert_eq!(second.total_impacted, first.total_impacted);
        assert_eq!(second.cascade_levels, first.cascade_levels);
        assert_eq!(memo.stats().hits, 1);
    }

    #[test]
    fn no_dependents_means_no_risk() {
        let graph = graph_of(&[("a", &["b"]), ("b", &[])]);
        let (report, _) = analyze_fresh(&graph, &p("a"));

        assert!(report.direct_dependents.is_empty());
        assert_eq!(report.total_impacted, 0);
        assert_eq!(report.risk, RiskLevel::None);
    }

    #[test]
    fn risk_rises_with_fanout() {
        let dependents: Vec<String> = (0..10).map(|i| format!("d{}", i)).collect();
        let mut rows: Vec<(&str, Vec<&str>)> =
            dependents.iter().map(|d| (d.as_str(), vec!["hub"])).collect();
        rows.push(("hub", vec![]));

        let edges: Vec<(&str, &[&str])> = rows.iter().map(|(f, t)| (*f, t.as_slice())).collect();
        let graph = graph_of(&edges);
        let (report, _) = analyze_fresh(&graph, &p("hub"));

        assert_eq!(report.total_impacted, 10);
        assert_eq!(report.risk, RiskLevel::High);
    }

    #[test]
    fn coupling_hints_exclude_import_linked_files() {
        use crate::history::FileCoupling;

        let graph = graph_of(&[("a", &["b"]), ("b", &[]), ("c", &[])]);

        let pair = |other: &str, confidence: f64| FileCoupling {
            file1: "a".to_string(),
            file2: other.to_string(),
            co_change_count: 4,
            file1_changes: 5,
            file2_changes: 4,
            confidence,
            support: 4,
        };

        let couplings = CouplingResult {
            couplings: vec![pair("b", 0.8), pair("c", 0.7)],
            by_file: [("a".to_string(), vec![pair("b", 0.8), pair("c", 0.7)])]
                .into_iter()
                .collect(),
            commits_analysed: 10,
            analysed_at_ms: 0,
        };

        let scc = SccResult::compute(&graph);
        let mut memo = ImpactMemo::default();
        let report = analyze(&graph, Some(&scc), &mut memo, &p("a"), Some(&couplings)).unwrap();

        // b is explained by the a -> b import; only c is hidden.
        let hints = report.couplings.unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].file, "c");
        assert_eq!(hints[0].co_changes, 4);
    }

    #[test]
    fn falls_back_to_plain_bfs_without_scc() {
        let graph = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let mut memo = ImpactMemo::default();

        let report = analyze(&graph, None, &mut memo, &p("c"), None).unwrap();
        assert_eq!(report.direct_dependents, vec!["b"]);
        assert_eq!(report.transitive_dependents, vec!["a"]);
        assert!(report.scc_count.is_none());
    }
}
