use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::PathBuf;

use itertools::Itertools;
use serde::Serialize;

use crate::error::RippleError;
use crate::graph::DepGraph;

/// One node of the condensed DAG: a strongly-connected component.
#[derive(Debug, Clone, Serialize)]
pub struct SccNode {
    pub index: usize,
    pub files: Vec<PathBuf>,
    pub size: usize,
    pub is_cyclic: bool,
}

/// The condensation of the dependency graph: one node per SCC, deduplicated
/// inter-component edges, and a topological order with dependencies before
/// dependents.
#[derive(Debug, Clone)]
pub struct CondensedGraph {
    pub nodes: Vec<SccNode>,
    pub forward: Vec<Vec<usize>>,
    pub reverse: Vec<Vec<usize>>,
    pub topo_order: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct SccResult {
    pub components: Vec<Vec<PathBuf>>,
    pub node_to_component: HashMap<PathBuf, usize>,
    pub condensed: CondensedGraph,
}

impl SccResult {
    /// Compute SCCs, the condensed DAG, and the topological order.
    ///
    /// Tarjan is run iteratively with an explicit work stack, so deep
    /// dependency chains cannot exhaust the thread stack. Self-edges are
    /// ignored; a singleton with a self-import is not cyclic.
    pub fn compute(graph: &DepGraph) -> Self {
        // Sorted interning keeps component order stable across rebuilds.
        let files: Vec<&PathBuf> = graph.files().sorted().collect();
        let ids: HashMap<&PathBuf, usize> = files.iter().enumerate().map(|(i, f)| (*f, i)).collect();

        let adjacency: Vec<Vec<usize>> = files
            .iter()
            .map(|f| graph.forward(f).iter().filter_map(|t| ids.get(t).copied()).collect())
            .collect();

        let components_ix = tarjan(&adjacency);

        let mut node_to_component = HashMap::with_capacity(files.len());
        let components: Vec<Vec<PathBuf>> = components_ix
            .iter()
            .enumerate()
            .map(|(ci, members)| {
                members
                    .iter()
                    .map(|&v| {
                        node_to_component.insert(files[v].clone(), ci);
                        files[v].clone()
                    })
                    .collect()
            })
            .collect();

        let condensed = condense(&adjacency, &components_ix, &components);
        Self { components, node_to_component, condensed }
    }

    pub fn scc_count(&self) -> usize {
        self.components.len()
    }

    pub fn cyclic_scc_count(&self) -> usize {
        self.condensed.nodes.iter().filter(|n| n.is_cyclic).count()
    }

    pub fn component_of(&self, file: &PathBuf) -> Option<usize> {
        self.node_to_component.get(file).copied()
    }
}

/// Iterative Tarjan over `adjacency`. Self-edges are skipped. Components
/// come out with dependencies before dependents.
fn tarjan(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = adjacency.len();
    let mut index = vec![usize::MAX; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    // (node, next adjacency position) frames replace recursion.
    let mut work: Vec<(usize, usize)> = Vec::new();

    for root in 0..n {
        if index[root] != usize::MAX {
            continue;
        }

        work.push((root, 0));

        while let Some((v, i)) = work.last().copied() {
            if i == 0 {
                index[v] = next_index;
                lowlink[v] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[v] = true;
            }

            let mut pending = None;
            let mut j = i;

            while j < adjacency[v].len() {
                let w = adjacency[v][j];
                j += 1;

                if w == v {
                    continue;
                }

                if index[w] == usize::MAX {
                    pending = Some(w);
                    break;
                }

                if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
            }

            work.last_mut().expect("frame still present").1 = j;

            if let Some(w) = pending {
                work.push((w, 0));
                continue;
            }

            if lowlink[v] == index[v] {
                let mut component = Vec::new();

                loop {
                    let w = stack.pop().expect("tarjan stack must not underflow");
                    on_stack[w] = false;
                    component.push(w);

                    if w == v {
                        break;
                    }
                }

                component.sort();
                components.push(component);
            }

            work.pop();

            if let Some(&(parent, _)) = work.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[v]);
            }
        }
    }

    components
}

fn condense(
    adjacency: &[Vec<usize>],
    components_ix: &[Vec<usize>],
    components: &[Vec<PathBuf>],
) -> CondensedGraph {
    let count = components_ix.len();
    let mut component_of = vec![0usize; adjacency.len()];

    for (ci, members) in components_ix.iter().enumerate() {
        for &v in members {
            component_of[v] = ci;
        }
    }

    let mut forward_sets: Vec<HashSet<usize>> = vec![HashSet::new(); count];
    let mut reverse_sets: Vec<HashSet<usize>> = vec![HashSet::new(); count];

    for (v, targets) in adjacency.iter().enumerate() {
        for &w in targets {
            let (cu, cv) = (component_of[v], component_of[w]);

            if cu != cv {
                forward_sets[cu].insert(cv);
                reverse_sets[cv].insert(cu);
            }
        }
    }

    let forward: Vec<Vec<usize>> =
        forward_sets.into_iter().map(|s| s.into_iter().sorted().collect()).collect();
    let reverse: Vec<Vec<usize>> =
        reverse_sets.into_iter().map(|s| s.into_iter().sorted().collect()).collect();

    let nodes = components
        .iter()
        .enumerate()
        .map(|(index, files)| SccNode {
            index,
            files: files.clone(),
            size: files.len(),
            is_cyclic: files.len() > 1,
        })
        .collect();

    let topo_order = kahn(&forward, &reverse);
    CondensedGraph { nodes, forward, reverse, topo_order }
}

/// Kahn's algorithm over the condensed graph, starting from SCCs with no
/// outgoing forward edges. The result lists dependencies before their
/// dependents.
fn kahn(forward: &[Vec<usize>], reverse: &[Vec<usize>]) -> Vec<usize> {
    let count = forward.len();
    let mut out_degree: Vec<usize> = forward.iter().map(|t| t.len()).collect();
    let mut queue: VecDeque<usize> =
        (0..count).filter(|&u| out_degree[u] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(u) = queue.pop_front() {
        order.push(u);

        for &importer in &reverse[u] {
            out_degree[importer] -= 1;

            if out_degree[importer] == 0 {
                queue.push_back(importer);
            }
        }
    }

    if order.len() < count {
        // Cannot happen on a condensation, which is acyclic; a short order
        // means the component computation itself is wrong.
        let err = RippleError::InvariantViolation(format!(
            "topological sort covered {} of {} components",
            order.len(),
            count
        ));
        log::error!("{}", err);

        let seen: HashSet<usize> = order.iter().copied().collect();
        order.extend((0..count).filter(|u| !seen.contains(u)));
    }

    order
}
