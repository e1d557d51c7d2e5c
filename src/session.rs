use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;

use crate::core::normalize_path;
use crate::core::ChangeEvent;
use crate::core::UpdateSummary;
use crate::error::Result;
use crate::graph::DepGraph;
use crate::graph::HubFile;
use crate::history::CouplingMiner;
use crate::history::CouplingOptions;
use crate::history::CouplingResult;
use crate::imports::parse_imports;
use crate::imports::ConfigCache;
use crate::impact::analyze;
use crate::impact::ImpactReport;
use crate::languages::discover_all;
use crate::languages::Lang;
use crate::memo::ImpactMemo;
use crate::memo::MemoStats;
use crate::memo::DEFAULT_MEMO_CAPACITY;
use crate::scc::SccResult;
use crate::update::apply_change;
use crate::watch::ContentCache;
use crate::watch::ProjectWatcher;
use crate::watch::WatchConfig;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_files: Option<usize>,
    pub memo_capacity: usize,
    pub coupling: CouplingOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_files: None,
            memo_capacity: DEFAULT_MEMO_CAPACITY,
            coupling: CouplingOptions::default(),
        }
    }
}

/// Receives change and graph-update notifications, synchronously on the
/// thread that applied the change.
pub trait SessionListener: Send + Sync {
    fn on_change(&self, _event: &ChangeEvent) {}
    fn on_graph_updated(&self, _update: &UpdateSummary) {}
}

/// Handle returned by the subscribe calls; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: HashMap<u64, Arc<dyn SessionListener>>,
}

struct CoreState {
    graph: DepGraph,
    scc: SccResult,
    memo: ImpactMemo,
}

/// One open project: the graph, its SCC condensation, the memo cache, the
/// coupling miner and (optionally) the file watcher, torn down together.
///
/// The three core stores sit behind one mutex, so a subscriber never
/// observes an invalidated memo over a not-yet-updated graph.
pub struct ProjectSession {
    project_root: PathBuf,
    languages: Vec<Lang>,
    source_roots: Vec<PathBuf>,
    options: SessionOptions,
    configs: ConfigCache,
    core: Mutex<CoreState>,
    miner: CouplingMiner,
    listeners: Mutex<ListenerSet>,
    watcher: Mutex<Option<ProjectWatcher>>,
}

impl ProjectSession {
    /// Open a project and build its dependency graph.
    ///
    /// No detected language is not an error: the session opens with an
    /// empty graph.
    pub fn open(
        project_root: &Path,
        options: SessionOptions,
        progress: Option<&MultiProgress>,
    ) -> Self {
        let project_root = normalize_path(project_root);
        let languages = Lang::detect(&project_root);

        if languages.is_empty() {
            log::warn!("No project type detected at {}.", project_root.display());
        } else {
            log::info!("Detected language(s): {}.", languages.iter().join(", "));
        }

        let source_roots: Vec<PathBuf> =
            languages.iter().flat_map(|l| l.source_dirs(&project_root)).unique().collect();

        let configs = ConfigCache::new();
        let graph =
            build_graph(&project_root, &languages, &source_roots, &configs, &options, progress);
        let scc = SccResult::compute(&graph);
        let memo = ImpactMemo::new(options.memo_capacity);

        Self {
            miner: CouplingMiner::new(&project_root),
            project_root,
            languages,
            source_roots,
            options,
            configs,
            core: Mutex::new(CoreState { graph, scc, memo }),
            listeners: Mutex::new(ListenerSet::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Walk upward from `start` looking for a manifest marker.
    pub fn discover_project_root(start: &Path) -> Option<PathBuf> {
        let start = normalize_path(start);

        for dir in start.ancestors() {
            if dir.join(".git").exists() || !Lang::detect(dir).is_empty() {
                return Some(dir.to_path_buf());
            }
        }

        None
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn languages(&self) -> &[Lang] {
        &self.languages
    }

    /// Rebuild the graph from the filesystem, dropping every derived cache.
    pub fn rebuild(&self, progress: Option<&MultiProgress>) {
        self.configs.clear();
        self.miner.invalidate();

        let graph = build_graph(
            &self.project_root,
            &self.languages,
            &self.source_roots,
            &self.configs,
            &self.options,
            progress,
        );
        let scc = SccResult::compute(&graph);

        let mut core = self.core.lock().unwrap();
        core.graph = graph;
        core.scc = scc;
        core.memo.invalidate_all();
    }

    /// Impact analysis for one file; see [`crate::impact::analyze`].
    pub fn analyze_impact(&self, file: &Path, include_couplings: bool) -> Result<ImpactReport> {
        // Mining may block on libgit2; keep it outside the core lock.
        let couplings = include_couplings.then(|| self.miner.mine(&self.options.coupling));

        let file = normalize_path(file);
        let mut guard = self.core.lock().unwrap();
        let core = &mut *guard;
        analyze(&core.graph, Some(&core.scc), &mut core.memo, &file, couplings.as_deref())
    }

    pub fn hub_files(&self, top_n: usize) -> Vec<HubFile> {
        self.core.lock().unwrap().graph.hub_files(top_n)
    }

    pub fn couplings(&self) -> Arc<CouplingResult> {
        self.miner.mine(&self.options.coupling)
    }

    pub fn memo_stats(&self) -> MemoStats {
        self.core.lock().unwrap().memo.stats()
    }

    pub fn summary(&self) -> GraphSummary {
        let core = self.core.lock().unwrap();
        let cyclic_clusters = core
            .scc
            .condensed
            .nodes
            .iter()
            .filter(|n| n.is_cyclic)
            .map(|n| n.files.iter().map(|f| core.graph.display_path(f)).sorted().collect())
            .collect();

        GraphSummary {
            project_root: self.project_root.clone(),
            source_roots: self.source_roots.clone(),
            languages: core.graph.languages().to_vec(),
            file_count: core.graph.file_count(),
            edge_count: core.graph.edge_count(),
            scc_count: core.scc.scc_count(),
            cyclic_scc_count: core.scc.cyclic_scc_count(),
            cyclic_clusters,
        }
    }

    /// Apply one change event: mutate the graph, recompute SCCs, invalidate
    /// memos, then notify subscribers, in that order.
    pub fn apply_file_change(&self, event: &ChangeEvent) -> UpdateSummary {
        let summary = {
            let mut guard = self.core.lock().unwrap();
            let core = &mut *guard;
            apply_change(&mut core.graph, &mut core.scc, &mut core.memo, &self.configs, event)
        };

        let listeners = self.snapshot_listeners();

        for listener in &listeners {
            listener.on_change(event);
        }

        if summary.edges_changed {
            for listener in &listeners {
                listener.on_graph_updated(&summary);
            }
        }

        summary
    }

    pub fn subscribe<L: SessionListener + 'static>(&self, listener: L) -> Subscription {
        let mut set = self.listeners.lock().unwrap();
        let id = set.next_id;
        set.next_id += 1;
        set.entries.insert(id, Arc::new(listener));
        Subscription(id)
    }

    pub fn subscribe_changes<F>(&self, f: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        struct OnChange<F>(F);

        impl<F: Fn(&ChangeEvent) + Send + Sync> SessionListener for OnChange<F> {
            fn on_change(&self, event: &ChangeEvent) {
                (self.0)(event)
            }
        }

        self.subscribe(OnChange(f))
    }

    pub fn subscribe_graph_updates<F>(&self, f: F) -> Subscription
    where
        F: Fn(&UpdateSummary) + Send + Sync + 'static,
    {
        struct OnUpdate<F>(F);

        impl<F: Fn(&UpdateSummary) + Send + Sync> SessionListener for OnUpdate<F> {
            fn on_graph_updated(&self, update: &UpdateSummary) {
                (self.0)(update)
            }
        }

        self.subscribe(OnUpdate(f))
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.listeners.lock().unwrap().entries.remove(&subscription.0);
    }

    /// Start watching the source roots, feeding debounced events through
    /// the incremental updater and on to subscribers.
    pub fn watch(self: Arc<Self>, config: WatchConfig) -> notify::Result<()> {
        let cache = ContentCache::load(&self.languages, &self.source_roots);

        // The sink holds a weak reference; dropping the session tears the
        // watcher down rather than keeping it alive.
        let weak = Arc::downgrade(&self);
        let sink = Box::new(move |event: ChangeEvent| {
            if let Some(session) = weak.upgrade() {
                session.apply_file_change(&event);
            }
        });

        let watcher = ProjectWatcher::spawn(
            &self.source_roots,
            self.canonical_root(),
            cache,
            config,
            sink,
        )?;

        *self.watcher.lock().unwrap() = Some(watcher);
        Ok(())
    }

    /// Stop watching; pending debounce timers are cancelled.
    pub fn unwatch(&self) {
        *self.watcher.lock().unwrap() = None;
    }

    fn canonical_root(&self) -> PathBuf {
        self.source_roots.first().cloned().unwrap_or_else(|| self.project_root.clone())
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        self.listeners.lock().unwrap().entries.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub project_root: PathBuf,
    pub source_roots: Vec<PathBuf>,
    pub languages: Vec<Lang>,
    pub file_count: usize,
    pub edge_count: usize,
    pub scc_count: usize,
    pub cyclic_scc_count: usize,
    pub cyclic_clusters: Vec<Vec<String>>,
}

fn build_graph(
    project_root: &Path,
    languages: &[Lang],
    source_roots: &[PathBuf],
    configs: &ConfigCache,
    options: &SessionOptions,
    progress: Option<&MultiProgress>,
) -> DepGraph {
    let start = Instant::now();
    let mut files = discover_all(languages, source_roots);

    if let Some(cap) = options.max_files {
        if files.len() > cap {
            log::warn!("Capping graph at {} of {} discovered file(s).", cap, files.len());
            files.truncate(cap);
        }
    }

    let bar = progress.map(|p| {
        p.add(ProgressBar::new(files.len() as u64)).with_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                .expect("static template"),
        )
    });

    let mut graph =
        DepGraph::new(project_root.to_path_buf(), source_roots.to_vec(), languages.to_vec());

    for file in &files {
        graph.insert_file(file.clone());
    }

    let parsed: Vec<(PathBuf, Vec<PathBuf>)> = files
        .par_iter()
        .filter_map(|file| {
            let lang = Lang::of(file)?;
            let deps = parse_imports(lang, file, None, project_root, source_roots, configs);

            if let Some(bar) = &bar {
                bar.inc(1);
            }

            Some((file.clone(), deps))
        })
        .collect();

    for (file, deps) in parsed {
        graph.set_forward_edges(&file, deps);
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    log::info!(
        "Built graph: {} file(s), {} edge(s) in {}ms.",
        graph.file_count(),
        graph.edge_count(),
        start.elapsed().as_millis()
    );

    graph
}
