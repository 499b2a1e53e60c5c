//! Dependency graph between mods, used to order batch loading.
//!
//! Mods declare dependencies by name. When a batch of discovered mods is loaded together,
//! [`ModuleDependencyGraph::load_order`] places every dependency before its dependents.
//! Cycles are legal between mods (the resolver copes with them at lookup time), so instead of
//! failing, strongly connected components are kept together and ordered as a unit.
//!
//! # Algorithms
//!
//! - **Cycle detection**: three-color depth first search, reporting the first cycle path
//! - **Ordering**: Tarjan's strongly connected components, then Kahn's algorithm over the
//!   condensed DAG
//!
//! Ties are broken by insertion order, so the same batch always loads in the same order.
//!
//! # Thread Safety
//!
//! Edges live in `DashMap`s and the computed order is cached behind a `RwLock`, so the graph
//! can be filled from several discovery threads.
//!
//! # Examples
//!
//! ```rust
//! use dotmod::metadata::dependencies::ModuleDependencyGraph;
//!
//! let graph = ModuleDependencyGraph::new();
//! graph.add_module("App");
//! graph.add_module("Core");
//! graph.add_dependency("App", "Core");
//!
//! assert_eq!(graph.load_order(), vec![vec!["Core".to_string()], vec!["App".to_string()]]);
//! assert!(graph.find_cycle().is_none());
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

use dashmap::DashMap;

struct TarjanState<'a> {
    index_counter: usize,
    stack: Vec<&'a str>,
    indices: HashMap<&'a str, usize>,
    lowlinks: HashMap<&'a str, usize>,
    on_stack: HashMap<&'a str, bool>,
    sccs: Vec<Vec<&'a str>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed graph of mod name dependencies.
pub struct ModuleDependencyGraph {
    /// Insertion index of every known module
    nodes: DashMap<String, usize>,
    /// module -> modules it depends on
    dependencies: DashMap<String, Vec<String>>,
    next_index: AtomicUsize,
    cached_order: RwLock<Option<Vec<Vec<String>>>>,
}

impl ModuleDependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            dependencies: DashMap::new(),
            next_index: AtomicUsize::new(0),
            cached_order: RwLock::new(None),
        }
    }

    /// Adds a module node. Adding a known module is a no-op.
    pub fn add_module(&self, name: &str) {
        if self.nodes.contains_key(name) {
            return;
        }
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.nodes.entry(name.to_string()).or_insert(index);
        self.invalidate();
    }

    /// Records that `source` depends on `target`. Unknown endpoints are added.
    pub fn add_dependency(&self, source: &str, target: &str) {
        self.add_module(source);
        self.add_module(target);

        let mut deps = self.dependencies.entry(source.to_string()).or_default();
        if !deps.iter().any(|dep| dep == target) {
            deps.push(target.to_string());
        }
        drop(deps);
        self.invalidate();
    }

    /// Direct dependencies of `name`.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.dependencies
            .get(name)
            .map(|deps| deps.clone())
            .unwrap_or_default()
    }

    /// Number of modules in the graph.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no modules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn invalidate(&self) {
        // Best effort invalidation - ignore lock failures
        if let Ok(mut cache) = self.cached_order.write() {
            *cache = None;
        }
    }

    /// Modules sorted by insertion order.
    fn ordered_nodes(&self) -> Vec<(String, usize)> {
        let mut nodes: Vec<(String, usize)> = self
            .nodes
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        nodes.sort_by_key(|(_, index)| *index);
        nodes
    }

    /// Returns the first dependency cycle found, as a path that starts and ends on the same module.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let nodes = self.ordered_nodes();
        let adjacency = self.adjacency(&nodes);
        let mut colors: HashMap<&str, Color> =
            nodes.iter().map(|(name, _)| (name.as_str(), Color::White)).collect();
        let mut path = Vec::new();

        for (name, _) in &nodes {
            if colors.get(name.as_str()) == Some(&Color::White) {
                if let Some(cycle) = Self::dfs_visit(name, &adjacency, &mut colors, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for &target in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            match colors.get(target).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|n| *n == target)?;
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(target.to_string());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = Self::dfs_visit(target, adjacency, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }

    fn adjacency<'a>(&self, nodes: &'a [(String, usize)]) -> HashMap<&'a str, Vec<&'a str>> {
        let mut adjacency: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        for (name, _) in nodes {
            let targets = self.dependencies_of(name);
            let resolved: Vec<&'a str> = targets
                .iter()
                .filter_map(|target| {
                    nodes
                        .iter()
                        .find(|(candidate, _)| candidate == target)
                        .map(|(candidate, _)| candidate.as_str())
                })
                .collect();
            adjacency.insert(name.as_str(), resolved);
        }
        adjacency
    }

    /// Groups of modules in load order. Each group is one strongly connected component;
    /// a group with more than one member is a dependency cycle.
    #[must_use]
    pub fn load_order(&self) -> Vec<Vec<String>> {
        if let Ok(cache) = self.cached_order.read() {
            if let Some(order) = cache.as_ref() {
                return order.clone();
            }
        }

        let order = self.compute_order();
        if let Ok(mut cache) = self.cached_order.write() {
            *cache = Some(order.clone());
        }
        order
    }

    fn compute_order(&self) -> Vec<Vec<String>> {
        let nodes = self.ordered_nodes();
        let insertion: HashMap<&str, usize> =
            nodes.iter().map(|(name, index)| (name.as_str(), *index)).collect();
        let adjacency = self.adjacency(&nodes);

        let mut state = TarjanState {
            index_counter: 0,
            stack: Vec::new(),
            indices: HashMap::new(),
            lowlinks: HashMap::new(),
            on_stack: HashMap::new(),
            sccs: Vec::new(),
        };
        for (name, _) in &nodes {
            if !state.indices.contains_key(name.as_str()) {
                Self::tarjan_strongconnect(name, &adjacency, &mut state);
            }
        }

        let mut sccs = state.sccs;
        for scc in &mut sccs {
            scc.sort_by_key(|name| insertion[name]);
        }

        let mut scc_of: HashMap<&str, usize> = HashMap::new();
        for (id, scc) in sccs.iter().enumerate() {
            for name in scc {
                scc_of.insert(*name, id);
            }
        }

        // Edges point from dependency to dependent, so dependencies are emitted first.
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); sccs.len()];
        let mut in_degree = vec![0usize; sccs.len()];
        for (source, targets) in &adjacency {
            let source_scc = scc_of[source];
            for target in targets {
                let target_scc = scc_of[target];
                if source_scc != target_scc && successors[target_scc].insert(source_scc) {
                    in_degree[source_scc] += 1;
                }
            }
        }

        // Kahn's algorithm, picking the ready component whose first member was added earliest.
        let key = |id: usize| insertion[sccs[id][0]];
        let mut ready: BTreeSet<(usize, usize)> = (0..sccs.len())
            .filter(|id| in_degree[*id] == 0)
            .map(|id| (key(id), id))
            .collect();

        let mut result = Vec::with_capacity(sccs.len());
        while let Some((_, id)) = ready.pop_first() {
            result.push(sccs[id].iter().map(|name| (*name).to_string()).collect());
            for &next in &successors[id] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert((key(next), next));
                }
            }
        }
        result
    }

    fn tarjan_strongconnect<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        state: &mut TarjanState<'a>,
    ) {
        state.indices.insert(node, state.index_counter);
        state.lowlinks.insert(node, state.index_counter);
        state.index_counter += 1;
        state.stack.push(node);
        state.on_stack.insert(node, true);

        for &successor in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            if !state.indices.contains_key(successor) {
                Self::tarjan_strongconnect(successor, adjacency, state);
                let lowlink = state.lowlinks[node].min(state.lowlinks[successor]);
                state.lowlinks.insert(node, lowlink);
            } else if state.on_stack.get(successor).copied().unwrap_or(false) {
                let lowlink = state.lowlinks[node].min(state.indices[successor]);
                state.lowlinks.insert(node, lowlink);
            }
        }

        if state.lowlinks[node] == state.indices[node] {
            let mut scc = Vec::new();
            while let Some(member) = state.stack.pop() {
                state.on_stack.insert(member, false);
                scc.push(member);
                if member == node {
                    break;
                }
            }
            state.sccs.push(scc);
        }
    }
}

impl Default for ModuleDependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
