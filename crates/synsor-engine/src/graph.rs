//! Dependency graph over sensor keys and external identifiers.
//!
//! An arena of nodes addressed by small indices, with forward (depends-on)
//! and reverse (dependents) adjacency lists. "X depends on Y" means Y must
//! evaluate first or be present externally.

use std::collections::{BTreeSet, BinaryHeap};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

type EdgeList = SmallVec<[usize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Sensor,
    External,
}

#[derive(Debug)]
struct Node {
    name: String,
    kind: NodeKind,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: FxHashMap<String, usize>,
    deps: Vec<EdgeList>,
    dependents: Vec<EdgeList>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.deps.clear();
        self.dependents.clear();
    }

    fn ensure_node(&mut self, name: &str, kind: NodeKind) -> usize {
        if let Some(&idx) = self.index.get(name) {
            // A name first seen as an external id may later turn out to be
            // a sensor key; sensors win.
            if kind == NodeKind::Sensor {
                self.nodes[idx].kind = NodeKind::Sensor;
            }
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
        });
        self.deps.push(EdgeList::new());
        self.dependents.push(EdgeList::new());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Register a sensor and the names it depends on.
    pub fn add_sensor<'a>(
        &mut self,
        key: &str,
        dependencies: impl IntoIterator<Item = (&'a str, NodeKind)>,
    ) {
        let sensor = self.ensure_node(key, NodeKind::Sensor);
        for (dep_name, dep_kind) in dependencies {
            if dep_name == key {
                // Self-reference through the `state` alias resolves to a
                // different phase's value; not an edge.
                continue;
            }
            let dep = self.ensure_node(dep_name, dep_kind);
            if !self.deps[sensor].contains(&dep) {
                self.deps[sensor].push(dep);
                self.dependents[dep].push(sensor);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn sensor_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|&i| self.nodes[i].kind == NodeKind::Sensor)
    }

    /// Sensor keys in an order where dependencies precede dependents.
    /// Ties break stably by sensor key, so the order is identical across
    /// cycles for the same graph.
    pub fn topological_order(&self) -> Vec<String> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        for i in 0..n {
            for &dep in &self.deps[i] {
                // Only sensor dependencies gate evaluation; externals are
                // always available.
                if self.nodes[dep].kind == NodeKind::Sensor {
                    in_degree[i] += 1;
                }
            }
        }

        // Min-heap on (name, idx) gives the stable key tie-break.
        let mut ready: BinaryHeap<std::cmp::Reverse<(String, usize)>> = BinaryHeap::new();
        for i in self.sensor_indices() {
            if in_degree[i] == 0 {
                ready.push(std::cmp::Reverse((self.nodes[i].name.clone(), i)));
            }
        }

        let mut order = Vec::with_capacity(n);
        while let Some(std::cmp::Reverse((name, i))) = ready.pop() {
            order.push(name);
            for &dependent in &self.dependents[i] {
                if self.nodes[dependent].kind != NodeKind::Sensor {
                    continue;
                }
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(std::cmp::Reverse((
                        self.nodes[dependent].name.clone(),
                        dependent,
                    )));
                }
            }
        }
        // Cycle members never reach in-degree zero and are simply absent;
        // detect_cycles reports them.
        order
    }

    /// Minimal cycles among sensors, each as an ordered key list with the
    /// first key repeated at the end.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let sccs = self.strongly_connected_components();
        let mut cycles = Vec::new();
        for scc in sccs {
            if scc.len() == 1 {
                let i = scc[0];
                if !self.deps[i].contains(&i) {
                    continue;
                }
            }
            cycles.push(self.order_cycle(&scc));
        }
        cycles.sort();
        cycles
    }

    fn order_cycle(&self, scc: &[usize]) -> Vec<String> {
        let in_scc: BTreeSet<usize> = scc.iter().copied().collect();
        let start = scc
            .iter()
            .copied()
            .min_by(|&a, &b| self.nodes[a].name.cmp(&self.nodes[b].name))
            .expect("non-empty scc");

        let mut path = vec![self.nodes[start].name.clone()];
        let mut seen = BTreeSet::from([start]);
        let mut current = start;
        loop {
            // Follow the smallest-key edge that stays inside the component.
            let mut next = None;
            let mut candidates: Vec<usize> = self.deps[current]
                .iter()
                .copied()
                .filter(|d| in_scc.contains(d))
                .collect();
            candidates.sort_by(|&a, &b| self.nodes[a].name.cmp(&self.nodes[b].name));
            for cand in candidates {
                if cand == start {
                    next = Some(start);
                    break;
                }
                if !seen.contains(&cand) {
                    next = Some(cand);
                    break;
                }
            }
            match next {
                Some(n) if n == start => {
                    path.push(self.nodes[start].name.clone());
                    return path;
                }
                Some(n) => {
                    path.push(self.nodes[n].name.clone());
                    seen.insert(n);
                    current = n;
                }
                None => {
                    // Dead end inside the component; close the loop on the
                    // start key for a readable report.
                    path.push(self.nodes[start].name.clone());
                    return path;
                }
            }
        }
    }

    fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        // Tarjan, restricted to sensor nodes.
        struct State<'g> {
            graph: &'g DependencyGraph,
            index_counter: usize,
            stack: Vec<usize>,
            on_stack: Vec<bool>,
            indices: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            sccs: Vec<Vec<usize>>,
        }

        fn strongconnect(state: &mut State<'_>, v: usize) {
            state.indices[v] = Some(state.index_counter);
            state.lowlink[v] = state.index_counter;
            state.index_counter += 1;
            state.stack.push(v);
            state.on_stack[v] = true;

            let deps: Vec<usize> = state.graph.deps[v]
                .iter()
                .copied()
                .filter(|&w| state.graph.nodes[w].kind == NodeKind::Sensor)
                .collect();
            for w in deps {
                if state.indices[w].is_none() {
                    strongconnect(state, w);
                    state.lowlink[v] = state.lowlink[v].min(state.lowlink[w]);
                } else if state.on_stack[w] {
                    state.lowlink[v] = state.lowlink[v].min(state.indices[w].unwrap());
                }
            }

            if state.lowlink[v] == state.indices[v].unwrap() {
                let mut scc = Vec::new();
                while let Some(w) = state.stack.pop() {
                    state.on_stack[w] = false;
                    scc.push(w);
                    if w == v {
                        break;
                    }
                }
                if scc.len() > 1 {
                    state.sccs.push(scc);
                }
            }
        }

        let n = self.nodes.len();
        let mut state = State {
            graph: self,
            index_counter: 0,
            stack: Vec::new(),
            on_stack: vec![false; n],
            indices: vec![None; n],
            lowlink: vec![0; n],
            sccs: Vec::new(),
        };
        let sensor_nodes: Vec<usize> = self.sensor_indices().collect();
        for v in sensor_nodes {
            if state.indices[v].is_none() {
                strongconnect(&mut state, v);
            }
        }
        state.sccs
    }

    /// Sensors that must re-evaluate given changes to external inputs.
    pub fn affected_by(&self, changed: &BTreeSet<String>) -> BTreeSet<String> {
        let mut queue: Vec<usize> = changed
            .iter()
            .filter_map(|name| self.index.get(name).copied())
            .collect();
        let mut visited = vec![false; self.nodes.len()];
        let mut affected = BTreeSet::new();

        // A changed name that is itself a sensor re-evaluates too.
        for &i in &queue {
            if self.nodes[i].kind == NodeKind::Sensor {
                affected.insert(self.nodes[i].name.clone());
            }
        }

        while let Some(i) = queue.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            for &dependent in &self.dependents[i] {
                if self.nodes[dependent].kind == NodeKind::Sensor {
                    affected.insert(self.nodes[dependent].name.clone());
                }
                queue.push(dependent);
            }
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topological_order_respects_dependencies() {
        let mut g = DependencyGraph::new();
        g.add_sensor("derived", [("base", NodeKind::Sensor)]);
        g.add_sensor("base", [("x.power", NodeKind::External)]);
        let order = g.topological_order();
        assert_eq!(order, vec!["base".to_string(), "derived".to_string()]);
    }

    #[test]
    fn ties_break_by_key() {
        let mut g = DependencyGraph::new();
        g.add_sensor("zeta", []);
        g.add_sensor("alpha", []);
        g.add_sensor("mid", []);
        assert_eq!(
            g.topological_order(),
            vec!["alpha".to_string(), "mid".to_string(), "zeta".to_string()]
        );
    }

    #[test]
    fn order_is_stable_across_calls() {
        let mut g = DependencyGraph::new();
        g.add_sensor("c", [("a", NodeKind::Sensor)]);
        g.add_sensor("b", [("a", NodeKind::Sensor)]);
        g.add_sensor("a", []);
        let first = g.topological_order();
        for _ in 0..5 {
            assert_eq!(g.topological_order(), first);
        }
    }

    #[test]
    fn two_node_cycle_detected() {
        let mut g = DependencyGraph::new();
        g.add_sensor("x", [("y", NodeKind::Sensor)]);
        g.add_sensor("y", [("x", NodeKind::Sensor)]);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(
            cycles[0],
            vec!["x".to_string(), "y".to_string(), "x".to_string()]
        );
    }

    #[test]
    fn cycle_with_acyclic_branch() {
        let mut g = DependencyGraph::new();
        g.add_sensor("x", [("y", NodeKind::Sensor)]);
        g.add_sensor("y", [("x", NodeKind::Sensor)]);
        g.add_sensor("c", [("d", NodeKind::Sensor)]);
        g.add_sensor("d", []);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let order = g.topological_order();
        assert_eq!(order, vec!["d".to_string(), "c".to_string()]);
    }

    #[test]
    fn self_reference_is_not_an_edge() {
        let mut g = DependencyGraph::new();
        g.add_sensor("p", [("p", NodeKind::Sensor)]);
        assert!(g.detect_cycles().is_empty());
        assert_eq!(g.topological_order(), vec!["p".to_string()]);
    }

    #[test]
    fn affected_by_walks_transitively() {
        let mut g = DependencyGraph::new();
        g.add_sensor("base", [("x.power", NodeKind::External)]);
        g.add_sensor("derived", [("base", NodeKind::Sensor)]);
        g.add_sensor("other", [("y.power", NodeKind::External)]);

        let changed: BTreeSet<String> = ["x.power".to_string()].into();
        let affected = g.affected_by(&changed);
        assert_eq!(
            affected,
            ["base".to_string(), "derived".to_string()].into()
        );
    }

    proptest::proptest! {
        // Random edge sets: whatever ends up schedulable must be scheduled
        // after its dependencies, and the order must be reproducible.
        #[test]
        fn random_graphs_order_dependencies_first(
            edges in proptest::collection::vec((0u8..8, 0u8..8), 0..24)
        ) {
            let mut g = DependencyGraph::new();
            for i in 0..8u8 {
                g.add_sensor(&format!("s{i}"), []);
            }
            for (a, b) in &edges {
                if a != b {
                    g.add_sensor(&format!("s{a}"), [(format!("s{b}").as_str(), NodeKind::Sensor)]);
                }
            }

            let order = g.topological_order();
            let position: std::collections::HashMap<&str, usize> = order
                .iter()
                .enumerate()
                .map(|(i, k)| (k.as_str(), i))
                .collect();
            for (a, b) in &edges {
                if a == b {
                    continue;
                }
                let (sa, sb) = (format!("s{a}"), format!("s{b}"));
                if let (Some(pa), Some(pb)) = (position.get(sa.as_str()), position.get(sb.as_str())) {
                    proptest::prop_assert!(pb < pa, "{sb} must precede {sa}");
                }
            }
            proptest::prop_assert_eq!(g.topological_order(), order);
        }
    }

    #[test]
    fn three_node_cycle_is_ordered_minimally() {
        let mut g = DependencyGraph::new();
        g.add_sensor("b", [("a", NodeKind::Sensor)]);
        g.add_sensor("c", [("b", NodeKind::Sensor)]);
        g.add_sensor("a", [("c", NodeKind::Sensor)]);
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
        assert_eq!(cycle[0], "a");
    }
}
