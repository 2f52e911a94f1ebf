use crate::validator::ValidatedWorkflow;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use weavecore::NodeId;

/// Readiness bookkeeping for one run.
///
/// Every distinct upstream node connected into a node counts as one pending
/// dependency. Unconnected ports are served by their defaults and add none.
#[derive(Debug, Clone)]
pub struct DependencyPlan {
    remaining: HashMap<NodeId, usize>,
    downstream: HashMap<NodeId, Vec<NodeId>>,
    roots: HashSet<NodeId>,
    ready: VecDeque<NodeId>,
}

impl DependencyPlan {
    pub fn new(validated: &ValidatedWorkflow) -> Self {
        let graph = &validated.graph;
        let mut remaining = HashMap::new();
        let mut downstream = HashMap::new();
        let mut roots = HashSet::new();
        let mut ready = VecDeque::new();

        // Seed in topological order so the initial ready queue is stable
        for node_id in &validated.order {
            let idx = validated.node_to_index[node_id];
            let parents = graph.neighbors_directed(idx, Direction::Incoming).count();
            let children: Vec<NodeId> = graph
                .neighbors_directed(idx, Direction::Outgoing)
                .map(|next| graph[next].clone())
                .collect();

            if parents == 0 {
                ready.push_back(node_id.clone());
                roots.insert(node_id.clone());
            }
            remaining.insert(node_id.clone(), parents);
            downstream.insert(node_id.clone(), children);
        }

        Self {
            remaining,
            downstream,
            roots,
            ready,
        }
    }

    /// Take the next node whose dependencies have all resolved.
    pub fn next_ready(&mut self) -> Option<NodeId> {
        self.ready.pop_front()
    }

    /// Forget every ready node without dispatching it.
    pub fn clear_ready(&mut self) {
        self.ready.clear();
    }

    /// Mark `node_id` resolved, queueing the consumers that just became ready.
    pub fn resolve(&mut self, node_id: &str) {
        let Some(children) = self.downstream.get(node_id) else {
            return;
        };
        for child in children {
            if let Some(count) = self.remaining.get_mut(child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push_back(child.clone());
                }
            }
        }
    }

    pub fn is_root(&self, node_id: &str) -> bool {
        self.roots.contains(node_id)
    }
}
