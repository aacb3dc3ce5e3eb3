//! Flow graph of a net, built on `petgraph`.
//!
//! Conditions and tasks become graph nodes and flows become edges. Reachability
//! checks and the OR-join's backward search walk this graph instead of the
//! net's flow lists.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Dfs, Reversed, VisitMap};

use super::net::Net;

#[derive(Debug)]
pub struct FlowGraph<'n> {
    graph: DiGraph<&'n str, ()>,
    index_map: HashMap<&'n str, NodeIndex>,
}

impl<'n> FlowGraph<'n> {
    /// Flows with an unknown endpoint are left out; validation reports them.
    pub fn from_net(net: &'n Net) -> Self {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();

        let ids = net
            .conditions()
            .map(|c| c.id.as_str())
            .chain(net.tasks().map(|t| t.id.as_str()));
        for id in ids {
            index_map.entry(id).or_insert_with(|| graph.add_node(id));
        }

        for flow in net.flows() {
            let from = index_map.get(flow.source.as_str());
            let to = index_map.get(flow.target.as_str());
            if let (Some(&from), Some(&to)) = (from, to) {
                graph.add_edge(from, to, ());
            }
        }

        Self { graph, index_map }
    }

    /// Nodes reachable from `start` along the flows, `start` included.
    pub fn reachable_from(&self, start: &str) -> HashSet<&'n str> {
        let Some(&start) = self.index_map.get(start) else {
            return HashSet::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut seen = HashSet::new();
        while let Some(idx) = bfs.next(&self.graph) {
            seen.insert(self.graph[idx]);
        }
        seen
    }

    /// Nodes with a path to `start` that does not pass through `avoid`.
    /// `start` itself is not listed.
    pub fn upstream_avoiding(&self, start: &str, avoid: &str) -> Vec<&'n str> {
        let Some(&start_idx) = self.index_map.get(start) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start_idx);
        if let Some(&avoid) = self.index_map.get(avoid) {
            dfs.discovered.visit(avoid);
        }

        let mut upstream = Vec::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start_idx {
                upstream.push(self.graph[idx]);
            }
        }
        upstream
    }
}
