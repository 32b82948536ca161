// Holmes is an open source web search engine.
// Copyright (C) 2024 The Holmes Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Reachability from the initial URL set. The edge stream is processed in
//! blocks sized to the big buffer: each block gets Tarjan's SCC plus a
//! topological sweep, reachable classes are marked and collapsed in a
//! union-find, and only edges between still-undecided classes survive into
//! the next round. When the residual graph stops shrinking, a direct
//! search over what remains settles the rest.

use super::CardId;
use crate::config::UnreachableConfig;

const EDGE_BYTES: usize = 8;

pub struct Reachability {
    pub reachable: Vec<bool>,
    pub passes: u32,
}

struct Classes {
    parent: Vec<u32>,
    reachable: Vec<bool>,
}

impl Classes {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            reachable: vec![false; n],
        }
    }

    fn find(&mut self, v: u32) -> u32 {
        let mut root = v;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Path compression.
        let mut cur = v;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child as usize] = root;
        self.reachable[root as usize] =
            self.reachable[root as usize] || self.reachable[child as usize];
    }

    fn is_reachable(&mut self, v: u32) -> bool {
        let root = self.find(v);
        self.reachable[root as usize]
    }

    fn mark(&mut self, v: u32) {
        let root = self.find(v);
        self.reachable[root as usize] = true;
    }
}

pub fn find_reachable(
    n: usize,
    roots: &[CardId],
    edges: Vec<(CardId, CardId)>,
    config: &UnreachableConfig,
) -> Reachability {
    let mut classes = Classes::new(n);
    for &root in roots {
        classes.mark(root);
    }

    let block_edges = (config.big_buf_size / EDGE_BYTES).max(16);
    let mut residual = edges;
    let mut passes = 0u32;

    while !residual.is_empty() && passes < config.max_passes {
        passes += 1;
        let before = residual.len();

        let mut next = Vec::new();
        for block in residual.chunks(block_edges) {
            process_block(&mut classes, block, &mut next);
        }

        residual = next;

        if residual.is_empty() {
            break;
        }
        // Not shrinking enough; fall through to the direct search.
        if residual.len() as f64 > before as f64 * config.refilter_threshold {
            break;
        }
    }

    if !residual.is_empty() {
        final_sweep(&mut classes, &residual);
    }

    let reachable = (0..n as u32).map(|v| classes.is_reachable(v)).collect();
    tracing::info!("unreachable: {} cards, {} passes", n, passes);
    Reachability { reachable, passes }
}

/// One in-memory block: Tarjan's SCC over the vertices it touches, classes
/// unioned per component, then a propagation sweep in topological order.
/// Edges whose target stays undecided are re-emitted for the next round.
fn process_block(classes: &mut Classes, block: &[(CardId, CardId)], next: &mut Vec<(CardId, CardId)>) {
    use hashbrown::HashMap;

    // Local vertex numbering over this block's class representatives.
    let mut local_of: HashMap<u32, u32> = HashMap::new();
    let mut rep_of: Vec<u32> = Vec::new();
    let mut adj: Vec<Vec<u32>> = Vec::new();

    let local = |classes: &mut Classes,
                     local_of: &mut HashMap<u32, u32>,
                     rep_of: &mut Vec<u32>,
                     adj: &mut Vec<Vec<u32>>,
                     v: CardId| {
        let rep = classes.find(v);
        *local_of.entry(rep).or_insert_with(|| {
            rep_of.push(rep);
            adj.push(Vec::new());
            (rep_of.len() - 1) as u32
        })
    };

    let mut block_edges = Vec::with_capacity(block.len());
    for &(u, v) in block {
        let lu = local(classes, &mut local_of, &mut rep_of, &mut adj, u);
        let lv = local(classes, &mut local_of, &mut rep_of, &mut adj, v);
        if lu != lv {
            adj[lu as usize].push(lv);
        }
        block_edges.push((u, v));
    }

    let m = rep_of.len();
    let sccs = tarjan(m, &adj);

    // Components in reverse Tarjan emission order form a topological order
    // of the condensation.
    let mut comp_of = vec![0u32; m];
    for (ci, comp) in sccs.iter().enumerate() {
        for &v in comp {
            comp_of[v as usize] = ci as u32;
        }
    }

    for comp in &sccs {
        // Collapse the cycle into one class.
        for pair in comp.windows(2) {
            classes.union(rep_of[pair[0] as usize], rep_of[pair[1] as usize]);
        }
    }

    // Tarjan emits components children-first, so walking them in reverse
    // visits sources before sinks.
    let mut comp_reach: Vec<bool> = sccs
        .iter()
        .map(|comp| comp.iter().any(|&v| classes.is_reachable(rep_of[v as usize])))
        .collect();

    for ci in (0..sccs.len()).rev() {
        if !comp_reach[ci] {
            continue;
        }
        for &v in &sccs[ci] {
            for &w in &adj[v as usize] {
                let wc = comp_of[w as usize] as usize;
                if !comp_reach[wc] {
                    comp_reach[wc] = true;
                }
            }
        }
    }

    for (ci, comp) in sccs.iter().enumerate() {
        if comp_reach[ci] {
            for &v in comp {
                classes.mark(rep_of[v as usize]);
            }
        }
    }

    // Survivors: edges into still-undecided classes.
    for (u, v) in block_edges {
        if classes.find(u) != classes.find(v) && !classes.is_reachable(v) {
            next.push((u, v));
        }
    }
}

/// Iterative Tarjan; components are emitted children-first.
fn tarjan(n: usize, adj: &[Vec<u32>]) -> Vec<Vec<u32>> {
    const UNSET: u32 = u32::MAX;

    let mut index = vec![UNSET; n];
    let mut low = vec![0u32; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<u32> = Vec::new();
    let mut next_index = 0u32;
    let mut sccs = Vec::new();

    // Explicit DFS frames: (vertex, next child position).
    let mut frames: Vec<(u32, usize)> = Vec::new();

    for start in 0..n as u32 {
        if index[start as usize] != UNSET {
            continue;
        }

        frames.push((start, 0));
        while let Some(&mut (v, ref mut child)) = frames.last_mut() {
            let vi = v as usize;
            if *child == 0 {
                index[vi] = next_index;
                low[vi] = next_index;
                next_index += 1;
                stack.push(v);
                on_stack[vi] = true;
            }

            if let Some(&w) = adj[vi].get(*child) {
                *child += 1;
                let wi = w as usize;
                if index[wi] == UNSET {
                    frames.push((w, 0));
                } else if on_stack[wi] {
                    low[vi] = low[vi].min(index[wi]);
                }
                continue;
            }

            // All children done: maybe emit a component, then return.
            if low[vi] == index[vi] {
                let mut comp = Vec::new();
                loop {
                    let w = stack.pop().unwrap();
                    on_stack[w as usize] = false;
                    comp.push(w);
                    if w == v {
                        break;
                    }
                }
                sccs.push(comp);
            }

            frames.pop();
            if let Some(&mut (parent, _)) = frames.last_mut() {
                let pi = parent as usize;
                low[pi] = low[pi].min(low[vi]);
            }
        }
    }

    sccs
}

/// Direct search over the residual edges, from every class already known
/// reachable.
fn final_sweep(classes: &mut Classes, residual: &[(CardId, CardId)]) {
    use hashbrown::HashMap;

    let mut adj: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut todo: Vec<u32> = Vec::new();
    let mut seen: hashbrown::HashSet<u32> = hashbrown::HashSet::new();

    for &(u, v) in residual {
        let ru = classes.find(u);
        let rv = classes.find(v);
        adj.entry(ru).or_default().push(rv);
        if classes.is_reachable(ru) && seen.insert(ru) {
            todo.push(ru);
        }
    }

    while let Some(u) = todo.pop() {
        let Some(succs) = adj.get(&u) else { continue };
        for &v in succs {
            if !classes.is_reachable(v) {
                classes.mark(v);
                if seen.insert(v) {
                    todo.push(v);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> UnreachableConfig {
        UnreachableConfig::default()
    }

    #[test]
    fn simple_chain_and_island() {
        // Roots {0}; edges 0->1, 1->2, 3->4.
        let r = find_reachable(5, &[0], vec![(0, 1), (1, 2), (3, 4)], &cfg());
        assert_eq!(r.reachable, vec![true, true, true, false, false]);
    }

    #[test]
    fn cycles_collapse() {
        // 0 -> (1 <-> 2) -> 3, island 4 <-> 5.
        let edges = vec![(0, 1), (1, 2), (2, 1), (2, 3), (4, 5), (5, 4)];
        let r = find_reachable(6, &[0], edges, &cfg());
        assert_eq!(r.reachable, vec![true, true, true, true, false, false]);
    }

    #[test]
    fn multi_block_processing() {
        // Force tiny blocks so reachability must flow across rounds.
        let config = UnreachableConfig {
            big_buf_size: 16 * EDGE_BYTES,
            ..cfg()
        };

        let n = 500;
        let mut edges: Vec<(CardId, CardId)> = (0..n as u32 - 1).map(|i| (i, i + 1)).collect();
        // Put the edges in an order that defeats a single forward sweep.
        edges.reverse();

        let r = find_reachable(n, &[0], edges, &config);
        assert!(r.reachable.iter().all(|&b| b));
    }

    #[test]
    fn back_edges_into_roots() {
        let edges = vec![(1, 0), (2, 1)];
        let r = find_reachable(3, &[0], edges, &cfg());
        assert_eq!(r.reachable, vec![true, false, false]);
    }

    #[test]
    fn empty_inputs() {
        let r = find_reachable(0, &[], Vec::new(), &cfg());
        assert!(r.reachable.is_empty());

        let r = find_reachable(3, &[], vec![(0, 1)], &cfg());
        assert_eq!(r.reachable, vec![false, false, false]);

        let r = find_reachable(3, &[1], Vec::new(), &cfg());
        assert_eq!(r.reachable, vec![false, true, false]);
    }

    #[test]
    fn diamond_with_multiple_roots() {
        let edges = vec![(0, 2), (1, 2), (2, 3), (4, 3)];
        let r = find_reachable(5, &[0, 1], edges, &cfg());
        assert_eq!(r.reachable, vec![true, true, true, true, false]);
    }
}
