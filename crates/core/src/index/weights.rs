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

//! Dynamic document weights: a stationary distribution of the surf process
//! (random jump / weighted jump / link follow), computed by leaf-plucked
//! Gauss-Seidel with successive over-relaxation.
//!
//! Nodes that iteratively end up without outgoing edges ("leaves") are
//! plucked first; only the remaining internal nodes iterate. Cross-shard
//! reads lag one pass behind, which is tolerated since only the ranking of
//! the eigenvector matters, not its exact values. Leaves and skeletons then
//! receive their rank in one non-iterative pass each.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use super::graph::EdgeType;
use super::{CardFlags, CardId, CardNote};
use crate::config::WeightConfig;

#[derive(Debug, Default)]
pub struct WeightInput {
    /// Incoming live edges per live destination.
    pub in_edges: Vec<Vec<(CardId, EdgeType)>>,
    /// Incoming live edges per skeleton (dense skeleton index).
    pub skel_in_edges: Vec<Vec<(CardId, EdgeType)>>,
    /// Scanner-supplied static weight per live card.
    pub base_weight: Vec<u8>,
}

#[derive(Debug)]
pub struct WeightOutput {
    pub rank: Vec<f64>,
    pub skel_rank: Vec<f64>,
    /// Log-rescaled byte weights, image and non-image cards separately.
    pub byte_weight: Vec<u8>,
    pub passes: u32,
    pub internals: usize,
}

struct Flow {
    /// Incoming contributions per node: `(src, coefficient)` with the
    /// coefficient being `edge_weight / weighted_outdeg(src)`.
    incoming: Vec<Vec<(u32, f64)>>,
    base: Vec<f64>,
    follow_mult: f64,
}

/// Shared rank vector: plain f64 bits behind relaxed atomics so shards can
/// iterate in place while other shards read lagged values.
struct Ranks(Vec<AtomicU64>);

impl Ranks {
    fn new(n: usize, init: f64) -> Self {
        Self((0..n).map(|_| AtomicU64::new(init.to_bits())).collect())
    }

    fn get(&self, i: usize) -> f64 {
        f64::from_bits(self.0[i].load(Ordering::Relaxed))
    }

    fn set(&self, i: usize, v: f64) {
        self.0[i].store(v.to_bits(), Ordering::Relaxed);
    }
}

pub fn run(input: &WeightInput, notes: &mut [CardNote], config: &WeightConfig) -> WeightOutput {
    let n = input.in_edges.len();
    assert_eq!(input.base_weight.len(), n);

    let edge_weight = |etype: EdgeType| -> f64 {
        match etype {
            EdgeType::Intersite => f64::from(config.link_weight[1]),
            _ => f64::from(config.link_weight[0]),
        }
    };

    // Weighted out-degrees over the full live graph plus the skeleton
    // edges; rank flowing to leaves and skeletons leaks out of the
    // iteration on purpose.
    let mut wdeg = vec![0.0f64; n];
    for edges in input.in_edges.iter().chain(input.skel_in_edges.iter()) {
        for &(src, etype) in edges {
            wdeg[src as usize] += edge_weight(etype);
        }
    }

    // 1. Pluck: repeatedly remove nodes whose remaining live out-degree is
    // zero. The candidate set is ordered so the pluck order, and with it
    // the renumbering, is deterministic.
    let mut live_outdeg: Vec<u32> = vec![0; n];
    for edges in &input.in_edges {
        for &(src, _) in edges {
            live_outdeg[src as usize] += 1;
        }
    }

    let mut leaves_in_order: Vec<u32> = Vec::new();
    let mut plucked = vec![false; n];
    let mut candidates: BTreeSet<u32> = (0..n as u32)
        .filter(|&v| live_outdeg[v as usize] == 0)
        .collect();

    // Incoming edges are needed to decrement predecessors.
    while let Some(&v) = candidates.iter().next() {
        candidates.remove(&v);
        if plucked[v as usize] {
            continue;
        }
        plucked[v as usize] = true;
        leaves_in_order.push(v);

        for &(src, _) in &input.in_edges[v as usize] {
            let s = src as usize;
            if plucked[s] {
                continue;
            }
            live_outdeg[s] -= 1;
            if live_outdeg[s] == 0 {
                candidates.insert(src);
            }
        }
    }

    // 2. Renumber: internals first, then leaves in pluck order.
    let internals: Vec<u32> = (0..n as u32).filter(|&v| !plucked[v as usize]).collect();
    let intras = internals.len();

    let mut new_of_old = vec![0u32; n];
    let mut old_of_new = vec![0u32; n];
    for (new, &old) in internals.iter().chain(leaves_in_order.iter()).enumerate() {
        new_of_old[old as usize] = new as u32;
        old_of_new[new] = old;
    }

    // Base rank: random jump uniformly, weighted jump by static weight.
    let p_random = f64::from(config.prob_random) / 100.0;
    let p_weight = f64::from(config.prob_weight) / 100.0;
    let p_follow = f64::from(config.prob_follow) / 100.0;
    let weight_sum: f64 = input.base_weight.iter().map(|&w| f64::from(w).max(1.0)).sum();

    let base: Vec<f64> = (0..n)
        .map(|new| {
            let old = old_of_new[new] as usize;
            let uniform = if n > 0 { p_random / n as f64 } else { 0.0 };
            let weighted = if weight_sum > 0.0 {
                p_weight * f64::from(input.base_weight[old]).max(1.0) / weight_sum
            } else {
                0.0
            };
            uniform + weighted
        })
        .collect();

    let incoming: Vec<Vec<(u32, f64)>> = (0..n)
        .map(|new| {
            let old = old_of_new[new] as usize;
            input.in_edges[old]
                .iter()
                .map(|&(src, etype)| {
                    let coeff = edge_weight(etype) / wdeg[src as usize].max(f64::MIN_POSITIVE);
                    (new_of_old[src as usize], coeff)
                })
                .collect()
        })
        .collect();

    let flow = Flow {
        incoming,
        base,
        follow_mult: p_follow,
    };

    // 3 + 4. Sharded Gauss-Seidel with over-relaxation on the internals.
    let ranks = Ranks::new(n, if n > 0 { 1.0 / n as f64 } else { 0.0 });
    let passes = iterate(&flow, &ranks, intras, config);

    // 5a. One pass pulls rank into the leaves. Reverse pluck order
    // resolves leaf-to-leaf dependencies: a leaf plucked later feeds the
    // ones plucked before it.
    for new in (intras..n).rev() {
        let mut rank = flow.base[new];
        for &(src, coeff) in &flow.incoming[new] {
            rank += flow.follow_mult * ranks.get(src as usize) * coeff;
        }
        ranks.set(new, rank);
    }

    // 5b. A single pass from live cards into the skeletons.
    let skel_rank: Vec<f64> = input
        .skel_in_edges
        .iter()
        .map(|edges| {
            let mut rank = 0.0;
            for &(src, etype) in edges {
                let coeff = edge_weight(etype) / wdeg[src as usize].max(f64::MIN_POSITIVE);
                rank += p_follow * ranks.get(new_of_old[src as usize] as usize) * coeff;
            }
            rank
        })
        .collect();

    // Back to card-id order.
    let mut rank = vec![0.0f64; n];
    for new in 0..n {
        rank[old_of_new[new] as usize] = ranks.get(new);
    }

    // 6. Log-rescale to bytes, image and non-image cards separately.
    let byte_weight = rescale(&rank, notes, config.max_weight);
    for (id, &w) in byte_weight.iter().enumerate() {
        notes[id].weight = w;
    }

    tracing::info!(
        "weights: {} cards ({} internal, {} leaves), {} skeletons, {} passes",
        n,
        intras,
        n - intras,
        skel_rank.len(),
        passes
    );

    WeightOutput {
        rank,
        skel_rank,
        byte_weight,
        passes,
        internals: intras,
    }
}

fn iterate(flow: &Flow, ranks: &Ranks, intras: usize, config: &WeightConfig) -> u32 {
    if intras == 0 {
        return 0;
    }

    let threads = config.threads.max(1).min(intras);
    let per_shard = intras.div_ceil(threads);
    let shards: Vec<(usize, usize)> = (0..threads)
        .map(|t| (t * per_shard, ((t + 1) * per_shard).min(intras)))
        .collect();

    let omega = config.overrelax;
    let mut history: Vec<f64> = Vec::new();

    for pass in 0..config.max_eigen_passes {
        let deltas: Vec<f64> = std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .iter()
                .map(|&(lo, hi)| {
                    scope.spawn(move || {
                        let mut delta = 0.0f64;
                        for v in lo..hi {
                            let old = ranks.get(v);
                            let mut fresh = flow.base[v];
                            for &(src, coeff) in &flow.incoming[v] {
                                fresh += flow.follow_mult * ranks.get(src as usize) * coeff;
                            }
                            let new = (1.0 - omega) * old + omega * fresh;
                            delta += (new - old).abs();
                            ranks.set(v, new);
                        }
                        delta
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let delta: f64 = deltas.iter().sum();
        history.push(delta);

        if delta <= config.min_change {
            return pass + 1;
        }
        let lag = config.check_passes as usize;
        if history.len() > lag {
            let then = history[history.len() - 1 - lag];
            if delta * config.check_threshold > then {
                return pass + 1;
            }
        }
    }

    config.max_eigen_passes
}

/// Log-rescale ranks into `0..=max_weight`, image and non-image cards
/// forming separate histograms.
fn rescale(rank: &[f64], notes: &[CardNote], max_weight: u32) -> Vec<u8> {
    let max_weight = max_weight.min(255) as f64;
    let mut out = vec![0u8; rank.len()];

    for image_pass in [false, true] {
        let group: Vec<usize> = (0..rank.len())
            .filter(|&i| notes[i].flags.contains(CardFlags::IMAGE) == image_pass)
            .collect();

        let logs: Vec<f64> = group
            .iter()
            .map(|&i| rank[i].max(f64::MIN_POSITIVE).ln())
            .collect();
        let Some((&lo, &hi)) = logs
            .iter()
            .min_by(|a, b| a.total_cmp(b))
            .zip(logs.iter().max_by(|a, b| a.total_cmp(b)))
        else {
            continue;
        };

        for (&i, &log) in group.iter().zip(&logs) {
            out[i] = if hi > lo {
                ((log - lo) / (hi - lo) * max_weight).round() as u8
            } else {
                (max_weight / 2.0).round() as u8
            };
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WeightConfig {
        WeightConfig {
            threads: 1,
            ..WeightConfig::default()
        }
    }

    fn input(n: usize, edges: &[(u32, u32)]) -> WeightInput {
        let mut in_edges = vec![Vec::new(); n];
        for &(src, dst) in edges {
            in_edges[dst as usize].push((src, EdgeType::Normal));
        }
        WeightInput {
            in_edges,
            skel_in_edges: Vec::new(),
            base_weight: vec![0; n],
        }
    }

    #[test]
    fn cycle_ranks_sum_to_one() {
        // 0 -> 1 -> 2 -> 3 -> 0: fully internal, no leakage.
        let input = input(4, &[(0, 1), (1, 2), (2, 3), (3, 0)]);
        let mut notes = vec![CardNote::default(); 4];

        let out = run(&input, &mut notes, &config());

        assert_eq!(out.internals, 4);
        let sum: f64 = out.rank.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3, "sum was {sum}");
        for r in &out.rank {
            assert!(r.is_finite() && *r >= 0.0);
            assert!((r - 0.25).abs() < 1e-3);
        }
    }

    #[test]
    fn chain_is_fully_plucked() {
        // 0 -> 1 -> 2: everything drains, so all nodes are leaves.
        let input = input(3, &[(0, 1), (1, 2)]);
        let mut notes = vec![CardNote::default(); 3];

        let out = run(&input, &mut notes, &config());

        assert_eq!(out.internals, 0);
        assert!(out.rank.iter().all(|r| r.is_finite() && *r > 0.0));
        // Rank accumulates down the chain.
        assert!(out.rank[1] > out.rank[0]);
        assert!(out.rank[2] > out.rank[0]);
    }

    #[test]
    fn linked_node_outranks_unlinked() {
        // 1 and 2 both point at 3 inside a cycle so nothing is plucked.
        let input = input(
            4,
            &[(0, 1), (1, 3), (2, 3), (3, 0), (0, 2), (3, 1)],
        );
        let mut notes = vec![CardNote::default(); 4];

        let out = run(&input, &mut notes, &config());
        assert!(out.rank[3] > out.rank[2]);
    }

    #[test]
    fn skeletons_receive_rank() {
        let mut inp = input(2, &[(0, 1), (1, 0)]);
        inp.skel_in_edges = vec![vec![(0, EdgeType::Normal)]];
        let mut notes = vec![CardNote::default(); 2];

        let out = run(&inp, &mut notes, &config());
        assert_eq!(out.skel_rank.len(), 1);
        assert!(out.skel_rank[0] > 0.0);
        assert!(out.skel_rank[0].is_finite());
    }

    #[test]
    fn byte_weights_cover_range() {
        let mut edges = Vec::new();
        // A popular hub in a ring of 20.
        for i in 0..20u32 {
            edges.push((i, (i + 1) % 20));
            if i != 5 {
                edges.push((i, 5));
            }
        }
        let input = input(20, &edges);
        let mut notes = vec![CardNote::default(); 20];

        let out = run(&input, &mut notes, &config());
        let hub = out.byte_weight[5];
        assert!(hub > out.byte_weight[0]);
        assert_eq!(notes[5].weight, hub);
    }

    #[test]
    fn image_and_text_rescale_separately() {
        let input = input(4, &[(0, 1), (1, 0), (2, 3), (3, 2)]);
        let mut notes = vec![CardNote::default(); 4];
        notes[2].flags |= CardFlags::IMAGE;
        notes[3].flags |= CardFlags::IMAGE;

        let out = run(&input, &mut notes, &config());
        // Each group rescales over its own histogram; both symmetric pairs
        // land mid-range.
        assert_eq!(out.byte_weight[0], out.byte_weight[1]);
        assert_eq!(out.byte_weight[2], out.byte_weight[3]);
    }

    #[test]
    fn empty_graph() {
        let input = WeightInput::default();
        let mut notes = Vec::new();
        let out = run(&input, &mut notes, &config());
        assert!(out.rank.is_empty());
        assert_eq!(out.passes, 0);
    }

    #[test]
    fn two_threads_match_ranking() {
        let mut edges = Vec::new();
        for i in 0..40u32 {
            edges.push((i, (i + 7) % 40));
            edges.push((i, (i + 13) % 40));
        }
        let inp = input(40, &edges);

        let mut notes1 = vec![CardNote::default(); 40];
        let out1 = run(&inp, &mut notes1, &config());

        let mut notes2 = vec![CardNote::default(); 40];
        let cfg2 = WeightConfig {
            threads: 2,
            ..WeightConfig::default()
        };
        let out2 = run(&inp, &mut notes2, &cfg2);

        // Exact values may lag across shards; the totals still agree to
        // within the convergence tolerance.
        let sum1: f64 = out1.rank.iter().sum();
        let sum2: f64 = out2.rank.iter().sum();
        assert!((sum1 - sum2).abs() < 1e-2);
    }
}
