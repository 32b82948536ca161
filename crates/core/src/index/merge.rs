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

//! Duplicate detection. Three mergers grow the merges union-find: exact
//! duplicates by URL fingerprint and by body MD5, near-duplicates by
//! min-hash signature blocks, and image duplicates by KD-tree neighbor
//! search with a quad-tree pixel re-check.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::merges::Merges;
use super::{is_skeleton, CardFlags, CardId, CardNote};
use crate::config::{ImageMatcherConfig, MatcherConfig};

/// True when a card takes part in content merging at all.
fn mergeable(notes: &[CardNote], id: CardId) -> bool {
    !is_skeleton(id)
        && !notes[id as usize]
            .flags
            .intersects(CardFlags::EMPTY | CardFlags::FRAMESET)
}

/// Unions runs of consecutive equal keys. The input must be sorted by key;
/// both the fingerprint and the MD5 merger reduce to this.
pub fn merge_by_key<K: Ord>(
    records: impl Iterator<Item = (K, CardId)>,
    notes: &[CardNote],
    merges: &mut Merges,
) -> u64 {
    let mut merged = 0u64;
    let mut run_key: Option<K> = None;
    let mut run_head: Option<CardId> = None;

    for (key, id) in records {
        if !mergeable(notes, id) {
            continue;
        }

        if run_key.as_ref() == Some(&key) {
            if let Some(head) = run_head {
                if merges.find(head) != merges.find(id) {
                    merges.union(head, id);
                    merged += 1;
                }
            }
        } else {
            run_key = Some(key);
            run_head = Some(id);
        }
    }

    merges.flatten();
    merged
}

/// Broder-style min-hash signature of a token stream.
pub fn signature(tokens: impl Iterator<Item = u64>, positions: usize) -> Vec<u32> {
    let seeds: Vec<u64> = (0..positions as u64)
        .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(0x85eb_ca6b))
        .collect();

    let mut sig = vec![u32::MAX; positions];
    for token in tokens {
        for (pos, seed) in seeds.iter().enumerate() {
            let mixed = token
                .wrapping_mul(0xc2b2_ae3d_27d4_eb4f)
                .rotate_left(31)
                .wrapping_mul(*seed | 1);
            let h = (mixed >> 32) as u32 ^ mixed as u32;
            if h < sig[pos] {
                sig[pos] = h;
            }
        }
    }
    sig
}

/// Near-duplicate merging over min-hash signatures. Each pass permutes the
/// signature positions, sorts, blocks the run and compares every pair in a
/// block; re-permutation across passes reaches the neighbors a single sort
/// order misses.
pub fn merge_signs(
    sigs: &[(CardId, Vec<u32>)],
    notes: &[CardNote],
    merges: &mut Merges,
    config: &MatcherConfig,
    seed: u64,
) -> u64 {
    let max_mismatch = config.signatures.saturating_sub(config.threshold);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut merged = 0u64;

    let mut order: Vec<usize> = (0..config.signatures).collect();
    let mut sorted: Vec<usize> = (0..sigs.len()).collect();

    for _ in 0..config.passes {
        order.shuffle(&mut rng);

        sorted.sort_by(|&a, &b| {
            let (sa, sb) = (&sigs[a].1, &sigs[b].1);
            order
                .iter()
                .map(|&p| sa[p].cmp(&sb[p]))
                .find(|c| !c.is_eq())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Bounded blocks keep the pairwise comparison quadratic but small.
        for block in sorted.chunks(config.block.max(2)) {
            for (i, &a) in block.iter().enumerate() {
                for &b in &block[i + 1..] {
                    let (ida, idb) = (sigs[a].0, sigs[b].0);
                    if !mergeable(notes, ida) || !mergeable(notes, idb) {
                        continue;
                    }
                    if merges.find(ida) == merges.find(idb) {
                        continue;
                    }
                    let mismatches = sigs[a]
                        .1
                        .iter()
                        .zip(&sigs[b].1)
                        .filter(|(x, y)| x != y)
                        .count();
                    if mismatches <= max_mismatch {
                        merges.union(ida, idb);
                        merged += 1;
                    }
                }
            }
        }
    }

    merges.flatten();
    merged
}

/*** Image duplicates ***/

pub const IMAGE_VEC_DIM: usize = 48;

/// Perceptual description of one image: the fixed-length comparison vector
/// plus the full quad-tree of region averages for the exact re-check.
#[derive(Debug, Clone)]
pub struct ImageSig {
    pub id: CardId,
    pub width: u16,
    pub height: u16,
    pub vector: [u8; IMAGE_VEC_DIM],
    pub quad: Vec<u8>,
}

fn vec_dist(a: &[u8; IMAGE_VEC_DIM], b: &[u8; IMAGE_VEC_DIM]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| u32::from(x.abs_diff(*y)))
        .sum()
}

fn quad_matches(a: &ImageSig, b: &ImageSig, threshold: u32) -> bool {
    if a.quad.len() != b.quad.len() {
        return false;
    }
    let total: u64 = a
        .quad
        .iter()
        .zip(&b.quad)
        .map(|(x, y)| u64::from(x.abs_diff(*y)))
        .sum();
    let per_cell = if a.quad.is_empty() {
        0
    } else {
        (total / a.quad.len() as u64) as u32
    };
    per_cell <= threshold / 4
}

/// KD-tree over the comparison vectors, used for radius searches inside one
/// cluster.
struct KdTree<'a> {
    sigs: &'a [ImageSig],
    nodes: Vec<KdNode>,
    root: usize,
}

struct KdNode {
    point: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

const KD_LEAF: usize = usize::MAX;

impl<'a> KdTree<'a> {
    fn build(sigs: &'a [ImageSig]) -> Self {
        let mut tree = Self {
            sigs,
            nodes: Vec::with_capacity(sigs.len()),
            root: KD_LEAF,
        };
        let mut points: Vec<usize> = (0..sigs.len()).collect();
        tree.root = tree.build_node(&mut points, 0);
        tree
    }

    fn build_node(&mut self, points: &mut [usize], depth: usize) -> usize {
        if points.is_empty() {
            return KD_LEAF;
        }
        let axis = depth % IMAGE_VEC_DIM;
        points.sort_unstable_by_key(|&p| self.sigs[p].vector[axis]);
        let mid = points.len() / 2;
        let point = points[mid];

        let (left_pts, rest) = points.split_at_mut(mid);
        let right_pts = &mut rest[1..];

        // Children are built before the node so the borrow of `points`
        // splits cleanly.
        let mut left_points: Vec<usize> = left_pts.to_vec();
        let mut right_points: Vec<usize> = right_pts.to_vec();
        let left = self.build_node(&mut left_points, depth + 1);
        let right = self.build_node(&mut right_points, depth + 1);

        self.nodes.push(KdNode {
            point,
            axis,
            left: (left != KD_LEAF).then_some(left),
            right: (right != KD_LEAF).then_some(right),
        });
        self.nodes.len() - 1
    }

    /// Indices of all points within `radius` (L1) of the query vector.
    fn within(&self, query: &[u8; IMAGE_VEC_DIM], radius: u32, out: &mut Vec<usize>) {
        if self.root != KD_LEAF {
            self.within_node(self.root, query, radius, out);
        }
    }

    fn within_node(
        &self,
        node: usize,
        query: &[u8; IMAGE_VEC_DIM],
        radius: u32,
        out: &mut Vec<usize>,
    ) {
        let n = &self.nodes[node];
        let point = &self.sigs[n.point];
        if vec_dist(&point.vector, query) <= radius {
            out.push(n.point);
        }

        let axis_val = point.vector[n.axis];
        let q = query[n.axis];

        if let Some(left) = n.left {
            if u32::from(q) <= u32::from(axis_val) + radius {
                self.within_node(left, query, radius, out);
            }
        }
        if let Some(right) = n.right {
            if u32::from(q) + radius >= u32::from(axis_val) {
                self.within_node(right, query, radius, out);
            }
        }
    }
}

/// Splits one cluster by a random BSP cut until it fits the per-worker
/// buffer.
fn split_cluster(mut cluster: Vec<ImageSig>, max_len: usize, rng: &mut StdRng) -> Vec<Vec<ImageSig>> {
    if cluster.len() <= max_len {
        return vec![cluster];
    }

    let axis = rng.gen_range(0..IMAGE_VEC_DIM);
    cluster.sort_unstable_by_key(|s| s.vector[axis]);
    let mid = cluster.len() / 2;
    let right = cluster.split_off(mid);

    let mut out = split_cluster(cluster, max_len, rng);
    out.extend(split_cluster(right, max_len, rng));
    out
}

/// Image duplicate merging: clusters by physical size, BSP-splits clusters
/// to fit the worker buffer, then each worker KD-searches its cluster and a
/// quad-tree re-check confirms candidates.
pub fn merge_images(
    sigs: Vec<ImageSig>,
    notes: &[CardNote],
    merges: &mut Merges,
    config: &ImageMatcherConfig,
    seed: u64,
) -> u64 {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut by_size: std::collections::BTreeMap<(u16, u16), Vec<ImageSig>> =
        std::collections::BTreeMap::new();
    for sig in sigs {
        by_size.entry((sig.width, sig.height)).or_default().push(sig);
    }

    let per_worker = (config.buf_size / config.threads.max(1))
        / (IMAGE_VEC_DIM + std::mem::size_of::<ImageSig>());
    let per_worker = per_worker.clamp(64, 1 << 20);

    let mut clusters = Vec::new();
    for (_, cluster) in by_size {
        clusters.extend(split_cluster(cluster, per_worker, &mut rng));
    }

    // Workers only produce candidate pairs; the union-find stays on this
    // thread.
    let pairs: Vec<(CardId, CardId)> = clusters
        .par_iter()
        .flat_map_iter(|cluster| {
            let tree = KdTree::build(cluster);
            let mut found = Vec::new();
            let mut hits = Vec::new();

            for (i, sig) in cluster.iter().enumerate() {
                hits.clear();
                tree.within(&sig.vector, config.vector_threshold, &mut hits);
                for &j in &hits {
                    if j <= i {
                        continue;
                    }
                    if quad_matches(sig, &cluster[j], config.vector_threshold) {
                        found.push((sig.id, cluster[j].id));
                    }
                }
            }
            found
        })
        .collect();

    let mut merged = 0u64;
    for (a, b) in pairs {
        if !mergeable(notes, a) || !mergeable(notes, b) {
            continue;
        }
        if merges.find(a) != merges.find(b) {
            merges.union(a, b);
            merged += 1;
        }
    }

    merges.flatten();
    merged
}
