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

//! Fingerprints and the fingerprint-to-id resolver.
//!
//! A fingerprint is the 128-bit digest of a canonical URL key; the master
//! list maps every known fingerprint to its dense card id. The resolver
//! splits the list radix-wise on the top bits of `hash32` until each
//! partition fits an open-addressed table under the configured load factor,
//! then streams lookups through a worker pool while the caller's thread
//! keeps the input order on output.

use std::sync::Arc;

use crossbeam_channel::bounded;
use memmap2::Mmap;

use super::{is_skeleton, CardId};
use crate::config::ResolveConfig;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    /// Digest of a canonical URL key. Two URLs are the same document iff
    /// their keys produce equal fingerprints.
    pub fn of_url_key(key: &str) -> Self {
        Self(md5::compute(key.as_bytes()).0)
    }

    pub fn hash32(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().unwrap())
    }
}

/// Sorted on-disk master list of `(fingerprint, card_id)` records. The
/// array is strictly sorted by fingerprint; the resolver and the direct
/// binary search both rely on it.
pub struct FingerprintList {
    map: Mmap,
    len: usize,
}

const REC_BYTES: usize = 20;

impl FingerprintList {
    pub fn write<P: AsRef<std::path::Path>>(
        path: P,
        pairs: &mut Vec<(Fingerprint, CardId)>,
    ) -> Result<()> {
        pairs.sort_unstable();

        let mut data = Vec::with_capacity(pairs.len() * REC_BYTES);
        let mut prev: Option<Fingerprint> = None;
        for (fp, id) in pairs.iter() {
            if prev == Some(*fp) {
                anyhow::bail!("duplicate fingerprint in master list");
            }
            prev = Some(*fp);
            data.extend_from_slice(&fp.0);
            data.extend_from_slice(&id.to_le_bytes());
        }

        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        if map.len() % REC_BYTES != 0 {
            anyhow::bail!("fingerprint list has a truncated record");
        }
        let len = map.len() / REC_BYTES;
        Ok(Self { map, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> (Fingerprint, CardId) {
        let rec = &self.map[i * REC_BYTES..(i + 1) * REC_BYTES];
        let mut fp = [0u8; 16];
        fp.copy_from_slice(&rec[0..16]);
        (
            Fingerprint(fp),
            CardId::from_le_bytes(rec[16..20].try_into().unwrap()),
        )
    }

    pub fn find(&self, fp: &Fingerprint) -> Option<CardId> {
        let mut lo = 0usize;
        let mut hi = self.len;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (mid_fp, id) = self.get(mid);
            match mid_fp.cmp(fp) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(id),
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fingerprint, CardId)> + '_ {
        (0..self.len).map(|i| self.get(i))
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResolveMode: u8 {
        /// Drop records whose fingerprint is not in the master list.
        const SKIP_UNKNOWN = 1;
        /// Drop records resolving into the skeleton id range.
        const SKIP_SKEL = 2;
    }
}

const RADIX_BITS: u32 = 8;
const MAX_DEPTH: u32 = 3;
const SLOT_EMPTY: u32 = u32::MAX;

enum Node {
    Leaf(Table),
    Split { depth: u32, children: Vec<Node> },
}

/// Open-addressed table keyed by the full fingerprint.
struct Table {
    slots: Vec<u32>,
    entries: Vec<(Fingerprint, CardId)>,
}

impl Table {
    fn build(entries: Vec<(Fingerprint, CardId)>, max_density: f64) -> Self {
        let wanted = ((entries.len() as f64 / max_density).ceil() as usize).max(4);
        let size = wanted.next_power_of_two();
        let mut slots = vec![SLOT_EMPTY; size];

        for (i, (fp, _)) in entries.iter().enumerate() {
            let mut slot = fp.hash32() as usize & (size - 1);
            while slots[slot] != SLOT_EMPTY {
                slot = (slot + 1) & (size - 1);
            }
            slots[slot] = i as u32;
        }

        Self { slots, entries }
    }

    fn find(&self, fp: &Fingerprint) -> Option<CardId> {
        let size = self.slots.len();
        let mut slot = fp.hash32() as usize & (size - 1);
        loop {
            let idx = self.slots[slot];
            if idx == SLOT_EMPTY {
                return None;
            }
            let (entry_fp, id) = &self.entries[idx as usize];
            if entry_fp == fp {
                return Some(*id);
            }
            slot = (slot + 1) & (size - 1);
        }
    }
}

/// Fingerprint resolver: the split tree is built once and consulted by all
/// worker threads.
pub struct Resolver {
    root: Node,
    mode: ResolveMode,
    config: ResolveConfig,
}

fn radix_child(fp: &Fingerprint, depth: u32) -> usize {
    ((fp.hash32() >> (32 - RADIX_BITS * (depth + 1))) & ((1 << RADIX_BITS) - 1)) as usize
}

impl Resolver {
    pub fn build(
        pairs: impl Iterator<Item = (Fingerprint, CardId)>,
        mode: ResolveMode,
        config: ResolveConfig,
    ) -> Self {
        let entries: Vec<_> = pairs.collect();
        let leaf_capacity =
            (((1usize << 16) as f64) * config.max_hash_density).max(64.0) as usize;
        let root = Self::build_node(entries, 0, leaf_capacity, config.max_hash_density);
        Self { root, mode, config }
    }

    fn build_node(
        entries: Vec<(Fingerprint, CardId)>,
        depth: u32,
        leaf_capacity: usize,
        max_density: f64,
    ) -> Node {
        if entries.len() <= leaf_capacity || depth >= MAX_DEPTH {
            return Node::Leaf(Table::build(entries, max_density));
        }

        let mut buckets: Vec<Vec<(Fingerprint, CardId)>> =
            (0..1 << RADIX_BITS).map(|_| Vec::new()).collect();
        for (fp, id) in entries {
            buckets[radix_child(&fp, depth)].push((fp, id));
        }

        Node::Split {
            depth,
            children: buckets
                .into_iter()
                .map(|bucket| Self::build_node(bucket, depth + 1, leaf_capacity, max_density))
                .collect(),
        }
    }

    fn lookup(root: &Node, fp: &Fingerprint) -> Option<CardId> {
        let mut node = root;
        loop {
            match node {
                Node::Leaf(table) => return table.find(fp),
                Node::Split { depth, children } => {
                    node = &children[radix_child(fp, *depth)];
                }
            }
        }
    }

    pub fn resolve(&self, fp: &Fingerprint) -> Option<CardId> {
        Self::lookup(&self.root, fp)
    }

    fn admit(&self, resolved: Option<CardId>) -> Option<Option<CardId>> {
        match resolved {
            None if self.mode.contains(ResolveMode::SKIP_UNKNOWN) => None,
            None => Some(None),
            Some(id) if self.mode.contains(ResolveMode::SKIP_SKEL) && is_skeleton(id) => None,
            Some(id) => Some(Some(id)),
        }
    }

    /// Streams `(fingerprint, payload)` records through the worker pool,
    /// replacing each fingerprint by its card id. Batches are prefetched;
    /// the calling thread reassembles them in input order.
    pub fn resolve_stream<P, I, F>(self: &Arc<Self>, input: I, mut output: F) -> Result<u64>
    where
        P: Send,
        I: Iterator<Item = (Fingerprint, P)> + Send,
        F: FnMut(Option<CardId>, P),
    {
        let threads = self.config.threads.max(1);
        let batch_size = self.config.batch_size.max(1);
        let prefetch = self.config.prefetch.max(1);

        let mut dropped = 0u64;

        std::thread::scope(|scope| {
            let (batch_tx, batch_rx) =
                bounded::<(u64, Vec<(Fingerprint, P)>)>(prefetch);
            let (done_tx, done_rx) =
                bounded::<(u64, Vec<(Option<CardId>, P)>)>(prefetch);

            for _ in 0..threads {
                let batch_rx = batch_rx.clone();
                let done_tx = done_tx.clone();
                let resolver = Arc::clone(self);
                scope.spawn(move || {
                    while let Ok((seq, batch)) = batch_rx.recv() {
                        let resolved = batch
                            .into_iter()
                            .map(|(fp, payload)| (resolver.resolve(&fp), payload))
                            .collect();
                        if done_tx.send((seq, resolved)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(batch_rx);
            drop(done_tx);

            // Feed batches from this scope too, so the pool stays busy
            // while the main thread reorders output.
            let feeder = scope.spawn(move || {
                let mut input = input;
                let mut seq = 0u64;
                loop {
                    let mut batch = Vec::with_capacity(batch_size);
                    for item in input.by_ref().take(batch_size) {
                        batch.push(item);
                    }
                    if batch.is_empty() {
                        break;
                    }
                    if batch_tx.send((seq, batch)).is_err() {
                        break;
                    }
                    seq += 1;
                }
            });

            let mut next_seq = 0u64;
            let mut reorder = std::collections::BTreeMap::new();
            while let Ok((seq, batch)) = done_rx.recv() {
                reorder.insert(seq, batch);
                while let Some(batch) = reorder.remove(&next_seq) {
                    for (resolved, payload) in batch {
                        match self.admit(resolved) {
                            Some(id) => output(id, payload),
                            None => dropped += 1,
                        }
                    }
                    next_seq += 1;
                }
            }

            feeder.join().ok();
        });

        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint(md5::compute(n.to_le_bytes()).0)
    }

    #[test]
    fn list_is_sorted_and_searchable() {
        let path = crate::gen_temp_path();
        let mut pairs: Vec<_> = (0..1000u64).map(|i| (fp(i), i as CardId)).collect();
        FingerprintList::write(&path, &mut pairs).unwrap();

        let list = FingerprintList::open(&path).unwrap();
        assert_eq!(list.len(), 1000);

        for i in 1..list.len() {
            assert!(list.get(i - 1).0 < list.get(i).0, "list must be sorted");
        }

        for i in (0..1000u64).step_by(37) {
            assert_eq!(list.find(&fp(i)), Some(i as CardId));
        }
        assert_eq!(list.find(&fp(5000)), None);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_duplicate_fingerprints() {
        let path = crate::gen_temp_path();
        let mut pairs = vec![(fp(1), 1), (fp(1), 2)];
        assert!(FingerprintList::write(&path, &mut pairs).is_err());
        std::fs::remove_file(&path).ok();
    }

    fn resolver(n: u64, mode: ResolveMode) -> Arc<Resolver> {
        let pairs = (0..n).map(|i| {
            let id = if i % 10 == 9 {
                super::super::FIRST_ID_SKEL + i as CardId
            } else {
                i as CardId
            };
            (fp(i), id)
        });
        Arc::new(Resolver::build(pairs, mode, ResolveConfig::default()))
    }

    #[test]
    fn resolves_exactly() {
        let r = resolver(10_000, ResolveMode::empty());
        for i in (0..10_000u64).step_by(71) {
            let expect = if i % 10 == 9 {
                super::super::FIRST_ID_SKEL + i as CardId
            } else {
                i as CardId
            };
            assert_eq!(r.resolve(&fp(i)), Some(expect));
        }
        assert_eq!(r.resolve(&fp(999_999)), None);

        // Resolving twice yields the same id.
        assert_eq!(r.resolve(&fp(42)), r.resolve(&fp(42)));
    }

    #[test]
    fn stream_preserves_order_and_modes() {
        let r = resolver(1000, ResolveMode::SKIP_UNKNOWN | ResolveMode::SKIP_SKEL);

        let input: Vec<(Fingerprint, u64)> = (0..2000u64).map(|i| (fp(i), i)).collect();
        let mut out = Vec::new();
        let dropped = r
            .resolve_stream(input.into_iter(), |id, payload| {
                out.push((id.unwrap(), payload));
            })
            .unwrap();

        // 1000 unknown plus the skeleton tenth of the known range.
        assert_eq!(dropped, 1000 + 100);
        assert_eq!(out.len(), 900);

        // Payload order is input order.
        let payloads: Vec<u64> = out.iter().map(|(_, p)| *p).collect();
        let mut sorted = payloads.clone();
        sorted.sort_unstable();
        assert_eq!(payloads, sorted);

        for (id, payload) in out {
            assert_eq!(id, payload as CardId);
        }
    }

    #[test]
    fn empty_resolver() {
        let r = Arc::new(Resolver::build(
            std::iter::empty(),
            ResolveMode::empty(),
            ResolveConfig::default(),
        ));
        assert_eq!(r.resolve(&fp(1)), None);

        let mut out: Vec<(Option<CardId>, u64)> = Vec::new();
        let dropped = r
            .resolve_stream(vec![(fp(1), 1u64)].into_iter(), |id, p| out.push((id, p)))
            .unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(out, vec![(None, 1)]);
    }
}
