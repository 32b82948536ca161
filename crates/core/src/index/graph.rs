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

//! Link graph construction: resolves link endpoints, orders cards
//! site-adjacent, rewrites redirect destinations, splits the edge list into
//! per-thread shards and writes the on-disk graph files.
//!
//! On-disk record: a 32-bit destination word whose top 3 bits select the
//! width of the out-degree field (0 means an implicit degree of one, then
//! 8, 16 or 32 bits follow), followed by that many 32-bit source words,
//! each carrying the edge type in its top 3 bits. The sidecar `-index`
//! file is a fixed-width table of absolute record offsets indexed by
//! destination id, `!0` for destinations without a record.

use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::bail;
use hashbrown::HashMap;

use super::fingerprint::{Fingerprint, Resolver};
use super::{CardFlags, CardId, CardNote, StageCounter, FIRST_ID_SKEL};
use crate::Result;

/// Edge types, stored in the top 3 bits of each source word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EdgeType {
    Normal = 0,
    Intersite = 1,
    Redirect = 2,
    Frame = 4,
    Image = 6,
}

impl EdgeType {
    fn from_bits(bits: u32) -> Result<Self> {
        Ok(match bits {
            0 => EdgeType::Normal,
            1 => EdgeType::Intersite,
            2 => EdgeType::Redirect,
            4 => EdgeType::Frame,
            6 => EdgeType::Image,
            other => bail!("unknown edge type {other}"),
        })
    }
}

const ID_MASK: u32 = 0x1fff_ffff;
const DEG_SHIFT: u32 = 29;
pub const NO_RECORD: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub src: CardId,
    pub dst: CardId,
    pub etype: EdgeType,
}

/// A link as the scanner emits it, before resolution.
#[derive(Debug, Clone, Copy)]
pub struct RawLink {
    pub src: Fingerprint,
    pub dst: Fingerprint,
    pub etype: EdgeType,
}

/*** On-disk graph files ***/

pub struct GraphWriter {
    graph: BufWriter<std::fs::File>,
    index: Vec<u64>,
    offset: u64,
    path: PathBuf,
}

impl GraphWriter {
    pub fn create<P: AsRef<Path>>(path: P, max_dest: usize) -> Result<Self> {
        let file = std::fs::File::create(path.as_ref())?;
        Ok(Self {
            graph: BufWriter::new(file),
            index: vec![NO_RECORD; max_dest],
            offset: 0,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Writes one destination record. Sources must carry ids below 2^29.
    pub fn push(&mut self, dst: CardId, sources: &[(CardId, EdgeType)]) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }
        if dst as usize >= self.index.len() {
            bail!("destination {dst} out of range");
        }
        self.index[dst as usize] = self.offset;

        let degree = sources.len() as u32;
        let mut buf = Vec::with_capacity(8 + sources.len() * 4);

        let prefix: u32 = match degree {
            1 => 0,
            2..=0xff => 1,
            0x100..=0xffff => 2,
            _ => 3,
        };
        buf.extend_from_slice(&((prefix << DEG_SHIFT) | (dst & ID_MASK)).to_le_bytes());
        match prefix {
            0 => {}
            1 => buf.push(degree as u8),
            2 => buf.extend_from_slice(&(degree as u16).to_le_bytes()),
            _ => buf.extend_from_slice(&degree.to_le_bytes()),
        }

        for &(src, etype) in sources {
            if src > ID_MASK {
                bail!("source id {src} does not fit the record format");
            }
            buf.extend_from_slice(&(((etype as u32) << DEG_SHIFT) | src).to_le_bytes());
        }

        self.graph.write_all(&buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Flushes the graph and writes the sidecar offset index.
    pub fn finish(mut self) -> Result<()> {
        self.graph.flush()?;

        let index_path = index_path(&self.path);
        let mut out = BufWriter::new(std::fs::File::create(index_path)?);
        for offset in &self.index {
            out.write_all(&offset.to_le_bytes())?;
        }
        out.flush()?;
        Ok(())
    }
}

pub fn index_path(graph: &Path) -> PathBuf {
    let mut name = graph.file_name().unwrap_or_default().to_os_string();
    name.push("-index");
    graph.with_file_name(name)
}

pub struct GraphReader {
    data: Vec<u8>,
    index: Vec<u64>,
}

impl GraphReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;

        let raw = std::fs::read(index_path(path.as_ref()))?;
        if raw.len() % 8 != 0 {
            bail!("graph index has a truncated entry");
        }
        let index = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self { data, index })
    }

    pub fn destinations(&self) -> usize {
        self.index.len()
    }

    /// Incoming edges of one destination.
    pub fn sources(&self, dst: CardId) -> Result<Vec<(CardId, EdgeType)>> {
        let Some(&offset) = self.index.get(dst as usize) else {
            return Ok(Vec::new());
        };
        if offset == NO_RECORD {
            return Ok(Vec::new());
        }

        let mut cursor = &self.data[offset as usize..];
        let mut word = [0u8; 4];
        cursor.read_exact(&mut word)?;
        let head = u32::from_le_bytes(word);
        if head & ID_MASK != dst & ID_MASK {
            bail!("graph index points at the wrong record for {dst}");
        }

        let degree = match head >> DEG_SHIFT {
            0 => 1,
            1 => {
                let mut b = [0u8; 1];
                cursor.read_exact(&mut b)?;
                u32::from(b[0])
            }
            2 => {
                let mut b = [0u8; 2];
                cursor.read_exact(&mut b)?;
                u32::from(u16::from_le_bytes(b))
            }
            _ => {
                cursor.read_exact(&mut word)?;
                u32::from_le_bytes(word)
            }
        };

        let mut sources = Vec::with_capacity(degree as usize);
        for _ in 0..degree {
            cursor.read_exact(&mut word)?;
            let w = u32::from_le_bytes(word);
            sources.push((w & ID_MASK, EdgeType::from_bits(w >> DEG_SHIFT)?));
        }
        Ok(sources)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CardId, Vec<(CardId, EdgeType)>)> + '_ {
        (0..self.index.len() as CardId).filter_map(move |dst| {
            if self.index[dst as usize] == NO_RECORD {
                return None;
            }
            self.sources(dst).ok().map(|sources| (dst, sources))
        })
    }
}

/*** The mkgraph stage ***/

pub struct GraphConfig {
    pub shards: usize,
    /// Area-crossing links are dropped when areas are in use.
    pub check_areas: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            check_areas: false,
        }
    }
}

pub struct GraphOutput {
    /// Live-destination shards, contiguous destination ranges.
    pub shards: Vec<PathBuf>,
    /// Ranges covered by each shard.
    pub shard_ranges: Vec<(CardId, CardId)>,
    /// Skeleton-destination subgraph.
    pub skel_graph: PathBuf,
    /// Out-degree per live source id.
    pub out_degrees: Vec<u32>,
    /// Site-adjacent order: `real[new] = old`.
    pub real: Vec<CardId>,
    /// Inverse permutation: `goes[old] = new`.
    pub goes: Vec<CardId>,
    pub edges: u64,
}

pub struct MkGraph<'a> {
    notes: &'a mut [CardNote],
    config: GraphConfig,
    counter: StageCounter,
}

impl<'a> MkGraph<'a> {
    pub fn new(notes: &'a mut [CardNote], config: GraphConfig, max_inconsistencies: u64) -> Self {
        Self {
            notes,
            config,
            counter: StageCounter::new("mkgraph", max_inconsistencies),
        }
    }

    pub fn run<P: AsRef<Path>>(
        mut self,
        links: impl Iterator<Item = RawLink>,
        resolver: &Resolver,
        out_dir: P,
    ) -> Result<GraphOutput> {
        let out_dir = out_dir.as_ref();
        std::fs::create_dir_all(out_dir)?;
        let n = self.notes.len();

        // 1. Resolve endpoints, skipping unknown fingerprints.
        let mut input = 0u64;
        let mut edges: Vec<Edge> = Vec::new();
        for link in links {
            input += 1;
            let (Some(src), Some(dst)) = (resolver.resolve(&link.src), resolver.resolve(&link.dst))
            else {
                continue;
            };
            if src == dst {
                continue;
            }
            edges.push(Edge {
                src,
                dst,
                etype: link.etype,
            });
        }

        // 2. Site-adjacent permutation of the live cards.
        let mut real: Vec<CardId> = (0..n as CardId).collect();
        real.sort_by_key(|&id| (self.notes[id as usize].site_id, id));
        let mut goes = vec![0 as CardId; n];
        for (new, &old) in real.iter().enumerate() {
            goes[old as usize] = new as CardId;
        }

        // 3. Redirect rewriting. A redirect's single outgoing link names
        // its target; chains are followed to the terminus.
        let mut redirect_target: HashMap<CardId, CardId> = HashMap::new();
        for edge in &edges {
            if edge.etype == EdgeType::Redirect
                && !is_skel(edge.src)
                && self.notes[edge.src as usize].flags.contains(CardFlags::REDIRECT)
            {
                redirect_target.entry(edge.src).or_insert(edge.dst);
            }
        }

        let resolve_redirect = |start: CardId| -> Option<CardId> {
            let mut cur = start;
            for _ in 0..32 {
                match redirect_target.get(&cur) {
                    Some(&next) => cur = next,
                    None => {
                        return if cur == start { None } else { Some(cur) };
                    }
                }
            }
            None
        };

        for &from in redirect_target.keys() {
            if let Some(target) = resolve_redirect(from) {
                if !is_skel(target) {
                    self.notes[from as usize].flags |= CardFlags::HAS_TARGET;
                }
            }
        }

        let src_is_redirect = |notes: &[CardNote], id: CardId| {
            !is_skel(id) && notes[id as usize].flags.contains(CardFlags::REDIRECT)
        };

        let mut kept: Vec<Edge> = Vec::with_capacity(edges.len());
        for mut edge in edges {
            if !is_skel(edge.dst)
                && self.notes[edge.dst as usize].flags.contains(CardFlags::REDIRECT)
                && !src_is_redirect(self.notes, edge.src)
            {
                match resolve_redirect(edge.dst) {
                    Some(target) if target != edge.src => edge.dst = target,
                    _ => {
                        self.counter.drop_offender(format_args!(
                            "link {} -> {}: unresolvable redirect chain",
                            edge.src, edge.dst
                        ))?;
                        continue;
                    }
                }
            }

            // 4. Area checks apply only to live-to-live links.
            if self.config.check_areas && !is_skel(edge.src) && !is_skel(edge.dst) {
                let src_area = self.notes[edge.src as usize].area_id;
                let dst_area = self.notes[edge.dst as usize].area_id;
                if src_area != dst_area {
                    continue;
                }
            }

            // Inter-site links are tagged separately.
            if edge.etype == EdgeType::Normal
                && !is_skel(edge.src)
                && !is_skel(edge.dst)
                && self.notes[edge.src as usize].site_id != self.notes[edge.dst as usize].site_id
            {
                edge.etype = EdgeType::Intersite;
            }

            // 5. Destinations become IS_LINKED.
            if !is_skel(edge.dst) {
                self.notes[edge.dst as usize].flags |= CardFlags::IS_LINKED;
            }

            kept.push(edge);
        }

        // 6. Out-degrees per live source.
        let mut out_degrees = vec![0u32; n];
        for edge in &kept {
            if !is_skel(edge.src) {
                out_degrees[edge.src as usize] += 1;
            }
        }

        // 7. Split into per-thread shards by destination range, skeleton
        // destinations separately.
        let shards = self.config.shards.max(1);
        let per_shard = n.div_ceil(shards).max(1);

        let mut shard_edges: Vec<Vec<Edge>> = (0..shards).map(|_| Vec::new()).collect();
        let mut skel_edges: Vec<Edge> = Vec::new();
        let total = kept.len() as u64;
        for edge in kept {
            if is_skel(edge.dst) {
                skel_edges.push(edge);
            } else {
                shard_edges[(edge.dst as usize) / per_shard].push(edge);
            }
        }

        let mut shard_paths = Vec::new();
        let mut shard_ranges = Vec::new();
        for (i, edges) in shard_edges.into_iter().enumerate() {
            let path = out_dir.join(format!("graph-{i}"));
            write_graph(&path, n, edges, 0)?;
            shard_paths.push(path);
            let lo = (i * per_shard) as CardId;
            let hi = (((i + 1) * per_shard).min(n)) as CardId;
            shard_ranges.push((lo, hi));
        }

        let skel_path = out_dir.join("graph-skel");
        let max_skel = skel_edges
            .iter()
            .map(|e| (e.dst - FIRST_ID_SKEL) as usize + 1)
            .max()
            .unwrap_or(0);
        write_graph(&skel_path, max_skel, skel_edges, FIRST_ID_SKEL)?;

        self.counter.report(input, total);

        Ok(GraphOutput {
            shards: shard_paths,
            shard_ranges,
            skel_graph: skel_path,
            out_degrees,
            real,
            goes,
            edges: total,
        })
    }
}

fn is_skel(id: CardId) -> bool {
    super::is_skeleton(id)
}

/// Groups edges by destination and writes one graph file. `rebase` is
/// subtracted from destination ids (used by the skeleton subgraph).
fn write_graph(path: &Path, max_dest: usize, mut edges: Vec<Edge>, rebase: CardId) -> Result<()> {
    use itertools::Itertools;

    edges.sort_unstable_by_key(|e| (e.dst, e.src));

    let mut writer = GraphWriter::create(path, max_dest)?;
    for (dst, group) in &edges.iter().chunk_by(|e| e.dst) {
        let sources: Vec<_> = group.map(|e| (e.src, e.etype)).collect();
        writer.push(dst - rebase, &sources)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolveConfig;
    use crate::index::fingerprint::ResolveMode;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint(md5::compute(n.to_le_bytes()).0)
    }

    #[test]
    fn record_format_roundtrip() {
        let path = crate::gen_temp_path();
        let mut writer = GraphWriter::create(&path, 70_000).unwrap();

        // Degrees crossing each prefix width.
        let single = vec![(7 as CardId, EdgeType::Normal)];
        let medium: Vec<_> = (0..200 as CardId).map(|i| (i, EdgeType::Intersite)).collect();
        let large: Vec<_> = (0..66_000 as CardId)
            .map(|i| (i, EdgeType::Image))
            .collect();

        writer.push(1, &single).unwrap();
        writer.push(5, &medium).unwrap();
        writer.push(69_999, &large).unwrap();
        writer.finish().unwrap();

        let reader = GraphReader::open(&path).unwrap();
        assert_eq!(reader.sources(1).unwrap(), single);
        assert_eq!(reader.sources(5).unwrap(), medium);
        assert_eq!(reader.sources(69_999).unwrap().len(), 66_000);
        assert!(reader.sources(2).unwrap().is_empty());

        std::fs::remove_file(&path).ok();
        std::fs::remove_file(index_path(&path)).ok();
    }

    fn resolver_for(n: u64) -> Resolver {
        Resolver::build(
            (0..n).map(|i| (fp(i), i as CardId)),
            ResolveMode::SKIP_UNKNOWN,
            ResolveConfig::default(),
        )
    }

    #[test]
    fn builds_graph_with_redirects_and_marks() {
        // Cards: 0 -> 1 (redirect 1 -> 2), 3 -> 4 cross-site.
        let mut notes = vec![CardNote::default(); 5];
        notes[1].flags |= CardFlags::REDIRECT;
        for (i, note) in notes.iter_mut().enumerate() {
            note.site_id = if i == 4 { 99 } else { 1 };
        }

        let links = vec![
            RawLink {
                src: fp(0),
                dst: fp(1),
                etype: EdgeType::Normal,
            },
            RawLink {
                src: fp(1),
                dst: fp(2),
                etype: EdgeType::Redirect,
            },
            RawLink {
                src: fp(3),
                dst: fp(4),
                etype: EdgeType::Normal,
            },
            // Unknown fingerprint: skipped.
            RawLink {
                src: fp(77),
                dst: fp(0),
                etype: EdgeType::Normal,
            },
        ];

        let resolver = resolver_for(5);
        let dir = crate::gen_temp_path();
        let output = MkGraph::new(&mut notes, GraphConfig::default(), 100)
            .run(links.into_iter(), &resolver, &dir)
            .unwrap();

        // 0 -> 1 was rewritten to the redirect target 2.
        assert!(notes[1].flags.contains(CardFlags::HAS_TARGET));
        assert!(notes[2].flags.contains(CardFlags::IS_LINKED));

        // Cross-site link got tagged.
        let mut found_intersite = false;
        for shard in &output.shards {
            let reader = GraphReader::open(shard).unwrap();
            for (dst, sources) in reader.iter() {
                if dst == 4 {
                    assert_eq!(sources, vec![(3, EdgeType::Intersite)]);
                    found_intersite = true;
                }
            }
        }
        assert!(found_intersite);

        assert_eq!(output.out_degrees[0], 1);
        assert_eq!(output.out_degrees[3], 1);
        assert_eq!(output.edges, 3);

        // real/goes are inverse permutations.
        for (new, &old) in output.real.iter().enumerate() {
            assert_eq!(output.goes[old as usize], new as CardId);
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn site_adjacent_order() {
        let mut notes = vec![CardNote::default(); 4];
        notes[0].site_id = 5;
        notes[1].site_id = 1;
        notes[2].site_id = 5;
        notes[3].site_id = 1;

        let resolver = resolver_for(4);
        let dir = crate::gen_temp_path();
        let output = MkGraph::new(&mut notes, GraphConfig::default(), 100)
            .run(std::iter::empty(), &resolver, &dir)
            .unwrap();

        assert_eq!(output.real, vec![1, 3, 0, 2]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_graph_succeeds() {
        let mut notes = Vec::new();
        let resolver = resolver_for(0);
        let dir = crate::gen_temp_path();
        let output = MkGraph::new(&mut notes, GraphConfig::default(), 100)
            .run(std::iter::empty(), &resolver, &dir)
            .unwrap();
        assert_eq!(output.edges, 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
