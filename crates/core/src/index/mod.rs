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

//! The indexer pipeline. Stages exchange typed record streams on disk;
//! every stage is restartable from its inputs and logs one summary line.

pub mod fingerprint;
pub mod graph;
pub mod labels;
pub mod lexicon;
pub mod lexmap;
pub mod merge;
pub mod merger;
pub mod merges;
pub mod params;
pub mod reftexts;
pub mod unreachable;
pub mod weights;

/// Dense card id. Skeletons live in their own half of the id space.
pub type CardId = u32;

/// First id of the skeleton range: cards that are referenced but never
/// downloaded. They join the link graph and weight propagation but carry no
/// body.
pub const FIRST_ID_SKEL: CardId = 0x8000_0000;

pub fn is_skeleton(id: CardId) -> bool {
    id >= FIRST_ID_SKEL
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CardFlags: u16 {
        const EMPTY = 0x0001;
        const DUP = 0x0002;
        const MERGED = 0x0004;
        const FRAMESET = 0x0008;
        const REDIRECT = 0x0010;
        /// The redirect chain from this card ends at a live card.
        const HAS_TARGET = 0x0020;
        const IS_LINKED = 0x0040;
        const GIANT = 0x0080;
        const IMAGE = 0x0100;
    }
}

/// Per-card attributes every stage reads and some mutate. Kept as one dense
/// array indexed by card id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardNote {
    pub flags: CardFlags,
    pub weight: u8,
    pub site_id: u32,
    pub area_id: u32,
    pub type_lang: u8,
}

pub const SITE_ID_UNKNOWN: u32 = u32::MAX;

/// Counts per-stage inconsistencies. Offenders are dropped and the stage
/// continues until the configured threshold, then the whole stage fails.
pub struct StageCounter {
    name: &'static str,
    max: u64,
    dropped: u64,
}

impl StageCounter {
    pub fn new(name: &'static str, max: u64) -> Self {
        Self {
            name,
            max,
            dropped: 0,
        }
    }

    pub fn drop_offender(&mut self, what: impl std::fmt::Display) -> crate::Result<()> {
        tracing::error!("{}: dropping {}", self.name, what);
        self.dropped += 1;
        if self.dropped > self.max {
            anyhow::bail!("{}: too many inconsistencies ({})", self.name, self.dropped);
        }
        Ok(())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn report(&self, input: u64, output: u64) {
        tracing::info!(
            "{}: {} in, {} out, {} dropped",
            self.name,
            input,
            output,
            self.dropped
        );
    }
}
