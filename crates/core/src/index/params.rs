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

//! The `parameters` file: a single binary struct handed to the search
//! server. Every field round-trips byte-exact, so the layout is written out
//! by hand instead of going through a codec.

use std::path::Path;

use anyhow::bail;

use crate::Result;

pub const PARAMS_VERSION: u32 = 0x0340;

const MAGIC: u32 = 0x4950_6101;
const BYTES: usize = 4 + 4 + 4 + 8 + 4 + 4 + 4 + 8 + 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LexParams {
    pub context_slots: u32,
    pub slot_budget: u32,
    pub max_gap: u32,
    /// Absolute word-length cap.
    pub max_word_chars: u32,
    /// Per-category word-length cap recorded for the search server.
    pub category_word_chars: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Parameters {
    pub version: u32,
    /// Reference time of the indexing run.
    pub ref_time: u32,
    pub objects_in: u64,
    pub sites: u32,
    pub num_slices: u32,
    pub srand: u32,
    pub cards_out: u64,
    pub lex_config: LexParams,
}

impl Parameters {
    pub fn to_bytes(&self) -> [u8; BYTES] {
        let mut buf = [0u8; BYTES];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.ref_time.to_le_bytes());
        buf[12..20].copy_from_slice(&self.objects_in.to_le_bytes());
        buf[20..24].copy_from_slice(&self.sites.to_le_bytes());
        buf[24..28].copy_from_slice(&self.num_slices.to_le_bytes());
        buf[28..32].copy_from_slice(&self.srand.to_le_bytes());
        buf[32..40].copy_from_slice(&self.cards_out.to_le_bytes());
        buf[40..44].copy_from_slice(&self.lex_config.context_slots.to_le_bytes());
        buf[44..48].copy_from_slice(&self.lex_config.slot_budget.to_le_bytes());
        buf[48..52].copy_from_slice(&self.lex_config.max_gap.to_le_bytes());
        buf[52..56].copy_from_slice(&self.lex_config.max_word_chars.to_le_bytes());
        buf[56..60].copy_from_slice(&self.lex_config.category_word_chars.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != BYTES {
            bail!("parameters file has wrong size: {}", buf.len());
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            bail!("parameters file has bad magic");
        }

        Ok(Self {
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            ref_time: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            objects_in: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            sites: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            num_slices: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            srand: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            cards_out: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            lex_config: LexParams {
                context_slots: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
                slot_budget: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
                max_gap: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
                max_word_chars: u32::from_le_bytes(buf[52..56].try_into().unwrap()),
                category_word_chars: u32::from_le_bytes(buf[56..60].try_into().unwrap()),
            },
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn save_load_identity(
            version: u32,
            ref_time: u32,
            objects_in: u64,
            sites: u32,
            num_slices: u32,
            srand: u32,
            cards_out: u64,
            context_slots: u32,
            slot_budget: u32,
            max_gap: u32,
            max_word_chars: u32,
            category_word_chars: u32,
        ) {
            let params = Parameters {
                version,
                ref_time,
                objects_in,
                sites,
                num_slices,
                srand,
                cards_out,
                lex_config: LexParams {
                    context_slots,
                    slot_budget,
                    max_gap,
                    max_word_chars,
                    category_word_chars,
                },
            };

            let path = crate::gen_temp_path();
            params.save(&path).unwrap();
            let loaded = Parameters::load(&path).unwrap();
            std::fs::remove_file(&path).ok();

            prop_assert_eq!(loaded, params);
            // The write itself is byte-stable.
            prop_assert_eq!(loaded.to_bytes(), params.to_bytes());
        }
    }

    #[test]
    fn rejects_truncated_file() {
        let path = crate::gen_temp_path();
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(Parameters::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
