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

//! Fixed-layout records of the URL and MD5 databases.

use super::bucket::Oid;
use super::FixedRecord;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UrlFlags: u8 {
        /// Part of the initial URL set.
        const INITIAL = 1;
        /// Queued for gathering.
        const QUEUED = 2;
        /// Regathering requested manually.
        const REGATHER = 4;
    }
}

/// Per-URL state: maps a URL to its bucket or error code and carries the
/// refresh bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrlRec {
    /// Time of last access, or of queueing when not gathered yet.
    pub access: u32,
    /// Object ID, or an error oid past [`super::bucket::OID_FIRST_ERROR`].
    pub oid: Oid,
    /// Last modification as reported by the server. Server-local time,
    /// never comparable with our own clocks.
    pub http_last_mod: u32,
    /// Mixed average time between the last observed changes.
    pub avg_change_time: u32,
    pub flags: UrlFlags,
    pub retries: u8,
}

impl FixedRecord for UrlRec {
    const BYTES: usize = 18;

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.access.to_le_bytes());
        buf[4..8].copy_from_slice(&self.oid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.http_last_mod.to_le_bytes());
        buf[12..16].copy_from_slice(&self.avg_change_time.to_le_bytes());
        buf[16] = self.flags.bits();
        buf[17] = self.retries;
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            access: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            oid: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            http_last_mod: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            avg_change_time: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            flags: UrlFlags::from_bits_truncate(buf[16]),
            retries: buf[17],
        }
    }
}

/// Maps a body MD5 to the bucket first seen with that content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Md5Rec {
    pub oid: Oid,
}

impl FixedRecord for Md5Rec {
    const BYTES: usize = 4;

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.oid.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            oid: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        }
    }
}
