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

pub mod bucket;
pub mod fixed_db;
pub mod records;

/// Fixed-size byte layout of a stored record. Layouts are little-endian and
/// explicit so files round-trip byte-exact across versions.
pub trait FixedRecord: Sized {
    const BYTES: usize;

    fn write(&self, buf: &mut [u8]);
    fn read(buf: &[u8]) -> Self;
}
