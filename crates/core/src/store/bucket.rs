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

//! The append-only card store. Each record is a 16-byte aligned
//! `(oid, length, type)`-headed opaque blob; the oid is the record offset
//! divided by the alignment and stays stable for the lifetime of the file.
//! Deletion marks a tombstone in place; the offline shakedown rewrite
//! renumbers everything and reports the old-to-new mapping.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail};
use fs4::FileExt as LockExt;

use crate::Result;

pub type Oid = u32;

pub const OID_UNDEFINED: Oid = 0xffff_ffff;
/// Oids at and past this value encode per-URL error codes instead of file
/// positions.
pub const OID_FIRST_ERROR: Oid = 0xffff_0000;

const ALIGN: u64 = 16;
const HDR_BYTES: usize = 16;
const MAGIC: u32 = 0x5cb0_cafe;
const MAGIC_DELETED: u32 = 0x5cb0_dead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketHeader {
    pub oid: Oid,
    pub length: u32,
    pub btype: u32,
}

pub struct BucketFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl BucketFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        if size % ALIGN != 0 {
            bail!("bucket file has a truncated tail record");
        }

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record under the advisory file lock and returns its oid.
    pub fn append(&mut self, btype: u32, body: &[u8]) -> Result<Oid> {
        let oid = Oid::try_from(self.size / ALIGN)
            .map_err(|_| anyhow!("bucket file oid space exhausted"))?;
        if oid >= OID_FIRST_ERROR {
            bail!("bucket file oid space exhausted");
        }

        let mut record = Vec::with_capacity(HDR_BYTES + body.len() + ALIGN as usize);
        record.extend_from_slice(&MAGIC.to_le_bytes());
        record.extend_from_slice(&oid.to_le_bytes());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&btype.to_le_bytes());
        record.extend_from_slice(body);
        while record.len() as u64 % ALIGN != 0 {
            record.push(0);
        }

        self.file.lock_exclusive()?;
        let res = (|| -> Result<()> {
            self.file.write_all_at(&record, self.size)?;
            self.file.flush()?;
            Ok(())
        })();
        self.file.unlock()?;
        res?;

        self.size += record.len() as u64;
        Ok(oid)
    }

    fn read_header(&self, oid: Oid) -> Result<(u32, BucketHeader)> {
        let pos = u64::from(oid) * ALIGN;
        if pos + HDR_BYTES as u64 > self.size {
            bail!("oid {oid:08x} out of bounds");
        }

        let mut hdr = [0u8; HDR_BYTES];
        self.file.read_exact_at(&mut hdr, pos)?;

        let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        if magic != MAGIC && magic != MAGIC_DELETED {
            bail!("bad magic at oid {oid:08x}");
        }
        let stored = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
        if stored != oid {
            bail!("oid mismatch at {oid:08x}: header says {stored:08x}");
        }

        Ok((
            magic,
            BucketHeader {
                oid,
                length: u32::from_le_bytes(hdr[8..12].try_into().unwrap()),
                btype: u32::from_le_bytes(hdr[12..16].try_into().unwrap()),
            },
        ))
    }

    /// Fetches a record body. Returns `None` for tombstones.
    pub fn get(&self, oid: Oid) -> Result<Option<(BucketHeader, Vec<u8>)>> {
        let (magic, header) = self.read_header(oid)?;
        if magic == MAGIC_DELETED {
            return Ok(None);
        }

        let mut body = vec![0u8; header.length as usize];
        self.file
            .read_exact_at(&mut body, u64::from(oid) * ALIGN + HDR_BYTES as u64)?;
        Ok(Some((header, body)))
    }

    /// Marks a record deleted in place.
    pub fn delete(&mut self, oid: Oid) -> Result<()> {
        let (_, _) = self.read_header(oid)?;
        self.file
            .write_all_at(&MAGIC_DELETED.to_le_bytes(), u64::from(oid) * ALIGN)?;
        Ok(())
    }

    /// Sequential scan over live records.
    pub fn iter(&self) -> Iter<'_> {
        Iter { file: self, pos: 0 }
    }

    /// Rewrites the file without tombstones, reporting each record's new oid
    /// (or `None` when the record was deleted). Consumers must re-seat their
    /// oid references through this stream before reading again.
    pub fn shakedown<F>(self, mut renumbered: F) -> Result<Self>
    where
        F: FnMut(Oid, Option<Oid>),
    {
        let tmp_path = self.path.with_extension("shake");
        let mut out = BucketFile::open(&tmp_path)?;

        let mut pos = 0u64;
        while pos + HDR_BYTES as u64 <= self.size {
            let oid = (pos / ALIGN) as Oid;
            let (magic, header) = self.read_header(oid)?;

            if magic == MAGIC_DELETED {
                renumbered(oid, None);
            } else {
                let mut body = vec![0u8; header.length as usize];
                self.file.read_exact_at(&mut body, pos + HDR_BYTES as u64)?;
                let new_oid = out.append(header.btype, &body)?;
                renumbered(oid, Some(new_oid));
            }

            let record = (HDR_BYTES as u64 + u64::from(header.length)).next_multiple_of(ALIGN);
            pos += record;
        }

        drop(out);
        std::fs::rename(&tmp_path, &self.path)?;
        let path = self.path.clone();
        drop(self);
        BucketFile::open(path)
    }
}

pub struct Iter<'a> {
    file: &'a BucketFile,
    pos: u64,
}

impl Iterator for Iter<'_> {
    type Item = Result<(BucketHeader, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos + HDR_BYTES as u64 <= self.file.size {
            let oid = (self.pos / ALIGN) as Oid;
            let (magic, header) = match self.file.read_header(oid) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };

            self.pos +=
                (HDR_BYTES as u64 + u64::from(header.length)).next_multiple_of(ALIGN);

            if magic == MAGIC_DELETED {
                continue;
            }

            return match self.file.get(oid) {
                Ok(Some(rec)) => Some(Ok(rec)),
                Ok(None) => continue,
                Err(e) => Some(Err(e)),
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_get_delete() {
        let mut bucket = BucketFile::open(crate::gen_temp_path()).unwrap();

        let a = bucket.append(1, b"first body").unwrap();
        let b = bucket.append(2, b"second").unwrap();
        assert_ne!(a, b);

        let (hdr, body) = bucket.get(a).unwrap().unwrap();
        assert_eq!(hdr.btype, 1);
        assert_eq!(body, b"first body");

        bucket.delete(a).unwrap();
        assert!(bucket.get(a).unwrap().is_none());
        assert!(bucket.get(b).unwrap().is_some());

        let live: Vec<_> = bucket.iter().map(|r| r.unwrap()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1, b"second");
    }

    #[test]
    fn oids_are_monotonic() {
        let mut bucket = BucketFile::open(crate::gen_temp_path()).unwrap();
        let mut last = None;
        for i in 0..64u32 {
            let oid = bucket.append(0, &i.to_le_bytes()).unwrap();
            if let Some(last) = last {
                assert!(oid > last);
            }
            last = Some(oid);
        }
    }

    #[test]
    fn shakedown_renumbers() {
        let path = crate::gen_temp_path();
        let mut bucket = BucketFile::open(&path).unwrap();

        let a = bucket.append(0, b"aaaa").unwrap();
        let b = bucket.append(0, b"bbbb").unwrap();
        let c = bucket.append(0, b"cccc").unwrap();
        bucket.delete(b).unwrap();

        let mut map = Vec::new();
        let bucket = bucket
            .shakedown(|old, new| map.push((old, new)))
            .unwrap();

        assert_eq!(map.len(), 3);
        assert_eq!(map[0], (a, Some(a)));
        assert_eq!(map[1], (b, None));
        let new_c = map[2].1.unwrap();
        assert_eq!(map[2].0, c);

        let (_, body) = bucket.get(new_c).unwrap().unwrap();
        assert_eq!(body, b"cccc");
    }

    #[test]
    fn reopen_preserves_records() {
        let path = crate::gen_temp_path();
        let oid;
        {
            let mut bucket = BucketFile::open(&path).unwrap();
            oid = bucket.append(7, b"persistent").unwrap();
        }
        let bucket = BucketFile::open(&path).unwrap();
        let (hdr, body) = bucket.get(oid).unwrap().unwrap();
        assert_eq!(hdr.btype, 7);
        assert_eq!(body, b"persistent");
    }
}
