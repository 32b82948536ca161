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

//! Disk hash database with variable keys and fixed-length values:
//! extendible hashing over 8 KiB pages, with the directory persisted in a
//! sidecar file. Iteration order is implementation-defined.

use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::bail;
use rustc_hash::FxHasher;

use super::FixedRecord;
use crate::Result;

const PAGE_SIZE: usize = 8192;
const PAGE_HDR: usize = 8;
const DIR_MAGIC: u32 = 0x4878_db01;
pub const MAX_KEY: usize = 4096;

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.finish()
}

struct Page {
    buf: Vec<u8>,
}

impl Page {
    fn empty(local_bits: u8) -> Self {
        let mut buf = vec![0u8; PAGE_SIZE];
        buf[0..2].copy_from_slice(&(PAGE_HDR as u16).to_le_bytes());
        buf[2] = local_bits;
        Self { buf }
    }

    fn used(&self) -> usize {
        u16::from_le_bytes(self.buf[0..2].try_into().unwrap()) as usize
    }

    fn set_used(&mut self, used: usize) {
        self.buf[0..2].copy_from_slice(&(used as u16).to_le_bytes());
    }

    fn local_bits(&self) -> u8 {
        self.buf[2]
    }

    fn set_local_bits(&mut self, bits: u8) {
        self.buf[2] = bits;
    }

    /// Offset of the record with this key, if present.
    fn find(&self, key: &[u8], value_bytes: usize) -> Option<usize> {
        let mut pos = PAGE_HDR;
        let used = self.used();
        while pos < used {
            let klen = u16::from_le_bytes(self.buf[pos..pos + 2].try_into().unwrap()) as usize;
            if &self.buf[pos + 2..pos + 2 + klen] == key {
                return Some(pos);
            }
            pos += 2 + klen + value_bytes;
        }
        None
    }

    fn push(&mut self, key: &[u8], value: &[u8]) -> bool {
        let used = self.used();
        let needed = 2 + key.len() + value.len();
        if used + needed > PAGE_SIZE {
            return false;
        }
        self.buf[used..used + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        self.buf[used + 2..used + 2 + key.len()].copy_from_slice(key);
        self.buf[used + 2 + key.len()..used + needed].copy_from_slice(value);
        self.set_used(used + needed);
        true
    }

    fn remove(&mut self, pos: usize, value_bytes: usize) {
        let klen = u16::from_le_bytes(self.buf[pos..pos + 2].try_into().unwrap()) as usize;
        let rec = 2 + klen + value_bytes;
        let used = self.used();
        self.buf.copy_within(pos + rec..used, pos);
        self.set_used(used - rec);
    }

    fn records(&self, value_bytes: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut pos = PAGE_HDR;
        let used = self.used();
        while pos < used {
            let klen = u16::from_le_bytes(self.buf[pos..pos + 2].try_into().unwrap()) as usize;
            let key = self.buf[pos + 2..pos + 2 + klen].to_vec();
            let value = self.buf[pos + 2 + klen..pos + 2 + klen + value_bytes].to_vec();
            out.push((key, value));
            pos += 2 + klen + value_bytes;
        }
        out
    }
}

pub struct FixedDb<R: FixedRecord> {
    file: File,
    dir_path: PathBuf,
    dir: Vec<u32>,
    global_bits: u8,
    page_count: u32,
    records: u64,
    _marker: std::marker::PhantomData<R>,
}

impl<R: FixedRecord> FixedDb<R> {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        let pag_path = base.as_ref().with_extension("pag");
        let dir_path = base.as_ref().with_extension("dir");
        if let Some(parent) = pag_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&pag_path)?;

        let mut db = Self {
            file,
            dir_path,
            dir: Vec::new(),
            global_bits: 0,
            page_count: 0,
            records: 0,
            _marker: std::marker::PhantomData,
        };

        if db.file.metadata()?.len() == 0 {
            db.write_page(0, &Page::empty(0))?;
            db.page_count = 1;
            db.dir = vec![0];
            db.save_dir()?;
        } else {
            db.load_dir()?;
        }

        Ok(db)
    }

    fn load_dir(&mut self) -> Result<()> {
        let data = std::fs::read(&self.dir_path)?;
        if data.len() < 17 {
            bail!("directory file too short");
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != DIR_MAGIC {
            bail!("bad directory magic");
        }
        self.global_bits = data[4];
        self.page_count = u32::from_le_bytes(data[5..9].try_into().unwrap());
        self.records = u64::from_le_bytes(data[9..17].try_into().unwrap());

        let entries = 1usize << self.global_bits;
        if data.len() != 17 + entries * 4 {
            bail!("directory file has wrong size");
        }
        self.dir = (0..entries)
            .map(|i| u32::from_le_bytes(data[17 + i * 4..21 + i * 4].try_into().unwrap()))
            .collect();
        Ok(())
    }

    fn save_dir(&self) -> Result<()> {
        let mut data = Vec::with_capacity(17 + self.dir.len() * 4);
        data.extend_from_slice(&DIR_MAGIC.to_le_bytes());
        data.push(self.global_bits);
        data.extend_from_slice(&self.page_count.to_le_bytes());
        data.extend_from_slice(&self.records.to_le_bytes());
        for entry in &self.dir {
            data.extend_from_slice(&entry.to_le_bytes());
        }
        std::fs::write(&self.dir_path, data)?;
        Ok(())
    }

    fn read_page(&self, id: u32) -> Result<Page> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file
            .read_exact_at(&mut buf, u64::from(id) * PAGE_SIZE as u64)?;
        Ok(Page { buf })
    }

    fn write_page(&self, id: u32, page: &Page) -> Result<()> {
        self.file
            .write_all_at(&page.buf, u64::from(id) * PAGE_SIZE as u64)?;
        Ok(())
    }

    fn dir_slot(&self, hash: u64) -> usize {
        (hash & ((1u64 << self.global_bits) - 1)) as usize
    }

    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<R>> {
        let page = self.read_page(self.dir[self.dir_slot(hash_key(key))])?;
        Ok(page
            .find(key, R::BYTES)
            .map(|pos| R::read(&page.buf[pos + 2 + key.len()..pos + 2 + key.len() + R::BYTES])))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    pub fn store(&mut self, key: &[u8], rec: &R) -> Result<()> {
        if key.len() > MAX_KEY {
            bail!("key too long: {} bytes", key.len());
        }

        let mut value = vec![0u8; R::BYTES];
        rec.write(&mut value);

        loop {
            let hash = hash_key(key);
            let page_id = self.dir[self.dir_slot(hash)];
            let mut page = self.read_page(page_id)?;

            if let Some(pos) = page.find(key, R::BYTES) {
                page.buf[pos + 2 + key.len()..pos + 2 + key.len() + R::BYTES]
                    .copy_from_slice(&value);
                return self.write_page(page_id, &page);
            }

            if page.push(key, &value) {
                self.records += 1;
                return self.write_page(page_id, &page);
            }

            self.split(page_id, page)?;
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let page_id = self.dir[self.dir_slot(hash_key(key))];
        let mut page = self.read_page(page_id)?;

        match page.find(key, R::BYTES) {
            Some(pos) => {
                page.remove(pos, R::BYTES);
                self.records -= 1;
                self.write_page(page_id, &page)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn split(&mut self, page_id: u32, page: Page) -> Result<()> {
        let local = page.local_bits();
        if local >= 32 {
            bail!("page overflow: too many records share a hash prefix");
        }

        if local == self.global_bits {
            // Double the directory.
            let mut doubled = Vec::with_capacity(self.dir.len() * 2);
            doubled.extend_from_slice(&self.dir);
            doubled.extend_from_slice(&self.dir);
            self.dir = doubled;
            self.global_bits += 1;
        }

        let new_id = self.page_count;
        self.page_count += 1;

        let mut old_page = Page::empty(local + 1);
        let mut new_page = Page::empty(local + 1);

        for (key, value) in page.records(R::BYTES) {
            let hash = hash_key(&key);
            let target = if (hash >> local) & 1 == 1 {
                &mut new_page
            } else {
                &mut old_page
            };
            if !target.push(&key, &value) {
                bail!("page overflow during split");
            }
        }

        for slot in 0..self.dir.len() {
            if self.dir[slot] == page_id && (slot >> local) & 1 == 1 {
                self.dir[slot] = new_id;
            }
        }

        self.write_page(page_id, &old_page)?;
        self.write_page(new_id, &new_page)?;
        Ok(())
    }

    /// Restartable scan over every record. The order is whatever the pages
    /// dictate.
    pub fn iter(&self) -> Iter<'_, R> {
        Iter {
            db: self,
            page: 0,
            pending: Vec::new(),
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.save_dir()
    }
}

impl<R: FixedRecord> Drop for FixedDb<R> {
    fn drop(&mut self) {
        self.save_dir().ok();
    }
}

pub struct Iter<'a, R: FixedRecord> {
    db: &'a FixedDb<R>,
    page: u32,
    pending: Vec<(Vec<u8>, Vec<u8>)>,
}

impl<R: FixedRecord> Iterator for Iter<'_, R> {
    type Item = Result<(Vec<u8>, R)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.pending.pop() {
                return Some(Ok((key, R::read(&value))));
            }
            if self.page >= self.db.page_count {
                return None;
            }
            match self.db.read_page(self.page) {
                Ok(page) => {
                    self.pending = page.records(R::BYTES);
                    self.page += 1;
                }
                Err(e) => {
                    self.page = self.db.page_count;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{Md5Rec, UrlFlags, UrlRec};

    #[test]
    fn store_lookup_delete() {
        let mut db: FixedDb<Md5Rec> = FixedDb::open(crate::gen_temp_path()).unwrap();

        assert!(db.lookup(b"missing").unwrap().is_none());

        db.store(b"key-a", &Md5Rec { oid: 1 }).unwrap();
        db.store(b"key-b", &Md5Rec { oid: 2 }).unwrap();
        assert_eq!(db.lookup(b"key-a").unwrap().unwrap().oid, 1);
        assert_eq!(db.lookup(b"key-b").unwrap().unwrap().oid, 2);
        assert_eq!(db.len(), 2);

        db.store(b"key-a", &Md5Rec { oid: 9 }).unwrap();
        assert_eq!(db.lookup(b"key-a").unwrap().unwrap().oid, 9);
        assert_eq!(db.len(), 2);

        assert!(db.delete(b"key-a").unwrap());
        assert!(!db.delete(b"key-a").unwrap());
        assert!(db.lookup(b"key-a").unwrap().is_none());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn survives_page_splits() {
        let mut db: FixedDb<UrlRec> = FixedDb::open(crate::gen_temp_path()).unwrap();

        let n = 10_000u32;
        for i in 0..n {
            let key = format!("http://example.com/page/{i}");
            let rec = UrlRec {
                access: i,
                oid: i,
                flags: UrlFlags::QUEUED,
                ..Default::default()
            };
            db.store(key.as_bytes(), &rec).unwrap();
        }

        assert_eq!(db.len(), u64::from(n));
        for i in (0..n).step_by(97) {
            let key = format!("http://example.com/page/{i}");
            let rec = db.lookup(key.as_bytes()).unwrap().unwrap();
            assert_eq!(rec.oid, i);
            assert_eq!(rec.access, i);
        }
    }

    #[test]
    fn iteration_sees_every_record_once() {
        let mut db: FixedDb<Md5Rec> = FixedDb::open(crate::gen_temp_path()).unwrap();

        for i in 0..1000u32 {
            db.store(format!("k{i}").as_bytes(), &Md5Rec { oid: i })
                .unwrap();
        }

        let mut seen: Vec<u32> = db.iter().map(|r| r.unwrap().1.oid).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn reopen_after_sync() {
        let base = crate::gen_temp_path();
        {
            let mut db: FixedDb<Md5Rec> = FixedDb::open(&base).unwrap();
            for i in 0..500u32 {
                db.store(format!("key-{i}").as_bytes(), &Md5Rec { oid: i })
                    .unwrap();
            }
            db.sync().unwrap();
        }

        let db: FixedDb<Md5Rec> = FixedDb::open(&base).unwrap();
        assert_eq!(db.len(), 500);
        assert_eq!(db.lookup(b"key-123").unwrap().unwrap().oid, 123);
    }
}
