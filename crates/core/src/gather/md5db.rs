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

//! The MD5 database: body content sum -> first bucket seen with it, used
//! to detect byte-identical re-crawls.

use std::path::Path;

use crate::store::bucket::Oid;
use crate::store::fixed_db::FixedDb;
use crate::store::records::Md5Rec;
use crate::Result;

pub struct Md5Db {
    db: FixedDb<Md5Rec>,
}

impl Md5Db {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        Ok(Self {
            db: FixedDb::open(base)?,
        })
    }

    pub fn lookup(&self, sum: &[u8; 16]) -> Result<Option<Md5Rec>> {
        self.db.lookup(sum)
    }

    pub fn exists(&self, sum: &[u8; 16]) -> Result<bool> {
        self.db.exists(sum)
    }

    pub fn store(&mut self, sum: &[u8; 16], oid: Oid) -> Result<()> {
        self.db.store(sum, &Md5Rec { oid })
    }

    pub fn delete(&mut self, sum: &[u8; 16]) -> Result<bool> {
        self.db.delete(sum)
    }

    /// Scan over every record, in store order.
    pub fn iter(&self) -> impl Iterator<Item = Result<([u8; 16], Md5Rec)>> + '_ {
        self.db.iter().map(|r| {
            r.and_then(|(key, rec)| {
                let sum: [u8; 16] = key
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("md5 database holds a malformed key"))?;
                Ok((sum, rec))
            })
        })
    }

    pub fn sync(&mut self) -> Result<()> {
        self.db.sync()
    }

    pub fn len(&self) -> u64 {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_lookup() {
        let mut db = Md5Db::open(crate::gen_temp_path()).unwrap();

        let sum_a = md5::compute(b"body a").0;
        let sum_b = md5::compute(b"body b").0;

        db.store(&sum_a, 10).unwrap();
        db.store(&sum_b, 20).unwrap();

        assert_eq!(db.lookup(&sum_a).unwrap().unwrap().oid, 10);
        assert_eq!(db.lookup(&sum_b).unwrap().unwrap().oid, 20);
        assert!(db.lookup(&md5::compute(b"other").0).unwrap().is_none());

        let mut oids: Vec<Oid> = db.iter().map(|r| r.unwrap().1.oid).collect();
        oids.sort_unstable();
        assert_eq!(oids, vec![10, 20]);

        assert!(db.delete(&sum_a).unwrap());
        assert!(db.lookup(&sum_a).unwrap().is_none());
    }
}
