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

//! The URL database: canonical URL -> [`UrlRec`], a typed wrapper over the
//! fixed-record store. Owned exclusively by the gatherer while it runs.

use std::path::Path;

use crate::store::fixed_db::FixedDb;
use crate::store::records::UrlRec;
use crate::Result;

pub struct UrlDb {
    db: FixedDb<UrlRec>,
}

impl UrlDb {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self> {
        Ok(Self {
            db: FixedDb::open(base)?,
        })
    }

    pub fn lookup(&self, url: &str) -> Result<Option<UrlRec>> {
        self.db.lookup(url.as_bytes())
    }

    pub fn exists(&self, url: &str) -> Result<bool> {
        self.db.exists(url.as_bytes())
    }

    pub fn store(&mut self, url: &str, rec: &UrlRec) -> Result<()> {
        self.db.store(url.as_bytes(), rec)
    }

    pub fn delete(&mut self, url: &str) -> Result<bool> {
        self.db.delete(url.as_bytes())
    }

    /// Scan over every record, in store order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(String, UrlRec)>> + '_ {
        self.db
            .iter()
            .map(|r| r.map(|(key, rec)| (String::from_utf8_lossy(&key).into_owned(), rec)))
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
    use crate::store::records::UrlFlags;

    #[test]
    fn store_and_iterate() {
        let mut db = UrlDb::open(crate::gen_temp_path()).unwrap();

        let rec = UrlRec {
            access: 7,
            flags: UrlFlags::QUEUED,
            ..Default::default()
        };
        db.store("http://a.example/", &rec).unwrap();
        db.store("http://b.example/", &rec).unwrap();

        assert_eq!(db.len(), 2);
        assert!(db.exists("http://a.example/").unwrap());
        assert_eq!(db.lookup("http://a.example/").unwrap().unwrap().access, 7);
        assert!(db.lookup("http://c.example/").unwrap().is_none());

        let mut urls: Vec<String> = db.iter().map(|r| r.unwrap().0).collect();
        urls.sort();
        assert_eq!(urls, vec!["http://a.example/", "http://b.example/"]);

        assert!(db.delete("http://a.example/").unwrap());
        assert!(!db.exists("http://a.example/").unwrap());
        assert_eq!(db.len(), 1);
    }
}
