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

//! Streaming external merge sort. Every indexer stage that exchanges sorted
//! record files instantiates this with its concrete record type; records
//! bring their key ordering through `Ord` and their framing through
//! `bincode`.

use anyhow::Result;
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Read, Seek, Write},
};

struct Chunk<T> {
    data: Vec<T>,
}

impl<T> Chunk<T> {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(1 << 20)),
        }
    }

    fn push(&mut self, item: T) {
        self.data.push(item);
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn store(mut self, mut file: TempFile) -> Result<StoredChunk<T>>
    where
        T: bincode::Encode + Ord,
    {
        self.data.sort_unstable();

        let mut wrt = BufWriter::new(&mut file.inner);
        for item in &self.data {
            let bytes = bincode::encode_to_vec(item, bincode::config::standard())?;
            let size = bytes.len() as u32;

            wrt.write_all(&size.to_le_bytes())?;
            wrt.write_all(&bytes)?;
        }
        wrt.flush()?;
        drop(wrt);

        StoredChunk::new(file)
    }
}

struct TempDir {
    path: std::path::PathBuf,
}

impl TempDir {
    fn new() -> Result<Self> {
        let path = crate::gen_temp_path();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path).ok();
        }
    }
}

struct TempFile {
    inner: File,
}

impl TempFile {
    fn new(dir: &TempDir, seq: usize) -> Result<Self> {
        let path = dir.path.join(format!("run-{seq}"));

        Ok(Self {
            inner: OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        })
    }
}

impl Read for TempFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for TempFile {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

struct StoredChunk<T> {
    buf: Vec<u8>,
    data: BufReader<TempFile>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> StoredChunk<T> {
    fn new(mut file: TempFile) -> Result<Self> {
        file.seek(std::io::SeekFrom::Start(0))?;
        Ok(Self {
            buf: Vec::new(),
            data: BufReader::new(file),
            _marker: std::marker::PhantomData,
        })
    }

    fn next(&mut self) -> Option<T>
    where
        T: bincode::Decode<()>,
    {
        self.buf.clear();
        self.buf.resize(4, 0);

        self.data.read_exact(&mut self.buf).ok()?;
        let next_size = u32::from_le_bytes(self.buf.as_slice().try_into().ok()?);

        self.buf.clear();
        self.buf.resize(next_size as usize, 0);
        self.data.read_exact(&mut self.buf).ok()?;

        let (next, _) = bincode::decode_from_slice(&self.buf, bincode::config::standard()).ok()?;
        Some(next)
    }
}

pub struct ExternalSorter<T> {
    chunk_size: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Default for ExternalSorter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ExternalSorter<T> {
    pub fn new() -> Self {
        Self {
            chunk_size: 1_000_000,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn sort<I>(self, iter: I) -> Result<SortedIterator<T>>
    where
        I: Iterator<Item = T>,
        T: bincode::Encode + bincode::Decode<()> + Ord,
    {
        let dir = TempDir::new()?;
        let mut stored_chunks = Vec::new();
        let mut chunk = Chunk::new(self.chunk_size);

        for item in iter {
            chunk.push(item);

            if chunk.len() >= self.chunk_size {
                let file = TempFile::new(&dir, stored_chunks.len())?;
                stored_chunks.push(chunk.store(file)?);
                chunk = Chunk::new(self.chunk_size);
            }
        }

        if !chunk.is_empty() {
            let file = TempFile::new(&dir, stored_chunks.len())?;
            stored_chunks.push(chunk.store(file)?);
        }

        let heads = stored_chunks
            .into_iter()
            .filter_map(Head::new)
            .map(Reverse)
            .collect::<BinaryHeap<_>>();

        Ok(SortedIterator {
            _dir: dir,
            chunks: heads,
        })
    }
}

struct Head<T> {
    item: T,
    rest: StoredChunk<T>,
}

impl<T> Head<T>
where
    T: bincode::Decode<()>,
{
    fn new(mut chunk: StoredChunk<T>) -> Option<Self> {
        let item = chunk.next()?;
        Some(Self { item, rest: chunk })
    }
}

impl<T: Ord> Ord for Head<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.item.cmp(&other.item)
    }
}

impl<T: Ord> PartialOrd for Head<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Eq> Eq for Head<T> {}

impl<T: PartialEq> PartialEq for Head<T> {
    fn eq(&self, other: &Self) -> bool {
        self.item.eq(&other.item)
    }
}

pub struct SortedIterator<T> {
    // The temp dir lives as long as the merge reads from it.
    _dir: TempDir,
    chunks: BinaryHeap<Reverse<Head<T>>>,
}

impl<T> Iterator for SortedIterator<T>
where
    T: bincode::Decode<()> + Ord,
{
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        let mut head = self.chunks.pop()?.0;

        if let Some(next) = head.rest.next() {
            self.chunks.push(Reverse(Head {
                item: next,
                rest: head.rest,
            }));
        }

        Some(head.item)
    }
}
