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

//! The merges array: a union-find over card ids stored as one dense
//! `Vec<u32>`. Roots encode their class size as `0x80000000 | size`;
//! untouched entries are `!0`. Path compression is an explicit pass, never
//! an invariant — consumers always re-resolve through `find`.

use super::CardId;

const UNTOUCHED: u32 = u32::MAX;
const ROOT_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone)]
pub struct Merges {
    items: Vec<u32>,
}

impl Merges {
    pub fn new(n: usize) -> Self {
        Self {
            items: vec![UNTOUCHED; n],
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the id has ever been merged with anything.
    pub fn is_touched(&self, id: CardId) -> bool {
        self.items[id as usize] != UNTOUCHED
    }

    /// Class representative, or the id itself when untouched. Does not
    /// mutate; flattening is explicit.
    pub fn find(&self, id: CardId) -> CardId {
        let mut cur = id;
        loop {
            let v = self.items[cur as usize];
            if v == UNTOUCHED || v & ROOT_BIT != 0 {
                return cur;
            }
            cur = v;
        }
    }

    /// Size of the class containing `id`.
    pub fn class_size(&self, id: CardId) -> u32 {
        let root = self.find(id);
        let v = self.items[root as usize];
        if v == UNTOUCHED {
            1
        } else {
            v & !ROOT_BIT
        }
    }

    /// Unions the classes of `a` and `b`; the smaller id stays the root so
    /// repeated runs produce identical structures.
    pub fn union(&mut self, a: CardId, b: CardId) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }

        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        let size = self.class_size(root) + self.class_size(child);
        self.items[child as usize] = root;
        self.items[root as usize] = ROOT_BIT | size;
    }

    /// Explicit path compression: every entry points either at itself (as a
    /// root) or directly at its root.
    pub fn flatten(&mut self) {
        for i in 0..self.items.len() {
            let root = self.find(i as CardId);
            if root != i as CardId {
                self.items[i as usize] = root;
            }
        }
    }

    /// Rewrites every entry so one indirection resolves any id to the
    /// chosen primary of its class.
    pub fn redirect_to(&mut self, primary_of_root: impl Fn(CardId) -> CardId) {
        self.flatten();
        let n = self.items.len();

        let mut roots = Vec::new();
        let mut primaries = vec![UNTOUCHED; n];
        for i in 0..n {
            let v = self.items[i];
            if v != UNTOUCHED && v & ROOT_BIT != 0 {
                let primary = primary_of_root(i as CardId);
                primaries[i] = primary;
                roots.push((i as CardId, v & !ROOT_BIT, primary));
            }
        }

        // Members first, while root entries still identify the classes.
        for i in 0..n {
            let v = self.items[i];
            if v != UNTOUCHED && v & ROOT_BIT == 0 {
                let primary = primaries[v as usize];
                if i as CardId != primary {
                    self.items[i] = primary;
                }
            }
        }

        for (root, size, primary) in roots {
            if primary != root {
                self.items[root as usize] = primary;
            }
            self.items[primary as usize] = ROOT_BIT | size;
        }
    }

    /// Checks the §8 invariants: flattened classes, sane roots.
    pub fn check_flat(&self) -> bool {
        self.items.iter().enumerate().all(|(i, &v)| {
            if v == UNTOUCHED || v & ROOT_BIT != 0 {
                true
            } else {
                let parent = self.items[v as usize];
                parent == UNTOUCHED || parent & ROOT_BIT != 0 || self.find(i as CardId) == v
            }
        })
    }

    pub fn classes(&self) -> impl Iterator<Item = (CardId, u32)> + '_ {
        self.items.iter().enumerate().filter_map(|(i, &v)| {
            if v != UNTOUCHED && v & ROOT_BIT != 0 {
                Some((i as CardId, v & !ROOT_BIT))
            } else {
                None
            }
        })
    }

    pub fn raw(&self) -> &[u32] {
        &self.items
    }
}
