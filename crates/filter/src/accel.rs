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

//! Accelerator side-tables for `switch` commands. A switch with many cases
//! of the same shape gets the matching cases compiled into a lookup
//! structure; everything else stays on the linear path. The tables may
//! report several hits, so results are collected and de-duplicated by the
//! interpreter.

use std::collections::{BTreeMap, HashMap};

use aho_corasick::AhoCorasick;

use crate::ast::{Case, CasePattern, Lookup, Switch};
use crate::lexer::CmpOp;

/// Case-count thresholds above which a switch grows an accelerator of the
/// given kind.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub hash_limit: usize,
    pub kmp_limit: usize,
    pub trie_limit: usize,
    pub tree_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            hash_limit: 8,
            kmp_limit: 16,
            trie_limit: 16,
            tree_limit: 8,
        }
    }
}

#[derive(Debug, Default)]
pub struct Tables {
    hash: Option<HashTable>,
    ihash: Option<HashTable>,
    substr: Option<SubstrTable>,
    isubstr: Option<SubstrTable>,
    trie: Option<TrieTable>,
    itrie: Option<TrieTable>,
    int_tree: Option<IntervalTree<i64>>,
    str_tree: Option<IntervalTree<String>>,
    istr_tree: Option<IntervalTree<String>>,
    /// Indices into `Switch::cases` that no table covers.
    pub linear: Vec<usize>,
}

#[derive(Debug)]
struct HashTable {
    map: HashMap<String, Vec<usize>>,
    icase: bool,
}

impl HashTable {
    fn build(cases: &[(usize, &str)], icase: bool) -> Self {
        let mut map: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, lit) in cases {
            let key = if icase {
                lit.to_lowercase()
            } else {
                lit.to_string()
            };
            map.entry(key).or_default().push(*idx);
        }
        Self { map, icase }
    }

    fn find(&self, s: &str, out: &mut Vec<usize>) {
        let hit = if self.icase {
            self.map.get(&s.to_lowercase())
        } else {
            self.map.get(s)
        };
        if let Some(hit) = hit {
            out.extend_from_slice(hit);
        }
    }
}

#[derive(Debug)]
struct SubstrTable {
    automaton: AhoCorasick,
    cases: Vec<usize>,
    icase: bool,
}

impl SubstrTable {
    fn build(cases: &[(usize, &str)], icase: bool) -> Option<Self> {
        let patterns: Vec<String> = cases
            .iter()
            .map(|(_, s)| {
                if icase {
                    s.to_lowercase()
                } else {
                    s.to_string()
                }
            })
            .collect();
        let automaton = AhoCorasick::new(&patterns).ok()?;
        Some(Self {
            automaton,
            cases: cases.iter().map(|(idx, _)| *idx).collect(),
            icase,
        })
    }

    fn find(&self, s: &str, out: &mut Vec<usize>) {
        let haystack = if self.icase {
            std::borrow::Cow::Owned(s.to_lowercase())
        } else {
            std::borrow::Cow::Borrowed(s)
        };
        let mut seen = vec![false; self.cases.len()];
        for m in self.automaton.find_overlapping_iter(haystack.as_ref()) {
            let pat = m.pattern().as_usize();
            if !seen[pat] {
                seen[pat] = true;
                out.push(self.cases[pat]);
            }
        }
    }
}

/// Byte trie over pattern prefixes. Matching walks the haystack from the
/// root, collecting every pattern whose prefix ends on the path, then checks
/// the suffix half and the length.
#[derive(Debug)]
struct TrieTable {
    nodes: Vec<TrieNode>,
    icase: bool,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: Vec<(u8, usize)>,
    /// `(case index, prefix length, suffix)` of patterns ending here.
    terminals: Vec<(usize, usize, String)>,
}

impl TrieTable {
    fn build(cases: &[(usize, String, String)], icase: bool) -> Self {
        let mut nodes = vec![TrieNode::default()];
        for (idx, prefix, suffix) in cases {
            let mut node = 0;
            for &b in prefix.as_bytes() {
                node = match nodes[node].children.iter().find(|(c, _)| *c == b) {
                    Some((_, next)) => *next,
                    None => {
                        nodes.push(TrieNode::default());
                        let next = nodes.len() - 1;
                        nodes[node].children.push((b, next));
                        next
                    }
                };
            }
            nodes[node]
                .terminals
                .push((*idx, prefix.len(), suffix.clone()));
        }
        Self { nodes, icase }
    }

    fn find(&self, s: &str, out: &mut Vec<usize>) {
        let folded;
        let s = if self.icase {
            folded = s.to_lowercase();
            folded.as_str()
        } else {
            s
        };

        let bytes = s.as_bytes();
        let mut node = 0;
        let mut depth = 0;
        loop {
            for &(idx, plen, ref suffix) in &self.nodes[node].terminals {
                if bytes.len() >= plen + suffix.len() && s.ends_with(suffix.as_str()) {
                    out.push(idx);
                }
            }
            if depth >= bytes.len() {
                break;
            }
            match self.nodes[node]
                .children
                .iter()
                .find(|(c, _)| *c == bytes[depth])
            {
                Some((_, next)) => {
                    node = *next;
                    depth += 1;
                }
                None => break,
            }
        }
    }
}

/// Ordered interval table; the balanced tree of the std `BTreeMap` carries
/// the range lookups.
#[derive(Debug)]
struct IntervalTree<K> {
    by_lo: BTreeMap<K, Vec<(K, usize)>>,
}

impl<K: Ord + Clone> IntervalTree<K> {
    fn build(cases: Vec<(usize, K, K)>) -> Self {
        let mut by_lo: BTreeMap<K, Vec<(K, usize)>> = BTreeMap::new();
        for (idx, lo, hi) in cases {
            by_lo.entry(lo).or_default().push((hi, idx));
        }
        Self { by_lo }
    }

    fn find(&self, key: &K, out: &mut Vec<usize>) {
        for (_, entries) in self.by_lo.range(..=key.clone()) {
            for (hi, idx) in entries {
                if key <= hi {
                    out.push(*idx);
                }
            }
        }
    }
}

pub fn build(switch: &Switch, pool: &[Lookup], limits: &Limits) -> Tables {
    let mut tables = Tables::default();

    let mut eq_cs: Vec<(usize, &str)> = Vec::new();
    let mut eq_ci: Vec<(usize, &str)> = Vec::new();
    let mut substr_cs: Vec<(usize, &str)> = Vec::new();
    let mut substr_ci: Vec<(usize, &str)> = Vec::new();
    let mut trie_cs: Vec<(usize, String, String)> = Vec::new();
    let mut trie_ci: Vec<(usize, String, String)> = Vec::new();
    let mut ints: Vec<(usize, i64, i64)> = Vec::new();
    let mut strs_cs: Vec<(usize, String, String)> = Vec::new();
    let mut strs_ci: Vec<(usize, String, String)> = Vec::new();
    let mut linear = Vec::new();

    for (idx, case) in switch.cases.iter().enumerate() {
        match classify(case, pool) {
            Class::EqStr(s) => {
                if case.icase {
                    eq_ci.push((idx, s));
                } else {
                    eq_cs.push((idx, s));
                }
            }
            Class::EqInt(n) => ints.push((idx, n, n)),
            Class::Substring(s) => {
                if case.icase {
                    substr_ci.push((idx, s));
                } else {
                    substr_cs.push((idx, s));
                }
            }
            Class::PrefixSuffix(p, s) => {
                if case.icase {
                    trie_ci.push((idx, p.to_string(), s.to_string()));
                } else {
                    trie_cs.push((idx, p.to_string(), s.to_string()));
                }
            }
            Class::IntRange(lo, hi) => ints.push((idx, lo, hi)),
            Class::StrRange(lo, hi) => {
                if case.icase {
                    strs_ci.push((idx, lo.to_lowercase(), hi.to_lowercase()));
                } else {
                    strs_cs.push((idx, lo.to_string(), hi.to_string()));
                }
            }
            Class::Linear => linear.push(idx),
        }
    }

    let mut demote = |cases: Vec<usize>, linear: &mut Vec<usize>| linear.extend(cases);

    if eq_cs.len() >= limits.hash_limit {
        tables.hash = Some(HashTable::build(&eq_cs, false));
    } else {
        demote(eq_cs.iter().map(|(i, _)| *i).collect(), &mut linear);
    }
    if eq_ci.len() >= limits.hash_limit {
        tables.ihash = Some(HashTable::build(&eq_ci, true));
    } else {
        demote(eq_ci.iter().map(|(i, _)| *i).collect(), &mut linear);
    }

    if substr_cs.len() >= limits.kmp_limit {
        match SubstrTable::build(&substr_cs, false) {
            Some(t) => tables.substr = Some(t),
            None => demote(substr_cs.iter().map(|(i, _)| *i).collect(), &mut linear),
        }
    } else {
        demote(substr_cs.iter().map(|(i, _)| *i).collect(), &mut linear);
    }
    if substr_ci.len() >= limits.kmp_limit {
        match SubstrTable::build(&substr_ci, true) {
            Some(t) => tables.isubstr = Some(t),
            None => demote(substr_ci.iter().map(|(i, _)| *i).collect(), &mut linear),
        }
    } else {
        demote(substr_ci.iter().map(|(i, _)| *i).collect(), &mut linear);
    }

    if trie_cs.len() >= limits.trie_limit {
        tables.trie = Some(TrieTable::build(&trie_cs, false));
    } else {
        demote(trie_cs.iter().map(|(i, _, _)| *i).collect(), &mut linear);
    }
    if trie_ci.len() >= limits.trie_limit {
        tables.itrie = Some(TrieTable::build(&trie_ci, true));
    } else {
        demote(trie_ci.iter().map(|(i, _, _)| *i).collect(), &mut linear);
    }

    if ints.len() >= limits.tree_limit {
        tables.int_tree = Some(IntervalTree::build(ints));
    } else {
        demote(ints.iter().map(|(i, _, _)| *i).collect(), &mut linear);
    }
    if strs_cs.len() >= limits.tree_limit {
        tables.str_tree = Some(IntervalTree::build(strs_cs));
    } else {
        demote(strs_cs.iter().map(|(i, _, _)| *i).collect(), &mut linear);
    }
    if strs_ci.len() >= limits.tree_limit {
        tables.istr_tree = Some(IntervalTree::build(strs_ci));
    } else {
        demote(strs_ci.iter().map(|(i, _, _)| *i).collect(), &mut linear);
    }

    linear.sort_unstable();
    tables.linear = linear;
    tables
}

enum Class<'a> {
    EqStr(&'a str),
    EqInt(i64),
    Substring(&'a str),
    PrefixSuffix(&'a str, &'a str),
    IntRange(i64, i64),
    StrRange(&'a str, &'a str),
    Linear,
}

fn classify<'a>(case: &'a Case, pool: &'a [Lookup]) -> Class<'a> {
    match (case.op, &case.pat) {
        (CmpOp::Eq, CasePattern::Str(s)) => Class::EqStr(s),
        (CmpOp::Eq, CasePattern::Int(n)) => Class::EqInt(*n),
        (CmpOp::PatMatch, CasePattern::Lookup(idx)) => match &pool[*idx] {
            Lookup::Pattern { pat, .. } => {
                if let Some(sub) = pat.as_substring() {
                    Class::Substring(sub)
                } else if let Some((p, s)) = pat.as_prefix_suffix() {
                    Class::PrefixSuffix(p, s)
                } else {
                    Class::Linear
                }
            }
            Lookup::Regex { .. } => Class::Linear,
        },
        (CmpOp::InSet, CasePattern::IntInterval(lo, hi)) => Class::IntRange(*lo, *hi),
        (CmpOp::InSet, CasePattern::StrInterval(lo, hi)) => Class::StrRange(lo, hi),
        _ => Class::Linear,
    }
}

impl Tables {
    /// Collects the indices of all cases matched by a string scrutinee.
    pub fn find_str(&self, s: &str, out: &mut Vec<usize>) {
        if let Some(t) = &self.hash {
            t.find(s, out);
        }
        if let Some(t) = &self.ihash {
            t.find(s, out);
        }
        if let Some(t) = &self.substr {
            t.find(s, out);
        }
        if let Some(t) = &self.isubstr {
            t.find(s, out);
        }
        if let Some(t) = &self.trie {
            t.find(s, out);
        }
        if let Some(t) = &self.itrie {
            t.find(s, out);
        }
        if let Some(t) = &self.str_tree {
            t.find(&s.to_string(), out);
        }
        if let Some(t) = &self.istr_tree {
            t.find(&s.to_lowercase(), out);
        }
    }

    /// Collects the indices of all cases matched by an int scrutinee.
    pub fn find_int(&self, n: i64, out: &mut Vec<usize>) {
        if let Some(t) = &self.int_tree {
            t.find(&n, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse;
    use crate::ast::Cmd;
    use crate::Bindings;

    fn switch_of(src: &str) -> (Switch, Vec<Lookup>) {
        let mut b = Bindings::default();
        b.raw("url", crate::ast::VType::Str, 0);
        b.raw("n", crate::ast::VType::Int, 1);
        let prog = parse(src, &b).unwrap();
        let sw = match prog.body.into_iter().next().unwrap() {
            Cmd::Switch(sw) => *sw,
            other => panic!("expected switch, got {other:?}"),
        };
        (sw, prog.pool)
    }

    #[test]
    fn hash_table_hits() {
        let src = r#"
            switch url {
                case == "a": accept;
                case == "b": accept;
                case == "c": accept;
                case == "a": reject;
            }
        "#;
        let (sw, pool) = switch_of(src);
        let limits = Limits {
            hash_limit: 2,
            ..Default::default()
        };
        let tables = build(&sw, &pool, &limits);

        let mut out = Vec::new();
        tables.find_str("a", &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![0, 3]);

        out.clear();
        tables.find_str("z", &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn substring_and_trie() {
        let src = r#"
            switch url {
                case =* "*dl*": accept;
                case =* "*cgi*": accept;
                case =* "http://a/*.html": accept;
                case =* "http://b/*.gif": accept;
            }
        "#;
        let (sw, pool) = switch_of(src);
        let limits = Limits {
            kmp_limit: 2,
            trie_limit: 2,
            ..Default::default()
        };
        let tables = build(&sw, &pool, &limits);
        assert!(tables.linear.is_empty());

        let mut out = Vec::new();
        tables.find_str("http://a/cgi-dl/x.html", &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![0, 1, 2]);
    }

    #[test]
    fn interval_tree() {
        let src = r#"
            switch n {
                case =# 1 .. 10: accept;
                case =# 5 .. 20: accept;
                case == 7: accept;
            }
        "#;
        let (sw, pool) = switch_of(src);
        let limits = Limits {
            tree_limit: 2,
            ..Default::default()
        };
        let tables = build(&sw, &pool, &limits);

        let mut out = Vec::new();
        tables.find_int(7, &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![0, 1, 2]);

        out.clear();
        tables.find_int(15, &mut out);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn below_limits_stays_linear() {
        let src = r#"
            switch url {
                case == "a": accept;
                case =* "*b*": accept;
            }
        "#;
        let (sw, pool) = switch_of(src);
        let tables = build(&sw, &pool, &Limits::default());
        assert_eq!(tables.linear, vec![0, 1]);
    }
}
