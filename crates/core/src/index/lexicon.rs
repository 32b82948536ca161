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

//! Lexicon building: the word hash filled while walking card text, the
//! ordering pass joining accent, stem and synonym equivalents, context slot
//! packing, and the final drop of unreferenced words.

use hashbrown::HashMap;
use rust_stemmers::Stemmer;

use super::lexmap::WordClass;
use crate::config::LexConfig;

/// One lexicon entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verbum {
    pub id: u32,
    pub class: WordClass,
    pub freq: u64,
}

/// Open-addressed hash keyed by the word bytes, grown on load. Ids are
/// assigned in insertion order.
pub struct Lexicon {
    slots: Vec<u32>,
    entries: Vec<(String, Verbum)>,
}

const SLOT_EMPTY: u32 = u32::MAX;

fn word_hash(word: &str) -> u64 {
    use std::hash::Hasher;
    let mut h = rustc_hash::FxHasher::default();
    h.write(word.as_bytes());
    h.finish()
}

impl Default for Lexicon {
    fn default() -> Self {
        Self::new()
    }
}

impl Lexicon {
    pub fn new() -> Self {
        Self {
            slots: vec![SLOT_EMPTY; 1024],
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn slot_of(&self, word: &str) -> usize {
        let mask = self.slots.len() - 1;
        let mut slot = word_hash(word) as usize & mask;
        loop {
            let idx = self.slots[slot];
            if idx == SLOT_EMPTY || self.entries[idx as usize].0 == word {
                return slot;
            }
            slot = (slot + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let mut slots = vec![SLOT_EMPTY; self.slots.len() * 2];
        let mask = slots.len() - 1;
        for (i, (word, _)) in self.entries.iter().enumerate() {
            let mut slot = word_hash(word) as usize & mask;
            while slots[slot] != SLOT_EMPTY {
                slot = (slot + 1) & mask;
            }
            slots[slot] = i as u32;
        }
        self.slots = slots;
    }

    /// Counts one occurrence, creating the entry on first sight.
    pub fn add(&mut self, word: &str) -> &Verbum {
        if self.entries.len() * 4 >= self.slots.len() * 3 {
            self.grow();
        }

        let slot = self.slot_of(word);
        let idx = if self.slots[slot] == SLOT_EMPTY {
            let id = self.entries.len() as u32;
            self.entries.push((
                word.to_string(),
                Verbum {
                    id,
                    class: WordClass::Normal,
                    freq: 0,
                },
            ));
            self.slots[slot] = id;
            id
        } else {
            self.slots[slot]
        };

        let verbum = &mut self.entries[idx as usize].1;
        verbum.freq += 1;
        verbum
    }

    pub fn get(&self, word: &str) -> Option<&Verbum> {
        let slot = self.slot_of(word);
        let idx = self.slots[slot];
        if idx == SLOT_EMPTY {
            None
        } else {
            Some(&self.entries[idx as usize].1)
        }
    }

    pub fn set_class(&mut self, word: &str, class: WordClass) {
        if self.entries.len() * 4 >= self.slots.len() * 3 {
            self.grow();
        }
        let slot = self.slot_of(word);
        let idx = self.slots[slot];
        if idx == SLOT_EMPTY {
            let id = self.entries.len() as u32;
            self.entries.push((word.to_string(), Verbum { id, class, freq: 0 }));
            self.slots[slot] = id;
        } else {
            self.entries[idx as usize].1.class = class;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Verbum)> {
        self.entries.iter().map(|(w, v)| (w.as_str(), v))
    }
}

/// Walks card text once and fills the word hash. The classifier decides
/// word classes during the walk; frequencies accumulate per distinct word.
pub fn mklex<'a, C: super::lexmap::Classify>(
    lexicon: &mut Lexicon,
    classifier: &'a C,
    config: &'a LexConfig,
    segments: impl Iterator<Item = super::lexmap::Segment<'a>>,
) -> crate::Result<u64> {
    use super::lexmap::{Emit, LexMapper};

    let mut mapper = LexMapper::new(classifier, config);
    let mut emitted = 0u64;
    let mut seen: Vec<(String, WordClass)> = Vec::new();

    mapper.run(segments, |emit| {
        if let Emit::Word { word, class, .. } = emit {
            seen.push((word, class));
        }
    })?;

    for (word, class) in seen {
        lexicon.add(&word);
        if class != WordClass::Normal {
            lexicon.set_class(&word, class);
        }
        emitted += 1;
    }

    Ok(emitted)
}

/// Strips combining accents off the common Latin range.
pub fn strip_accents(word: &str) -> String {
    word.chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ý' | 'ÿ' => 'y',
            'ç' => 'c',
            'ñ' => 'n',
            'š' => 's',
            'ž' => 'z',
            'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' => 'A',
            'É' | 'È' | 'Ê' | 'Ë' => 'E',
            'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
            'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
            'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
            'Ç' => 'C',
            'Ñ' => 'N',
            'Š' => 'S',
            'Ž' => 'Z',
            c => c,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct OrderedWord {
    pub word: String,
    pub new_id: u32,
    pub old_id: u32,
    pub class: WordClass,
    pub freq: u64,
    /// Representative of the accent/stem/synonym class, by new id.
    pub class_rep: u32,
    /// Context slot base for context words; each context word owns
    /// `2 * context_slots` phantom ids from this base.
    pub slot_base: Option<u32>,
}

pub struct OrderedLexicon {
    pub words: Vec<OrderedWord>,
    /// old id -> new id.
    pub renumber: HashMap<u32, u32>,
    /// Stem table under the final numbering: word -> stem representative.
    pub stems: Vec<(u32, u32)>,
}

/// The ordering pass: equivalence classes by accent stripping, stemmer
/// output and synonym dictionary; most frequent member leads each class;
/// context slots are packed under the budget; the final order groups each
/// class together for reference locality.
pub fn lexorder(
    lexicon: &Lexicon,
    stemmer: Option<&Stemmer>,
    synonyms: &HashMap<String, String>,
    config: &LexConfig,
) -> OrderedLexicon {
    let n = lexicon.len();
    let mut parent: Vec<u32> = (0..n as u32).collect();

    fn find(parent: &mut [u32], v: u32) -> u32 {
        let mut root = v;
        while parent[root as usize] != root {
            root = parent[root as usize];
        }
        let mut cur = v;
        while parent[cur as usize] != root {
            let next = parent[cur as usize];
            parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn union(parent: &mut [u32], a: u32, b: u32) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            let (hi, lo) = if ra < rb { (ra, rb) } else { (rb, ra) };
            parent[lo as usize] = hi;
        }
    }

    let by_word: HashMap<&str, u32> = lexicon.iter().map(|(w, v)| (w, v.id)).collect();

    // Accent equivalence.
    let mut by_accentless: HashMap<String, u32> = HashMap::new();
    for (word, verbum) in lexicon.iter() {
        let stripped = strip_accents(word);
        match by_accentless.get(stripped.as_str()) {
            Some(&other) => union(&mut parent, verbum.id, other),
            None => {
                by_accentless.insert(stripped, verbum.id);
            }
        }
    }

    // Stemmer equivalence.
    if let Some(stemmer) = stemmer {
        let mut by_stem: HashMap<String, u32> = HashMap::new();
        for (word, verbum) in lexicon.iter() {
            let stem = stemmer.stem(word).into_owned();
            match by_stem.get(stem.as_str()) {
                Some(&other) => union(&mut parent, verbum.id, other),
                None => {
                    by_stem.insert(stem, verbum.id);
                }
            }
        }
    }

    // Synonym dictionary.
    for (from, to) in synonyms {
        if let (Some(&a), Some(&b)) = (by_word.get(from.as_str()), by_word.get(to.as_str())) {
            union(&mut parent, a, b);
        }
    }

    // Representative per class: the most frequent member.
    let entries: Vec<(&str, &Verbum)> = lexicon.iter().collect();
    let mut class_members: HashMap<u32, Vec<u32>> = HashMap::new();
    for (_, verbum) in &entries {
        let root = find(&mut parent, verbum.id);
        class_members.entry(root).or_default().push(verbum.id);
    }

    let mut rep_of_root: HashMap<u32, u32> = HashMap::new();
    for (&root, members) in &class_members {
        let rep = *members
            .iter()
            .max_by_key(|&&id| (entries[id as usize].1.freq, std::cmp::Reverse(id)))
            .unwrap();
        rep_of_root.insert(root, rep);

        let rep_class = entries[rep as usize].1.class;
        if members
            .iter()
            .any(|&id| entries[id as usize].1.class != rep_class)
        {
            tracing::warn!(
                "lexicon class of {:?} mixes word classes",
                entries[rep as usize].0
            );
        }
    }

    // Reference-locality order: classes by falling representative
    // frequency, inside a class the representative first, then accentless
    // before accented forms.
    let mut class_list: Vec<(u32, Vec<u32>)> = class_members.into_iter().collect();
    class_list.sort_by_key(|(root, _)| {
        let rep = rep_of_root[root];
        (std::cmp::Reverse(entries[rep as usize].1.freq), rep)
    });

    let mut words = Vec::with_capacity(n);
    let mut renumber: HashMap<u32, u32> = HashMap::new();

    for (root, mut members) in class_list {
        let rep = rep_of_root[&root];
        members.sort_by_key(|&id| {
            let word = entries[id as usize].0;
            (
                id != rep,
                (word != strip_accents(word)),
                word.to_string(),
            )
        });

        let rep_new = words.len() as u32;
        for id in members {
            let new_id = words.len() as u32;
            renumber.insert(id, new_id);
            let (word, verbum) = entries[id as usize];
            words.push(OrderedWord {
                word: word.to_string(),
                new_id,
                old_id: id,
                class: verbum.class,
                freq: verbum.freq,
                class_rep: rep_new,
                slot_base: None,
            });
        }
    }

    assign_context_slots(&mut words, config);

    // Stem table under the final numbering.
    let mut stems = Vec::new();
    if let Some(stemmer) = stemmer {
        let mut stem_rep: HashMap<String, u32> = HashMap::new();
        for w in &words {
            let stem = stemmer.stem(&w.word).into_owned();
            let rep = *stem_rep.entry(stem).or_insert(w.new_id);
            if rep != w.new_id {
                stems.push((w.new_id, rep));
            }
        }
    }

    tracing::info!(
        "lexorder: {} words in {} classes",
        words.len(),
        rep_of_root.len()
    );

    OrderedLexicon {
        words,
        renumber,
        stems,
    }
}

/// Packs context slots: every context word wants `2 * context_slots`
/// phantom ids. Greedy by falling frequency; once the budget is exhausted
/// the remaining context words share the final slot base.
fn assign_context_slots(words: &mut [OrderedWord], config: &LexConfig) {
    let per_word = 2 * config.context_slots as u32;
    if per_word == 0 {
        return;
    }

    let mut ctx: Vec<usize> = words
        .iter()
        .enumerate()
        .filter(|(_, w)| matches!(w.class, WordClass::Context(_)))
        .map(|(i, _)| i)
        .collect();
    ctx.sort_by_key(|&i| std::cmp::Reverse(words[i].freq));

    let mut next_base = 0u32;
    let mut last_base = 0u32;
    for i in ctx {
        if (next_base + per_word) as usize <= config.slot_budget {
            words[i].slot_base = Some(next_base);
            last_base = next_base;
            next_base += per_word;
        } else {
            words[i].slot_base = Some(last_base);
        }
    }
}

/// The final drop: words with no postings and no special class disappear,
/// unless a kept word needs them as an accent equivalent or a stem.
pub fn lexsort(
    ordered: &OrderedLexicon,
    has_postings: impl Fn(u32) -> bool,
) -> Vec<OrderedWord> {
    let mut keep = vec![false; ordered.words.len()];

    for w in &ordered.words {
        if has_postings(w.new_id) || !matches!(w.class, WordClass::Normal) {
            keep[w.new_id as usize] = true;
        }
    }

    // Accent equivalents: the class representative stays when any member
    // stays.
    for w in &ordered.words {
        if keep[w.new_id as usize] {
            keep[w.class_rep as usize] = true;
        }
    }

    // Stems of kept words stay too.
    for &(word, stem) in &ordered.stems {
        if keep[word as usize] {
            keep[stem as usize] = true;
        }
    }

    ordered
        .words
        .iter()
        .filter(|w| keep[w.new_id as usize])
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_stemmers::Algorithm;

    #[test]
    fn hash_assigns_ids_and_counts() {
        let mut lex = Lexicon::new();
        lex.add("alpha");
        lex.add("beta");
        lex.add("alpha");

        assert_eq!(lex.len(), 2);
        assert_eq!(lex.get("alpha").unwrap().freq, 2);
        assert_eq!(lex.get("alpha").unwrap().id, 0);
        assert_eq!(lex.get("beta").unwrap().id, 1);
        assert!(lex.get("gamma").is_none());
    }

    #[test]
    fn mklex_fills_hash_from_text() {
        use crate::index::lexmap::Segment;

        let classifier = |word: &str| match word {
            "of" => WordClass::Context(0),
            _ => WordClass::Normal,
        };

        let mut lex = Lexicon::new();
        let emitted = mklex(
            &mut lex,
            &classifier,
            &LexConfig::default(),
            std::iter::once(Segment::Text("bank of england bank")),
        )
        .unwrap();

        assert_eq!(emitted, 4);
        assert_eq!(lex.get("bank").unwrap().freq, 2);
        assert_eq!(lex.get("of").unwrap().class, WordClass::Context(0));
    }

    #[test]
    fn hash_survives_growth() {
        let mut lex = Lexicon::new();
        for i in 0..10_000 {
            lex.add(&format!("word{i}"));
        }
        assert_eq!(lex.len(), 10_000);
        for i in (0..10_000).step_by(131) {
            assert!(lex.get(&format!("word{i}")).is_some());
        }
    }

    #[test]
    fn accent_classes_share_representative() {
        let mut lex = Lexicon::new();
        for _ in 0..10 {
            lex.add("cafe");
        }
        lex.add("café");
        lex.add("other");

        let ordered = lexorder(&lex, None, &HashMap::new(), &LexConfig::default());

        let cafe = ordered.words.iter().find(|w| w.word == "cafe").unwrap();
        let cafe_acc = ordered.words.iter().find(|w| w.word == "café").unwrap();
        assert_eq!(cafe.class_rep, cafe_acc.class_rep);
        // The frequent form leads the class and the class is contiguous.
        assert_eq!(cafe.new_id, cafe.class_rep);
        assert_eq!(cafe_acc.new_id, cafe.new_id + 1);
    }

    #[test]
    fn stemming_joins_inflections() {
        let mut lex = Lexicon::new();
        lex.add("running");
        lex.add("runs");
        lex.add("unrelated");

        let stemmer = Stemmer::create(Algorithm::English);
        let ordered = lexorder(&lex, Some(&stemmer), &HashMap::new(), &LexConfig::default());

        let a = ordered.words.iter().find(|w| w.word == "running").unwrap();
        let b = ordered.words.iter().find(|w| w.word == "runs").unwrap();
        let c = ordered.words.iter().find(|w| w.word == "unrelated").unwrap();
        assert_eq!(a.class_rep, b.class_rep);
        assert_ne!(a.class_rep, c.class_rep);
    }

    #[test]
    fn synonyms_join_classes() {
        let mut lex = Lexicon::new();
        lex.add("car");
        lex.add("automobile");

        let mut synonyms = HashMap::new();
        synonyms.insert("automobile".to_string(), "car".to_string());

        let ordered = lexorder(&lex, None, &synonyms, &LexConfig::default());
        let a = ordered.words.iter().find(|w| w.word == "car").unwrap();
        let b = ordered
            .words
            .iter()
            .find(|w| w.word == "automobile")
            .unwrap();
        assert_eq!(a.class_rep, b.class_rep);
    }

    #[test]
    fn context_slots_respect_budget() {
        let mut lex = Lexicon::new();
        for i in 0..10 {
            let word = format!("ctx{i}");
            for _ in 0..(10 - i) {
                lex.add(&word);
            }
            lex.set_class(&word, WordClass::Context(0));
        }

        let config = LexConfig {
            context_slots: 2,
            slot_budget: 16,
            ..LexConfig::default()
        };
        let ordered = lexorder(&lex, None, &HashMap::new(), &config);

        let bases: Vec<u32> = ordered
            .words
            .iter()
            .filter_map(|w| w.slot_base)
            .collect();
        assert_eq!(bases.len(), 10);
        // 4 phantom ids per word, budget 16: four distinct bases, the rest
        // share the last one.
        assert!(bases.iter().all(|&b| (b + 4) as usize <= 16));
        let distinct: std::collections::HashSet<u32> = bases.iter().copied().collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn renumber_is_dense_and_total() {
        let mut lex = Lexicon::new();
        for word in ["a", "b", "c", "d"] {
            lex.add(word);
        }
        let ordered = lexorder(&lex, None, &HashMap::new(), &LexConfig::default());

        let mut new_ids: Vec<u32> = ordered.renumber.values().copied().collect();
        new_ids.sort_unstable();
        assert_eq!(new_ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn lexsort_drops_unreferenced_but_keeps_equivalents() {
        let mut lex = Lexicon::new();
        for _ in 0..5 {
            lex.add("cafe");
        }
        lex.add("café");
        lex.add("dangling");
        lex.set_class("of", WordClass::Context(0));

        let ordered = lexorder(&lex, None, &HashMap::new(), &LexConfig::default());

        // Only the accented form carries postings.
        let accented_id = ordered
            .words
            .iter()
            .find(|w| w.word == "café")
            .unwrap()
            .new_id;
        let kept = lexsort(&ordered, |id| id == accented_id);

        let kept_words: Vec<&str> = kept.iter().map(|w| w.word.as_str()).collect();
        assert!(kept_words.contains(&"café"));
        // Its class representative survives as the accent equivalent.
        assert!(kept_words.contains(&"cafe"));
        // Context word has a special class.
        assert!(kept_words.contains(&"of"));
        assert!(!kept_words.contains(&"dangling"));
    }
}
