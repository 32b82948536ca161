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

//! The lexical mapper: a state machine over tagged text producing word and
//! complex (context pair) emissions. It keeps a sliding window of the last
//! word and the pending context base, with a gap counter deciding whether
//! two tokens may still pair up.

use crate::config::LexConfig;
use crate::Result;

/// Classes a word can take in the lexicon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordClass {
    Normal,
    Ignored,
    Garbage,
    /// Context words pair with their neighbors into complexes; the payload
    /// is the context slot.
    Context(u16),
    Break,
    Complex,
}

/// Classifies words; the lexicon provides the real implementation.
pub trait Classify {
    fn classify(&self, word: &str) -> WordClass;
}

impl<F: Fn(&str) -> WordClass> Classify for F {
    fn classify(&self, word: &str) -> WordClass {
        self(word)
    }
}

/// Input stream segments: text plus the explicit tags embedded by the
/// parsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// Category override for the following words.
    SetCategory(u8),
    /// Explicit break: nothing pairs across it.
    Break,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit {
    Word {
        pos: u32,
        cat: u8,
        word: String,
        class: WordClass,
    },
    Complex {
        pos: u32,
        cat: u8,
        root: String,
        context: String,
        /// True when the context word precedes the root word.
        incoming: bool,
    },
}

pub struct LexMapper<'a, C: Classify> {
    classifier: &'a C,
    config: &'a LexConfig,
    pos: u32,
    gap: u32,
    current_cat: u8,
    last_word: Option<String>,
    context_base: Option<String>,
}

impl<'a, C: Classify> LexMapper<'a, C> {
    pub fn new(classifier: &'a C, config: &'a LexConfig) -> Self {
        Self {
            classifier,
            config,
            pos: 0,
            gap: 0,
            current_cat: 0,
            last_word: None,
            context_base: None,
        }
    }

    pub fn run(
        &mut self,
        segments: impl Iterator<Item = Segment<'a>>,
        mut sink: impl FnMut(Emit),
    ) -> Result<()> {
        for segment in segments {
            match segment {
                Segment::SetCategory(cat) => self.current_cat = cat,
                Segment::Break => self.hard_break(),
                Segment::Text(text) => {
                    for word in tokenize(text) {
                        self.process_word(&word, &mut sink)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn hard_break(&mut self) {
        // A break adds the full gap so nothing straddles it.
        self.gap += self.config.max_gap;
        self.context_base = None;
        self.last_word = None;
    }

    fn process_word(&mut self, word: &str, sink: &mut impl FnMut(Emit)) -> Result<()> {
        let chars = word.chars().count();
        if chars > self.config.max_word_chars {
            anyhow::bail!("word of {chars} characters exceeds the absolute cap");
        }

        let mut class = self.classifier.classify(word);

        if looks_like_encoded_run(word) {
            // Base64/uuencode debris collapses to a single garbage token.
            class = WordClass::Garbage;
        }

        // Over the current category's cap the word still lexes, but only
        // as garbage.
        if chars > self.config.category_cap(self.current_cat) {
            class = WordClass::Garbage;
        }

        match class {
            WordClass::Ignored | WordClass::Complex => {
                // No position change.
            }
            WordClass::Garbage => {
                self.gap += 1;
                self.context_base = None;
            }
            WordClass::Break => {
                self.hard_break();
            }
            WordClass::Normal => {
                self.pos += 1;
                sink(Emit::Word {
                    pos: self.pos,
                    cat: self.current_cat,
                    word: word.to_string(),
                    class,
                });

                if self.gap == 0 {
                    if let Some(context) = self.context_base.take() {
                        sink(Emit::Complex {
                            pos: self.pos,
                            cat: self.current_cat,
                            root: word.to_string(),
                            context,
                            incoming: true,
                        });
                    }
                }

                self.last_word = Some(word.to_string());
                self.gap = 0;
            }
            WordClass::Context(_) => {
                self.pos += 1;
                sink(Emit::Word {
                    pos: self.pos,
                    cat: self.current_cat,
                    word: word.to_string(),
                    class,
                });

                // Outgoing pair with the previous word, then arm the
                // incoming side.
                if self.gap == 0 {
                    if let Some(root) = self.last_word.clone() {
                        sink(Emit::Complex {
                            pos: self.pos,
                            cat: self.current_cat,
                            root,
                            context: word.to_string(),
                            incoming: false,
                        });
                    }
                }
                self.context_base = Some(word.to_string());
                self.last_word = None;
                self.gap = 0;
            }
        }

        Ok(())
    }
}

/// Splits text into words, expanding ligatures to their canonical letter
/// sequences.
fn tokenize(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        if c.is_alphanumeric() {
            match c {
                'ﬁ' => current.push_str("fi"),
                'ﬂ' => current.push_str("fl"),
                'ﬀ' => current.push_str("ff"),
                'ﬃ' => current.push_str("ffi"),
                'ﬄ' => current.push_str("ffl"),
                'æ' => current.push_str("ae"),
                'Æ' => current.push_str("AE"),
                'œ' => current.push_str("oe"),
                'Œ' => current.push_str("OE"),
                c => current.push(c),
            }
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Heuristic for base64/uuencode debris: long tokens whose character
/// category flips unusually often for their length.
fn looks_like_encoded_run(word: &str) -> bool {
    let len = word.chars().count();
    if len < 16 {
        return false;
    }

    #[derive(PartialEq, Clone, Copy)]
    enum Cat {
        Lower,
        Upper,
        Digit,
    }

    let mut changes = 0usize;
    let mut prev: Option<Cat> = None;
    for c in word.chars() {
        let cat = if c.is_ascii_digit() {
            Cat::Digit
        } else if c.is_uppercase() {
            Cat::Upper
        } else {
            Cat::Lower
        };
        if prev.is_some_and(|p| p != cat) {
            changes += 1;
        }
        prev = Some(cat);
    }

    changes * 2 > len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(word: &str) -> WordClass {
        match word {
            "the" | "a" => WordClass::Ignored,
            "of" => WordClass::Context(1),
            "xxx" => WordClass::Garbage,
            "STOP" => WordClass::Break,
            _ => WordClass::Normal,
        }
    }

    fn map(text: &str) -> Vec<Emit> {
        let config = LexConfig::default();
        let c = classifier;
        let mut mapper = LexMapper::new(&c, &config);
        let mut out = Vec::new();
        mapper
            .run(std::iter::once(Segment::Text(text)), |e| out.push(e))
            .unwrap();
        out
    }

    fn words(emits: &[Emit]) -> Vec<&str> {
        emits
            .iter()
            .filter_map(|e| match e {
                Emit::Word { word, .. } => Some(word.as_str()),
                _ => None,
            })
            .collect()
    }

    fn complexes(emits: &[Emit]) -> Vec<(String, String, bool)> {
        emits
            .iter()
            .filter_map(|e| match e {
                Emit::Complex {
                    root,
                    context,
                    incoming,
                    ..
                } => Some((root.clone(), context.clone(), *incoming)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_words_get_positions() {
        let emits = map("alpha beta gamma");
        assert_eq!(words(&emits), vec!["alpha", "beta", "gamma"]);
        let positions: Vec<u32> = emits
            .iter()
            .filter_map(|e| match e {
                Emit::Word { pos, .. } => Some(*pos),
                _ => None,
            })
            .collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn ignored_words_skip_positions() {
        let emits = map("the alpha a beta");
        assert_eq!(words(&emits), vec!["alpha", "beta"]);
    }

    #[test]
    fn context_pairs_both_directions() {
        // "bank of england": outgoing (bank, of), incoming (england, of).
        let emits = map("bank of england");
        assert_eq!(
            complexes(&emits),
            vec![
                ("bank".to_string(), "of".to_string(), false),
                ("england".to_string(), "of".to_string(), true),
            ]
        );
    }

    #[test]
    fn garbage_breaks_pairing() {
        // Garbage clears the pending context.
        let emits = map("bank of xxx england");
        assert_eq!(
            complexes(&emits),
            vec![("bank".to_string(), "of".to_string(), false)]
        );
    }

    #[test]
    fn break_word_stops_everything() {
        let emits = map("bank of STOP england");
        assert_eq!(
            complexes(&emits),
            vec![("bank".to_string(), "of".to_string(), false)]
        );
        assert_eq!(words(&emits), vec!["bank", "of", "england"]);
    }

    #[test]
    fn explicit_break_segment() {
        let config = LexConfig::default();
        let c = classifier;
        let mut mapper = LexMapper::new(&c, &config);
        let mut out = Vec::new();
        mapper
            .run(
                vec![
                    Segment::Text("bank of"),
                    Segment::Break,
                    Segment::Text("england"),
                ]
                .into_iter(),
                |e| out.push(e),
            )
            .unwrap();
        assert_eq!(
            complexes(&out),
            vec![("bank".to_string(), "of".to_string(), false)]
        );
    }

    #[test]
    fn category_tags_color_words() {
        let config = LexConfig::default();
        let c = classifier;
        let mut mapper = LexMapper::new(&c, &config);
        let mut out = Vec::new();
        mapper
            .run(
                vec![
                    Segment::Text("alpha"),
                    Segment::SetCategory(3),
                    Segment::Text("beta"),
                ]
                .into_iter(),
                |e| out.push(e),
            )
            .unwrap();

        let cats: Vec<u8> = out
            .iter()
            .filter_map(|e| match e {
                Emit::Word { cat, .. } => Some(*cat),
                _ => None,
            })
            .collect();
        assert_eq!(cats, vec![0, 3]);
    }

    #[test]
    fn ligatures_expand() {
        let emits = map("ﬁnance oﬃce");
        assert_eq!(words(&emits), vec!["finance", "office"]);
    }

    #[test]
    fn encoded_runs_collapse_to_garbage() {
        let emits = map("bank of aGVsbG8xMjNXb3JsZDQ1NkZvbGRlcjc4OQ england");
        // The run clears the context like any garbage token.
        assert_eq!(
            complexes(&emits),
            vec![("bank".to_string(), "of".to_string(), false)]
        );
    }

    #[test]
    fn over_category_cap_becomes_garbage() {
        let config = LexConfig {
            category_word_chars: vec![8],
            max_word_chars: 64,
            ..LexConfig::default()
        };
        let c = classifier;
        let mut mapper = LexMapper::new(&c, &config);
        let mut out = Vec::new();
        mapper
            .run(
                std::iter::once(Segment::Text("bank of toolongword england")),
                |e| out.push(e),
            )
            .unwrap();

        // The long word was demoted to garbage: it emits nothing and
        // clears the pending context like any other garbage token.
        assert_eq!(words(&out), vec!["bank", "of", "england"]);
        assert_eq!(
            complexes(&out),
            vec![("bank".to_string(), "of".to_string(), false)]
        );
    }

    #[test]
    fn category_cap_follows_current_category() {
        let config = LexConfig {
            // Category 0 allows long words, category 1 does not.
            category_word_chars: vec![32, 4],
            max_word_chars: 64,
            ..LexConfig::default()
        };
        let c = classifier;
        let mut mapper = LexMapper::new(&c, &config);
        let mut out = Vec::new();
        mapper
            .run(
                vec![
                    Segment::Text("longword"),
                    Segment::SetCategory(1),
                    Segment::Text("longword tiny"),
                ]
                .into_iter(),
                |e| out.push(e),
            )
            .unwrap();

        assert_eq!(words(&out), vec!["longword", "tiny"]);
    }

    #[test]
    fn oversized_word_aborts() {
        let config = LexConfig {
            max_word_chars: 8,
            ..LexConfig::default()
        };
        let c = classifier;
        let mut mapper = LexMapper::new(&c, &config);
        let result = mapper.run(
            std::iter::once(Segment::Text("tiny enormousword")),
            |_| {},
        );
        assert!(result.is_err());
    }
}
