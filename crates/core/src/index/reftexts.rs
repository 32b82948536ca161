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

//! Anchor-text processing. Anchors are scored by their source card's
//! weight, grouped per destination class and per normalized text, thinned
//! to the best few per class, then re-sorted by stream offset so the final
//! join against the URL list reads sequentially.

use hashbrown::HashMap;
use itertools::Itertools;

use super::fingerprint::{Fingerprint, Resolver};
use super::labels::{Label, LabelKind};
use super::merges::Merges;
use super::{is_skeleton, CardFlags, CardId, CardNote};
use crate::config::RefTextsConfig;

/// One anchor as the link extractor recorded it.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub src: Fingerprint,
    pub dst: Fingerprint,
    /// Normalized anchor text.
    pub text: String,
    /// Byte offset in the original link stream.
    pub offset: u64,
}

fn text_hash(text: &str) -> u64 {
    use std::hash::Hasher;
    let mut h = rustc_hash::FxHasher::default();
    h.write(text.as_bytes());
    h.finish()
}

struct Scored {
    dst: CardId,
    text: String,
    count: u32,
    weight: f64,
    offset: u64,
    src: CardId,
}

/// Runs the whole pipeline and emits the surviving anchors as body labels
/// on the destination's primary card.
pub fn run(
    anchors: impl Iterator<Item = Anchor>,
    resolver: &Resolver,
    merges: &Merges,
    notes: &[CardNote],
    src_url: impl Fn(CardId) -> Option<String>,
    config: &RefTextsConfig,
) -> Vec<Label> {
    let mut input = 0u64;

    // Group by destination class, inside it by anchor text.
    let mut by_class: HashMap<CardId, HashMap<u64, Scored>> = HashMap::new();

    for anchor in anchors {
        input += 1;

        let (Some(src), Some(dst)) = (resolver.resolve(&anchor.src), resolver.resolve(&anchor.dst))
        else {
            continue;
        };
        if is_skeleton(src) {
            continue;
        }

        let src_class = merges.find(src);
        let dst_class = if is_skeleton(dst) { dst } else { merges.find(dst) };
        if src_class == dst_class {
            continue;
        }
        if !is_skeleton(src_class)
            && notes[src_class as usize].flags.contains(CardFlags::EMPTY)
        {
            continue;
        }

        // Anchors from heavier documents weigh exponentially more, and
        // anchors crossing sites eight times that.
        let src_note = &notes[src as usize];
        let mut weight = (f64::from(src_note.weight) / 8.0).exp2();
        let inter_site = !is_skeleton(dst_class)
            && src_note.site_id != notes[dst_class as usize].site_id;
        if inter_site {
            weight *= 8.0;
        }

        let texts = by_class.entry(dst_class).or_default();
        let entry = texts.entry(text_hash(&anchor.text));
        match entry {
            hashbrown::hash_map::Entry::Occupied(mut o) => {
                let scored = o.get_mut();
                scored.count += 1;
                scored.weight += weight;
                if anchor.offset < scored.offset {
                    scored.offset = anchor.offset;
                    scored.src = src;
                }
            }
            hashbrown::hash_map::Entry::Vacant(v) => {
                v.insert(Scored {
                    dst: dst_class,
                    text: anchor.text,
                    count: 1,
                    weight,
                    offset: anchor.offset,
                    src,
                });
            }
        }
    }

    // Top-K per class by weight.
    let mut survivors: Vec<Scored> = Vec::new();
    for (_, texts) in by_class {
        let mut list: Vec<Scored> = texts.into_values().collect();
        list.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then(a.offset.cmp(&b.offset))
        });
        list.truncate(config.max_texts_per_class);
        survivors.extend(list);
    }

    // Offset order enables one sequential read of the source stream for
    // the URL join.
    let labels: Vec<Label> = survivors
        .into_iter()
        .sorted_by_key(|s| s.offset)
        .map(|s| Label {
            card: s.dst,
            kind: LabelKind::Body,
            name: "reftext".to_string(),
            value: match src_url(s.src) {
                Some(url) => format!("{}\u{1}{}\u{1}{}", s.text, s.count, url),
                None => format!("{}\u{1}{}", s.text, s.count),
            },
        })
        .collect();

    tracing::info!("reftexts: {} anchors in, {} labels out", input, labels.len());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolveConfig;
    use crate::index::fingerprint::ResolveMode;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint(md5::compute(n.to_le_bytes()).0)
    }

    fn setup(n: u64) -> (Resolver, Merges, Vec<CardNote>) {
        let resolver = Resolver::build(
            (0..n).map(|i| (fp(i), i as CardId)),
            ResolveMode::SKIP_UNKNOWN,
            ResolveConfig::default(),
        );
        let merges = Merges::new(n as usize);
        let notes = vec![CardNote::default(); n as usize];
        (resolver, merges, notes)
    }

    fn anchor(src: u64, dst: u64, text: &str, offset: u64) -> Anchor {
        Anchor {
            src: fp(src),
            dst: fp(dst),
            text: text.to_string(),
            offset,
        }
    }

    #[test]
    fn groups_and_counts_identical_texts() {
        let (resolver, merges, notes) = setup(4);

        let anchors = vec![
            anchor(0, 3, "example page", 10),
            anchor(1, 3, "example page", 20),
            anchor(2, 3, "other words", 30),
        ];

        let labels = run(
            anchors.into_iter(),
            &resolver,
            &merges,
            &notes,
            |_| None,
            &RefTextsConfig::default(),
        );

        assert_eq!(labels.len(), 2);
        assert!(labels.iter().all(|l| l.card == 3));
        assert!(labels
            .iter()
            .any(|l| l.value == format!("example page\u{1}2")));
    }

    #[test]
    fn intersite_anchors_dominate() {
        let (resolver, merges, mut notes) = setup(4);
        notes[0].site_id = 1;
        notes[1].site_id = 2;
        notes[3].site_id = 1;

        let config = RefTextsConfig {
            max_texts_per_class: 1,
        };

        // Same weight sources; only the anchor from site 2 crosses sites.
        let anchors = vec![
            anchor(0, 3, "same site text", 10),
            anchor(1, 3, "cross site text", 20),
        ];

        let labels = run(
            anchors.into_iter(),
            &resolver,
            &merges,
            &notes,
            |_| None,
            &config,
        );

        assert_eq!(labels.len(), 1);
        assert!(labels[0].value.starts_with("cross site text"));
    }

    #[test]
    fn same_class_endpoints_are_skipped() {
        let (resolver, mut merges, notes) = setup(4);
        merges.union(0, 3);

        let labels = run(
            vec![anchor(0, 3, "self reference", 5)].into_iter(),
            &resolver,
            &merges,
            &notes,
            |_| None,
            &RefTextsConfig::default(),
        );
        assert!(labels.is_empty());
    }

    #[test]
    fn output_is_offset_sorted_with_urls() {
        let (resolver, merges, notes) = setup(6);

        let anchors = vec![
            anchor(0, 4, "late", 300),
            anchor(1, 5, "early", 100),
            anchor(2, 4, "middle", 200),
        ];

        let labels = run(
            anchors.into_iter(),
            &resolver,
            &merges,
            &notes,
            |id| Some(format!("http://src{id}/")),
            &RefTextsConfig::default(),
        );

        let values: Vec<&str> = labels.iter().map(|l| l.value.as_str()).collect();
        assert_eq!(values.len(), 3);
        assert!(values[0].starts_with("early"));
        assert!(values[1].starts_with("middle"));
        assert!(values[2].starts_with("late"));
        assert!(values[0].ends_with("http://src1/"));
    }
}
