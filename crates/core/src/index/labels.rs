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

//! Per-card side-channel labels and the final join. After merging, labels
//! re-attach to the class primary; URL labels group into per-source-URL
//! header blocks with redirect labels nested under their target's URL. The
//! fetch stage then streams `(card, labels)` pairs by merge-joining the two
//! sorted streams, consulting the stage filter for admission.

use hashbrown::HashMap;

use filter::{Ctx, Filter, Interp, Value, VarTable, Verdict};

use super::merges::Merges;
use super::{CardFlags, CardId, CardNote, StageCounter};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LabelKind {
    /// Per-source-URL attributes, grouped into the header block.
    Url,
    /// Body attributes of the card itself.
    Body,
    /// Only meaningful when the card was merged away.
    MergedOnly,
    /// Overrides card attributes at fetch time.
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub card: CardId,
    pub kind: LabelKind,
    /// Attribute name; for URL labels the source URL forming the block.
    pub name: String,
    pub value: String,
}

/// Re-attaches labels after merging and orders them for the join.
pub fn labelsort(
    labels: Vec<Label>,
    merges: &Merges,
    notes: &[CardNote],
    redirect_target: &HashMap<CardId, CardId>,
) -> Vec<Label> {
    let mut out = Vec::with_capacity(labels.len());

    for mut label in labels {
        let card = label.card as usize;

        // Redirect labels nest under the URL they redirect to.
        if card < notes.len() && notes[card].flags.contains(CardFlags::REDIRECT) {
            if let Some(&target) = redirect_target.get(&label.card) {
                label.card = target;
            }
        }

        // Merged-only labels die with unmerged cards; everything else
        // follows its card to the class primary.
        let merged_away = card < notes.len() && notes[card].flags.contains(CardFlags::DUP);
        if label.kind == LabelKind::MergedOnly && !merged_away {
            continue;
        }
        label.card = merges.find(label.card);

        out.push(label);
    }

    // Block order: URL header block first, grouped per source URL.
    out.sort_by(|a, b| {
        a.card
            .cmp(&b.card)
            .then(a.kind.cmp(&b.kind))
            .then(a.name.cmp(&b.name))
            .then(a.value.cmp(&b.value))
    });
    out
}

/// Variable slots of the fetch-stage filter.
mod slots {
    pub const URL: usize = 0;
    pub const WEIGHT: usize = 1;
    pub const SITE: usize = 2;
    pub const AREA: usize = 3;
    pub const COUNT: usize = 4;
}

pub fn stage_filter_bindings() -> filter::Bindings {
    let mut b = filter::Bindings::default();
    b.raw_ro("url", filter::VType::Str, slots::URL);
    b.raw_ro("weight", filter::VType::Int, slots::WEIGHT);
    b.raw_ro("site", filter::VType::Int, slots::SITE);
    b.raw_ro("area", filter::VType::Int, slots::AREA);
    b
}

/// One joined output record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedCard {
    pub card: CardId,
    pub url: String,
    pub labels: Vec<Label>,
}

/// Merge-joins the sorted card stream with the sorted label stream. Cards
/// the stage filter rejects are dropped together with their labels.
pub fn fetch(
    cards: impl Iterator<Item = (CardId, String)>,
    sorted_labels: Vec<Label>,
    notes: &[CardNote],
    stage_filter: Option<&Filter>,
    max_inconsistencies: u64,
    mut sink: impl FnMut(FetchedCard),
) -> Result<()> {
    use itertools::{EitherOrBoth, Itertools};

    let mut counter = StageCounter::new("fetch", max_inconsistencies);
    let mut interp = stage_filter.map(Interp::new);

    let mut label_groups: Vec<(CardId, Vec<Label>)> = Vec::new();
    for (card, group) in &sorted_labels.into_iter().chunk_by(|l| l.card) {
        label_groups.push((card, group.collect()));
    }

    let mut input = 0u64;
    let mut output = 0u64;
    let mut last_card: Option<CardId> = None;

    for pair in cards.merge_join_by(label_groups, |l, r| l.0.cmp(&r.0)) {
        let (card, url, card_labels) = match pair {
            EitherOrBoth::Left((card, url)) => (card, url, Vec::new()),
            EitherOrBoth::Both((card, url), (_, labels)) => (card, url, labels),
            EitherOrBoth::Right((lcard, labels)) => {
                // Labels for cards missing from the stream are
                // inconsistencies.
                for _ in &labels {
                    counter.drop_offender(format_args!("label for missing card {lcard}"))?;
                }
                continue;
            }
        };

        input += 1;
        if let Some(last) = last_card {
            if card <= last {
                anyhow::bail!("fetch: card stream not sorted ({card} after {last})");
            }
        }
        last_card = Some(card);

        if let Some(interp) = interp.as_mut() {
            let note = notes
                .get(card as usize)
                .copied()
                .unwrap_or_default();
            let mut vars = VarTable::new(slots::COUNT)
                .with(slots::URL, Value::Str(url.clone()))
                .with(slots::WEIGHT, Value::Int(i64::from(note.weight)))
                .with(slots::SITE, Value::Int(i64::from(note.site_id)))
                .with(slots::AREA, Value::Int(i64::from(note.area_id)));
            let mut ctx = Ctx::new(&mut vars);
            if let Verdict::Reject(_) = interp.run(&mut ctx)? {
                continue;
            }
        }

        output += 1;
        sink(FetchedCard {
            card,
            url,
            labels: card_labels,
        });
    }

    counter.report(input, output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(card: CardId, kind: LabelKind, name: &str, value: &str) -> Label {
        Label {
            card,
            kind,
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn labels_follow_merges() {
        let mut merges = Merges::new(4);
        merges.union(1, 3);
        let mut notes = vec![CardNote::default(); 4];
        notes[3].flags |= CardFlags::DUP;
        notes[1].flags |= CardFlags::MERGED;

        let labels = vec![
            label(3, LabelKind::Body, "title", "dup title"),
            label(1, LabelKind::Body, "title", "primary title"),
        ];

        let sorted = labelsort(labels, &merges, &notes, &HashMap::new());
        assert_eq!(sorted.len(), 2);
        assert!(sorted.iter().all(|l| l.card == 1));
    }

    #[test]
    fn merged_only_labels_need_a_dup() {
        let mut merges = Merges::new(4);
        merges.union(1, 3);
        let mut notes = vec![CardNote::default(); 4];
        notes[3].flags |= CardFlags::DUP;

        let labels = vec![
            label(3, LabelKind::MergedOnly, "origin", "kept"),
            label(2, LabelKind::MergedOnly, "origin", "dropped"),
        ];

        let sorted = labelsort(labels, &merges, &notes, &HashMap::new());
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].value, "kept");
        assert_eq!(sorted[0].card, 1);
    }

    #[test]
    fn redirect_labels_nest_under_target() {
        let merges = Merges::new(4);
        let mut notes = vec![CardNote::default(); 4];
        notes[0].flags |= CardFlags::REDIRECT | CardFlags::HAS_TARGET;

        let mut redirects = HashMap::new();
        redirects.insert(0 as CardId, 2 as CardId);

        let labels = vec![label(0, LabelKind::Url, "http://old/", "moved")];
        let sorted = labelsort(labels, &merges, &notes, &redirects);

        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].card, 2);
        // The redirect's own URL still names the nested block.
        assert_eq!(sorted[0].name, "http://old/");
    }

    #[test]
    fn url_block_precedes_body() {
        let merges = Merges::new(2);
        let notes = vec![CardNote::default(); 2];

        let labels = vec![
            label(1, LabelKind::Body, "title", "t"),
            label(1, LabelKind::Url, "http://b/", "x"),
            label(1, LabelKind::Url, "http://a/", "y"),
        ];
        let sorted = labelsort(labels, &merges, &notes, &HashMap::new());

        assert_eq!(sorted[0].kind, LabelKind::Url);
        assert_eq!(sorted[0].name, "http://a/");
        assert_eq!(sorted[1].name, "http://b/");
        assert_eq!(sorted[2].kind, LabelKind::Body);
    }

    #[test]
    fn fetch_joins_streams() {
        let notes = vec![CardNote::default(); 3];
        let labels = vec![
            label(0, LabelKind::Body, "a", "1"),
            label(2, LabelKind::Body, "b", "2"),
            label(2, LabelKind::Body, "c", "3"),
        ];

        let cards = vec![
            (0, "http://zero/".to_string()),
            (1, "http://one/".to_string()),
            (2, "http://two/".to_string()),
        ];

        let mut out = Vec::new();
        fetch(cards.into_iter(), labels, &notes, None, 10, |c| out.push(c)).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].labels.len(), 1);
        assert_eq!(out[1].labels.len(), 0);
        assert_eq!(out[2].labels.len(), 2);
    }

    #[test]
    fn fetch_drops_orphan_labels_but_continues() {
        let notes = vec![CardNote::default(); 3];
        let labels = vec![label(1, LabelKind::Body, "orphan", "x")];
        let cards = vec![(0, "http://zero/".to_string()), (2, "http://two/".to_string())];

        let mut out = Vec::new();
        fetch(cards.into_iter(), labels, &notes, None, 10, |c| out.push(c)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.labels.is_empty()));
    }

    #[test]
    fn fetch_respects_stage_filter() {
        let mut notes = vec![CardNote::default(); 2];
        notes[0].weight = 10;
        notes[1].weight = 200;

        let program = Filter::parse(
            r#"if weight < 100 { reject "too light"; } accept;"#,
            &stage_filter_bindings(),
        )
        .unwrap();

        let cards = vec![(0, "http://a/".to_string()), (1, "http://b/".to_string())];
        let mut out = Vec::new();
        fetch(
            cards.into_iter(),
            Vec::new(),
            &notes,
            Some(&program),
            10,
            |c| out.push(c),
        )
        .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].card, 1);
    }
}
