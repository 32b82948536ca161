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

//! Primary card selection. After the mergers have built the equivalence
//! classes, each class elects the member with the highest weight (smallest
//! site id on ties) as its primary; the others become duplicates. Oversized
//! classes get the giant-document penalty. Afterwards a single indirection
//! through the merges array resolves any id to its primary.

use super::merges::Merges;
use super::{is_skeleton, CardFlags, CardId, CardNote};
use crate::config::MergeConfig;

pub fn run(notes: &mut [CardNote], merges: &mut Merges, config: &MergeConfig) {
    merges.flatten();

    // Member lists per root, live cards only. Skeleton members stay in the
    // class but never carry DUP/MERGED flags.
    let mut members: hashbrown::HashMap<CardId, Vec<CardId>> = hashbrown::HashMap::new();
    for id in 0..notes.len() as CardId {
        if !merges.is_touched(id) {
            continue;
        }
        members.entry(merges.find(id)).or_default().push(id);
    }

    let mut primaries: hashbrown::HashMap<CardId, CardId> = hashbrown::HashMap::new();
    let mut classes = 0u64;
    let mut dups = 0u64;

    for (&root, ids) in &members {
        if ids.len() < 2 {
            continue;
        }
        classes += 1;

        let primary = *ids
            .iter()
            .max_by(|&&a, &&b| {
                let na = &notes[a as usize];
                let nb = &notes[b as usize];
                na.weight
                    .cmp(&nb.weight)
                    .then(nb.site_id.cmp(&na.site_id))
                    .then(b.cmp(&a))
            })
            .unwrap();
        primaries.insert(root, primary);

        let giant = ids.len() >= config.giant_documents;
        for &id in ids {
            if giant {
                notes[id as usize].flags |= CardFlags::GIANT;
            }
            if id == primary {
                notes[id as usize].flags |= CardFlags::MERGED;
            } else {
                notes[id as usize].flags |= CardFlags::DUP;
                dups += 1;
            }
        }
    }

    merges.redirect_to(|root| {
        if is_skeleton(root) {
            root
        } else {
            primaries.get(&root).copied().unwrap_or(root)
        }
    });

    tracing::info!("merger: {} classes, {} duplicates flagged", classes, dups);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_by_weight() {
        // Two cards with identical fingerprints, weights 100 and 50.
        let mut notes = vec![CardNote::default(); 2];
        notes[0].weight = 50;
        notes[1].weight = 100;

        let mut merges = Merges::new(2);
        merges.union(0, 1);

        run(&mut notes, &mut merges, &MergeConfig::default());

        assert!(notes[1].flags.contains(CardFlags::MERGED));
        assert!(!notes[1].flags.contains(CardFlags::DUP));
        assert!(notes[0].flags.contains(CardFlags::DUP));
        assert!(!notes[0].flags.contains(CardFlags::MERGED));
        assert_eq!(merges.find(0), 1);
    }

    #[test]
    fn ties_break_by_smaller_site_id() {
        let mut notes = vec![CardNote::default(); 3];
        for (i, n) in notes.iter_mut().enumerate() {
            n.weight = 10;
            n.site_id = [5, 2, 9][i];
        }

        let mut merges = Merges::new(3);
        merges.union(0, 1);
        merges.union(1, 2);

        run(&mut notes, &mut merges, &MergeConfig::default());

        assert!(notes[1].flags.contains(CardFlags::MERGED));
        assert_eq!(merges.find(0), 1);
        assert_eq!(merges.find(2), 1);
    }

    #[test]
    fn dup_and_merged_are_paired() {
        let mut notes = vec![CardNote::default(); 8];
        for (i, n) in notes.iter_mut().enumerate() {
            n.weight = (i % 4) as u8;
        }

        let mut merges = Merges::new(8);
        merges.union(0, 1);
        merges.union(2, 3);
        merges.union(3, 4);

        run(&mut notes, &mut merges, &MergeConfig::default());

        for id in 0..8 as CardId {
            let flags = notes[id as usize].flags;
            if flags.contains(CardFlags::DUP) {
                let primary = merges.find(id);
                assert!(notes[primary as usize].flags.contains(CardFlags::MERGED));
                assert_ne!(primary, id);
            }
            if flags.contains(CardFlags::MERGED) {
                assert_eq!(merges.find(id), id);
            }
        }
    }

    #[test]
    fn giant_classes_are_penalized() {
        let config = MergeConfig {
            giant_documents: 4,
        };
        let mut notes = vec![CardNote::default(); 6];
        let mut merges = Merges::new(6);
        for i in 1..4 {
            merges.union(0, i);
        }
        merges.union(4, 5);

        run(&mut notes, &mut merges, &config);

        for i in 0..4 {
            assert!(notes[i].flags.contains(CardFlags::GIANT));
        }
        assert!(!notes[4].flags.contains(CardFlags::GIANT));
        assert!(!notes[5].flags.contains(CardFlags::GIANT));
    }

    #[test]
    fn single_member_classes_untouched() {
        let mut notes = vec![CardNote::default(); 2];
        let mut merges = Merges::new(2);

        run(&mut notes, &mut merges, &MergeConfig::default());

        assert!(notes[0].flags.is_empty());
        assert!(notes[1].flags.is_empty());
    }
}
