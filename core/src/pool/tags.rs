/*
 * tags.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fetchpool, an HTTP request orchestration library.
 *
 * Fetchpool is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fetchpool is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fetchpool.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Tag index: fetches grouped under caller-chosen integers for bulk cancel.

use std::collections::{BTreeSet, HashMap};

use crate::engine::FetchId;

/// Bidirectional index. A fetch carries at most one tag.
#[derive(Debug, Default)]
pub(crate) struct TagRegistry {
    by_tag: HashMap<i32, BTreeSet<FetchId>>,
    by_fetch: HashMap<FetchId, i32>,
}

impl TagRegistry {
    /// Tag `id`, moving it out of any previous tag.
    pub fn tag(&mut self, id: FetchId, tag: i32) {
        if let Some(old) = self.by_fetch.insert(id, tag) {
            if old != tag {
                self.remove_member(old, id);
            }
        }
        self.by_tag.entry(tag).or_default().insert(id);
    }

    pub fn untag(&mut self, id: FetchId) {
        if let Some(tag) = self.by_fetch.remove(&id) {
            self.remove_member(tag, id);
        }
    }

    /// Remove the whole tag and return its members in id order.
    pub fn take_tag(&mut self, tag: i32) -> Vec<FetchId> {
        let members = self.by_tag.remove(&tag).unwrap_or_default();
        for id in &members {
            self.by_fetch.remove(id);
        }
        members.into_iter().collect()
    }

    #[cfg(test)]
    pub fn tag_of(&self, id: FetchId) -> Option<i32> {
        self.by_fetch.get(&id).copied()
    }

    #[cfg(test)]
    pub fn len(&self, tag: i32) -> usize {
        self.by_tag.get(&tag).map(|s| s.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_fetch.is_empty()
    }

    fn remove_member(&mut self, tag: i32, id: FetchId) {
        if let Some(members) = self.by_tag.get_mut(&tag) {
            members.remove(&id);
            if members.is_empty() {
                self.by_tag.remove(&tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_and_take() {
        let mut r = TagRegistry::default();
        r.tag(3, 7);
        r.tag(1, 7);
        r.tag(2, 8);
        assert_eq!(r.len(7), 2);
        assert_eq!(r.take_tag(7), vec![1, 3]);
        assert_eq!(r.tag_of(1), None);
        assert_eq!(r.tag_of(3), None);
        assert_eq!(r.tag_of(2), Some(8));
        assert!(r.take_tag(7).is_empty());
    }

    #[test]
    fn retag_moves_between_sets() {
        let mut r = TagRegistry::default();
        r.tag(1, 5);
        r.tag(1, 6);
        assert_eq!(r.len(5), 0);
        assert_eq!(r.len(6), 1);
        assert!(r.take_tag(5).is_empty());
        r.tag(1, 6);
        assert_eq!(r.len(6), 1);
    }

    #[test]
    fn untag_clears_both_sides() {
        let mut r = TagRegistry::default();
        r.tag(1, 5);
        r.tag(2, 5);
        r.untag(1);
        r.untag(1);
        r.untag(42);
        assert_eq!(r.take_tag(5), vec![2]);
        assert!(r.is_empty());
    }

    #[test]
    fn untag_after_take_is_harmless() {
        let mut r = TagRegistry::default();
        r.tag(1, 5);
        let members = r.take_tag(5);
        for id in members {
            r.untag(id);
        }
        assert!(r.is_empty());
        assert_eq!(r.len(5), 0);
    }
}
