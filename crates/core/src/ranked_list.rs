//! Ranked candidate list: ascending by distance, unique by address.

use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashSet;

use crate::account::AccountSnapshot;
use crate::tiers::WorkerRange;

/// Accounts ordered by distance to liquidation, closest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankedList(Vec<AccountSnapshot>);

/// A tier's view of the list at read time.
#[derive(Debug, Clone, Default)]
pub struct WindowSplit {
    pub before: Vec<AccountSnapshot>,
    pub window: Vec<AccountSnapshot>,
    pub after: Vec<AccountSnapshot>,
}

impl RankedList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Sort ascending by distance, keeping input order among equal distances.
    /// Later duplicates of an address are discarded.
    pub fn from_unsorted(mut entries: Vec<AccountSnapshot>) -> Self {
        let mut seen = HashSet::with_capacity(entries.len());
        entries.retain(|entry| seen.insert(entry.address));
        entries.sort_by_key(|entry| entry.distance);
        Self(entries)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[AccountSnapshot] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AccountSnapshot> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<AccountSnapshot> {
        self.0
    }

    pub fn addresses(&self) -> Vec<Pubkey> {
        self.0.iter().map(|entry| entry.address).collect()
    }

    pub fn contains(&self, address: &Pubkey) -> bool {
        self.0.iter().any(|entry| entry.address == *address)
    }

    /// Ascending by distance and free of duplicate addresses.
    pub fn is_sorted(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.0.len());
        self.0.windows(2).all(|pair| pair[0].distance <= pair[1].distance)
            && self.0.iter().all(|entry| seen.insert(entry.address))
    }

    /// Split into the entries before, inside and after `range`, clamped to
    /// the current length.
    pub fn split_window(&self, range: WorkerRange) -> WindowSplit {
        let len = self.0.len();
        let start = range.start.min(len);
        let end = range.end.map_or(len, |end| end.min(len)).max(start);

        WindowSplit {
            before: self.0[..start].to_vec(),
            window: self.0[start..end].to_vec(),
            after: self.0[end..].to_vec(),
        }
    }

    /// Rebuild the list from untouched neighbours and re-evaluated entries.
    ///
    /// `before ++ after` is kept as is; each element of `updated` lands after
    /// every existing entry with a distance less than or equal to its own.
    /// Existing copies of an updated address are removed first.
    pub fn merge_range(
        before: &[AccountSnapshot],
        after: &[AccountSnapshot],
        mut updated: Vec<AccountSnapshot>,
    ) -> Self {
        updated.sort_by_key(|entry| entry.distance);
        let mut seen = HashSet::with_capacity(updated.len());
        updated.retain(|entry| seen.insert(entry.address));

        let mut merged = Vec::with_capacity(before.len() + after.len() + updated.len());
        let mut pending = updated.into_iter().peekable();

        for entry in before.iter().chain(after) {
            if seen.contains(&entry.address) {
                continue;
            }
            while let Some(item) = pending.next_if(|item| item.distance < entry.distance) {
                merged.push(item);
            }
            merged.push(entry.clone());
        }
        merged.extend(pending);

        Self(merged)
    }

    /// Copy of the list without the given addresses.
    pub fn without(&self, addresses: &HashSet<Pubkey>) -> Vec<AccountSnapshot> {
        self.0
            .iter()
            .filter(|entry| !addresses.contains(&entry.address))
            .cloned()
            .collect()
    }
}

impl From<RankedList> for Vec<AccountSnapshot> {
    fn from(list: RankedList) -> Self {
        list.0
    }
}

impl<'a> IntoIterator for &'a RankedList {
    type Item = &'a AccountSnapshot;
    type IntoIter = std::slice::Iter<'a, AccountSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MarginResult;
    use crate::fixed::Fixed;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn snapshot(distance: i64) -> AccountSnapshot {
        AccountSnapshot::new(
            Pubkey::new_unique(),
            MarginResult::new(Fixed::from_int(distance), Fixed::ZERO, smallvec![Fixed::ONE]),
            0,
        )
    }

    fn distances(list: &RankedList) -> Vec<i64> {
        list.iter().map(|e| (e.distance.to_f64()) as i64).collect()
    }

    #[test]
    fn test_from_unsorted_is_stable() {
        let a = snapshot(3);
        let b = snapshot(1);
        let c = snapshot(3);
        let list = RankedList::from_unsorted(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(list.addresses(), vec![b.address, a.address, c.address]);
    }

    #[test]
    fn test_from_unsorted_drops_duplicates() {
        let a = snapshot(3);
        let mut moved = a.clone();
        moved.distance = Fixed::from_int(-1);

        let list = RankedList::from_unsorted(vec![a.clone(), snapshot(1), moved]);
        assert_eq!(list.len(), 2);
        assert!(list.is_sorted());
    }

    #[test]
    fn test_split_window_clamps() {
        let list = RankedList::from_unsorted((0..5).map(snapshot).collect());

        let split = list.split_window(WorkerRange::new(1, Some(3)));
        assert_eq!((split.before.len(), split.window.len(), split.after.len()), (1, 2, 2));

        let split = list.split_window(WorkerRange::new(4, Some(12)));
        assert_eq!((split.before.len(), split.window.len(), split.after.len()), (4, 1, 0));

        let split = list.split_window(WorkerRange::new(28, None));
        assert_eq!((split.before.len(), split.window.len(), split.after.len()), (5, 0, 0));
    }

    #[test]
    fn test_merge_places_equal_distances_after_existing() {
        let existing = snapshot(2);
        let updated = snapshot(2);
        let merged = RankedList::merge_range(&[snapshot(1)], &[existing.clone(), snapshot(5)], vec![updated.clone()]);

        assert_eq!(distances(&merged), vec![1, 2, 2, 5]);
        assert_eq!(merged.as_slice()[1].address, existing.address);
        assert_eq!(merged.as_slice()[2].address, updated.address);
    }

    #[test]
    fn test_merge_replaces_stale_copy() {
        let stale = snapshot(10);
        let mut fresh = stale.clone();
        fresh.distance = Fixed::from_int(-2);

        let merged = RankedList::merge_range(&[snapshot(1)], &[stale, snapshot(11)], vec![fresh.clone()]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.as_slice()[0].address, fresh.address);
        assert!(merged.is_sorted());
    }

    #[test]
    fn test_merge_scenario_from_tier_zero() {
        let after: Vec<_> = [3, 4, 6, 7, 9, 12].into_iter().map(snapshot).collect();
        let updated = vec![snapshot(2), snapshot(0)];

        let merged = RankedList::merge_range(&[], &after, updated);
        assert_eq!(distances(&merged), vec![0, 2, 3, 4, 6, 7, 9, 12]);
    }

    fn arb_sorted(max: usize) -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(-1_000i64..1_000, 0..max).prop_map(|mut v| {
            v.sort();
            v
        })
    }

    proptest! {
        #[test]
        fn prop_ranked_output_sorted_and_unique(values in prop::collection::vec(-1_000i64..1_000, 0..64)) {
            let entries: Vec<_> = values.into_iter().map(snapshot).collect();
            let list = RankedList::from_unsorted(entries);
            prop_assert!(list.is_sorted());
        }

        #[test]
        fn prop_merge_sorted_with_summed_length(
            base in arb_sorted(64),
            updated in prop::collection::vec(-1_000i64..1_000, 0..16),
            split in 0usize..64,
        ) {
            let base: Vec<_> = base.into_iter().map(snapshot).collect();
            let split = split.min(base.len());
            let (before, after) = base.split_at(split);
            let updated: Vec<_> = updated.into_iter().map(snapshot).collect();
            let expected_len = before.len() + after.len() + updated.len();

            let merged = RankedList::merge_range(before, after, updated);
            prop_assert!(merged.is_sorted());
            prop_assert_eq!(merged.len(), expected_len);
        }
    }
}
