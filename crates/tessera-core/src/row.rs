//! Row — a set of 64-bit column IDs.
//!
//! The currency of every query: fragments produce rows, views and fields
//! reduce them with set algebra. Backed by a [`RoaringTreemap`] so the full
//! 64-bit column space is addressable even though any single fragment only
//! contributes offsets inside its own shard.

use roaring::RoaringTreemap;

use crate::SHARD_WIDTH;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: RoaringTreemap,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from explicit column IDs (mostly tests and merges).
    pub fn from_columns<I: IntoIterator<Item = u64>>(columns: I) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    /// Insert a column. Returns `true` if the column was not already present.
    pub fn set(&mut self, column: u64) -> bool {
        self.columns.insert(column)
    }

    /// Remove a column. Returns `true` if the column was present.
    pub fn clear(&mut self, column: u64) -> bool {
        self.columns.remove(column)
    }

    pub fn contains(&self, column: u64) -> bool {
        self.columns.contains(column)
    }

    pub fn count(&self) -> u64 {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// All columns in ascending order.
    pub fn columns(&self) -> Vec<u64> {
        self.columns.iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.columns.iter()
    }

    // ── Set algebra ────────────────────────────────────

    pub fn union(&self, other: &Row) -> Row {
        Row {
            columns: &self.columns | &other.columns,
        }
    }

    pub fn intersect(&self, other: &Row) -> Row {
        Row {
            columns: &self.columns & &other.columns,
        }
    }

    pub fn difference(&self, other: &Row) -> Row {
        Row {
            columns: &self.columns - &other.columns,
        }
    }

    /// In-place union, used when reducing over fragments.
    pub fn merge(&mut self, other: &Row) {
        self.columns |= &other.columns;
    }

    /// Columns of this row that fall inside `shard`, as offsets relative to
    /// the shard base. Used to push a full-width filter down into a fragment.
    pub fn shard_offsets(&self, shard: u64) -> roaring::RoaringBitmap {
        let base = shard * SHARD_WIDTH;
        self.columns
            .iter()
            .skip_while(|&c| c < base)
            .take_while(|&c| c < base + SHARD_WIDTH)
            .map(|c| (c - base) as u32)
            .collect()
    }
}

impl FromIterator<u64> for Row {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self::from_columns(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_report_change() {
        let mut r = Row::new();
        assert!(r.set(7));
        assert!(!r.set(7));
        assert!(r.clear(7));
        assert!(!r.clear(7));
        assert!(r.is_empty());
    }

    #[test]
    fn algebra() {
        let a = Row::from_columns([1, 2, 3]);
        let b = Row::from_columns([2, 3, 4]);
        assert_eq!(a.union(&b).columns(), vec![1, 2, 3, 4]);
        assert_eq!(a.intersect(&b).columns(), vec![2, 3]);
        assert_eq!(a.difference(&b).columns(), vec![1]);
        assert_eq!(a.count(), 3);
    }

    #[test]
    fn merge_accumulates() {
        let mut a = Row::from_columns([1]);
        a.merge(&Row::from_columns([2]));
        a.merge(&Row::from_columns([1, 3]));
        assert_eq!(a.columns(), vec![1, 2, 3]);
    }

    #[test]
    fn shard_offsets_select_only_local_columns() {
        let r = Row::from_columns([5, SHARD_WIDTH - 1, SHARD_WIDTH, SHARD_WIDTH + 9]);
        let s0 = r.shard_offsets(0);
        let s1 = r.shard_offsets(1);
        assert_eq!(s0.iter().collect::<Vec<_>>(), vec![5, (SHARD_WIDTH - 1) as u32]);
        assert_eq!(s1.iter().collect::<Vec<_>>(), vec![0, 9]);
    }
}
