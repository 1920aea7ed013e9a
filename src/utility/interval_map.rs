use std::ops::Range;

/// A half-open interval of `usize`.
pub type Interval = Range<usize>;

/// Describes modifications of an IntervalMap after overwriting an interval.
#[derive(PartialEq, Eq, Debug)]
pub enum Mutation<V> {
    /// (Original interval, new begin)
    ModifiedBegin(Interval, usize),
    /// (Original interval, new end)
    ModifiedEnd(Interval, usize),
    /// (Original interval, new lower interval, new higher interval)
    Split(Interval, Interval, Interval),
    /// (Removed interval, its value)
    Removed(Interval, V),
}

/// Maps non-overlapping half-open `Interval`s to values.
///
/// `insert` and `clear` report exactly how existing intervals were disturbed,
/// so that callers owning per-interval resources (e.g. memory mappings) can
/// release precisely the affected pieces.
#[derive(Debug)]
pub struct IntervalMap<V> {
    begins: Vec<usize>,
    ends: Vec<usize>,
    vals: Vec<V>,
}

pub struct ItemIter<'a, V> {
    map: &'a IntervalMap<V>,
    i: usize,
}

impl<'a, V> Iterator for ItemIter<'a, V> {
    type Item = (Interval, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.i;
        let m = self.map;
        if i >= m.begins.len() {
            return None;
        }
        self.i += 1;
        Some((m.begins[i]..m.ends[i], &m.vals[i]))
    }
}

pub struct KeyIter<'a, V> {
    map: &'a IntervalMap<V>,
    i: usize,
}

impl<'a, V> Iterator for KeyIter<'a, V> {
    type Item = Interval;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.i;
        let m = self.map;
        if i >= m.begins.len() {
            return None;
        }
        self.i += 1;
        Some(m.begins[i]..m.ends[i])
    }
}

impl<V: Clone> IntervalMap<V> {
    pub fn new() -> IntervalMap<V> {
        IntervalMap {
            begins: Vec::new(),
            ends: Vec::new(),
            vals: Vec::new(),
        }
    }

    /// Iterator over all interval keys, in sorted order.
    pub fn keys(&self) -> KeyIter<V> {
        KeyIter { map: self, i: 0 }
    }

    /// Iterator over all interval keys and their values, in order by key.
    pub fn iter(&self) -> ItemIter<V> {
        ItemIter { map: self, i: 0 }
    }

    /// Mutates the map so that `interval` maps to nothing, modifying and
    /// removing intervals as needed. Returns the performed mutations,
    /// including the values of completely-removed intervals. A split (e.g.
    /// clearing 5..6 out of 0..10) clones the stored value.
    pub fn clear(&mut self, interval: Interval) -> Vec<Mutation<V>> {
        self.splice(interval, None)
    }

    /// Maps `interval` to `val`. Existing contents of the interval are
    /// cleared as for [`Self::clear`].
    pub fn insert(&mut self, interval: Interval, val: V) -> Vec<Mutation<V>> {
        self.splice(interval, Some(val))
    }

    // Splices zero or one value into the given interval.
    fn splice(&mut self, interval: Interval, val: Option<V>) -> Vec<Mutation<V>> {
        let (begin, end) = (interval.start, interval.end);
        assert!(begin <= end);
        if begin == end && val.is_none() {
            return Vec::new();
        }

        let mut mutations = Vec::new();
        let mut begins_insertions = Vec::new();
        let mut ends_insertions = Vec::new();
        let mut vals_insertions = Vec::new();
        if let Some(v) = val {
            begins_insertions.push(begin);
            ends_insertions.push(end);
            vals_insertions.push(v);
        }

        // We're eventually going to call Vec::splice on our vectors; this is
        // the starting index. Intervals from here on start at or after
        // `begin`.
        let splice_start = match self.begins.binary_search(&begin) {
            Ok(i) | Err(i) => i,
        };

        // The splice end is non-inclusive; grow it over every interval that
        // ends within our range.
        let mut splice_end = splice_start;

        // An interval before the splice point may extend into our range.
        if splice_start > 0 && self.ends[splice_start - 1] > begin {
            let i = splice_start - 1;

            if self.ends[i] > end {
                // Extends past our end as well; split it.
                let old = self.begins[i]..self.ends[i];
                let lower = self.begins[i]..begin;
                let upper = end..self.ends[i];

                // Truncate the existing interval.
                self.ends[i] = lower.end;

                // Create a new interval starting after the spliced range.
                begins_insertions.push(upper.start);
                ends_insertions.push(upper.end);
                vals_insertions.push(self.vals[i].clone());
                mutations.push(Mutation::Split(old, lower, upper));
            } else {
                // Otherwise clip its end to our begin.
                let old = self.begins[i]..self.ends[i];
                self.ends[i] = begin;
                mutations.push(Mutation::ModifiedEnd(old, begin));
            }
        }

        while splice_end < self.ends.len() && self.ends[splice_end] <= end {
            splice_end += 1;
        }

        // An interval straddling our end has its begin clipped.
        let mut modified_begin: Option<Mutation<V>> = None;
        if splice_end < self.begins.len()
            && self.begins[splice_end] < end
            && self.ends[splice_end] > end
        {
            let i = splice_end;
            let old = self.begins[i]..self.ends[i];
            self.begins[i] = end;
            modified_begin = Some(Mutation::ModifiedBegin(old, end));
        }

        let dropped_begins: Vec<_> = self
            .begins
            .splice(splice_start..splice_end, begins_insertions)
            .collect();
        let dropped_ends: Vec<_> = self
            .ends
            .splice(splice_start..splice_end, ends_insertions)
            .collect();
        {
            // Consume the spliced-out values directly to avoid extra copies;
            // the scope bounds the mutable borrow of self.vals.
            let mut dropped_vals = self.vals.splice(splice_start..splice_end, vals_insertions);
            for i in 0..dropped_begins.len() {
                mutations.push(Mutation::Removed(
                    dropped_begins[i]..dropped_ends[i],
                    dropped_vals.next().unwrap(),
                ));
            }
        }

        // Report the modified begin last so that mutations stay ordered by
        // interval.
        if let Some(m) = modified_begin {
            mutations.push(m);
        }

        mutations
    }

    // Returns the index of the interval containing `x`.
    fn get_index(&self, x: usize) -> Option<usize> {
        match self.begins.binary_search(&x) {
            Ok(i) => Some(i),
            Err(i) => {
                if i == 0 {
                    None
                } else if x < self.ends[i - 1] {
                    Some(i - 1)
                } else {
                    None
                }
            }
        }
    }

    /// Returns the entry of the interval containing `x`.
    pub fn get(&self, x: usize) -> Option<(Interval, &V)> {
        self.get_index(x)
            .map(|i| (self.begins[i]..self.ends[i], &self.vals[i]))
    }

    /// Returns the entry of the interval containing `x`, with a mutable value.
    pub fn get_mut(&mut self, x: usize) -> Option<(Interval, &mut V)> {
        match self.get_index(x) {
            None => None,
            Some(i) => Some((self.begins[i]..self.ends[i], &mut self.vals[i])),
        }
    }
}

impl<V: Clone> Default for IntervalMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval_sum<I>(i: I) -> usize
    where
        I: Iterator<Item = Interval>,
    {
        i.map(|x| x.end - x.start).sum()
    }

    fn validate_map<V: Clone>(m: &IntervalMap<V>) {
        // Every interval is non-empty
        for i in m.keys() {
            assert!(i.start < i.end);
        }

        // Intervals don't overlap
        for (i1, i2) in m.keys().zip(m.keys().skip(1)) {
            assert!(i1.end <= i2.start);
        }
    }

    fn insert_and_validate(
        m: &mut IntervalMap<String>,
        interval: Interval,
        val: &str,
        expected_mutations: &[Mutation<String>],
        expected_val: &[(Interval, &str)],
    ) {
        let len = interval.end - interval.start;
        let old_len_sum = interval_sum(m.keys());

        let mutations = m.insert(interval, val.to_string());
        validate_map(m);

        let new_len_sum = interval_sum(m.keys());
        assert!(new_len_sum >= old_len_sum.max(len));

        assert_eq!(mutations, expected_mutations);
        assert_eq!(
            m.iter().map(|(i, s)| (i, s.clone())).collect::<Vec<_>>(),
            expected_val
                .iter()
                .map(|(i, s)| (i.clone(), s.to_string()))
                .collect::<Vec<_>>()
        );
    }

    fn clear_and_validate(
        m: &mut IntervalMap<String>,
        interval: Interval,
        expected_mutations: &[Mutation<String>],
        expected_val: &[(Interval, &str)],
    ) {
        let old_len_sum = interval_sum(m.keys());

        let mutations = m.clear(interval);
        validate_map(m);

        assert!(interval_sum(m.keys()) <= old_len_sum);

        assert_eq!(mutations, expected_mutations);
        assert_eq!(
            m.iter().map(|(i, s)| (i, s.clone())).collect::<Vec<_>>(),
            expected_val
                .iter()
                .map(|(i, s)| (i.clone(), s.to_string()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_insert_into_empty() {
        let mut m = IntervalMap::new();
        insert_and_validate(&mut m, 10..20, "x", &[], &[(10..20, "x")]);
    }

    #[test]
    fn test_insert_after() {
        let mut m = IntervalMap::new();
        m.insert(1..3, "i1".to_string());
        insert_and_validate(&mut m, 3..6, "i2", &[], &[(1..3, "i1"), (3..6, "i2")]);
    }

    #[test]
    fn test_insert_before() {
        let mut m = IntervalMap::new();
        m.insert(4..6, "i1".to_string());
        insert_and_validate(&mut m, 1..4, "i2", &[], &[(1..4, "i2"), (4..6, "i1")]);
    }

    #[test]
    fn test_insert_over_begin() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        insert_and_validate(
            &mut m,
            10..21,
            "second",
            &[Mutation::ModifiedBegin(20..30, 21)],
            &[(10..21, "second"), (21..30, "first")],
        );
    }

    #[test]
    fn test_insert_over_end() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        insert_and_validate(
            &mut m,
            29..31,
            "second",
            &[Mutation::ModifiedEnd(20..30, 29)],
            &[(20..29, "first"), (29..31, "second")],
        );
    }

    #[test]
    fn test_insert_removing() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        insert_and_validate(
            &mut m,
            10..40,
            "second",
            &[Mutation::Removed(20..30, "first".to_string())],
            &[(10..40, "second")],
        );
    }

    #[test]
    fn test_insert_forcing_split() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        insert_and_validate(
            &mut m,
            24..26,
            "second",
            &[Mutation::Split(20..30, 20..24, 26..30)],
            &[(20..24, "first"), (24..26, "second"), (26..30, "first")],
        );
    }

    #[test]
    fn test_insert_all_mutations() {
        let mut m = IntervalMap::new();
        m.insert(0..10, "first".to_string());
        m.insert(20..30, "second".to_string());
        m.insert(40..50, "third".to_string());
        insert_and_validate(
            &mut m,
            5..45,
            "clobbering",
            &[
                Mutation::ModifiedEnd(0..10, 5),
                Mutation::Removed(20..30, "second".to_string()),
                Mutation::ModifiedBegin(40..50, 45),
            ],
            &[(0..5, "first"), (5..45, "clobbering"), (45..50, "third")],
        );
    }

    #[test]
    fn test_clear_over_begin() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        clear_and_validate(
            &mut m,
            10..21,
            &[Mutation::ModifiedBegin(20..30, 21)],
            &[(21..30, "first")],
        );
    }

    #[test]
    fn test_clear_over_end() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        clear_and_validate(
            &mut m,
            29..31,
            &[Mutation::ModifiedEnd(20..30, 29)],
            &[(20..29, "first")],
        );
    }

    #[test]
    fn test_clear_forcing_split() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        clear_and_validate(
            &mut m,
            24..26,
            &[Mutation::Split(20..30, 20..24, 26..30)],
            &[(20..24, "first"), (26..30, "first")],
        );
    }

    #[test]
    fn test_clear_removing() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        clear_and_validate(
            &mut m,
            10..40,
            &[Mutation::Removed(20..30, "first".to_string())],
            &[],
        );
    }

    #[test]
    fn test_clear_empty_range_is_noop() {
        let mut m = IntervalMap::new();
        m.insert(20..30, "first".to_string());
        clear_and_validate(&mut m, 25..25, &[], &[(20..30, "first")]);
    }

    #[test]
    fn test_get_empty() {
        let m = IntervalMap::<String>::new();
        assert_eq!(m.get(10), None);
    }

    #[test]
    fn test_get_single_interval() {
        let mut m = IntervalMap::<String>::new();
        m.insert(1..4, "interval".to_string());
        assert_eq!(m.get(0), None);
        assert_eq!(m.get(1), Some((1..4, &"interval".to_string())));
        assert_eq!(m.get(2), Some((1..4, &"interval".to_string())));
        assert_eq!(m.get(3), Some((1..4, &"interval".to_string())));
        assert_eq!(m.get(4), None);
    }

    #[test]
    fn test_get_two_intervals_with_gap() {
        let mut m = IntervalMap::<String>::new();
        m.insert(1..4, "i1".to_string());
        m.insert(5..8, "i2".to_string());
        assert_eq!(m.get(0), None);
        assert_eq!(m.get(3), Some((1..4, &"i1".to_string())));
        assert_eq!(m.get(4), None);
        assert_eq!(m.get(5), Some((5..8, &"i2".to_string())));
        assert_eq!(m.get(7), Some((5..8, &"i2".to_string())));
        assert_eq!(m.get(8), None);
    }

    #[test]
    fn test_get_two_intervals_without_gap() {
        let mut m = IntervalMap::<String>::new();
        m.insert(1..4, "i1".to_string());
        m.insert(4..7, "i2".to_string());
        assert_eq!(m.get(3), Some((1..4, &"i1".to_string())));
        assert_eq!(m.get(4), Some((4..7, &"i2".to_string())));
        assert_eq!(m.get(6), Some((4..7, &"i2".to_string())));
        assert_eq!(m.get(7), None);
    }

    #[test]
    fn test_get_mut() {
        let mut m = IntervalMap::<String>::new();
        m.insert(1..4, "i1".to_string());
        let (interval, val) = m.get_mut(2).unwrap();
        assert_eq!(interval, 1..4);
        *val = "changed".to_string();
        assert_eq!(m.get(2), Some((1..4, &"changed".to_string())));
    }
}
