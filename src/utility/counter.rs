use std::collections::HashMap;
use std::fmt;

/// A collection of named counters, used as an injected collaborator by
/// subsystems that want to tally events (e.g. per-syscall invocation counts).
/// The process or thread that created a counter owns its lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counter {
    // key -> count; counts may go negative via subtraction
    items: HashMap<String, i64>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    /// Increment the counter for `id` by one, returning the new value.
    pub fn add_one(&mut self, id: &str) -> i64 {
        self.add_value(id, 1)
    }

    /// Decrement the counter for `id` by one, returning the new value.
    pub fn sub_one(&mut self, id: &str) -> i64 {
        self.add_value(id, -1)
    }

    /// Add `value` to the counter for `id`, returning the new value.
    pub fn add_value(&mut self, id: &str, value: i64) -> i64 {
        let count = self.items.entry(id.to_string()).or_insert(0);
        *count += value;
        *count
    }

    /// The current value for `id` (zero if never counted).
    pub fn get_value(&self, id: &str) -> i64 {
        self.items.get(id).copied().unwrap_or(0)
    }

    /// Add all counts from `other` into this counter.
    pub fn add_counter(&mut self, other: &Counter) {
        for (id, value) in other.items.iter() {
            self.add_value(id, *value);
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sorted: Vec<_> = self.items.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));

        write!(f, "{{")?;
        for (i, (id, value)) in sorted.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", id, value)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut c = Counter::new();
        assert_eq!(c.add_one("read"), 1);
        assert_eq!(c.add_one("read"), 2);
        assert_eq!(c.add_one("write"), 1);
        assert_eq!(c.sub_one("read"), 1);
        assert_eq!(c.get_value("read"), 1);
        assert_eq!(c.get_value("nope"), 0);
    }

    #[test]
    fn test_merge_and_display() {
        let mut a = Counter::new();
        a.add_value("read", 2);
        let mut b = Counter::new();
        b.add_value("read", 1);
        b.add_value("brk", 4);
        a.add_counter(&b);
        assert_eq!(format!("{}", a), "{brk:4, read:3}");
    }
}
