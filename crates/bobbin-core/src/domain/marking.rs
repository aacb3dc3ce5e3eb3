//! Token marking of a net.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Token count per condition id. Conditions with zero tokens are not stored,
/// so two markings with the same tokens compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Marking {
    tokens: BTreeMap<String, u32>,
}

impl Marking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial marking of a case: one token in the input condition.
    pub fn initial(input_condition: &str) -> Self {
        let mut marking = Self::new();
        marking.add(input_condition, 1);
        marking
    }

    pub fn count(&self, condition: &str) -> u32 {
        self.tokens.get(condition).copied().unwrap_or(0)
    }

    pub fn is_marked(&self, condition: &str) -> bool {
        self.count(condition) > 0
    }

    /// Add tokens to a condition. The count saturates at `u32::MAX`.
    pub fn add(&mut self, condition: &str, tokens: u32) {
        if tokens == 0 {
            return;
        }
        let count = self.tokens.entry(condition.to_string()).or_insert(0);
        *count = count.saturating_add(tokens);
    }

    /// Remove one token. Returns `false` (and changes nothing) when the
    /// condition is empty.
    pub fn consume(&mut self, condition: &str) -> bool {
        match self.tokens.get_mut(condition) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.tokens.remove(condition);
                true
            }
            None => false,
        }
    }

    /// Remove every token from a condition, returning how many were removed.
    pub fn clear(&mut self, condition: &str) -> u32 {
        self.tokens.remove(condition).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.tokens.values().map(|&c| u64::from(c)).sum()
    }

    /// Marked conditions in id order.
    pub fn marked(&self) -> impl Iterator<Item = (&str, u32)> {
        self.tokens.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_marking_has_one_input_token() {
        let m = Marking::initial("start");
        assert_eq!(m.count("start"), 1);
        assert_eq!(m.total(), 1);
    }

    #[test]
    fn consuming_an_empty_condition_is_refused() {
        let mut m = Marking::new();
        assert!(!m.consume("c"));
        assert_eq!(m.count("c"), 0);
    }

    #[test]
    fn empty_conditions_are_not_stored() {
        let mut a = Marking::new();
        a.add("c", 2);
        a.consume("c");
        a.consume("c");
        assert_eq!(a, Marking::new());
        assert!(a.is_empty());
    }

    #[test]
    fn adding_past_the_limit_saturates() {
        let mut m = Marking::new();
        m.add("c", u32::MAX);
        m.add("c", 2);
        assert_eq!(m.count("c"), u32::MAX);
        assert!(m.consume("c"));
        assert_eq!(m.count("c"), u32::MAX - 1);
    }

    #[test]
    fn clear_reports_removed_tokens() {
        let mut m = Marking::new();
        m.add("c", 3);
        assert_eq!(m.clear("c"), 3);
        assert_eq!(m.clear("c"), 0);
    }
}
