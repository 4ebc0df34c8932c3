//! Broadcast-state table ("configstrings").
//!
//! Values are sent whole in the gamestate. Changes made while participants
//! are connected go out as reliable `cs` commands; values too long for one
//! command are split into `bcs0`/`bcs1`/`bcs2` chunks that each repeat the
//! index.

use crate::core::{CONFIGSTRING_CHUNK_THRESHOLD, MAX_CONFIGSTRINGS};
use crate::sync::quote;

/// Fixed table of indexed broadcast strings.
#[derive(Debug, Clone)]
pub struct ConfigStrings {
    values: Vec<String>,
}

impl Default for ConfigStrings {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStrings {
    /// All entries empty.
    pub fn new() -> Self {
        Self {
            values: vec![String::new(); MAX_CONFIGSTRINGS],
        }
    }

    /// Value at `index`, empty when unset or out of range.
    pub fn get(&self, index: usize) -> &str {
        self.values.get(index).map_or("", String::as_str)
    }

    /// Replace a value. Returns false when the index is out of range or the
    /// value did not change.
    pub fn set(&mut self, index: usize, value: &str) -> bool {
        match self.values.get_mut(index) {
            Some(slot) if slot != value => {
                value.clone_into(slot);
                true
            }
            _ => false,
        }
    }

    /// Non-empty entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(i, v)| (i, v.as_str()))
    }

    /// Empty every entry.
    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(String::clear);
    }
}

/// Reliable commands announcing `value` at `index`.
pub fn update_commands(index: usize, value: &str) -> Vec<String> {
    if value.len() < CONFIGSTRING_CHUNK_THRESHOLD {
        return vec![format!("cs {index} {}", quote(value))];
    }

    let chunk = CONFIGSTRING_CHUNK_THRESHOLD - 1;
    let mut commands = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let cmd = if commands.is_empty() {
            "bcs0"
        } else if rest.len() < CONFIGSTRING_CHUNK_THRESHOLD {
            "bcs2"
        } else {
            "bcs1"
        };
        let split = floor_char_boundary(rest, chunk);
        let (head, tail) = rest.split_at(split);
        commands.push(format!("{cmd} {index} {}", quote(head)));
        rest = tail;
    }
    commands
}

fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    (1..=at).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tokenize;

    #[test]
    fn test_set_reports_change() {
        let mut cs = ConfigStrings::new();
        assert!(cs.set(5, "arena"));
        assert!(!cs.set(5, "arena"));
        assert!(!cs.set(MAX_CONFIGSTRINGS, "x"));
        assert_eq!(cs.get(5), "arena");
        assert_eq!(cs.iter().collect::<Vec<_>>(), vec![(5, "arena")]);
    }

    #[test]
    fn test_short_value_single_command() {
        assert_eq!(update_commands(3, "a b"), vec!["cs 3 \"a b\"".to_string()]);
    }

    #[test]
    fn test_long_value_chunks() {
        let value = "x".repeat(2500);
        let commands = update_commands(7, &value);
        let names: Vec<String> = commands.iter().map(|c| tokenize(c)[0].clone()).collect();
        assert_eq!(names, vec!["bcs0", "bcs1", "bcs2"]);

        let rebuilt: String = commands.iter().map(|c| tokenize(c)[2].clone()).collect();
        assert_eq!(rebuilt, value);
        assert!(commands.iter().all(|c| tokenize(c)[1] == "7"));
    }

    #[test]
    fn test_threshold_boundary() {
        let below = "y".repeat(CONFIGSTRING_CHUNK_THRESHOLD - 1);
        assert_eq!(update_commands(1, &below).len(), 1);

        // Exactly one chunk plus one byte: bcs0 then bcs2.
        let at = "y".repeat(CONFIGSTRING_CHUNK_THRESHOLD);
        let commands = update_commands(1, &at);
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("bcs0 "));
        assert!(commands[1].starts_with("bcs2 "));
    }
}
