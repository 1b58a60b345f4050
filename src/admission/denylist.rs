//! Key-value commands refused outright.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenylistEntry {
    pub command: String,
    /// Cursor-based or bounded equivalent suggested to the caller.
    pub alternative: String,
}

impl DenylistEntry {
    pub fn new(command: impl Into<String>, alternative: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            alternative: alternative.into(),
        }
    }
}

/// Case-insensitive lookup over a list of denied commands.
#[derive(Debug, Clone, Copy)]
pub struct KvDenylist<'a> {
    entries: &'a [DenylistEntry],
}

impl<'a> KvDenylist<'a> {
    pub fn new(entries: &'a [DenylistEntry]) -> Self {
        Self { entries }
    }

    pub fn default_entries() -> Vec<DenylistEntry> {
        vec![
            DenylistEntry::new("KEYS", "SCAN"),
            DenylistEntry::new("FLUSHALL", "SCAN with batched UNLINK"),
            DenylistEntry::new("FLUSHDB", "SCAN with batched UNLINK"),
        ]
    }

    pub fn lookup(&self, command: &str) -> Option<&'a DenylistEntry> {
        let command = command.trim();
        self.entries
            .iter()
            .find(|entry| entry.command.eq_ignore_ascii_case(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let entries = KvDenylist::default_entries();
        let denylist = KvDenylist::new(&entries);

        assert_eq!(denylist.lookup("keys").unwrap().alternative, "SCAN");
        assert!(denylist.lookup(" FlushAll ").is_some());
        assert!(denylist.lookup("SCAN").is_none());
        assert!(denylist.lookup("GET").is_none());
    }
}
