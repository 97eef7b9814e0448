//! Scoped overlay of environment variables around a single run
//!
//! The child inherits the harness environment at spawn time, so the overlay
//! must be applied before launch and reverted after the child is reaped.
//! Each overlaid key remembers what it replaced: a previous value is written
//! back, a previously absent key is removed again.
//!
//! The overlay also reverts itself on drop, so an early return or a panic in
//! the run body cannot leave the environment modified.

use std::ffi::OsString;
use tracing::debug;

/// One overlaid key with the state it replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    /// Variable name
    pub key: String,
    /// Value written by the overlay
    pub value: String,
    /// Value present before the overlay, `None` if the key was absent
    pub previous: Option<OsString>,
}

/// Environment changes applied for the duration of one run
#[derive(Debug)]
pub struct EnvOverlay {
    entries: Vec<OverlayEntry>,
    reverted: bool,
}

impl EnvOverlay {
    /// Record the current state of every key, then overwrite it.
    ///
    /// Entries are applied in iteration order. A key that appears twice keeps
    /// the state seen before its first write, so reverting restores the
    /// original value rather than the overlay's own.
    pub fn apply<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries: Vec<OverlayEntry> = Vec::new();
        for (key, value) in vars {
            let key = key.into();
            let value = value.into();
            let previous = match entries.iter().find(|e| e.key == key) {
                Some(earlier) => earlier.previous.clone(),
                None => std::env::var_os(&key),
            };
            debug!(key = %key, had_previous = previous.is_some(), "applying env overlay");
            std::env::set_var(&key, &value);
            entries.push(OverlayEntry { key, value, previous });
        }
        Self { entries, reverted: false }
    }

    /// Entries in the order they were applied
    pub fn entries(&self) -> &[OverlayEntry] {
        &self.entries
    }

    /// Whether `revert` has already run
    pub fn is_reverted(&self) -> bool {
        self.reverted
    }

    /// Restore every overlaid key to its prior state.
    ///
    /// Idempotent: only the first call touches the environment.
    pub fn revert(&mut self) {
        if self.reverted {
            return;
        }
        // Reverse order so duplicated keys settle on the oldest recorded state
        for entry in self.entries.iter().rev() {
            match &entry.previous {
                Some(prev) => std::env::set_var(&entry.key, prev),
                None => std::env::remove_var(&entry.key),
            }
        }
        debug!(count = self.entries.len(), "env overlay reverted");
        self.reverted = true;
    }
}

impl Drop for EnvOverlay {
    fn drop(&mut self) {
        self.revert();
    }
}
