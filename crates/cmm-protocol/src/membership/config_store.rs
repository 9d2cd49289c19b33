//! Two-phase configuration store.
//!
//! `ConfigUpdate` stages a full snapshot under a version; `ConfigCommit`
//! makes it current. Nothing staged is ever visible until committed, and
//! replaying a committed `(update, commit)` pair changes nothing.

use std::collections::BTreeMap;

pub type ConfigEntries = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Staged,
    /// Same version staged again (retransmission).
    AlreadyStaged,
    /// The version is already committed or superseded.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { version: u64 },
    AlreadyApplied,
    /// Commit for a version we never saw an update for. Not applied.
    NotStaged,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    version: u64,
    entries: ConfigEntries,
    staged: BTreeMap<u64, ConfigEntries>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed version; 0 before the first commit.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &ConfigEntries {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_staged(&self, version: u64) -> bool {
        self.staged.contains_key(&version)
    }

    pub fn stage(&mut self, version: u64, entries: ConfigEntries) -> StageOutcome {
        if version <= self.version {
            return StageOutcome::AlreadyApplied;
        }
        if self.staged.contains_key(&version) {
            return StageOutcome::AlreadyStaged;
        }
        self.staged.insert(version, entries);
        StageOutcome::Staged
    }

    /// Commit `version`. Older staged versions are discarded with it.
    pub fn commit(&mut self, version: u64) -> CommitOutcome {
        if version <= self.version {
            return CommitOutcome::AlreadyApplied;
        }
        let Some(entries) = self.staged.remove(&version) else {
            return CommitOutcome::NotStaged;
        };
        self.entries = entries;
        self.version = version;
        self.staged.retain(|&v, _| v > version);
        CommitOutcome::Applied { version }
    }

    /// Next full snapshot: the newest staged snapshot (or the committed
    /// entries when nothing is staged) with `changes` applied. An empty value
    /// removes the key.
    pub fn propose(&self, changes: &ConfigEntries) -> (u64, ConfigEntries) {
        let (base_version, base) = match self.staged.iter().next_back() {
            Some((&version, entries)) => (version, entries),
            None => (self.version, &self.entries),
        };
        let mut next = base.clone();
        for (key, value) in changes {
            if value.is_empty() {
                next.remove(key);
            } else {
                next.insert(key.clone(), value.clone());
            }
        }
        (base_version.max(self.version) + 1, next)
    }
}
