use crate::raft::error::LogError;
use crate::raft::types::{Configuration, Entry, EntryData, EntryId};

// Represents a contiguous slice of a raft log, starting right after the last
// compaction point.
pub struct LogSlice {
    entries: Vec<Entry>,

    // The sum of the sizes of all payloads in the stored entries.
    size_bytes: u64,

    // The id of the entry immediately *before* this log slice, or a (0, 0)
    // sentinel if this slice starts at the beginning of time.
    previous: EntryId,
}

// Describes what an append_all call did to the slice.
#[derive(Debug, Default, PartialEq)]
pub struct AppendOutcome {
    // The first index removed because of a conflicting term, if any.
    pub truncated_from: Option<u64>,

    // The entries actually added.
    pub appended: Vec<Entry>,
}

impl LogSlice {
    // Returns a new instance with the given entries. The "previous" parameter
    // holds the id of the entry immediately before this slice starts.
    pub fn new(previous: EntryId, entries: Vec<Entry>) -> Result<Self, LogError> {
        let mut result = LogSlice {
            entries: Vec::with_capacity(entries.len()),
            size_bytes: 0,
            previous,
        };
        for entry in entries {
            result.push_checked(entry)?;
        }
        Ok(result)
    }

    #[cfg(test)]
    pub fn initial() -> Self {
        LogSlice {
            entries: Vec::new(),
            size_bytes: 0,
            previous: EntryId::default(),
        }
    }

    pub fn previous_id(&self) -> EntryId {
        self.previous
    }

    // Returns the id of the last entry known to exist, even if it has been
    // compacted away. Returns (0, 0) for an empty log.
    pub fn last_id(&self) -> EntryId {
        match self.entries.last() {
            Some(entry) => entry.id(),
            None => self.previous,
        }
    }

    pub fn next_index(&self) -> u64 {
        self.last_id().index + 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    // Returns the term of the entry at the supplied index. This also works for
    // the entry right before the slice. Returns None for anything else not held.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.previous.index {
            return Some(self.previous.term);
        }
        self.local_index(index).map(|i| self.entries[i].term)
    }

    pub fn entry_at(&self, index: u64) -> Option<&Entry> {
        self.local_index(index).map(|i| &self.entries[i])
    }

    // Returns true if the supplied index lies at or before the compaction point.
    pub fn is_index_compacted(&self, index: u64) -> bool {
        index <= self.previous.index
    }

    // Returns up to "max" entries starting at the supplied index.
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<Entry> {
        match self.local_index(index) {
            Some(start) => self.entries[start..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    // Adds a new entry to the end of the slice and returns a copy of it.
    #[cfg(test)]
    pub fn append(&mut self, term: u64, data: EntryData) -> Entry {
        let entry = Entry {
            index: self.next_index(),
            term: term.max(self.last_id().term),
            data,
        };
        self.size_bytes += entry.size_bytes();
        self.entries.push(entry.clone());
        entry
    }

    // Adds the supplied entries, as received from a leader. Entries already
    // present with a matching term are skipped. The first entry with a
    // conflicting term removes it and everything after it. Entries at or
    // before the compaction point are ignored.
    pub fn append_all(&mut self, entries: &[Entry]) -> Result<AppendOutcome, LogError> {
        let mut outcome = AppendOutcome::default();
        for entry in entries {
            if entry.index <= self.previous.index {
                continue;
            }
            if let Some(local) = self.local_index(entry.index) {
                if self.entries[local].term == entry.term {
                    continue;
                }
                self.truncate_local(local);
                outcome.truncated_from.get_or_insert(entry.index);
            }
            self.push_checked(entry.clone())?;
            outcome.appended.push(entry.clone());
        }
        Ok(outcome)
    }

    // Drops all entries up to (and including) the supplied index, which must be
    // held in this slice.
    pub fn compact_to(&mut self, index: u64) {
        let Some(local) = self.local_index(index) else {
            return;
        };
        let previous = self.entries[local].id();
        for entry in self.entries.drain(..=local) {
            self.size_bytes -= entry.size_bytes();
        }
        self.previous = previous;
    }

    // Moves the start of the slice to just after the supplied snapshot id. If
    // the slice holds the exact entry, everything after it is kept and this
    // returns true. Otherwise the slice is cleared.
    pub fn prune_until(&mut self, last: EntryId) -> bool {
        if self.term_at(last.index) == Some(last.term) && last.index >= self.previous.index {
            self.compact_to(last.index);
            self.previous = last;
            return true;
        }
        self.entries.clear();
        self.size_bytes = 0;
        self.previous = last;
        false
    }

    // Returns true if a log ending in "last" is at least as up-to-date as this one.
    pub fn is_up_to_date(&self, last: &EntryId) -> bool {
        let ours = self.last_id();
        if ours.term != last.term {
            return last.term > ours.term;
        }
        last.index >= ours.index
    }

    // Returns the latest configuration entry held in the slice.
    pub fn latest_configuration(&self) -> Option<(u64, Configuration)> {
        self.configuration_at(self.last_id().index)
    }

    // Returns the latest configuration entry at or before the supplied index.
    pub fn configuration_at(&self, index: u64) -> Option<(u64, Configuration)> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| match &e.data {
                EntryData::Configuration(config) => Some((e.index, config.clone())),
                _ => None,
            })
    }

    fn local_index(&self, index: u64) -> Option<usize> {
        if index <= self.previous.index {
            return None;
        }
        let local = (index - self.previous.index - 1) as usize;
        if local < self.entries.len() {
            Some(local)
        } else {
            None
        }
    }

    fn truncate_local(&mut self, local: usize) {
        for entry in self.entries.drain(local..) {
            self.size_bytes -= entry.size_bytes();
        }
    }

    fn push_checked(&mut self, entry: Entry) -> Result<(), LogError> {
        let last = self.last_id();
        if entry.index != last.index + 1 {
            return Err(LogError::NonContiguous {
                expected: last.index + 1,
                actual: entry.index,
            });
        }
        if entry.term < last.term {
            return Err(LogError::TermRegression {
                index: entry.index,
                term: entry.term,
                previous: last.term,
            });
        }
        self.size_bytes += entry.size_bytes();
        self.entries.push(entry);
        Ok(())
    }
}
