use std::collections::HashSet;

use pagesweep_core::{Record, RecordId};
use serde::Serialize;

/// How one page changed the accumulated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PageTally {
    pub added: usize,
    pub duplicates: usize,
}

/// Seen-id set plus the ordered list of first-seen records.
#[derive(Debug, Clone, Default)]
pub struct DedupAccumulator {
    seen: HashSet<RecordId>,
    records: Vec<Record>,
}

impl DedupAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self, records: impl IntoIterator<Item = Record>) -> PageTally {
        let mut tally = PageTally::default();
        for record in records {
            if self.seen.contains(&record.id) {
                tally.duplicates += 1;
                continue;
            }
            self.seen.insert(record.id.clone());
            self.records.push(record);
            tally.added += 1;
        }
        tally
    }

    /// Accumulated records in insertion order. Safe to call at any point.
    pub fn snapshot(&self) -> Vec<Record> {
        self.records.clone()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
