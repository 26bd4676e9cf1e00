use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Last successful feed harvest per tracked account.
///
/// Owned by the scheduler and kept in memory only. Marks never move backwards.
#[derive(Debug, Default, Clone)]
pub struct WatermarkTable {
    marks: HashMap<i64, DateTime<Utc>>,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account_id: i64) -> Option<DateTime<Utc>> {
        self.marks.get(&account_id).copied()
    }

    /// The mark as unix seconds, the form the source's `since` filter takes.
    pub fn since(&self, account_id: i64) -> Option<i64> {
        self.get(account_id).map(|mark| mark.timestamp())
    }

    /// Move the mark for `account_id` to `at` if that is later than the
    /// current one. Returns whether the mark changed.
    pub fn advance(&mut self, account_id: i64, at: DateTime<Utc>) -> bool {
        match self.marks.get(&account_id) {
            Some(current) if *current >= at => false,
            _ => {
                self.marks.insert(account_id, at);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }
}
