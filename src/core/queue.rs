use std::collections::{BinaryHeap, HashSet};
use std::fs;
use std::path::Path;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ScheduledWorkItem;

/// Min-heap of accounts keyed by when their next follower snapshot is due.
#[derive(Debug, Clone, Default)]
pub struct FollowerQueue {
    heap: BinaryHeap<ScheduledWorkItem>,
}

#[derive(Serialize, Deserialize, Default)]
struct QueueFile {
    items: Vec<ScheduledWorkItem>,
}

impl FollowerQueue {
    /// Every account due immediately.
    pub fn seeded(account_ids: impl IntoIterator<Item = u64>, now: DateTime<Utc>) -> Self {
        let mut queue = FollowerQueue::default();
        queue.reconcile(account_ids, now);
        queue
    }

    pub fn push(&mut self, account_id: u64, next_eligible: DateTime<Utc>) {
        self.heap.push(ScheduledWorkItem {
            account_id,
            next_eligible,
        });
    }

    pub fn peek(&self) -> Option<&ScheduledWorkItem> {
        self.heap.peek()
    }

    /// Pop the head only if it is due at `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<ScheduledWorkItem> {
        match self.heap.peek() {
            Some(head) if head.next_eligible <= now => self.heap.pop(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[cfg(test)]
    pub fn next_eligible(&self, account_id: u64) -> Option<DateTime<Utc>> {
        self.heap
            .iter()
            .find(|item| item.account_id == account_id)
            .map(|item| item.next_eligible)
    }

    /// Make the queue hold exactly one entry per id in `account_ids`: unknown
    /// entries are dropped, duplicates collapse to the earliest, missing ids
    /// are added as due at `now`.
    pub fn reconcile(&mut self, account_ids: impl IntoIterator<Item = u64>, now: DateTime<Utc>) {
        let wanted: Vec<u64> = account_ids.into_iter().collect();
        let wanted_set: HashSet<u64> = wanted.iter().copied().collect();

        let mut seen = HashSet::new();
        let mut kept = BinaryHeap::new();
        // into_sorted_vec is ascending by Ord, which is reversed: latest first
        for item in std::mem::take(&mut self.heap).into_sorted_vec().into_iter().rev() {
            if wanted_set.contains(&item.account_id) && seen.insert(item.account_id) {
                kept.push(item);
            }
        }
        for id in wanted {
            if seen.insert(id) {
                kept.push(ScheduledWorkItem {
                    account_id: id,
                    next_eligible: now,
                });
            }
        }
        self.heap = kept;
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        let file: QueueFile = serde_json::from_str(&data)?;
        Ok(Some(FollowerQueue {
            heap: file.items.into_iter().collect(),
        }))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = QueueFile {
            items: self.heap.clone().into_sorted_vec().into_iter().rev().collect(),
        };
        let data = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
