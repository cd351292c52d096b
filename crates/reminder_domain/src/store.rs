use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    error::StoreError,
    kv::{get_json, set_json, KvStore},
    model::ReminderSignature,
};

const KEY_PREFIX: &str = "reminder:";

/// The ids currently scheduled for one logical reminder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredReminder {
    pub signature: ReminderSignature,
    pub ids: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Maps reminder keys to their active notification ids.
///
/// Mutation goes through [`ReminderStore::lock`], which serializes all work on
/// one key while leaving other keys free.
pub struct ReminderStore {
    kv: Arc<dyn KvStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ReminderStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Unsynchronized read, for inspection only.
    pub fn get(&self, key: &str) -> Result<Option<StoredReminder>, StoreError> {
        get_json(self.kv.as_ref(), &storage_key(key))
    }

    /// Waits until no other holder works on `key` and returns its slot.
    pub async fn lock(&self, key: &str) -> ReminderSlot<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        ReminderSlot {
            store: self,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// Exclusive access to one key's entry, released on drop.
pub struct ReminderSlot<'a> {
    store: &'a ReminderStore,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ReminderSlot<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current(&self) -> Result<Option<StoredReminder>, StoreError> {
        self.store.get(&self.key)
    }

    /// Replaces the entry; an empty id set removes it.
    pub fn replace(&mut self, entry: &StoredReminder) -> Result<(), StoreError> {
        if entry.ids.is_empty() {
            return self.clear();
        }
        set_json(self.store.kv.as_ref(), &storage_key(&self.key), entry)
    }

    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.store.kv.delete(&storage_key(&self.key))
    }
}

impl Drop for ReminderSlot<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.store.locks.lock();
        // One reference in the table, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        kv::MemoryKvStore,
        model::{Cadence, Reminder, ReminderPayload},
        time::WallTime,
    };
    use chrono::TimeZone;

    fn entry(ids: &[&str]) -> StoredReminder {
        let reminder = Reminder::medicine(
            "med1",
            Cadence::Daily,
            WallTime::new(8, 0).unwrap(),
            ReminderPayload::new("Vitamin D", "One tablet"),
        );
        StoredReminder {
            signature: reminder.signature(),
            ids: ids.iter().map(|id| id.to_string()).collect(),
            scheduled_at: Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn replace_and_clear_round_trip() {
        let store = ReminderStore::new(Arc::new(MemoryKvStore::new()));
        {
            let mut slot = store.lock("med1").await;
            assert_eq!(slot.current().unwrap(), None);
            slot.replace(&entry(&["1", "2"])).unwrap();
            assert_eq!(slot.current().unwrap().unwrap().ids, vec!["1", "2"]);
        }
        assert_eq!(store.get("med1").unwrap().unwrap().ids.len(), 2);

        let mut slot = store.lock("med1").await;
        slot.replace(&entry(&[])).unwrap();
        assert_eq!(slot.current().unwrap(), None);
    }

    #[tokio::test]
    async fn same_key_waits_for_holder() {
        let store = ReminderStore::new(Arc::new(MemoryKvStore::new()));
        let held = store.lock("med1").await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), store.lock("med1")).await;
        assert!(blocked.is_err(), "second holder must wait");

        let other = tokio::time::timeout(Duration::from_millis(20), store.lock("med2")).await;
        assert!(other.is_ok(), "other keys stay free");
        drop(other);

        drop(held);
        let reacquired = tokio::time::timeout(Duration::from_millis(20), store.lock("med1")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let store = ReminderStore::new(Arc::new(MemoryKvStore::new()));
        {
            let _a = store.lock("a").await;
            let _b = store.lock("b").await;
            assert_eq!(store.lock_count(), 2);
        }
        assert_eq!(store.lock_count(), 0);
    }
}
