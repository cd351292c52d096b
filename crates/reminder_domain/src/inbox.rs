use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::StoreError,
    kv::{get_json, set_json, KvStore},
    model::NotificationRecord,
};

const KEY_PREFIX: &str = "inbox:";

/// Persisted merged notification view, one list per user.
///
/// Every read-modify-write runs under one lock so a read mark cannot be lost
/// to a concurrent reconciliation.
pub struct Inbox {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl Inbox {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self, user_id: &str) -> Result<Vec<NotificationRecord>, StoreError> {
        Ok(get_json(self.kv.as_ref(), &storage_key(user_id))?.unwrap_or_default())
    }

    /// Applies `f` to the current list and stores what it returns.
    pub fn update<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut Vec<NotificationRecord>) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock();
        let mut records = self.snapshot(user_id)?;
        let out = f(&mut records);
        set_json(self.kv.as_ref(), &storage_key(user_id), &records)?;
        Ok(out)
    }

    pub fn mark_read(&self, user_id: &str, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.update(user_id, |records| {
            records
                .iter_mut()
                .find(|record| record.id == id)
                .map(|record| record.mark_read(at))
                .unwrap_or(false)
        })
    }

    pub fn mark_all_read(&self, user_id: &str, at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.update(user_id, |records| {
            records
                .iter_mut()
                .map(|record| record.mark_read(at))
                .filter(|changed| *changed)
                .count()
        })
    }

    pub fn unread_count(&self, user_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .snapshot(user_id)?
            .iter()
            .filter(|record| !record.is_read)
            .count())
    }

    pub fn clear_all(&self, user_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        self.kv.delete(&storage_key(user_id))
    }
}

fn storage_key(user_id: &str) -> String {
    format!("{KEY_PREFIX}{user_id}")
}
