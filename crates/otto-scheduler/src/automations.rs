//! Typed access to the persisted automation list.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use otto_store::{AUTOMATIONS_KEY, KeyLocks, PersistentStore, runs_key};
use otto_types::Automation;

use crate::Result;

/// Reads and rewrites the automation list stored under one key.
///
/// Every mutation takes the list's lock, reloads, applies the change,
/// and writes the whole list back.
pub struct AutomationStore {
    store: Arc<dyn PersistentStore>,
    locks: Arc<KeyLocks>,
}

impl AutomationStore {
    pub fn new(store: Arc<dyn PersistentStore>, locks: Arc<KeyLocks>) -> Self {
        Self { store, locks }
    }

    /// Load the full automation list (empty when nothing is stored).
    pub async fn list(&self) -> Result<Vec<Automation>> {
        match self.store.read(AUTOMATIONS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Find one automation by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Automation>> {
        Ok(self.list().await?.into_iter().find(|a| a.id == id))
    }

    /// Append a new automation.
    pub async fn insert(&self, automation: Automation) -> Result<()> {
        self.update_list(|list| list.push(automation)).await
    }

    /// Remove an automation and its run history. Returns false when the
    /// ID is unknown.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self
            .update_list(|list| {
                let before = list.len();
                list.retain(|a| a.id != id);
                list.len() != before
            })
            .await?;
        if removed {
            self.store.delete(&runs_key(id)).await?;
        }
        Ok(removed)
    }

    /// Set the enabled flag. Returns false when the ID is unknown.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        self.update_list(|list| {
            match list.iter_mut().find(|a| a.id == id) {
                Some(automation) => {
                    automation.enabled = enabled;
                    true
                }
                None => false,
            }
        })
        .await
    }

    /// Advance an automation's last fire time.
    pub async fn touch_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_list(|list| {
            if let Some(automation) = list.iter_mut().find(|a| a.id == id) {
                automation.last_run_at = Some(at);
            }
        })
        .await
    }

    /// Read-modify-write the list under its key lock.
    async fn update_list<F, T>(&self, apply: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Automation>) -> T,
    {
        let _guard = self.locks.acquire(AUTOMATIONS_KEY).await;
        let mut list = self.list().await?;
        let out = apply(&mut list);
        self.store
            .write(AUTOMATIONS_KEY, serde_json::to_value(&list)?)
            .await?;
        Ok(out)
    }
}
