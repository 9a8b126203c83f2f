//! In-memory backing store for tests and local development.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use weft_core::storage::StorageError;

use super::KvBackend;

/// A [`KvBackend`] held entirely in process memory.
///
/// Shares the Redis backend's semantics (string values, glob scans, sets) so
/// the same adapter and manager code runs against either.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, String>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Match a Redis-style glob pattern (`*` and `?`) against a key.
fn glob_match(pattern: &str, key: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = key.chars().collect();

    fn matches(pat: &[char], txt: &[char]) -> bool {
        match (pat.first(), txt.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&pat[1..], txt) || (!txt.is_empty() && matches(pat, &txt[1..]))
            }
            (Some('?'), Some(_)) => matches(&pat[1..], &txt[1..]),
            (Some(p), Some(t)) if p == t => matches(&pat[1..], &txt[1..]),
            _ => false,
        }
    }

    matches(&pat, &txt)
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.lock().expect("kv lock").get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data
            .lock()
            .expect("kv lock")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.lock().expect("kv lock").remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.lock().expect("kv lock").contains_key(key))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .lock()
            .expect("kv lock")
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.sets
            .lock()
            .expect("set lock")
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StorageError> {
        if let Some(set) = self.sets.lock().expect("set lock").get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .sets
            .lock()
            .expect("set lock")
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
