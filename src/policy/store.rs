//! The policy data document
//!
//! A hierarchical JSON tree addressed by `/`-separated paths, with one
//! lock-scoped transaction per mutation. Reads take a snapshot, so
//! evaluations never observe a half-applied write.

use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};

use crate::error::Error;
use crate::Result;

/// An in-memory data document.
pub struct DataStore {
    root: Mutex<Value>,
}

impl Default for DataStore {
    fn default() -> Self {
        DataStore {
            root: Mutex::new(Value::Object(Map::new())),
        }
    }
}

fn lock(store: &DataStore) -> MutexGuard<'_, Value> {
    store.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Split a `/`-separated store path into segments.
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl DataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the value at the given path: replace an existing element or
    /// add a new one. Fails with `StoreNotFound` when an ancestor is
    /// missing and `StoreConflict` when an ancestor is not a mapping.
    pub fn write_item(&self, path: &str, value: &Value) -> Result<()> {
        let segments = segments(path);
        let (leaf, ancestors) = segments
            .split_last()
            .ok_or_else(|| Error::bad_input("empty store path"))?;

        let mut root = lock(self);
        let mut current = &mut *root;

        for segment in ancestors {
            current = match current {
                Value::Object(map) => map
                    .get_mut(*segment)
                    .ok_or_else(|| Error::StoreNotFound(path.to_string()))?,
                _ => return Err(Error::StoreConflict(path.to_string())),
            };
        }

        match current {
            Value::Object(map) => {
                map.insert(leaf.to_string(), value.clone());
                Ok(())
            }
            _ => Err(Error::StoreConflict(path.to_string())),
        }
    }

    /// Ensure each prefix of the path exists, adding missing elements as
    /// empty mappings. Existing elements are never overwritten; a
    /// non-mapping intermediate fails with `StoreConflict`.
    pub fn create_path(&self, path: &str) -> Result<()> {
        let segments = segments(path);

        let mut root = lock(self);
        let mut current = &mut *root;

        for (i, segment) in segments.iter().enumerate() {
            let map = match current {
                Value::Object(map) => map,
                _ => return Err(Error::StoreConflict(path.to_string())),
            };

            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));

            // A leaf value at the final element is preserved as-is; only
            // intermediates must be mappings.
            if !current.is_object() && i + 1 < segments.len() {
                return Err(Error::StoreConflict(path.to_string()));
            }
        }

        Ok(())
    }

    /// Remove the element at the given path. Fails with `StoreNotFound`
    /// when the path does not exist.
    pub fn remove(&self, path: &str) -> Result<()> {
        let segments = segments(path);
        let (leaf, ancestors) = segments
            .split_last()
            .ok_or_else(|| Error::bad_input("empty store path"))?;

        let mut root = lock(self);
        let mut current = &mut *root;

        for segment in ancestors {
            current = match current {
                Value::Object(map) => map
                    .get_mut(*segment)
                    .ok_or_else(|| Error::StoreNotFound(path.to_string()))?,
                _ => return Err(Error::StoreNotFound(path.to_string())),
            };
        }

        match current {
            Value::Object(map) => map
                .remove(*leaf)
                .map(|_| ())
                .ok_or_else(|| Error::StoreNotFound(path.to_string())),
            _ => Err(Error::StoreNotFound(path.to_string())),
        }
    }

    /// A consistent snapshot of the whole document.
    pub fn snapshot(&self) -> Value {
        lock(self).clone()
    }
}
