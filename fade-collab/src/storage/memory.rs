//! In-memory snapshot store for tests and single-process setups.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{ProjectSnapshot, SnapshotStore, StoreError};

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, ProjectSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, code: &str, snapshot: &ProjectSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.to_owned(), snapshot.clone());
        Ok(())
    }

    fn load(&self, code: &str) -> Result<Option<ProjectSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .cloned())
    }

    fn delete(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(code)
            .is_some())
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut codes: Vec<String> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        codes.sort();
        Ok(codes)
    }
}
