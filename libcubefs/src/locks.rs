//! Per-volume mutual exclusion for node operations.
//!
//! Stage, publish, unpublish and unstage of one volume are serialised; calls
//! for different volumes proceed in parallel.  Entries are removed from the
//! table once nobody holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::VolumeId;

type LockTable = DashMap<VolumeId, Arc<Mutex<()>>>;

#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    table: Arc<LockTable>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.  Access is released when the
    /// returned guard is dropped.
    pub async fn lock(&self, id: &VolumeId) -> VolumeGuard {
        let mutex = self
            .table
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        VolumeGuard {
            id: id.clone(),
            table: Arc::clone(&self.table),
            guard: Some(guard),
        }
    }

    /// Number of volumes currently locked or waited on.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub struct VolumeGuard {
    id: VolumeId,
    table: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VolumeGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table itself still references the mutex: no holder and no
        // waiter, so the entry can go.
        self.table
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
