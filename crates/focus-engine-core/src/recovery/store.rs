//! Recovery store contract and an in-memory implementation.
//!
//! The SQLite-backed store lives with the rest of the database code in
//! [`crate::storage::Database`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::snapshot::RecoverySnapshot;
use crate::error::PersistenceError;

/// Durable home of the single in-flight session's snapshot.
///
/// A successful `save` must survive immediate process termination.
pub trait RecoveryStore: Send + Sync {
    /// Upsert the snapshot. Last writer wins by `last_persisted_at`: a
    /// snapshot older than the stored one is ignored.
    fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), PersistenceError>;

    /// Last durable snapshot, if any.
    fn load(&self) -> Result<Option<RecoverySnapshot>, PersistenceError>;

    /// Delete the snapshot if it belongs to `session_id`.
    fn clear(&self, session_id: &str) -> Result<(), PersistenceError>;

    /// Drop whatever is stored, readable or not.
    fn purge(&self) -> Result<(), PersistenceError>;
}

/// Whether `incoming` should replace `stored`.
pub(crate) fn supersedes(incoming: &RecoverySnapshot, stored: Option<&RecoverySnapshot>) -> bool {
    match stored {
        Some(existing) => incoming.last_persisted_at >= existing.last_persisted_at,
        None => true,
    }
}

/// Process-local store for tests and environments without disk.
///
/// Writes can be switched to fail to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryRecoveryStore {
    slot: Mutex<Option<RecoverySnapshot>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RecoverySnapshot) -> Self {
        Self {
            slot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn peek(&self) -> Option<RecoverySnapshot> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl RecoveryStore for MemoryRecoveryStore {
    fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed("store unavailable".into()));
        }
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| PersistenceError::WriteFailed("Failed to lock snapshot slot".into()))?;
        if !supersedes(snapshot, slot.as_ref()) {
            debug!(session_id = %snapshot.session_id, "Ignoring snapshot older than stored one");
            return Ok(());
        }
        *slot = Some(snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Option<RecoverySnapshot>, PersistenceError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| PersistenceError::ReadFailed("Failed to lock snapshot slot".into()))?;
        Ok(slot.clone())
    }

    fn clear(&self, session_id: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed("store unavailable".into()));
        }
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| PersistenceError::WriteFailed("Failed to lock snapshot slot".into()))?;
        if slot.as_ref().is_some_and(|s| s.session_id == session_id) {
            *slot = None;
        }
        Ok(())
    }

    fn purge(&self) -> Result<(), PersistenceError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| PersistenceError::WriteFailed("Failed to lock snapshot slot".into()))?;
        *slot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::snapshot::SNAPSHOT_VERSION;
    use crate::timer::SessionType;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn snap(id: &str, at: DateTime<Utc>) -> RecoverySnapshot {
        RecoverySnapshot {
            version: SNAPSHOT_VERSION,
            session_id: id.into(),
            session_type: SessionType::Focus,
            planned_duration_ms: 60_000,
            start_time: at,
            paused_duration_ms: 0,
            pause_timestamps: vec![],
            resume_timestamps: vec![],
            task_id: None,
            metadata: BTreeMap::new(),
            last_persisted_at: at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn older_snapshot_loses() {
        let store = MemoryRecoveryStore::new();
        store.save(&snap("a", t0() + Duration::seconds(10))).unwrap();
        store.save(&snap("a", t0())).unwrap();
        assert_eq!(
            store.load().unwrap().unwrap().last_persisted_at,
            t0() + Duration::seconds(10)
        );
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn clear_only_removes_matching_session() {
        let store = MemoryRecoveryStore::new();
        store.save(&snap("a", t0())).unwrap();
        store.clear("b").unwrap();
        assert!(store.load().unwrap().is_some());
        store.clear("a").unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn failing_writes_surface_errors() {
        let store = MemoryRecoveryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save(&snap("a", t0())),
            Err(PersistenceError::WriteFailed(_))
        ));
        assert!(store.peek().is_none());
    }
}
