use serde::{Deserialize, Serialize};

use crate::db::ShadowDb;
use crate::error::Result;
use crate::storage::Storage;

/// How much of the acknowledged ledger to keep. Entries not yet
/// acknowledged by the remote are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerRetention {
    KeepLast(usize),
    KeepAll,
}

impl Default for LedgerRetention {
    fn default() -> Self {
        LedgerRetention::KeepLast(1000)
    }
}

pub fn run_gc<S: Storage>(db: &ShadowDb<S>, policy: LedgerRetention) -> Result<usize> {
    let removed = match policy {
        LedgerRetention::KeepAll => 0,
        LedgerRetention::KeepLast(n) => db.storage().compact_changes(n)?,
    };
    if removed > 0 {
        tracing::debug!(removed, "compacted change ledger");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ShadowOptions};
    use crate::storage::{MemoryStorage, SqliteStorage};

    fn exercise<S: Storage>(mut db: ShadowDb<S>) {
        db.declare_table(
            "notes",
            vec![ColumnDef::text("id"), ColumnDef::text("body")],
            ShadowOptions::default(),
        )
        .unwrap();
        for i in 0..10 {
            db.insert("notes", format!("n{}", i)).column("body", "x").commit().unwrap();
        }

        // Nothing acknowledged yet: nothing may go.
        assert_eq!(run_gc(&db, LedgerRetention::KeepLast(0)).unwrap(), 0);

        db.acknowledge_upload(6).unwrap();
        assert_eq!(run_gc(&db, LedgerRetention::KeepAll).unwrap(), 0);
        assert_eq!(run_gc(&db, LedgerRetention::KeepLast(2)).unwrap(), 4);
        assert_eq!(run_gc(&db, LedgerRetention::KeepLast(2)).unwrap(), 0);

        let remaining: Vec<u64> = db.changes_since(0, 100).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(remaining, vec![5, 6, 7, 8, 9, 10]);

        // Sequences are never reused after compaction.
        let receipt = db.insert("notes", "n10").column("body", "y").commit().unwrap();
        assert_eq!(receipt.sequence, 11);
    }

    #[test]
    fn test_gc_sqlite() {
        exercise(ShadowDb::open_in_memory().unwrap());
    }

    #[test]
    fn test_gc_memory() {
        exercise(ShadowDb::with_storage(MemoryStorage::new()));
    }

    #[test]
    fn test_gc_sqlite_file_keeps_sequence_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::EngineConfig::with_path(dir.path().join("gc.db"));
        {
            let db = ShadowDb::<SqliteStorage>::open(config.clone()).unwrap();
            exercise(db);
        }
        let mut db = ShadowDb::<SqliteStorage>::open(config).unwrap();
        db.declare_table(
            "notes",
            vec![ColumnDef::text("id"), ColumnDef::text("body")],
            ShadowOptions::default(),
        )
        .unwrap();
        let receipt = db.insert("notes", "n11").column("body", "z").commit().unwrap();
        assert_eq!(receipt.sequence, 12);
    }
}
