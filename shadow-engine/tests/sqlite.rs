mod common;

use std::sync::Arc;
use std::thread;

use shadow_engine::{ConfirmedRow, EngineConfig, Error, JournalMode, Operation, ShadowDb, SqliteStorage};

fn open_at(path: &std::path::Path) -> ShadowDb<SqliteStorage> {
    let mut db = ShadowDb::open(EngineConfig::with_path(path)).unwrap();
    common::declare_chat(&mut db);
    db
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");

    {
        let db = open_at(&path);
        db.apply_confirmed_row("conversations", ConfirmedRow::new("c1").column("title", "General"))
            .unwrap();
        db.update("conversations", "c1").column("archived", true).commit().unwrap();
        db.insert("conversations", "c2").column("title", "Draft").commit().unwrap();
        db.acknowledge_upload(1).unwrap();
    }

    let db = open_at(&path);
    let local = db.local_row("conversations", "c1").unwrap().unwrap();
    assert!(local.is_changed("archived"));
    assert_eq!(db.get("conversations", "c1").unwrap().unwrap().get_bool("archived"), Some(true));
    assert_eq!(db.all("conversations").unwrap().len(), 2);

    assert_eq!(db.acknowledged_through().unwrap(), 1);
    let pending = db.pending_changes(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Insert);

    let receipt = db.delete("conversations", "c2").unwrap();
    assert_eq!(receipt.sequence, 3);
}

#[test]
fn test_ledger_failure_rolls_back_local_write() {
    let db = common::sqlite_db();
    db.apply_confirmed_row("conversations", ConfirmedRow::new("c1").column("title", "General"))
        .unwrap();
    db.storage()
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_conversation_changes BEFORE INSERT ON _shadow_changes
                 WHEN NEW.table_name = 'conversations'
                 BEGIN SELECT RAISE(ABORT, 'ledger rejected'); END;",
            )
        })
        .unwrap();

    let err = db.update("conversations", "c1").column("title", "Renamed").commit().unwrap_err();
    assert!(matches!(err, Error::Transaction { ref table, .. } if table == "conversations"));
    assert!(db.local_row("conversations", "c1").unwrap().is_none());
    assert_eq!(db.get("conversations", "c1").unwrap().unwrap().get_str("title"), Some("General"));

    let err = db.insert("conversations", "c2").column("title", "New").commit().unwrap_err();
    assert!(matches!(err, Error::Transaction { .. }));
    assert!(db.get("conversations", "c2").unwrap().is_none());
    assert!(db.changes_since(0, 10).unwrap().is_empty());
}

#[test]
fn test_merged_view_is_read_only() {
    let db = common::sqlite_db();
    let result = db.storage().with_connection(|conn| {
        conn.execute("INSERT INTO conversations (id, title) VALUES ('x', 'y')", [])
    });
    assert!(matches!(result, Err(Error::Storage(_))));
}

#[test]
fn test_merged_view_supports_joins() {
    let db = common::sqlite_db();
    db.insert("conversations", "c1").column("title", "General").commit().unwrap();
    db.insert("messages", "m1")
        .column("conversation_id", "c1")
        .column("body", "hello")
        .commit()
        .unwrap();

    let titles: Vec<(String, String)> = db
        .storage()
        .with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.body, c.title FROM messages m JOIN conversations c ON c.id = m.conversation_id",
            )?;
            let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect()
        })
        .unwrap();
    assert_eq!(titles, vec![("hello".to_string(), "General".to_string())]);
}

#[test]
fn test_concurrent_writes_get_sequences_in_commit_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig { journal_mode: JournalMode::Wal, ..EngineConfig::with_path(dir.path().join("c.db")) };
    let mut db = ShadowDb::open(config).unwrap();
    common::declare_chat(&mut db);
    let db = Arc::new(db);

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        db.insert("conversations", format!("w{w}-{i}"))
                            .column("title", format!("{w}/{i}"))
                            .commit()
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut receipts = Vec::new();
    for writer in writers {
        let mine = writer.join().unwrap();
        // Each thread sees its own writes committed in issue order.
        assert!(mine.windows(2).all(|w| w[0].sequence < w[1].sequence));
        receipts.extend(mine);
    }

    let ledger = db.changes_since(0, 1000).unwrap();
    assert_eq!(ledger.len(), 200);
    assert!(ledger.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    assert!(ledger.windows(2).all(|w| w[0].logical_clock < w[1].logical_clock));

    receipts.sort_by_key(|r| r.sequence);
    let ledger_ids: Vec<_> = ledger.iter().map(|e| e.write_id.clone()).collect();
    let receipt_ids: Vec<_> = receipts.iter().map(|r| r.write_id.clone()).collect();
    assert_eq!(ledger_ids, receipt_ids);
    assert_eq!(db.all("conversations").unwrap().len(), 200);
}

#[test]
fn test_point_reads_proceed_while_another_writer_holds_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    let config = EngineConfig { busy_timeout_ms: 50, ..EngineConfig::with_path(&path) };

    let mut reader = ShadowDb::open(config.clone()).unwrap();
    common::declare_chat(&mut reader);
    reader.insert("conversations", "c1").column("title", "General").commit().unwrap();
    let mut writer = ShadowDb::open(config).unwrap();
    common::declare_chat(&mut writer);

    writer.storage().with_connection(|conn| conn.execute_batch("BEGIN IMMEDIATE")).unwrap();

    assert!(reader.local_row("conversations", "c1").unwrap().is_some());
    assert!(reader.synced_row("conversations", "c1").unwrap().is_none());
    assert_eq!(reader.acknowledged_through().unwrap(), 0);
    let err = reader.update("conversations", "c1").column("archived", true).commit().unwrap_err();
    assert!(matches!(err, Error::Transaction { .. }));

    writer.storage().with_connection(|conn| conn.execute_batch("ROLLBACK")).unwrap();
    reader.update("conversations", "c1").column("archived", true).commit().unwrap();
}
