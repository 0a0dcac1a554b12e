#[macro_use]
mod common;

use shadow_engine::{ConfirmedRow, Error, LocalState, Operation, Query, ShadowDb, Storage, Value};

fn seed<S: Storage>(db: &ShadowDb<S>) {
    db.apply_confirmed_row("conversations", ConfirmedRow::new("c1").column("title", "General"))
        .unwrap();
    db.apply_confirmed_row(
        "messages",
        ConfirmedRow::new("m1")
            .column("conversation_id", "c1")
            .column("body", "hello")
            .column("status", "sent")
            .column("position", 1),
    )
    .unwrap();
}

fn insert_then_matching_confirmation<S: Storage>(db: ShadowDb<S>) {
    db.insert("conversations", "A").column("title", "x").commit().unwrap();

    let row = db.get("conversations", "A").unwrap().unwrap();
    assert_eq!(row.get_str("title"), Some("x"));
    assert_eq!(row.get_bool("archived"), Some(false));
    let local = db.local_row("conversations", "A").unwrap().unwrap();
    assert!(local.is_changed("title"));
    assert!(local.is_changed("archived"));

    let outcome = db
        .apply_confirmed_row("conversations", ConfirmedRow::new("A").column("title", "x").column("archived", false))
        .unwrap();
    assert_eq!(outcome.local, LocalState::Reconciled);
    assert!(db.local_row("conversations", "A").unwrap().is_none());

    let row = db.get("conversations", "A").unwrap().unwrap();
    assert_eq!(row.get_str("title"), Some("x"));
    assert_eq!(row.get_bool("archived"), Some(false));
}

fn stale_confirmation_keeps_local_value<S: Storage>(db: ShadowDb<S>) {
    db.apply_confirmed_row("conversations", ConfirmedRow::new("A").column("title", "x"))
        .unwrap();
    db.update("conversations", "A").column("archived", true).commit().unwrap();
    let local = db.local_row("conversations", "A").unwrap().unwrap();
    assert!(local.is_changed("archived"));
    assert_eq!(db.get("conversations", "A").unwrap().unwrap().get_bool("archived"), Some(true));

    db.apply_confirmed_row("conversations", ConfirmedRow::new("A").column("archived", false))
        .unwrap();
    let synced = db.synced_row("conversations", "A").unwrap().unwrap();
    assert_eq!(synced.get("archived"), &Value::Bool(false));
    let local = db.local_row("conversations", "A").unwrap().unwrap();
    assert_eq!(local.values.get("archived"), Some(&Value::Bool(true)));
    assert_eq!(db.get("conversations", "A").unwrap().unwrap().get_bool("archived"), Some(true));

    // A later local write back to the synced value supersedes the override.
    db.update("conversations", "A").column("archived", false).commit().unwrap();
    assert!(db.local_row("conversations", "A").unwrap().is_none());
}

fn reconciliation_is_idempotent<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    db.update("messages", "m1").column("body", "edited").column("status", "sent").commit().unwrap();

    let confirmation = ConfirmedRow::new("m1").column("status", "delivered").column("position", 2);
    db.apply_confirmed_row("messages", confirmation.clone()).unwrap();
    let once = db.all("messages").unwrap();
    let local_once = db.local_row("messages", "m1").unwrap();

    db.apply_confirmed_row("messages", confirmation).unwrap();
    assert_eq!(db.all("messages").unwrap(), once);
    assert_eq!(db.local_row("messages", "m1").unwrap(), local_once);
}

fn columns_reconcile_independently<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    db.update("messages", "m1").column("body", "edited").commit().unwrap();

    db.apply_confirmed_row("messages", ConfirmedRow::new("m1").column("status", "read"))
        .unwrap();

    let row = db.get("messages", "m1").unwrap().unwrap();
    assert_eq!(row.get_str("body"), Some("edited"));
    assert_eq!(row.get_str("status"), Some("read"));
    let local = db.local_row("messages", "m1").unwrap().unwrap();
    assert_eq!(local.changed_columns.iter().collect::<Vec<_>>(), vec!["body"]);
}

fn writing_the_synced_value_is_not_a_change<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    let receipt = db
        .update("messages", "m1")
        .column("body", "hello")
        .column("status", "sent")
        .column("position", 1)
        .commit()
        .unwrap();
    assert_eq!(receipt.operation, Operation::Update);
    assert!(db.local_row("messages", "m1").unwrap().is_none());

    db.update("messages", "m1").column("body", "hi").column("position", 1).commit().unwrap();
    let local = db.local_row("messages", "m1").unwrap().unwrap();
    assert!(local.is_changed("body"));
    assert!(!local.is_changed("position"));
}

fn partial_match_prunes_only_matching_columns<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    db.update("messages", "m1").column("body", "edited").column("status", "pending").commit().unwrap();

    let outcome = db
        .apply_confirmed_row("messages", ConfirmedRow::new("m1").column("body", "edited"))
        .unwrap();
    assert_eq!(outcome.pruned.iter().collect::<Vec<_>>(), vec!["body"]);
    let local = db.local_row("messages", "m1").unwrap().unwrap();
    assert_eq!(local.changed_columns.iter().collect::<Vec<_>>(), vec!["status"]);

    db.apply_confirmed_row("messages", ConfirmedRow::new("m1").column("status", "pending"))
        .unwrap();
    assert!(db.local_row("messages", "m1").unwrap().is_none());
}

fn deleted_rows_never_surface<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    db.delete("messages", "m1").unwrap();

    assert!(db.get("messages", "m1").unwrap().is_none());
    assert!(db.synced_row("messages", "m1").unwrap().is_some());
    assert!(db.all("messages").unwrap().is_empty());

    db.apply_confirmed_row("messages", ConfirmedRow::new("m1").column("body", "resurrected?"))
        .unwrap();
    assert!(db.get("messages", "m1").unwrap().is_none());
    assert!(matches!(db.update("messages", "m1").column("body", "x").commit(), Err(Error::NotFound { .. })));
    assert!(matches!(db.delete("messages", "m1"), Err(Error::NotFound { .. })));

    db.apply_confirmed_delete("messages", "m1").unwrap();
    assert!(db.local_row("messages", "m1").unwrap().is_none());
    assert!(db.synced_row("messages", "m1").unwrap().is_none());
}

fn acknowledged_delete_clears_both_tables<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    let receipt = db.delete("messages", "m1").unwrap();

    let report = db.acknowledge_upload(receipt.sequence).unwrap();
    assert_eq!(report.deletes_finalized, 1);
    assert!(db.local_row("messages", "m1").unwrap().is_none());
    assert!(db.synced_row("messages", "m1").unwrap().is_none());

    // The id can be reused afterwards.
    db.insert("messages", "m1")
        .column("conversation_id", "c1")
        .column("body", "again")
        .commit()
        .unwrap();
}

fn query_reads_the_merged_view<S: Storage>(db: ShadowDb<S>) {
    seed(&db);
    db.insert("messages", "m2")
        .column("conversation_id", "c1")
        .column("body", "second")
        .column("position", 2)
        .commit()
        .unwrap();
    db.insert("messages", "m3")
        .column("conversation_id", "c2")
        .column("body", "elsewhere")
        .commit()
        .unwrap();
    db.update("messages", "m1").column("position", 3).commit().unwrap();

    let rows = db
        .query(
            "messages",
            &Query::new().eq("conversation_id", "c1").order_by("position", shadow_engine::Order::Asc),
        )
        .unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.id().clone()).collect();
    assert_eq!(ids, vec![Value::from("m2"), Value::from("m1")]);

    let drafts = db.query("messages", &Query::new().eq("status", "draft")).unwrap();
    assert_eq!(drafts.len(), 2);

    let unpositioned = db.query("messages", &Query::new().is_null("position")).unwrap();
    assert_eq!(unpositioned.len(), 1);
    assert_eq!(unpositioned[0].id(), &Value::from("m3"));

    let err = db.query("messages", &Query::new().eq("nope", 1)).unwrap_err();
    assert!(matches!(err, Error::UnknownColumn { .. }));
}

on_every_backend!(
    insert_then_matching_confirmation,
    stale_confirmation_keeps_local_value,
    reconciliation_is_idempotent,
    columns_reconcile_independently,
    writing_the_synced_value_is_not_a_change,
    partial_match_prunes_only_matching_columns,
    deleted_rows_never_surface,
    acknowledged_delete_clears_both_tables,
    query_reads_the_merged_view,
);
