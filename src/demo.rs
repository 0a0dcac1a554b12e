//! Scripted walkthroughs of the shadow-table lifecycle over a small chat
//! schema: optimistic local writes, sync, offline edits, concurrent column
//! edits and deletes.

use serde::Serialize;
use serde_json::Map;

use shadow_engine::{
    ColumnDef, ConfirmedRow, Error, LoopbackRemote, OnDeleteAction, Order, Query, Remote, Result, ShadowDb,
    ShadowOptions, Storage, SyncSession,
};

pub const TABLES: [&str; 2] = ["conversations", "messages"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DemoScenario {
    Basics,
    Offline,
    ConcurrentEdit,
    Deletes,
}

impl DemoScenario {
    pub const ALL: [DemoScenario; 4] = [
        DemoScenario::Basics,
        DemoScenario::Offline,
        DemoScenario::ConcurrentEdit,
        DemoScenario::Deletes,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            DemoScenario::Basics => "Optimistic writes",
            DemoScenario::Offline => "Offline edits",
            DemoScenario::ConcurrentEdit => "Concurrent column edits",
            DemoScenario::Deletes => "Deletes",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            DemoScenario::Basics => {
                "A new conversation and message are visible immediately, then reconciled away once the remote confirms them."
            }
            DemoScenario::Offline => {
                "Edits made while the remote is unreachable stay pending in the ledger and upload on reconnect."
            }
            DemoScenario::ConcurrentEdit => {
                "Another client changes one column while this one edits another; both edits survive."
            }
            DemoScenario::Deletes => {
                "A local delete hides the row at once and is finalized when the upload is acknowledged."
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TableSnapshot {
    pub table: String,
    pub rows: Vec<Map<String, serde_json::Value>>,
    pub pending_local: usize,
}

pub struct Demo<S: Storage> {
    pub db: ShadowDb<S>,
    pub remote: LoopbackRemote,
    session: SyncSession,
    log: Vec<String>,
}

pub fn declare_chat_schema<S: Storage>(db: &mut ShadowDb<S>) -> Result<()> {
    db.declare_table(
        "conversations",
        vec![
            ColumnDef::text("id"),
            ColumnDef::text("title").not_null(),
            ColumnDef::boolean("archived").not_null().default_value(false),
        ],
        ShadowOptions::default(),
    )?;
    db.declare_table(
        "messages",
        vec![
            ColumnDef::text("id"),
            ColumnDef::text("conversation_id")
                .not_null()
                .references("conversations", OnDeleteAction::Cascade),
            ColumnDef::text("role").not_null().default_value("user"),
            ColumnDef::text("body").not_null(),
            ColumnDef::text("status").not_null().default_value("draft"),
            ColumnDef::integer("position"),
        ],
        ShadowOptions { indexes: vec![vec!["conversation_id".to_string()]], ..ShadowOptions::default() },
    )?;
    Ok(())
}

impl<S: Storage> Demo<S> {
    pub fn new(mut db: ShadowDb<S>) -> Result<Self> {
        declare_chat_schema(&mut db)?;
        let session = SyncSession::from_config(db.config());
        Ok(Self { db, remote: LoopbackRemote::new(), session, log: Vec::new() })
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.log.push(message);
    }

    pub fn run(&mut self, scenario: DemoScenario) -> Result<()> {
        self.note(format!("== {} ==", scenario.title()));
        match scenario {
            DemoScenario::Basics => self.step_basics(),
            DemoScenario::Offline => self.step_offline(),
            DemoScenario::ConcurrentEdit => self.step_concurrent_edit(),
            DemoScenario::Deletes => self.step_deletes(),
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        let report = self.session.sync(&self.db, &mut self.remote)?;
        self.note(format!(
            "sync: uploaded {}, applied {}, reconciled {} rows",
            report.uploaded,
            report.rows_applied + report.deletes_applied,
            report.rows_reconciled
        ));
        Ok(())
    }

    fn pending(&self, table: &str, id: &str) -> Result<String> {
        Ok(match self.db.local_row(table, id)? {
            Some(local) if local.is_deleted => "pending delete".to_string(),
            Some(local) => format!(
                "pending [{}]",
                local.changed_columns.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            None => "in sync".to_string(),
        })
    }

    fn step_basics(&mut self) -> Result<()> {
        if self.db.get("conversations", "c1")?.is_none() {
            self.db.insert("conversations", "c1").column("title", "Trip planning").commit()?;
        }
        self.insert_message("m1", "Where should we go?", 1)?;
        let status = self.pending("messages", "m1")?;
        self.note(format!("m1 written locally: {status}"));

        self.sync()?;
        let status = self.pending("messages", "m1")?;
        self.note(format!("m1 after sync: {status}"));
        Ok(())
    }

    fn step_offline(&mut self) -> Result<()> {
        self.ensure_conversation("c1", "Trip planning")?;
        self.remote.set_offline(true);
        self.db.update("conversations", "c1").column("title", "Trip planning (Lisbon)").commit()?;
        self.insert_message("m2", "Lisbon it is", 2)?;

        match self.sync() {
            Err(Error::Transport(reason)) => {
                let queued = self.db.pending_changes(usize::MAX)?.len();
                self.note(format!("sync failed ({reason}); {queued} changes queued"));
            }
            other => other?,
        }
        let title = self.title("c1")?;
        self.note(format!("c1 reads \"{title}\" while offline"));

        self.remote.set_offline(false);
        self.sync()?;
        let status = self.pending("conversations", "c1")?;
        self.note(format!("c1 after reconnect: {status}"));
        Ok(())
    }

    fn step_concurrent_edit(&mut self) -> Result<()> {
        self.ensure_conversation("c1", "Trip planning")?;
        self.db.update("conversations", "c1").column("archived", true).commit()?;

        // Another client renames the conversation; that change arrives
        // before the local edit is uploaded.
        self.remote
            .push_external("conversations", ConfirmedRow::new("c1").column("title", "Lisbon 2027"));
        let pulled = self.remote.pull()?;
        let count = pulled.len();
        for change in pulled {
            if let Some(row) = change.into_row() {
                self.db.apply_confirmed_row("conversations", row)?;
            }
        }
        self.remote.ack_pulled(count)?;
        let status = self.pending("conversations", "c1")?;
        let archived = self
            .db
            .get("conversations", "c1")?
            .and_then(|r| r.get_bool("archived"))
            .unwrap_or(false);
        let title = self.title("c1")?;
        self.note(format!("c1 reads \"{title}\", archived={archived}: {status}"));

        self.sync()?;
        let status = self.pending("conversations", "c1")?;
        self.note(format!("c1 after sync: {status}"));
        Ok(())
    }

    fn step_deletes(&mut self) -> Result<()> {
        self.ensure_conversation("c1", "Trip planning")?;
        if self.db.get("messages", "m9")?.is_none() {
            self.db
                .insert("messages", "m9")
                .column("conversation_id", "c1")
                .column("body", "typo")
                .commit()?;
            self.sync()?;
        }

        self.db.delete("messages", "m9")?;
        let visible = self.db.get("messages", "m9")?.is_some();
        let status = self.pending("messages", "m9")?;
        self.note(format!("m9 deleted locally: visible={visible}, {status}"));

        self.sync()?;
        let synced = self.db.synced_row("messages", "m9")?.is_some();
        let local = self.db.local_row("messages", "m9")?.is_some();
        self.note(format!("m9 after sync: synced={synced}, local={local}"));
        Ok(())
    }

    fn insert_message(&mut self, id: &str, body: &str, position: i64) -> Result<()> {
        if self.db.get("messages", id)?.is_some() {
            self.db.update("messages", id).column("body", body).commit()?;
            return Ok(());
        }
        self.db
            .insert("messages", id)
            .column("conversation_id", "c1")
            .column("body", body)
            .column("position", position)
            .commit()?;
        Ok(())
    }

    fn ensure_conversation(&mut self, id: &str, title: &str) -> Result<()> {
        if self.db.get("conversations", id)?.is_none() {
            self.db.insert("conversations", id).column("title", title).commit()?;
            self.sync()?;
        }
        Ok(())
    }

    fn title(&self, id: &str) -> Result<String> {
        Ok(self
            .db
            .get("conversations", id)?
            .and_then(|r| r.get_str("title").map(str::to_string))
            .unwrap_or_default())
    }

    pub fn snapshot(&self) -> Result<Vec<TableSnapshot>> {
        TABLES
            .iter()
            .map(|&table| -> Result<TableSnapshot> {
                let rows = self.db.query(table, &Query::new().order_by("id", Order::Asc))?;
                let mut pending_local = 0;
                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    if self.db.local_row(table, row.id().clone())?.is_some() {
                        pending_local += 1;
                    }
                    let mut obj = Map::new();
                    obj.insert("id".to_string(), serde_json::to_value(row.id())?);
                    for (col, value) in row.columns() {
                        obj.insert(col.to_string(), serde_json::to_value(value)?);
                    }
                    out.push(obj);
                }
                Ok(TableSnapshot { table: table.to_string(), rows: out, pending_local })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadow_engine::MemoryStorage;

    #[test]
    fn test_all_scenarios_converge() {
        let mut demo = Demo::new(ShadowDb::open_in_memory().unwrap()).unwrap();
        for scenario in DemoScenario::ALL {
            demo.run(scenario).unwrap();
        }
        assert!(demo.db.pending_changes(100).unwrap().is_empty());

        let snapshot = demo.snapshot().unwrap();
        assert!(snapshot.iter().all(|t| t.pending_local == 0));
        let conversations = &snapshot[0];
        assert_eq!(conversations.rows.len(), 1);
        assert_eq!(conversations.rows[0]["title"], "Lisbon 2027");
        assert_eq!(conversations.rows[0]["archived"], true);
        let messages = &snapshot[1];
        assert_eq!(messages.rows.len(), 2);
    }

    #[test]
    fn test_offline_scenario_reports_queue() {
        let mut demo = Demo::new(ShadowDb::with_storage(MemoryStorage::new())).unwrap();
        demo.run(DemoScenario::Offline).unwrap();
        assert!(demo.log().iter().any(|l| l.contains("2 changes queued")));
        assert!(demo.log().last().unwrap().ends_with("in sync"));
    }
}
