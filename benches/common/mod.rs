#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shadow_engine::{
    ColumnDef, Columns, ConfirmedRow, MemoryStorage, ShadowDb, ShadowOptions, SqliteStorage, Storage, Value,
};

pub const FILE_COLUMNS: [&str; 8] = [
    "path",
    "filename",
    "extension",
    "size_bytes",
    "owner",
    "modified_at",
    "tags",
    "starred",
];

pub fn declare_files<S: Storage>(db: &mut ShadowDb<S>) {
    db.declare_table(
        "files",
        vec![
            ColumnDef::text("id"),
            ColumnDef::text("path").not_null(),
            ColumnDef::text("filename").not_null(),
            ColumnDef::text("extension"),
            ColumnDef::integer("size_bytes").not_null().default_value(0),
            ColumnDef::text("owner"),
            ColumnDef::integer("modified_at"),
            ColumnDef::text("tags"),
            ColumnDef::boolean("starred").not_null().default_value(false),
        ],
        ShadowOptions { indexes: vec![vec!["owner".to_string()]], ..ShadowOptions::default() },
    )
    .unwrap();
}

pub fn file_record(idx: usize) -> Columns {
    let dirs = ["Documents", "Pictures", "Videos", "Downloads", "Projects"];
    let exts = ["pdf", "jpg", "mp4", "txt", "rs"];
    let owners = ["alice", "bob", "carol", "david"];

    let mut record = Columns::new();
    record.insert("path".into(), format!("/{}/file_{}.{}", dirs[idx % 5], idx, exts[idx % 5]).into());
    record.insert("filename".into(), format!("file_{}.{}", idx, exts[idx % 5]).into());
    record.insert("extension".into(), exts[idx % 5].into());
    record.insert("size_bytes".into(), ((1000 + idx * 100) as i64).into());
    record.insert("owner".into(), owners[idx % 4].into());
    record.insert("modified_at".into(), (1704067200 + idx as i64).into());
    record.insert("tags".into(), "work,important".into());
    record.insert("starred".into(), (idx % 7 == 0).into());
    record
}

pub fn file_id(idx: usize) -> String {
    format!("file_{}", idx)
}

pub fn confirmed_file(idx: usize) -> ConfirmedRow {
    let mut row = ConfirmedRow::new(file_id(idx));
    row.values = file_record(idx);
    row
}

pub fn sqlite_files() -> ShadowDb<SqliteStorage> {
    let mut db = ShadowDb::open_in_memory().unwrap();
    declare_files(&mut db);
    db
}

pub fn memory_files() -> ShadowDb<MemoryStorage> {
    let mut db = ShadowDb::with_storage(MemoryStorage::new());
    declare_files(&mut db);
    db
}

/// `rows` files, all confirmed by the remote.
pub fn synced_files<S: Storage>(db: &ShadowDb<S>, rows: usize) {
    for i in 0..rows {
        db.apply_confirmed_row("files", confirmed_file(i)).unwrap();
    }
}

/// A local edit to one random column of a random row among `rows`.
pub fn random_edit(rng: &mut StdRng, rows: usize) -> (String, &'static str, Value) {
    let idx = rng.gen_range(0..rows);
    match rng.gen_range(0..3) {
        0 => (file_id(idx), "tags", format!("tag-{}", rng.gen::<u16>()).into()),
        1 => (file_id(idx), "starred", rng.gen::<bool>().into()),
        _ => (file_id(idx), "size_bytes", rng.gen_range(0..1_000_000i64).into()),
    }
}

pub fn seeded_rng() -> StdRng {
    StdRng::seed_from_u64(0x5eed)
}
