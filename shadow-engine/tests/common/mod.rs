#![allow(dead_code, unused_macros)]

use shadow_engine::{
    ColumnDef, Columns, MemoryStorage, OnDeleteAction, ShadowDb, ShadowOptions, SqliteStorage, Storage, Value,
};

pub fn declare_chat<S: Storage>(db: &mut ShadowDb<S>) {
    db.declare_table(
        "conversations",
        vec![
            ColumnDef::text("id"),
            ColumnDef::text("title").not_null(),
            ColumnDef::boolean("archived").not_null().default_value(false),
        ],
        ShadowOptions::default(),
    )
    .unwrap();
    db.declare_table(
        "messages",
        vec![
            ColumnDef::text("id"),
            ColumnDef::text("conversation_id")
                .not_null()
                .references("conversations", OnDeleteAction::Cascade),
            ColumnDef::text("body").not_null(),
            ColumnDef::text("status").not_null().default_value("draft"),
            ColumnDef::integer("position"),
        ],
        ShadowOptions { indexes: vec![vec!["conversation_id".to_string()]], ..ShadowOptions::default() },
    )
    .unwrap();
}

pub fn sqlite_db() -> ShadowDb<SqliteStorage> {
    let mut db = ShadowDb::open_in_memory().unwrap();
    declare_chat(&mut db);
    db
}

pub fn memory_db() -> ShadowDb<MemoryStorage> {
    let mut db = ShadowDb::with_storage(MemoryStorage::new());
    declare_chat(&mut db);
    db
}

pub fn cols(pairs: &[(&str, Value)]) -> Columns {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Expands each generic `fn name<S: Storage>(db: ShadowDb<S>)` into one
/// test per backend.
macro_rules! on_every_backend {
    ($($name:ident),* $(,)?) => {
        mod sqlite {
            $(
                #[test]
                fn $name() {
                    super::$name(super::common::sqlite_db());
                }
            )*
        }

        mod memory {
            $(
                #[test]
                fn $name() {
                    super::$name(super::common::memory_db());
                }
            )*
        }
    };
}
