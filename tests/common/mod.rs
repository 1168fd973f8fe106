#![allow(dead_code)]

use std::sync::Arc;

use tagmerge::context::DatabaseContext;
use tagmerge::persist::{Store, StoreRole};

/// Vocabulary shared by most fixtures: format 1 `danbooru` with types
/// `general` (0) and `character` (4).
pub const DANBOORU: &str = "
    insert into TAG_FORMATS (format_id, format_name) values (1, 'danbooru');
    insert into TAG_TYPE_NAME (type_name_id, type_name) values (1, 'general'), (2, 'character');
    insert into TAG_TYPE_FORMAT_MAPPING (format_id, type_id, type_name_id) values (1, 0, 1), (1, 4, 2);
";

/// An in-memory base store populated with `sql`.
pub fn base_store(label: &str, sql: &str) -> Arc<Store> {
    let store = Store::open_in_memory(label, StoreRole::Base).unwrap();
    store
        .write(|c| {
            c.execute_batch(sql)?;
            Ok(())
        })
        .unwrap();
    store
}

pub fn user_store() -> Arc<Store> {
    Store::open_in_memory("user", StoreRole::User).unwrap()
}

/// Bases lowest priority first, plus an empty user store.
pub fn context(bases: Vec<Arc<Store>>) -> DatabaseContext {
    DatabaseContext::from_stores(bases, Some(user_store())).unwrap()
}
