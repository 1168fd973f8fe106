// used for persistence
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use roaring::RoaringTreemap;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{Result, TagDbError};

// ------------- Connection factories -------------
/// Produces the connection a store handle is bound to. The handle does not
/// care whether the file was downloaded, copied or created fresh.
pub trait ConnectionFactory {
    fn connect(&self) -> rusqlite::Result<Connection>;
    /// Read-only connections skip schema creation.
    fn read_only(&self) -> bool {
        false
    }
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> rusqlite::Result<Connection>,
{
    fn connect(&self) -> rusqlite::Result<Connection> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    pub path: PathBuf,
    pub read_only: bool,
}
impl FileStore {
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: true,
        }
    }
    pub fn writable(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
        }
    }
}
impl ConnectionFactory for FileStore {
    fn connect(&self) -> rusqlite::Result<Connection> {
        if self.read_only {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        } else {
            Connection::open(&self.path)
        }
    }
    fn read_only(&self) -> bool {
        self.read_only
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStore;
impl ConnectionFactory for MemoryStore {
    fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open_in_memory()
    }
}

// ------------- Store -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreRole {
    /// Externally distributed, immutable for the process lifetime.
    Base,
    /// The single local store that accepts writes.
    User,
}
impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreRole::Base => write!(f, "base"),
            StoreRole::User => write!(f, "user"),
        }
    }
}

/// One physical store. Every operation runs inside a single scoped
/// transaction while holding the handle's lock; nothing spans two stores.
pub struct Store {
    label: String,
    role: StoreRole,
    connection: Mutex<Connection>,
}

impl Store {
    pub fn open(
        label: impl Into<String>,
        role: StoreRole,
        factory: &dyn ConnectionFactory,
    ) -> Result<Arc<Store>> {
        let label = label.into();
        let connection = factory.connect()?;
        // Foreign keys are off by default in SQLite.
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        if !factory.read_only() {
            create_schema(&connection)?;
        }
        info!(store = %label, %role, read_only = factory.read_only(), "opened store");
        Ok(Arc::new(Store {
            label,
            role,
            connection: Mutex::new(connection),
        }))
    }
    pub fn open_in_memory(label: impl Into<String>, role: StoreRole) -> Result<Arc<Store>> {
        Self::open(label, role, &MemoryStore)
    }
    pub fn label(&self) -> &str {
        &self.label
    }
    pub fn role(&self) -> StoreRole {
        self.role
    }
    /// Runs `work` in a deferred transaction that is never committed.
    pub fn read<T>(&self, work: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|e| TagDbError::Lock(format!("{}: {}", self.label, e)))?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Deferred)?;
        work(&tx)
    }
    /// Runs `work` in an immediate transaction; commits on success and rolls
    /// back on any error, so a failed write leaves no trace.
    pub fn write<T>(&self, work: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|e| TagDbError::Lock(format!("{}: {}", self.label, e)))?;
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match work(&tx) {
            Ok(value) => {
                tx.commit().map_err(TagDbError::from_write)?;
                Ok(value)
            }
            Err(e) => {
                debug!(store = %self.label, error = %e, "rolling back");
                tx.rollback()?;
                Err(e)
            }
        }
    }
    /// Closes the underlying connection, surfacing any error SQLite reports.
    pub fn close(self) -> Result<()> {
        let connection = self
            .connection
            .into_inner()
            .map_err(|e| TagDbError::Lock(format!("{}: {}", self.label, e)))?;
        connection.close().map_err(|(_, e)| TagDbError::from(e))?;
        debug!(store = %self.label, "closed store");
        Ok(())
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Store")
            .field("label", &self.label)
            .field("role", &self.role)
            .finish()
    }
}

/// Identifier sets travel to SQLite as a single JSON array parameter, expanded
/// with `json_each`, so a bulk lookup stays one statement however many ids it
/// covers.
pub fn id_array(ids: &RoaringTreemap) -> Result<String> {
    Ok(serde_json::to_string(&ids.iter().collect::<Vec<u64>>())?)
}

// ------------- Schema -------------
// Mirrors the distributed store files column for column, so existing files
// are read as they are. The "STRICT" keyword is avoided for compatibility
// with external tooling.
fn create_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        create table if not exists TAGS (
            tag_id integer not null,
            source_tag varchar not null,
            tag varchar not null,
            created_at datetime default (CURRENT_TIMESTAMP),
            updated_at datetime default (CURRENT_TIMESTAMP),
            primary key (tag_id),
            constraint uix_tag unique (tag)
        );
        create table if not exists TAG_FORMATS (
            format_id integer not null,
            format_name varchar not null,
            description varchar,
            primary key (format_id),
            unique (format_name)
        );
        create table if not exists TAG_TYPE_NAME (
            type_name_id integer not null,
            type_name varchar not null,
            description varchar,
            primary key (type_name_id),
            unique (type_name)
        );
        create table if not exists TAG_TYPE_FORMAT_MAPPING (
            format_id integer not null,
            type_id integer not null,
            type_name_id integer not null,
            description varchar,
            primary key (format_id, type_id),
            foreign key (format_id) references TAG_FORMATS (format_id),
            foreign key (type_name_id) references TAG_TYPE_NAME (type_name_id)
        );
        create table if not exists TAG_STATUS (
            tag_id integer not null,
            format_id integer not null,
            type_id integer not null,
            alias boolean not null,
            preferred_tag_id integer not null,
            deprecated boolean default '0' not null,
            deprecated_at datetime,
            source_created_at datetime,
            created_at datetime default (CURRENT_TIMESTAMP),
            updated_at datetime default (CURRENT_TIMESTAMP),
            primary key (tag_id, format_id),
            foreign key (tag_id) references TAGS (tag_id),
            foreign key (format_id) references TAG_FORMATS (format_id),
            foreign key (preferred_tag_id) references TAGS (tag_id),
            foreign key (format_id, type_id)
                references TAG_TYPE_FORMAT_MAPPING (format_id, type_id),
            constraint ck_preferred_tag_consistency check (
                (alias = false and preferred_tag_id = tag_id) or
                (alias = true and preferred_tag_id != tag_id)
            )
        );
        create table if not exists TAG_TRANSLATIONS (
            translation_id integer not null,
            tag_id integer not null,
            language varchar,
            translation varchar,
            created_at datetime default (CURRENT_TIMESTAMP),
            updated_at datetime default (CURRENT_TIMESTAMP),
            primary key (translation_id),
            foreign key (tag_id) references TAGS (tag_id),
            constraint uix_tag_lang_trans unique (tag_id, language, translation)
        );
        create table if not exists TAG_USAGE_COUNTS (
            tag_id integer not null,
            format_id integer not null,
            count integer not null,
            created_at datetime default (CURRENT_TIMESTAMP),
            updated_at datetime default (CURRENT_TIMESTAMP),
            primary key (tag_id, format_id),
            foreign key (tag_id) references TAGS (tag_id),
            foreign key (format_id) references TAG_FORMATS (format_id),
            constraint uix_tag_format unique (tag_id, format_id)
        );
        create table if not exists DATABASE_METADATA (
            key varchar not null,
            value varchar not null,
            primary key (key)
        );
        ",
    )?;
    Ok(())
}
