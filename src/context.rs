use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, TagDbError};
use crate::interface::SearchInterface;
use crate::merge::MergedReader;
use crate::persist::{FileStore, Store, StoreRole};
use crate::reader::StoreReader;
use crate::writer::StoreWriter;

// ------------- Settings -------------
fn default_create_user_store() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Where the stores live and how the binary logs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Base store files, highest priority first.
    #[serde(default)]
    pub base_stores: Vec<PathBuf>,
    #[serde(default)]
    pub user_store: Option<PathBuf>,
    /// Create the user store file when it does not exist yet.
    #[serde(default = "default_create_user_store")]
    pub create_user_store: bool,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_stores: Vec::new(),
            user_store: None,
            create_user_store: default_create_user_store(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Reads the optional settings file `name` (any extension the config
    /// crate understands), overridden by `TAGMERGE_*` environment variables.
    /// `TAGMERGE_BASE_STORES` takes a comma separated list.
    pub fn load(name: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(name).required(false))
            .add_source(
                Environment::with_prefix("TAGMERGE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("base_stores"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

// ------------- Context -------------
/// Owns every store handle of the process, together with the merged reader
/// over them and the writer for the user store.
#[derive(Debug)]
pub struct DatabaseContext {
    bases: Vec<Arc<Store>>,
    user: Option<Arc<Store>>,
    reader: Arc<MergedReader>,
    writer: Option<StoreWriter>,
}

impl DatabaseContext {
    /// Opens the configured files. Base stores must exist and are opened
    /// read-only; the user store is created when allowed.
    pub fn open(settings: &Settings) -> Result<Self> {
        if settings.base_stores.is_empty() && settings.user_store.is_none() {
            return Err(TagDbError::Config(
                "no base or user store configured".to_string(),
            ));
        }
        let mut bases = Vec::with_capacity(settings.base_stores.len());
        // configured highest first, merged lowest first
        for path in settings.base_stores.iter().rev() {
            if !path.exists() {
                return Err(TagDbError::Config(format!(
                    "base store {} does not exist",
                    path.display()
                )));
            }
            bases.push(Store::open(
                path.display().to_string(),
                StoreRole::Base,
                &FileStore::read_only(path),
            )?);
        }
        let user = match &settings.user_store {
            Some(path) => Some(open_user_store(path, settings.create_user_store)?),
            None => None,
        };
        Self::from_stores(bases, user)
    }

    /// Wires already opened stores. `bases` are ordered lowest priority
    /// first.
    pub fn from_stores(bases: Vec<Arc<Store>>, user: Option<Arc<Store>>) -> Result<Self> {
        let reader = Arc::new(MergedReader::new(
            bases.iter().cloned().map(StoreReader::new).collect(),
            user.clone().map(StoreReader::new),
        )?);
        let writer = match &user {
            Some(store) => Some(StoreWriter::new(Arc::clone(store), Some(Arc::clone(&reader)))?),
            None => None,
        };
        info!(
            bases = bases.len(),
            user = user.is_some(),
            "database context ready"
        );
        Ok(Self {
            bases,
            user,
            reader,
            writer,
        })
    }

    pub fn reader(&self) -> &Arc<MergedReader> {
        &self.reader
    }

    /// Fails when no user store is configured.
    pub fn writer(&self) -> Result<&StoreWriter> {
        self.writer.as_ref().ok_or_else(|| {
            TagDbError::Config("no user store is available for writing".to_string())
        })
    }

    pub fn search_interface(&self) -> SearchInterface {
        SearchInterface::new(Arc::clone(&self.reader))
    }

    /// Drops the reader and writer and closes each store. A store still
    /// shared elsewhere (a clone of the reader, a running search) closes when
    /// its last handle goes away.
    pub fn close(self) -> Result<()> {
        let Self {
            bases,
            user,
            reader,
            writer,
        } = self;
        drop(writer);
        drop(reader);
        for store in bases.into_iter().chain(user) {
            match Arc::try_unwrap(store) {
                Ok(store) => store.close()?,
                Err(store) => debug!(store = %store.label(), "store still shared, not closing"),
            }
        }
        Ok(())
    }
}

fn open_user_store(path: &Path, create: bool) -> Result<Arc<Store>> {
    if !path.exists() {
        if !create {
            return Err(TagDbError::Config(format!(
                "user store {} does not exist",
                path.display()
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                TagDbError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        info!(path = %path.display(), "creating user store");
    }
    Store::open(
        path.display().to_string(),
        StoreRole::User,
        &FileStore::writable(path),
    )
}
