//! tagmerge – one logical tag database over several physical ones.
//!
//! Image-annotation tags come from independently authored stores: a few
//! read-only *base* stores distributed as SQLite files, plus one writable
//! *user* store where local tags, aliases, translations and usage counts are
//! registered. This crate presents all of them as a single, consistent
//! vocabulary.
//!
//! * A [`construct::Tag`] is identified by its canonical string across
//!   stores; its numeric id is only meaningful inside the store that issued
//!   it.
//! * A [`construct::TagStatus`] places a tag in a *format* (a tagging
//!   vocabulary such as `danbooru`): its type, and whether it is an alias of
//!   a preferred tag.
//! * Translations are additive, usage counts are per format, and a missing
//!   usage row means a count of zero.
//!
//! ## Modules
//! * [`persist`] – store handles, connection factories and the schema.
//! * [`reader`] – read access to one store, including the local search.
//! * [`query`], [`preload`], [`assemble`] – the search pipeline: candidate
//!   narrowing over roaring bitmaps, bulk preloading, row assembly.
//! * [`merge`] – the [`merge::MergedReader`] over all stores.
//! * [`writer`] – the [`writer::StoreWriter`] for the user store, with
//!   identifier-collision avoidance against the base stores.
//! * [`context`] – settings and the [`context::DatabaseContext`] owning all
//!   handles.
//! * [`interface`] – background searches and cancellation tokens.
//!
//! ## Quick Start
//! ```
//! use tagmerge::construct::{SearchFilters, TagRegisterRequest};
//! use tagmerge::context::DatabaseContext;
//! use tagmerge::persist::{Store, StoreRole};
//!
//! let user = Store::open_in_memory("user", StoreRole::User)?;
//! let context = DatabaseContext::from_stores(Vec::new(), Some(user))?;
//! context
//!     .writer()?
//!     .register_tag(&TagRegisterRequest::new("long_hair", "danbooru", "general"))?;
//! let rows = context
//!     .reader()
//!     .search_tags("long hair", &SearchFilters::in_format("danbooru"))?;
//! assert_eq!(rows[0].type_name.as_deref(), Some("general"));
//! context.close()?;
//! # Ok::<(), tagmerge::TagDbError>(())
//! ```

pub mod assemble;
pub mod construct;
pub mod context;
pub mod error;
pub mod interface;
pub mod merge;
pub mod persist;
pub mod preload;
pub mod query;
pub mod reader;
pub mod writer;

pub use error::{Result, TagDbError};
