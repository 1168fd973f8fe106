use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Params, params};
use tracing::{debug, info};

use crate::construct::{
    FormatId, NewTag, TagId, TagRegisterRequest, TagRegisterResult, TagStatus, TagStatusUpdate,
    TagTypeUpdate, Timestamp, TypeId, TypeNameId, normalize_tag,
};
use crate::error::{Result, TagDbError};
use crate::interface::CancelToken;
use crate::merge::MergedReader;
use crate::persist::{Store, StoreRole};
use crate::reader::{StoreReader, find_tag_id, max_format_id, max_tag_id};

// ------------- Statements -------------
// Every write goes through here so constraint failures surface as
// validation errors.
fn exec<P: Params>(c: &Connection, sql: &str, params: P) -> Result<usize> {
    c.execute(sql, params).map_err(TagDbError::from_write)
}

fn tag_text(c: &Connection, tag_id: TagId) -> Result<Option<String>> {
    Ok(c
        .query_row("select tag from TAGS where tag_id = ?1", params![tag_id], |r| {
            r.get(0)
        })
        .optional()?)
}

fn format_exists(c: &Connection, format_id: FormatId) -> Result<bool> {
    Ok(c
        .query_row(
            "select 1 from TAG_FORMATS where format_id = ?1",
            params![format_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn type_id_for_name_id(
    c: &Connection,
    format_id: FormatId,
    type_name_id: TypeNameId,
) -> Result<Option<TypeId>> {
    Ok(c
        .query_row(
            "
            select type_id from TAG_TYPE_FORMAT_MAPPING
            where format_id = ?1 and type_name_id = ?2
            order by type_id limit 1
            ",
            params![format_id, type_name_id],
            |r| r.get(0),
        )
        .optional()?)
}

fn format_id_by_name(c: &Connection, format_name: &str) -> Result<Option<FormatId>> {
    Ok(c
        .query_row(
            "select format_id from TAG_FORMATS where format_name = ?1",
            params![format_name],
            |r| r.get(0),
        )
        .optional()?)
}

fn mapping_exists(c: &Connection, format_id: FormatId, type_id: TypeId) -> Result<bool> {
    Ok(c
        .query_row(
            "select 1 from TAG_TYPE_FORMAT_MAPPING where format_id = ?1 and type_id = ?2",
            params![format_id, type_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// The id following `max`, refusing to wrap around.
fn next_id(max: i64, kind: &str) -> Result<i64> {
    max.checked_add(1)
        .ok_or_else(|| TagDbError::validation(format!("no {kind} id left above {max}")))
}

/// Inserts a tag. With a watermark the id is chosen above every id known to
/// the merged view; without one SQLite picks it.
fn insert_tag(
    c: &Connection,
    watermark: Option<TagId>,
    source_tag: &str,
    tag: &str,
) -> Result<TagId> {
    match watermark {
        Some(watermark) => {
            let tag_id = next_id(watermark.max(max_tag_id(c)?.unwrap_or(0)), "tag")?;
            exec(
                c,
                "insert into TAGS (tag_id, source_tag, tag) values (?1, ?2, ?3)",
                params![tag_id, source_tag, tag],
            )?;
            Ok(tag_id)
        }
        None => {
            exec(
                c,
                "insert into TAGS (source_tag, tag) values (?1, ?2)",
                params![source_tag, tag],
            )?;
            Ok(c.last_insert_rowid())
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TagDbError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

// ------------- Store writer -------------
/// Write accessor for the user store.
///
/// When bound to a merged reader, lookups that decide idempotence and the
/// identifiers of new tags and formats take every bound store into account,
/// so that nothing created locally collides with a base store.
///
/// Merged lookups run before the write transaction is opened; the store lock
/// is never held while another store is consulted.
#[derive(Debug)]
pub struct StoreWriter {
    store: Arc<Store>,
    local: StoreReader,
    reader: Option<Arc<MergedReader>>,
}

impl StoreWriter {
    pub fn new(store: Arc<Store>, reader: Option<Arc<MergedReader>>) -> Result<Self> {
        if store.role() != StoreRole::User {
            return Err(TagDbError::Config(format!(
                "store '{}' is a {} store and cannot be written",
                store.label(),
                store.role()
            )));
        }
        Ok(Self {
            local: StoreReader::new(Arc::clone(&store)),
            store,
            reader,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn lookup_tag_id(&self, tag: &str) -> Result<Option<TagId>> {
        match &self.reader {
            Some(reader) => reader.find_tag_id(tag),
            None => self.local.find_tag_id(tag),
        }
    }

    fn tag_id_watermark(&self) -> Result<Option<TagId>> {
        match &self.reader {
            Some(reader) => Ok(Some(reader.get_max_tag_id()?.unwrap_or(0))),
            None => Ok(None),
        }
    }

    // ------------- Tags -------------
    /// Returns the id of `tag`, creating it in the user store when no bound
    /// store knows it yet. The returned id may belong to a base store.
    pub fn create_tag(&self, source_tag: &str, tag: &str) -> Result<TagId> {
        require_text("source_tag", source_tag)?;
        require_text("tag", tag)?;
        if let Some(tag_id) = self.lookup_tag_id(tag)? {
            return Ok(tag_id);
        }
        let watermark = self.tag_id_watermark()?;
        let tag_id = self.store.write(|c| {
            if let Some(tag_id) = find_tag_id(c, tag)? {
                return Ok(tag_id);
            }
            insert_tag(c, watermark, source_tag, tag)
        })?;
        debug!(tag_id, tag, "created tag");
        Ok(tag_id)
    }

    /// Inserts the tags the user store does not hold yet, in one
    /// transaction. The first occurrence of a repeated tag wins. Returns the
    /// number of tags inserted.
    pub fn bulk_insert_tags(&self, tags: &[NewTag]) -> Result<usize> {
        for new_tag in tags {
            require_text("source_tag", &new_tag.source_tag)?;
            require_text("tag", &new_tag.tag)?;
        }
        let watermark = self.tag_id_watermark()?;
        let inserted = self.store.write(|c| {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut inserted = 0;
            for new_tag in tags {
                if !seen.insert(new_tag.tag.as_str()) || find_tag_id(c, &new_tag.tag)?.is_some() {
                    continue;
                }
                insert_tag(c, watermark, &new_tag.source_tag, &new_tag.tag)?;
                inserted += 1;
            }
            Ok(inserted)
        })?;
        info!(requested = tags.len(), inserted, "bulk inserted tags");
        Ok(inserted)
    }

    /// Creates a tag under a caller-chosen id. Repeating the same call is a
    /// no-op; reusing the id or the string for something else is rejected.
    pub fn create_tag_with_id(&self, tag_id: TagId, source_tag: &str, tag: &str) -> Result<TagId> {
        require_text("source_tag", source_tag)?;
        require_text("tag", tag)?;
        self.store.write(|c| {
            if let Some(existing) = tag_text(c, tag_id)? {
                if existing == tag {
                    return Ok(tag_id);
                }
                return Err(TagDbError::validation(format!(
                    "tag_id {tag_id} already holds '{existing}', not '{tag}'"
                )));
            }
            if let Some(other) = find_tag_id(c, tag)? {
                return Err(TagDbError::validation(format!(
                    "tag '{tag}' already exists with tag_id {other}"
                )));
            }
            exec(
                c,
                "insert into TAGS (tag_id, source_tag, tag) values (?1, ?2, ?3)",
                params![tag_id, source_tag, tag],
            )?;
            Ok(tag_id)
        })
    }

    /// Materializes a tag known to the merged view in the user store under
    /// the same id, refusing ids the merged view uses for another string.
    pub fn ensure_tag_with_id(&self, tag_id: TagId, source_tag: &str, tag: &str) -> Result<TagId> {
        if let Some(reader) = &self.reader {
            if let Some(existing) = reader.get_tag_by_id(tag_id)? {
                if existing.tag != tag {
                    return Err(TagDbError::validation(format!(
                        "tag_id {tag_id} is '{}' in store view, not '{tag}'",
                        existing.tag
                    )));
                }
            }
        }
        self.create_tag_with_id(tag_id, source_tag, tag)
    }

    pub fn update_tag(
        &self,
        tag_id: TagId,
        source_tag: Option<&str>,
        tag: Option<&str>,
    ) -> Result<()> {
        if let Some(source_tag) = source_tag {
            require_text("source_tag", source_tag)?;
        }
        if let Some(tag) = tag {
            require_text("tag", tag)?;
        }
        self.store.write(|c| {
            if tag_text(c, tag_id)?.is_none() {
                return Err(TagDbError::validation(format!(
                    "tag_id {tag_id} does not exist in the user store"
                )));
            }
            exec(
                c,
                "
                update TAGS set
                    source_tag = coalesce(?2, source_tag),
                    tag = coalesce(?3, tag),
                    updated_at = CURRENT_TIMESTAMP
                where tag_id = ?1
                ",
                params![tag_id, source_tag, tag],
            )?;
            Ok(())
        })
    }

    // ------------- Statuses -------------
    /// Inserts or updates one status row after checking that the row would
    /// be consistent and that everything it refers to exists locally.
    pub fn update_tag_status(&self, update: &TagStatusUpdate) -> Result<()> {
        let TagStatusUpdate {
            tag_id,
            format_id,
            alias,
            preferred_tag_id,
            ..
        } = *update;
        if !alias && preferred_tag_id != tag_id {
            return Err(TagDbError::validation(format!(
                "tag_id {tag_id} is not an alias but prefers tag_id {preferred_tag_id}"
            )));
        }
        if alias && preferred_tag_id == tag_id {
            return Err(TagDbError::validation(format!(
                "tag_id {tag_id} is an alias of itself"
            )));
        }
        self.store.write(|c| {
            if tag_text(c, tag_id)?.is_none() {
                return Err(TagDbError::validation(format!(
                    "tag_id {tag_id} does not exist in the user store"
                )));
            }
            if alias && tag_text(c, preferred_tag_id)?.is_none() {
                return Err(TagDbError::validation(format!(
                    "preferred tag_id {preferred_tag_id} does not exist in the user store"
                )));
            }
            if !format_exists(c, format_id)? {
                return Err(TagDbError::validation(format!(
                    "format_id {format_id} does not exist in the user store"
                )));
            }
            let existing_type: Option<TypeId> = c
                .query_row(
                    "select type_id from TAG_STATUS where tag_id = ?1 and format_id = ?2",
                    params![tag_id, format_id],
                    |r| r.get(0),
                )
                .optional()?;
            let type_id = update.type_id.or(existing_type).unwrap_or(0);
            if !mapping_exists(c, format_id, type_id)? {
                return Err(TagDbError::validation(format!(
                    "type_id {type_id} is not mapped for format_id {format_id}"
                )));
            }
            exec(
                c,
                "
                insert into TAG_STATUS (
                    tag_id, format_id, type_id, alias, preferred_tag_id,
                    deprecated, deprecated_at, source_created_at, updated_at
                )
                values (?1, ?2, ?3, ?4, ?5, coalesce(?6, false), ?7, ?8, coalesce(?9, CURRENT_TIMESTAMP))
                on conflict (tag_id, format_id) do update set
                    type_id = excluded.type_id,
                    alias = excluded.alias,
                    preferred_tag_id = excluded.preferred_tag_id,
                    deprecated = coalesce(?6, deprecated),
                    deprecated_at = coalesce(?7, deprecated_at),
                    source_created_at = coalesce(?8, source_created_at),
                    updated_at = excluded.updated_at
                ",
                params![
                    tag_id,
                    format_id,
                    type_id,
                    alias,
                    preferred_tag_id,
                    update.deprecated,
                    update.deprecated_at,
                    update.source_created_at,
                    update.updated_at,
                ],
            )?;
            debug!(tag_id, format_id, type_id, alias, preferred_tag_id, "updated tag status");
            Ok(())
        })
    }

    /// Returns whether a row was removed.
    pub fn delete_tag_status(&self, tag_id: TagId, format_id: FormatId) -> Result<bool> {
        let deleted = self.store.write(|c| {
            exec(
                c,
                "delete from TAG_STATUS where tag_id = ?1 and format_id = ?2",
                params![tag_id, format_id],
            )
        })?;
        Ok(deleted > 0)
    }

    /// Re-applies exported statuses. Stops with `Cancelled` between rows;
    /// rows written before that stay written.
    pub fn import_tag_statuses(&self, statuses: &[TagStatus], cancel: &CancelToken) -> Result<usize> {
        for (imported, status) in statuses.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(imported, total = statuses.len(), "status import cancelled");
                return Err(TagDbError::Cancelled);
            }
            self.update_tag_status(&TagStatusUpdate::from(status))?;
        }
        info!(imported = statuses.len(), "imported tag statuses");
        Ok(statuses.len())
    }

    // ------------- Usage and translations -------------
    pub fn update_usage_count(
        &self,
        tag_id: TagId,
        format_id: FormatId,
        count: i64,
        observed_at: Option<Timestamp>,
    ) -> Result<()> {
        if count < 0 {
            return Err(TagDbError::validation(format!(
                "usage count must not be negative, got {count}"
            )));
        }
        self.store.write(|c| {
            exec(
                c,
                "
                insert into TAG_USAGE_COUNTS (tag_id, format_id, count, updated_at)
                values (?1, ?2, ?3, coalesce(?4, CURRENT_TIMESTAMP))
                on conflict (tag_id, format_id) do update set
                    count = excluded.count,
                    updated_at = excluded.updated_at
                ",
                params![tag_id, format_id, count, observed_at],
            )?;
            Ok(())
        })
    }

    /// Adds a translation; an identical one already present is skipped.
    /// Returns whether a row was inserted.
    pub fn add_or_update_translation(
        &self,
        tag_id: TagId,
        language: &str,
        translation: &str,
    ) -> Result<bool> {
        require_text("language", language)?;
        require_text("translation", translation)?;
        self.store.write(|c| {
            if tag_text(c, tag_id)?.is_none() {
                return Err(TagDbError::validation(format!(
                    "tag_id {tag_id} does not exist in the user store"
                )));
            }
            let present = c
                .query_row(
                    "
                    select 1 from TAG_TRANSLATIONS
                    where tag_id = ?1 and language = ?2 and translation = ?3
                    ",
                    params![tag_id, language, translation],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if present {
                return Ok(false);
            }
            exec(
                c,
                "insert into TAG_TRANSLATIONS (tag_id, language, translation) values (?1, ?2, ?3)",
                params![tag_id, language, translation],
            )?;
            Ok(true)
        })
    }

    // ------------- Formats and types -------------
    /// Returns the local id of `format_name`, creating the format if needed.
    /// A name the merged view already knows keeps that id; a new name gets
    /// an id above every format id in the bound stores.
    pub fn create_format_if_not_exists(
        &self,
        format_name: &str,
        description: Option<&str>,
    ) -> Result<FormatId> {
        require_text("format_name", format_name)?;
        let (reserved, watermark) = match &self.reader {
            Some(reader) => (
                reader.get_format_id(format_name)?,
                Some(reader.get_max_format_id()?.unwrap_or(0)),
            ),
            None => (None, None),
        };
        let (format_id, created) = self.store.write(|c| {
            if let Some(format_id) = format_id_by_name(c, format_name)? {
                return Ok((format_id, false));
            }
            let format_id = match (reserved, watermark) {
                (Some(format_id), _) if !format_exists(c, format_id)? => Some(format_id),
                (_, Some(watermark)) => Some(next_id(
                    watermark.max(max_format_id(c)?.unwrap_or(0)),
                    "format",
                )?),
                _ => None,
            };
            let format_id = match format_id {
                Some(format_id) => {
                    exec(
                        c,
                        "insert into TAG_FORMATS (format_id, format_name, description) values (?1, ?2, ?3)",
                        params![format_id, format_name, description],
                    )?;
                    format_id
                }
                None => {
                    exec(
                        c,
                        "insert into TAG_FORMATS (format_name, description) values (?1, ?2)",
                        params![format_name, description],
                    )?;
                    c.last_insert_rowid()
                }
            };
            Ok((format_id, true))
        })?;
        if created {
            info!(format_id, format_name, "created format");
        }
        Ok(format_id)
    }

    pub fn create_type_name_if_not_exists(
        &self,
        type_name: &str,
        description: Option<&str>,
    ) -> Result<TypeNameId> {
        require_text("type_name", type_name)?;
        self.store.write(|c| {
            let existing: Option<TypeNameId> = c
                .query_row(
                    "select type_name_id from TAG_TYPE_NAME where type_name = ?1",
                    params![type_name],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(type_name_id) = existing {
                return Ok(type_name_id);
            }
            exec(
                c,
                "insert into TAG_TYPE_NAME (type_name, description) values (?1, ?2)",
                params![type_name, description],
            )?;
            Ok(c.last_insert_rowid())
        })
    }

    /// Maps `type_name_id` into the format and returns the type id it ends
    /// up under. A type name already mapped in the format keeps its type id;
    /// a `type_id` taken by another type name is replaced by the next free
    /// one.
    pub fn create_type_format_mapping_if_not_exists(
        &self,
        format_id: FormatId,
        type_id: TypeId,
        type_name_id: TypeNameId,
        description: Option<&str>,
    ) -> Result<TypeId> {
        let next = self.get_next_type_id(format_id)?;
        let (resolved, created) = self.store.write(|c| {
            if let Some(existing) = type_id_for_name_id(c, format_id, type_name_id)? {
                return Ok((existing, false));
            }
            let resolved = if mapping_exists(c, format_id, type_id)? {
                let local_max: Option<TypeId> = c.query_row(
                    "select max(type_id) from TAG_TYPE_FORMAT_MAPPING where format_id = ?1",
                    params![format_id],
                    |r| r.get(0),
                )?;
                match local_max {
                    Some(max) => next.max(next_id(max, "type")?),
                    None => next,
                }
            } else {
                type_id
            };
            exec(
                c,
                "
                insert into TAG_TYPE_FORMAT_MAPPING (format_id, type_id, type_name_id, description)
                values (?1, ?2, ?3, ?4)
                ",
                params![format_id, resolved, type_name_id, description],
            )?;
            Ok((resolved, true))
        })?;
        if created && resolved != type_id {
            debug!(format_id, requested = type_id, resolved, "type id taken, mapped to the next one");
        }
        Ok(resolved)
    }

    /// One above the highest type id of the format, or 0 for a format
    /// without types.
    pub fn get_next_type_id(&self, format_id: FormatId) -> Result<TypeId> {
        let max = match &self.reader {
            Some(reader) => reader.get_max_type_id(format_id)?,
            None => self.local.get_max_type_id(format_id)?,
        };
        max.map_or(Ok(0), |max| next_id(max, "type"))
    }

    /// Returns the type id `type_name` has in the format, provisioning the
    /// type name and its mapping when the user store lacks them. A mapping
    /// the merged view already has for the name keeps its type id.
    pub fn ensure_type_for_format(&self, format_id: FormatId, type_name: &str) -> Result<TypeId> {
        require_text("type_name", type_name)?;
        if let Some(type_id) = self.local.get_type_id_for_name(format_id, type_name)? {
            return Ok(type_id);
        }
        let known = match &self.reader {
            Some(reader) => reader.get_type_id_for_name(format_id, type_name)?,
            None => None,
        };
        let type_id = match known {
            Some(type_id)
                if self
                    .local
                    .get_type_name_by_format_type_id(format_id, type_id)?
                    .is_none() =>
            {
                type_id
            }
            _ => self.get_next_type_id(format_id)?,
        };
        let type_name_id = self.create_type_name_if_not_exists(type_name, None)?;
        let type_id =
            self.create_type_format_mapping_if_not_exists(format_id, type_id, type_name_id, None)?;
        info!(format_id, type_id, type_name, "provisioned type");
        Ok(type_id)
    }

    /// Reassigns the type of each tag in the format. Ids are those of the
    /// merged view; a tag or format only a base store holds is copied into
    /// the user store first. Missing type names and mappings are provisioned
    /// as they come up; a tag without a status in the format gets a
    /// non-alias one. Checks `cancel` between rows.
    pub fn update_tags_type_batch(
        &self,
        format_id: FormatId,
        updates: &[TagTypeUpdate],
        cancel: &CancelToken,
    ) -> Result<usize> {
        let merged_format_id = format_id;
        let format_id = self.localize_format(format_id)?;
        let mut type_ids: HashMap<&str, TypeId> = HashMap::new();
        for (updated, update) in updates.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(updated, total = updates.len(), "type reassignment cancelled");
                return Err(TagDbError::Cancelled);
            }
            let type_id = match type_ids.get(update.type_name.as_str()) {
                Some(type_id) => *type_id,
                None => {
                    let type_id = self.ensure_type_for_format(format_id, &update.type_name)?;
                    type_ids.insert(update.type_name.as_str(), type_id);
                    type_id
                }
            };
            let tag_id = self.localize_tag(update.tag_id)?;
            let status = match self.local.get_tag_status(tag_id, format_id)? {
                Some(status) => TagStatusUpdate::from(&status),
                None => match &self.reader {
                    Some(reader) => match reader.get_tag_status(update.tag_id, merged_format_id)? {
                        Some(status) if status.alias => TagStatusUpdate {
                            tag_id,
                            format_id,
                            preferred_tag_id: self.localize_tag(status.preferred_tag_id)?,
                            ..TagStatusUpdate::from(&status)
                        },
                        Some(status) => TagStatusUpdate {
                            tag_id,
                            format_id,
                            preferred_tag_id: tag_id,
                            ..TagStatusUpdate::from(&status)
                        },
                        None => TagStatusUpdate::preferred(tag_id, format_id),
                    },
                    None => TagStatusUpdate::preferred(tag_id, format_id),
                },
            };
            self.update_tag_status(&status.with_type(type_id))?;
        }
        info!(format_id, updated = updates.len(), "reassigned tag types");
        Ok(updates.len())
    }

    // ------------- Registration -------------
    /// Registers a tag in one format: provisions the format and type, makes
    /// sure the tag (and the tag it is an alias of) exists locally, then
    /// writes its status, translations and usage.
    pub fn register_tag(&self, request: &TagRegisterRequest) -> Result<TagRegisterResult> {
        let tag = normalize_tag(&request.tag);
        require_text("tag", &tag)?;
        let source_tag = request
            .source_tag
            .clone()
            .unwrap_or_else(|| request.tag.trim().to_string());
        let format_id = self.create_format_if_not_exists(&request.format_name, None)?;
        let type_id = self.ensure_type_for_format(format_id, &request.type_name)?;

        let created = self.lookup_tag_id(&tag)?.is_none();
        let tag_id = self.materialize(&source_tag, &tag)?;

        let preferred_tag_id = match &request.alias_of {
            Some(preferred) => {
                let preferred = normalize_tag(preferred);
                require_text("alias_of", &preferred)?;
                let preferred_tag_id = self.materialize(&preferred, &preferred)?;
                if preferred_tag_id != tag_id
                    && self.local.get_tag_status(preferred_tag_id, format_id)?.is_none()
                {
                    self.update_tag_status(
                        &TagStatusUpdate::preferred(preferred_tag_id, format_id).with_type(type_id),
                    )?;
                }
                preferred_tag_id
            }
            None => tag_id,
        };
        self.update_tag_status(
            &TagStatusUpdate::alias_of(tag_id, format_id, preferred_tag_id).with_type(type_id),
        )?;
        for translation in &request.translations {
            self.add_or_update_translation(tag_id, &translation.language, &translation.translation)?;
        }
        if let Some(count) = request.usage_count {
            self.update_usage_count(tag_id, format_id, count, None)?;
        }
        info!(tag_id, tag = %tag, format_id, created, "registered tag");
        Ok(TagRegisterResult { tag_id, created })
    }

    /// Returns the user store id of `tag`, copying it in from a base store
    /// or creating it when the user store lacks it. A copied tag keeps its
    /// base id unless some bound store uses that id for another string, in
    /// which case it is numbered above every bound store.
    fn materialize(&self, source_tag: &str, tag: &str) -> Result<TagId> {
        if let Some(tag_id) = self.local.find_tag_id(tag)? {
            return Ok(tag_id);
        }
        let Some(reader) = &self.reader else {
            return self.create_tag(source_tag, tag);
        };
        let kept = match reader.find_tag_id(tag)? {
            Some(tag_id) if reader.get_tags_by_id(tag_id)?.iter().all(|t| t == tag) => Some(tag_id),
            _ => None,
        };
        let watermark = self.tag_id_watermark()?;
        let tag_id = self.store.write(|c| {
            if let Some(tag_id) = find_tag_id(c, tag)? {
                return Ok(tag_id);
            }
            match kept {
                Some(tag_id) if tag_text(c, tag_id)?.is_none() => {
                    exec(
                        c,
                        "insert into TAGS (tag_id, source_tag, tag) values (?1, ?2, ?3)",
                        params![tag_id, source_tag, tag],
                    )?;
                    Ok(tag_id)
                }
                _ => insert_tag(c, watermark, source_tag, tag),
            }
        })?;
        if kept != Some(tag_id) {
            debug!(tag_id, tag, "stored tag under a fresh id");
        }
        Ok(tag_id)
    }

    // the user store id of a tag known by its merged view id
    fn localize_tag(&self, tag_id: TagId) -> Result<TagId> {
        if self.local.get_tag_by_id(tag_id)?.is_some() {
            return Ok(tag_id);
        }
        let known = match &self.reader {
            Some(reader) => reader.get_tag_by_id(tag_id)?,
            None => None,
        };
        match known {
            Some(tag) => self.materialize(&tag.source_tag, &tag.tag),
            None => Err(TagDbError::validation(format!(
                "tag_id {tag_id} does not exist in any store"
            ))),
        }
    }

    // the user store id of a format known by its merged view id
    fn localize_format(&self, format_id: FormatId) -> Result<FormatId> {
        if self.local.get_format_name(format_id)?.is_some() {
            return Ok(format_id);
        }
        let known = match &self.reader {
            Some(reader) => reader.get_format_name(format_id)?,
            None => None,
        };
        match known {
            Some(format_name) => self.create_format_if_not_exists(&format_name, None),
            None => Err(TagDbError::validation(format!(
                "format_id {format_id} does not exist in any store"
            ))),
        }
    }

    // ------------- Metadata -------------
    pub fn set_metadata_value(&self, key: &str, value: &str) -> Result<()> {
        require_text("key", key)?;
        self.store.write(|c| {
            exec(
                c,
                "
                insert into DATABASE_METADATA (key, value) values (?1, ?2)
                on conflict (key) do update set value = excluded.value
                ",
                params![key, value],
            )?;
            Ok(())
        })
    }
}
