use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use roaring::RoaringTreemap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, warn};

use crate::assemble::ResultBuilder;
use crate::construct::{
    FormatId, SearchFilters, Tag, TagId, TagSearchRow, TagStatus, TagTranslation, TagUsageCount,
    Timestamp, TypeId, TypeNameId,
};
use crate::error::{Result, TagDbError};
use crate::persist::Store;
use crate::preload::{SearchPreloader, ordered_tag_ids};
use crate::query::{SearchQueryBuilder, normalize_search_keyword, to_candidate};

// ------------- Row mapping -------------
/// Reads a boolean column leniently. Distributed stores have been seen with
/// integer, text and null flags; anything unrecognized is `None`.
pub(crate) fn read_flag(row: &Row, index: usize) -> rusqlite::Result<Option<bool>> {
    Ok(match row.get_ref(index)? {
        ValueRef::Integer(i) => Some(i != 0),
        ValueRef::Real(f) => Some(f != 0.0),
        ValueRef::Text(text) => match text {
            b"1" | b"true" | b"TRUE" | b"True" => Some(true),
            b"0" | b"false" | b"FALSE" | b"False" => Some(false),
            _ => None,
        },
        ValueRef::Null | ValueRef::Blob(_) => None,
    })
}

/// Malformed timestamps read as absent rather than failing the whole query.
pub(crate) fn read_timestamp(row: &Row, index: usize) -> Option<Timestamp> {
    row.get::<_, Option<Timestamp>>(index).ok().flatten()
}

const TAG_COLUMNS: &str = "tag_id, tag, source_tag, created_at, updated_at";

fn tag_from_row(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        tag_id: row.get(0)?,
        tag: row.get(1)?,
        source_tag: row.get(2)?,
        created_at: read_timestamp(row, 3),
        updated_at: read_timestamp(row, 4),
    })
}

const STATUS_COLUMNS: &str = "tag_id, format_id, type_id, alias, preferred_tag_id, deprecated, \
    deprecated_at, source_created_at, created_at, updated_at";

// None when the alias flag is unreadable
fn status_from_row(row: &Row) -> rusqlite::Result<Option<TagStatus>> {
    let tag_id: TagId = row.get(0)?;
    let format_id: FormatId = row.get(1)?;
    let Some(alias) = read_flag(row, 3)? else {
        warn!(tag_id, format_id, "ignoring status with unreadable alias flag");
        return Ok(None);
    };
    Ok(Some(TagStatus {
        tag_id,
        format_id,
        type_id: row.get(2)?,
        alias,
        preferred_tag_id: row.get(4)?,
        deprecated: read_flag(row, 5)?.unwrap_or(false),
        deprecated_at: read_timestamp(row, 6),
        source_created_at: read_timestamp(row, 7),
        created_at: read_timestamp(row, 8),
        updated_at: read_timestamp(row, 9),
    }))
}

fn usage_from_row(row: &Row) -> rusqlite::Result<TagUsageCount> {
    Ok(TagUsageCount {
        tag_id: row.get(0)?,
        format_id: row.get(1)?,
        count: row.get(2)?,
        updated_at: read_timestamp(row, 3),
    })
}

fn first_column(row: &Row) -> rusqlite::Result<String> {
    row.get(0)
}

// rows with a null language or text carry no translation
fn translation_from_row(row: &Row) -> rusqlite::Result<Option<TagTranslation>> {
    let language: Option<String> = row.get(2)?;
    let translation: Option<String> = row.get(3)?;
    Ok(match (language, translation) {
        (Some(language), Some(translation)) => Some(TagTranslation {
            translation_id: row.get(0)?,
            tag_id: row.get(1)?,
            language,
            translation,
        }),
        _ => None,
    })
}

// ------------- Store reader -------------
/// Read accessor bound to exactly one store. Lookups report absence as
/// `None`; the only lookup error besides storage failures is ambiguity.
#[derive(Debug, Clone)]
pub struct StoreReader {
    store: Arc<Store>,
}

impl StoreReader {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
    pub fn label(&self) -> &str {
        self.store.label()
    }

    // ------------- Point lookups -------------
    /// Looks a tag up by its canonical spelling. An exact keyword matching
    /// more than one tag is ambiguous; a wildcard keyword returns one of its
    /// matches, with no guarantee which.
    pub fn get_tag_id_by_name(&self, keyword: &str, partial: bool) -> Result<Option<TagId>> {
        let (pattern, use_like) = normalize_search_keyword(keyword, partial);
        let matches: Vec<TagId> = self.store.read(|c| {
            let sql = if use_like {
                "select tag_id from TAGS where tag like ?1 limit 1"
            } else {
                "select tag_id from TAGS where tag = ?1"
            };
            let mut statement = c.prepare_cached(sql)?;
            let ids = statement
                .query_map(params![pattern], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<TagId>>>()?;
            Ok(ids)
        })?;
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(TagDbError::Ambiguous {
                keyword: keyword.to_string(),
                matches,
            }),
        }
    }

    /// Exact lookup that treats `*` and `%` as ordinary characters.
    pub fn find_tag_id(&self, tag: &str) -> Result<Option<TagId>> {
        self.store.read(|c| find_tag_id(c, tag))
    }

    pub fn get_tag_by_id(&self, tag_id: TagId) -> Result<Option<Tag>> {
        self.store.read(|c| {
            let sql = format!("select {TAG_COLUMNS} from TAGS where tag_id = ?1");
            Ok(c.query_row(&sql, params![tag_id], tag_from_row).optional()?)
        })
    }

    pub fn get_tag_status(&self, tag_id: TagId, format_id: FormatId) -> Result<Option<TagStatus>> {
        self.store.read(|c| {
            let sql =
                format!("select {STATUS_COLUMNS} from TAG_STATUS where tag_id = ?1 and format_id = ?2");
            Ok(c
                .query_row(&sql, params![tag_id, format_id], status_from_row)
                .optional()?
                .flatten())
        })
    }

    /// `None` when the store has no row; callers that need a number treat
    /// that as 0.
    pub fn get_usage_count(&self, tag_id: TagId, format_id: FormatId) -> Result<Option<i64>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "select count from TAG_USAGE_COUNTS where tag_id = ?1 and format_id = ?2",
                    params![tag_id, format_id],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_format_id(&self, format_name: &str) -> Result<Option<FormatId>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "select format_id from TAG_FORMATS where format_name = ?1",
                    params![format_name],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_format_name(&self, format_id: FormatId) -> Result<Option<String>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "select format_name from TAG_FORMATS where format_id = ?1",
                    params![format_id],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_type_name_by_format_type_id(
        &self,
        format_id: FormatId,
        type_id: TypeId,
    ) -> Result<Option<String>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "
                    select n.type_name
                        from TAG_TYPE_FORMAT_MAPPING m
                        join TAG_TYPE_NAME n
                        on n.type_name_id = m.type_name_id
                        where m.format_id = ?1 and m.type_id = ?2
                    ",
                    params![format_id, type_id],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    /// Identifier of a type name in this store's type vocabulary.
    pub fn get_type_id(&self, type_name: &str) -> Result<Option<TypeNameId>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "select type_name_id from TAG_TYPE_NAME where type_name = ?1",
                    params![type_name],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    /// The format-local type code a type name is mapped to, if any.
    pub fn get_type_id_for_name(&self, format_id: FormatId, type_name: &str) -> Result<Option<TypeId>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "
                    select m.type_id
                        from TAG_TYPE_FORMAT_MAPPING m
                        join TAG_TYPE_NAME n
                        on n.type_name_id = m.type_name_id
                        where m.format_id = ?1 and n.type_name = ?2
                        order by m.type_id
                        limit 1
                    ",
                    params![format_id, type_name],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_metadata_value(&self, key: &str) -> Result<Option<String>> {
        self.store.read(|c| {
            Ok(c
                .query_row(
                    "select value from DATABASE_METADATA where key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    pub fn get_database_version(&self) -> Result<Option<String>> {
        self.get_metadata_value("version")
    }

    // ------------- Listings -------------
    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        self.store.read(|c| {
            let sql = format!("select {TAG_COLUMNS} from TAGS order by tag_id");
            let mut statement = c.prepare(&sql)?;
            let tags = statement
                .query_map([], tag_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tags)
        })
    }

    pub fn list_tag_statuses(&self, tag_id: Option<TagId>) -> Result<Vec<TagStatus>> {
        self.store.read(|c| {
            let sql = format!(
                "select {STATUS_COLUMNS} from TAG_STATUS
                where ?1 is null or tag_id = ?1
                order by tag_id, format_id"
            );
            let mut statement = c.prepare(&sql)?;
            let statuses = statement
                .query_map(params![tag_id], status_from_row)?
                .filter_map(|s| s.transpose())
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(statuses)
        })
    }

    pub fn list_usage_counts(
        &self,
        tag_id: Option<TagId>,
        format_id: Option<FormatId>,
    ) -> Result<Vec<TagUsageCount>> {
        self.store.read(|c| {
            let mut statement = c.prepare(
                "
                select tag_id, format_id, count, updated_at from TAG_USAGE_COUNTS
                where (?1 is null or tag_id = ?1) and (?2 is null or format_id = ?2)
                order by tag_id, format_id
                ",
            )?;
            let counts = statement
                .query_map(params![tag_id, format_id], usage_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(counts)
        })
    }

    pub fn get_translations(&self, tag_id: TagId) -> Result<Vec<TagTranslation>> {
        self.translations(Some(tag_id))
    }

    pub fn list_translations(&self) -> Result<Vec<TagTranslation>> {
        self.translations(None)
    }

    fn translations(&self, tag_id: Option<TagId>) -> Result<Vec<TagTranslation>> {
        self.store.read(|c| {
            let mut statement = c.prepare(
                "
                select translation_id, tag_id, language, translation from TAG_TRANSLATIONS
                where ?1 is null or tag_id = ?1
                order by translation_id
                ",
            )?;
            let translations = statement
                .query_map(params![tag_id], translation_from_row)?
                .filter_map(|t| t.transpose())
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(translations)
        })
    }

    pub fn get_all_tag_ids(&self) -> Result<RoaringTreemap> {
        self.store.read(|c| {
            let mut statement = c.prepare("select tag_id from TAGS")?;
            let mut rows = statement.query([])?;
            let mut ids = RoaringTreemap::new();
            while let Some(row) = rows.next()? {
                if let Some(id) = to_candidate(row.get(0)?) {
                    ids.insert(id);
                }
            }
            Ok(ids)
        })
    }

    pub fn get_max_tag_id(&self) -> Result<Option<TagId>> {
        self.store.read(max_tag_id)
    }

    pub fn get_max_format_id(&self) -> Result<Option<FormatId>> {
        self.store.read(max_format_id)
    }

    pub fn get_max_type_id(&self, format_id: FormatId) -> Result<Option<TypeId>> {
        self.store.read(|c| {
            Ok(c.query_row(
                "select max(type_id) from TAG_TYPE_FORMAT_MAPPING where format_id = ?1",
                params![format_id],
                |r| r.get(0),
            )?)
        })
    }

    pub fn get_tag_format_ids(&self) -> Result<BTreeSet<FormatId>> {
        self.store.read(|c| {
            let mut statement = c.prepare("select distinct format_id from TAG_FORMATS")?;
            let ids = statement
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(ids)
        })
    }

    pub fn get_tag_formats(&self) -> Result<BTreeSet<String>> {
        self.names("select distinct format_name from TAG_FORMATS", None)
    }

    pub fn get_format_map(&self) -> Result<BTreeMap<FormatId, String>> {
        self.store.read(|c| {
            let mut statement = c.prepare("select format_id, format_name from TAG_FORMATS")?;
            let map = statement
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(map)
        })
    }

    pub fn get_tag_languages(&self) -> Result<BTreeSet<String>> {
        self.names(
            "select distinct language from TAG_TRANSLATIONS where language is not null",
            None,
        )
    }

    pub fn get_tag_types(&self, format_id: FormatId) -> Result<BTreeSet<String>> {
        self.names(
            "
            select n.type_name
                from TAG_TYPE_NAME n
                join TAG_TYPE_FORMAT_MAPPING m
                on m.type_name_id = n.type_name_id
                where m.format_id = ?1
            ",
            Some(format_id),
        )
    }

    pub fn get_type_mapping_map(&self) -> Result<BTreeMap<(FormatId, TypeId), String>> {
        self.store.read(|c| {
            let mut statement = c.prepare(
                "
                select m.format_id, m.type_id, n.type_name
                    from TAG_TYPE_FORMAT_MAPPING m
                    join TAG_TYPE_NAME n
                    on n.type_name_id = m.type_name_id
                ",
            )?;
            let map = statement
                .query_map([], |r| Ok(((r.get(0)?, r.get(1)?), r.get(2)?)))?
                .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
            Ok(map)
        })
    }

    pub fn get_all_types(&self) -> Result<BTreeSet<String>> {
        self.names("select type_name from TAG_TYPE_NAME", None)
    }

    fn names(&self, sql: &str, format_id: Option<FormatId>) -> Result<BTreeSet<String>> {
        self.store.read(|c| {
            let mut statement = c.prepare(sql)?;
            let rows = match format_id {
                Some(format_id) => statement.query_map(params![format_id], first_column)?,
                None => statement.query_map([], first_column)?,
            };
            Ok(rows.collect::<rusqlite::Result<BTreeSet<String>>>()?)
        })
    }

    // ------------- Search -------------
    /// Seed set only: ids whose tag, source tag or translation matches.
    pub fn search_tag_ids(&self, keyword: &str, partial: bool) -> Result<RoaringTreemap> {
        let (pattern, use_like) = normalize_search_keyword(keyword, partial);
        self.store
            .read(|c| SearchQueryBuilder::new(c).initial_tag_ids(&pattern, use_like))
    }

    /// Rows in ascending candidate id order.
    pub fn search_tags(&self, keyword: &str, filters: &SearchFilters) -> Result<Vec<TagSearchRow>> {
        self.store.read(|c| {
            let candidates = SearchQueryBuilder::new(c).candidates(keyword, filters)?;
            if candidates.ids.is_empty() {
                return Ok(Vec::new());
            }
            let preloaded = SearchPreloader::new(c).load(&candidates.ids)?;
            let builder = ResultBuilder::new(candidates.format_id, filters.resolve_preferred);
            let rows: Vec<TagSearchRow> = ordered_tag_ids(&candidates.ids)
                .filter_map(|tag_id| builder.build_row(tag_id, &preloaded))
                .collect();
            debug!(store = %self.label(), keyword, rows = rows.len(), "searched tags");
            Ok(rows)
        })
    }

    /// Exact matches for many keywords with a single preload. Each keyword
    /// maps to the row of its lowest matching id; blank keywords are ignored.
    pub fn search_tags_bulk(
        &self,
        keywords: &[String],
        format_name: Option<&str>,
        resolve_preferred: bool,
    ) -> Result<BTreeMap<String, TagSearchRow>> {
        let cleaned: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if cleaned.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.store.read(|c| {
            let builder = SearchQueryBuilder::new(c);
            let by_keyword = builder.initial_tag_ids_for_keywords(&cleaned)?;
            if by_keyword.is_empty() {
                return Ok(BTreeMap::new());
            }
            let all_ids = by_keyword
                .values()
                .fold(RoaringTreemap::new(), |all, ids| all | ids);
            let (ids, format_id) = builder.apply_format_filter(all_ids, format_name)?;
            if ids.is_empty() {
                return Ok(BTreeMap::new());
            }
            let preloaded = SearchPreloader::new(c).load(&ids)?;
            let result_builder = ResultBuilder::new(format_id, resolve_preferred);
            let mut rows = BTreeMap::new();
            for (keyword, matches) in by_keyword {
                let row = ordered_tag_ids(&(matches & &ids))
                    .find_map(|tag_id| result_builder.build_row(tag_id, &preloaded));
                if let Some(row) = row {
                    rows.insert(keyword, row);
                }
            }
            Ok(rows)
        })
    }
}

// ------------- Shared statements -------------
// Also used by the writer inside its own transactions.
pub(crate) fn find_tag_id(c: &Connection, tag: &str) -> Result<Option<TagId>> {
    Ok(c
        .query_row("select tag_id from TAGS where tag = ?1", params![tag], |r| {
            r.get(0)
        })
        .optional()?)
}

pub(crate) fn max_tag_id(c: &Connection) -> Result<Option<TagId>> {
    Ok(c.query_row("select max(tag_id) from TAGS", [], |r| r.get(0))?)
}

pub(crate) fn max_format_id(c: &Connection) -> Result<Option<FormatId>> {
    Ok(c.query_row("select max(format_id) from TAG_FORMATS", [], |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::StoreRole;

    fn reader() -> StoreReader {
        let store = Store::open_in_memory("base", StoreRole::Base).unwrap();
        store
            .write(|c| {
                c.execute_batch(
                    "
                    insert into TAG_FORMATS (format_id, format_name) values (1, 'danbooru');
                    insert into TAG_TYPE_NAME (type_name_id, type_name) values (1, 'general');
                    insert into TAG_TYPE_FORMAT_MAPPING (format_id, type_id, type_name_id) values (1, 0, 1);
                    insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat'), (2, 'cat_ears', 'cat ears');
                    insert into TAG_STATUS (tag_id, format_id, type_id, alias, preferred_tag_id)
                        values (1, 1, 0, false, 1);
                    insert into DATABASE_METADATA (key, value) values ('version', '3.1');
                    ",
                )?;
                Ok(())
            })
            .unwrap();
        StoreReader::new(store)
    }

    #[test]
    fn exact_and_wildcard_lookups() {
        let reader = reader();
        assert_eq!(reader.get_tag_id_by_name("cat", false).unwrap(), Some(1));
        assert_eq!(reader.get_tag_id_by_name("dog", false).unwrap(), None);
        let any = reader.get_tag_id_by_name("cat*", false).unwrap().unwrap();
        assert!([1, 2].contains(&any));
    }

    #[test]
    fn point_lookups_report_absence() {
        let reader = reader();
        assert_eq!(reader.get_format_id("danbooru").unwrap(), Some(1));
        assert_eq!(reader.get_format_id("e621").unwrap(), None);
        assert_eq!(reader.get_usage_count(1, 1).unwrap(), None);
        assert_eq!(reader.get_type_name_by_format_type_id(1, 0).unwrap().as_deref(), Some("general"));
        assert_eq!(reader.get_type_id_for_name(1, "general").unwrap(), Some(0));
        assert_eq!(reader.get_database_version().unwrap().as_deref(), Some("3.1"));
        assert_eq!(reader.get_max_type_id(1).unwrap(), Some(0));
        assert_eq!(reader.get_max_type_id(2).unwrap(), None);
    }

    #[test]
    fn bulk_search_ignores_blank_keywords() {
        let reader = reader();
        let keywords = vec!["cat".to_string(), "  ".to_string(), "cat ears".to_string()];
        let rows = reader.search_tags_bulk(&keywords, None, false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["cat ears"].tag_id, 2);
    }
}
