use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use roaring::RoaringTreemap;
use rusqlite::{Connection, params};
use seahash::SeaHasher;
use tracing::trace;

use crate::construct::{FormatId, Tag, TagId, TypeId};
use crate::error::Result;
use crate::persist::id_array;
use crate::query::{to_candidate, to_tag_id};
use crate::reader::{read_flag, read_timestamp};

// we will use a fast hashing algo for maps keyed by identifiers
pub type IdHasher = BuildHasherDefault<SeaHasher>;
pub type IdMap<K, V> = HashMap<K, V, IdHasher>;

/// A status row as found in the store. `alias` is `None` when the stored
/// value cannot be read as a boolean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub tag_id: TagId,
    pub format_id: FormatId,
    pub type_id: TypeId,
    pub alias: Option<bool>,
    pub preferred_tag_id: TagId,
    pub deprecated: bool,
}

/// Everything needed to build result rows for a set of candidates, fetched
/// with a fixed number of statements.
#[derive(Debug, Default)]
pub struct Preloaded {
    /// Candidates plus the tags they prefer in any format.
    pub closure: RoaringTreemap,
    pub tags: IdMap<TagId, Tag>,
    pub statuses: IdMap<(TagId, FormatId), StatusRow>,
    /// Statuses of each tag, in format order.
    pub statuses_by_tag: IdMap<TagId, Vec<StatusRow>>,
    pub usage: IdMap<(TagId, FormatId), i64>,
    pub format_names: IdMap<FormatId, String>,
    pub type_names: IdMap<(FormatId, TypeId), String>,
    /// (language, translation) pairs of each tag.
    pub translations: IdMap<TagId, Vec<(String, String)>>,
}

impl Preloaded {
    pub fn status(&self, tag_id: TagId, format_id: FormatId) -> Option<&StatusRow> {
        self.statuses.get(&(tag_id, format_id))
    }
    pub fn usage_count(&self, tag_id: TagId, format_id: FormatId) -> i64 {
        self.usage.get(&(tag_id, format_id)).copied().unwrap_or(0)
    }
}

pub struct SearchPreloader<'c> {
    connection: &'c Connection,
}

impl<'c> SearchPreloader<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }

    pub fn load(&self, candidates: &RoaringTreemap) -> Result<Preloaded> {
        let mut preloaded = Preloaded::default();
        if candidates.is_empty() {
            return Ok(preloaded);
        }
        preloaded.closure = candidates | &self.preferred_ids(candidates)?;
        let closure = id_array(&preloaded.closure)?;
        self.load_statuses(&closure, &mut preloaded)?;
        self.load_tags(&closure, &mut preloaded)?;
        self.load_usage(&closure, &mut preloaded)?;
        self.load_vocabulary(&mut preloaded)?;
        self.load_translations(&closure, &mut preloaded)?;
        trace!(
            candidates = candidates.len(),
            closure = preloaded.closure.len(),
            "preloaded search rows"
        );
        Ok(preloaded)
    }

    // only one hop, alias chains are not followed
    fn preferred_ids(&self, candidates: &RoaringTreemap) -> Result<RoaringTreemap> {
        let mut statement = self.connection.prepare_cached(
            "
            select distinct preferred_tag_id from TAG_STATUS
            where tag_id in (select value from json_each(?1))
            ",
        )?;
        let mut rows = statement.query(params![id_array(candidates)?])?;
        let mut preferred = RoaringTreemap::new();
        while let Some(row) = rows.next()? {
            if let Some(id) = to_candidate(row.get(0)?) {
                preferred.insert(id);
            }
        }
        Ok(preferred)
    }

    fn load_statuses(&self, closure: &str, preloaded: &mut Preloaded) -> Result<()> {
        let mut statement = self.connection.prepare_cached(
            "
            select tag_id, format_id, type_id, alias, preferred_tag_id, deprecated
            from TAG_STATUS
            where tag_id in (select value from json_each(?1))
            order by tag_id, format_id
            ",
        )?;
        let mut rows = statement.query(params![closure])?;
        while let Some(row) = rows.next()? {
            let status = StatusRow {
                tag_id: row.get(0)?,
                format_id: row.get(1)?,
                type_id: row.get(2)?,
                alias: read_flag(row, 3)?,
                preferred_tag_id: row.get(4)?,
                deprecated: read_flag(row, 5)?.unwrap_or(false),
            };
            preloaded
                .statuses_by_tag
                .entry(status.tag_id)
                .or_default()
                .push(status.clone());
            preloaded
                .statuses
                .insert((status.tag_id, status.format_id), status);
        }
        Ok(())
    }

    fn load_tags(&self, closure: &str, preloaded: &mut Preloaded) -> Result<()> {
        let mut statement = self.connection.prepare_cached(
            "
            select tag_id, tag, source_tag, created_at, updated_at from TAGS
            where tag_id in (select value from json_each(?1))
            ",
        )?;
        let mut rows = statement.query(params![closure])?;
        while let Some(row) = rows.next()? {
            let tag = Tag {
                tag_id: row.get(0)?,
                tag: row.get(1)?,
                source_tag: row.get(2)?,
                created_at: read_timestamp(row, 3),
                updated_at: read_timestamp(row, 4),
            };
            preloaded.tags.insert(tag.tag_id, tag);
        }
        Ok(())
    }

    fn load_usage(&self, closure: &str, preloaded: &mut Preloaded) -> Result<()> {
        let mut statement = self.connection.prepare_cached(
            "
            select tag_id, format_id, count from TAG_USAGE_COUNTS
            where tag_id in (select value from json_each(?1))
            ",
        )?;
        let mut rows = statement.query(params![closure])?;
        while let Some(row) = rows.next()? {
            preloaded
                .usage
                .insert((row.get(0)?, row.get(1)?), row.get(2)?);
        }
        Ok(())
    }

    // formats and types are small vocabularies, so they are fetched whole
    fn load_vocabulary(&self, preloaded: &mut Preloaded) -> Result<()> {
        let mut statement = self
            .connection
            .prepare_cached("select format_id, format_name from TAG_FORMATS")?;
        let mut rows = statement.query([])?;
        while let Some(row) = rows.next()? {
            preloaded.format_names.insert(row.get(0)?, row.get(1)?);
        }
        let mut statement = self.connection.prepare_cached(
            "
            select m.format_id, m.type_id, n.type_name
                from TAG_TYPE_FORMAT_MAPPING m
                join TAG_TYPE_NAME n
                on n.type_name_id = m.type_name_id
            ",
        )?;
        let mut rows = statement.query([])?;
        while let Some(row) = rows.next()? {
            preloaded
                .type_names
                .insert((row.get(0)?, row.get(1)?), row.get(2)?);
        }
        Ok(())
    }

    fn load_translations(&self, closure: &str, preloaded: &mut Preloaded) -> Result<()> {
        let mut statement = self.connection.prepare_cached(
            "
            select tag_id, language, translation from TAG_TRANSLATIONS
            where tag_id in (select value from json_each(?1))
            order by translation_id
            ",
        )?;
        let mut rows = statement.query(params![closure])?;
        while let Some(row) = rows.next()? {
            let tag_id: TagId = row.get(0)?;
            let language: Option<String> = row.get(1)?;
            let translation: Option<String> = row.get(2)?;
            if let (Some(language), Some(translation)) = (language, translation) {
                preloaded
                    .translations
                    .entry(tag_id)
                    .or_default()
                    .push((language, translation));
            }
        }
        Ok(())
    }
}

/// Candidates in ascending id order, as tag ids.
pub fn ordered_tag_ids(candidates: &RoaringTreemap) -> impl Iterator<Item = TagId> + '_ {
    candidates.iter().map(to_tag_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{Store, StoreRole};

    #[test]
    fn closure_includes_preferred_tags() {
        let store = Store::open_in_memory("base", StoreRole::Base).unwrap();
        store
            .write(|c| {
                c.execute_batch(
                    "
                    insert into TAG_FORMATS (format_id, format_name) values (1, 'danbooru');
                    insert into TAG_TYPE_NAME (type_name_id, type_name) values (1, 'general');
                    insert into TAG_TYPE_FORMAT_MAPPING (format_id, type_id, type_name_id) values (1, 0, 1);
                    insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat'), (2, 'kitten', 'kitten');
                    insert into TAG_STATUS (tag_id, format_id, type_id, alias, preferred_tag_id)
                        values (1, 1, 0, true, 2), (2, 1, 0, false, 2);
                    insert into TAG_TRANSLATIONS (tag_id, language, translation) values (2, 'ja', '子猫');
                    ",
                )?;
                Ok(())
            })
            .unwrap();
        let candidates: RoaringTreemap = [1u64].into_iter().collect();
        let preloaded = store
            .read(|c| SearchPreloader::new(c).load(&candidates))
            .unwrap();
        assert!(preloaded.closure.contains(2));
        assert_eq!(preloaded.tags[&2].tag, "kitten");
        assert_eq!(preloaded.status(1, 1).unwrap().alias, Some(true));
        assert_eq!(preloaded.usage_count(1, 1), 0);
        assert_eq!(preloaded.type_names[&(1, 0)], "general");
        assert_eq!(preloaded.translations[&2], vec![("ja".into(), "子猫".into())]);
    }
}
