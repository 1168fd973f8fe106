use std::collections::BTreeMap;

// used for candidate sets
use roaring::RoaringTreemap;
use rusqlite::{Connection, Params, params};
use tracing::debug;

use crate::construct::{FormatId, SearchFilters, TagId};
use crate::error::Result;
use crate::persist::id_array;

/// Turns a user keyword into a `LIKE` pattern when it asks for one.
///
/// `*` is the user-facing wildcard and becomes `%`. A keyword containing a
/// wildcard, or searched with `partial`, is wrapped in `%` on both ends.
/// Returns the pattern and whether `LIKE` should be used instead of `=`.
pub fn normalize_search_keyword(keyword: &str, partial: bool) -> (String, bool) {
    let use_like = partial || keyword.contains('*') || keyword.contains('%');
    let mut pattern = keyword.replace('*', "%");
    if use_like {
        if !pattern.starts_with('%') {
            pattern.insert(0, '%');
        }
        if !pattern.ends_with('%') {
            pattern.push('%');
        }
    }
    (pattern, use_like)
}

/// A filter given as `None`, empty, or `all` does not narrow anything.
pub fn is_unrestricted(name: Option<&str>) -> bool {
    name.is_none_or(|n| n.is_empty() || n.eq_ignore_ascii_case("all"))
}

/// Outcome of narrowing: the surviving candidates and the active format, if
/// the search was restricted to one.
#[derive(Debug, Default)]
pub struct Candidates {
    pub ids: RoaringTreemap,
    pub format_id: Option<FormatId>,
}

pub(crate) fn to_candidate(tag_id: TagId) -> Option<u64> {
    let candidate = u64::try_from(tag_id).ok();
    if candidate.is_none() {
        debug!(tag_id, "skipping negative tag id");
    }
    candidate
}

pub(crate) fn to_tag_id(candidate: u64) -> TagId {
    candidate as TagId
}

fn id_set<P: Params>(connection: &Connection, sql: &str, params: P) -> Result<RoaringTreemap> {
    let mut statement = connection.prepare_cached(sql)?;
    let mut rows = statement.query(params)?;
    let mut ids = RoaringTreemap::new();
    while let Some(row) = rows.next()? {
        if let Some(id) = to_candidate(row.get(0)?) {
            ids.insert(id);
        }
    }
    Ok(ids)
}

// ------------- Query builder -------------
/// Set algebra over candidate tag ids within one store. Every filter step
/// only looks at the current candidates and returns their intersection with
/// the rows satisfying it.
pub struct SearchQueryBuilder<'c> {
    connection: &'c Connection,
}

impl<'c> SearchQueryBuilder<'c> {
    pub fn new(connection: &'c Connection) -> Self {
        Self { connection }
    }

    /// Seeds the candidate set from tag, source tag and translation text.
    pub fn initial_tag_ids(&self, pattern: &str, use_like: bool) -> Result<RoaringTreemap> {
        let sql = if use_like {
            "
            select tag_id from TAGS where tag like ?1 or source_tag like ?1
            union
            select tag_id from TAG_TRANSLATIONS where translation like ?1
            "
        } else {
            "
            select tag_id from TAGS where tag = ?1 or source_tag = ?1
            union
            select tag_id from TAG_TRANSLATIONS where translation = ?1
            "
        };
        id_set(self.connection, sql, params![pattern])
    }

    /// Exact seeds for many keywords at once. Keywords without any match are
    /// left out of the returned map.
    pub fn initial_tag_ids_for_keywords(
        &self,
        keywords: &[String],
    ) -> Result<BTreeMap<String, RoaringTreemap>> {
        let mut by_keyword: BTreeMap<String, RoaringTreemap> = BTreeMap::new();
        if keywords.is_empty() {
            return Ok(by_keyword);
        }
        let wanted = serde_json::to_string(keywords)?;
        let mut statement = self.connection.prepare_cached(
            "
            select tag_id, tag, source_tag from TAGS
            where tag in (select value from json_each(?1))
               or source_tag in (select value from json_each(?1))
            ",
        )?;
        let mut rows = statement.query(params![wanted])?;
        while let Some(row) = rows.next()? {
            let Some(id) = to_candidate(row.get(0)?) else {
                continue;
            };
            let tag: String = row.get(1)?;
            let source_tag: String = row.get(2)?;
            for text in [tag, source_tag] {
                if keywords.contains(&text) {
                    by_keyword.entry(text).or_default().insert(id);
                }
            }
        }
        let mut statement = self.connection.prepare_cached(
            "
            select tag_id, translation from TAG_TRANSLATIONS
            where translation in (select value from json_each(?1))
            ",
        )?;
        let mut rows = statement.query(params![wanted])?;
        while let Some(row) = rows.next()? {
            let Some(id) = to_candidate(row.get(0)?) else {
                continue;
            };
            let translation: String = row.get(1)?;
            by_keyword.entry(translation).or_default().insert(id);
        }
        Ok(by_keyword)
    }

    /// An unknown format name empties the candidate set.
    pub fn apply_format_filter(
        &self,
        ids: RoaringTreemap,
        format_name: Option<&str>,
    ) -> Result<(RoaringTreemap, Option<FormatId>)> {
        let Some(format_name) = format_name.filter(|n| !is_unrestricted(Some(n))) else {
            return Ok((ids, None));
        };
        let format_id: Option<FormatId> = {
            let mut statement = self
                .connection
                .prepare_cached("select format_id from TAG_FORMATS where format_name = ?1")?;
            let mut rows = statement.query(params![format_name])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(format_id) = format_id else {
            return Ok((RoaringTreemap::new(), None));
        };
        let in_format = id_set(
            self.connection,
            "
            select tag_id from TAG_STATUS
            where format_id = ?1 and tag_id in (select value from json_each(?2))
            ",
            params![format_id, id_array(&ids)?],
        )?;
        Ok((ids & in_format, Some(format_id)))
    }

    /// Keeps candidates whose usage lies within `[min_usage, max_usage]`.
    /// A tag without a usage row counts as 0, so it survives whenever the
    /// range includes 0.
    pub fn apply_usage_filter(
        &self,
        ids: RoaringTreemap,
        format_id: Option<FormatId>,
        min_usage: Option<i64>,
        max_usage: Option<i64>,
    ) -> Result<RoaringTreemap> {
        if min_usage.is_none() && max_usage.is_none() {
            return Ok(ids);
        }
        let candidates = id_array(&ids)?;
        let in_range = id_set(
            self.connection,
            "
            select tag_id from TAG_USAGE_COUNTS
            where tag_id in (select value from json_each(?1))
              and (?2 is null or format_id = ?2)
              and (?3 is null or count >= ?3)
              and (?4 is null or count <= ?4)
            ",
            params![candidates, format_id, min_usage, max_usage],
        )?;
        let includes_zero = min_usage.is_none_or(|m| m <= 0) && max_usage.is_none_or(|m| m >= 0);
        if !includes_zero {
            return Ok(ids & in_range);
        }
        let counted = id_set(
            self.connection,
            "
            select tag_id from TAG_USAGE_COUNTS
            where tag_id in (select value from json_each(?1))
              and (?2 is null or format_id = ?2)
            ",
            params![candidates, format_id],
        )?;
        let uncounted = &ids - &counted;
        Ok(ids & (in_range | uncounted))
    }

    /// Unknown type names empty the candidate set.
    pub fn apply_type_filter(
        &self,
        ids: RoaringTreemap,
        format_id: Option<FormatId>,
        type_name: Option<&str>,
    ) -> Result<RoaringTreemap> {
        let Some(type_name) = type_name.filter(|n| !is_unrestricted(Some(n))) else {
            return Ok(ids);
        };
        let typed = id_set(
            self.connection,
            "
            select s.tag_id
                from TAG_STATUS s
                join TAG_TYPE_FORMAT_MAPPING m
                on m.format_id = s.format_id and m.type_id = s.type_id
                join TAG_TYPE_NAME n
                on n.type_name_id = m.type_name_id
                where n.type_name = ?1
                and (?2 is null or s.format_id = ?2)
                and s.tag_id in (select value from json_each(?3))
            ",
            params![type_name, format_id, id_array(&ids)?],
        )?;
        Ok(ids & typed)
    }

    pub fn apply_alias_filter(
        &self,
        ids: RoaringTreemap,
        format_id: Option<FormatId>,
        alias: Option<bool>,
    ) -> Result<RoaringTreemap> {
        let Some(alias) = alias else {
            return Ok(ids);
        };
        let matching = id_set(
            self.connection,
            "
            select tag_id from TAG_STATUS
            where alias = ?1
              and (?2 is null or format_id = ?2)
              and tag_id in (select value from json_each(?3))
            ",
            params![alias, format_id, id_array(&ids)?],
        )?;
        Ok(ids & matching)
    }

    pub fn apply_language_filter(
        &self,
        ids: RoaringTreemap,
        language: Option<&str>,
    ) -> Result<RoaringTreemap> {
        let Some(language) = language.filter(|l| !is_unrestricted(Some(l))) else {
            return Ok(ids);
        };
        let translated = id_set(
            self.connection,
            "
            select tag_id from TAG_TRANSLATIONS
            where language = ?1 and tag_id in (select value from json_each(?2))
            ",
            params![language, id_array(&ids)?],
        )?;
        Ok(ids & translated)
    }

    /// Progressive narrowing: seed, then format, usage, type, alias and
    /// language, stopping as soon as nothing is left.
    pub fn candidates(&self, keyword: &str, filters: &SearchFilters) -> Result<Candidates> {
        let (pattern, use_like) = normalize_search_keyword(keyword, filters.partial);
        let ids = self.initial_tag_ids(&pattern, use_like)?;
        debug!(keyword, seeded = ids.len(), "seeded candidates");
        if ids.is_empty() {
            return Ok(Candidates::default());
        }
        let (ids, format_id) = self.apply_format_filter(ids, filters.format_name.as_deref())?;
        if ids.is_empty() {
            return Ok(Candidates::default());
        }
        let ids = self.apply_usage_filter(ids, format_id, filters.min_usage, filters.max_usage)?;
        if ids.is_empty() {
            return Ok(Candidates::default());
        }
        let ids = self.apply_type_filter(ids, format_id, filters.type_name.as_deref())?;
        if ids.is_empty() {
            return Ok(Candidates::default());
        }
        let ids = self.apply_alias_filter(ids, format_id, filters.alias)?;
        if ids.is_empty() {
            return Ok(Candidates::default());
        }
        let ids = self.apply_language_filter(ids, filters.language.as_deref())?;
        debug!(keyword, remaining = ids.len(), "narrowed candidates");
        Ok(Candidates { ids, format_id })
    }
}
