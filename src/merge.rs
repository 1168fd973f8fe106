use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use roaring::RoaringTreemap;
use tracing::debug;

use crate::construct::{
    FormatId, SearchFilters, Tag, TagId, TagSearchRequest, TagSearchResult, TagSearchRow,
    TagStatistics, TagStatus, TagTranslation, TagUsageCount, TypeId, TypeNameId, split_prompt,
};
use crate::error::{Result, TagDbError};
use crate::reader::StoreReader;

/// What a keyed merge does when a later store yields a key already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Later stores win; the user store is visited last.
    Overwrite,
    /// The first row seen for a key is kept.
    KeepFirst,
}

/// Presents the base stores and the optional user store as one logical
/// tag database.
///
/// Point lookups walk from the user store down to the lowest priority base
/// and stop at the first hit. Listings walk the other way round so that
/// higher priority stores overwrite lower ones by key.
#[derive(Debug, Clone)]
pub struct MergedReader {
    /// Lowest priority first.
    bases: Vec<StoreReader>,
    user: Option<StoreReader>,
}

impl MergedReader {
    /// `bases` are ordered lowest priority first.
    pub fn new(bases: Vec<StoreReader>, user: Option<StoreReader>) -> Result<Self> {
        if bases.is_empty() && user.is_none() {
            return Err(TagDbError::Config(
                "a merged reader needs at least one store".to_string(),
            ));
        }
        Ok(Self { bases, user })
    }

    pub fn bases(&self) -> &[StoreReader] {
        &self.bases
    }
    pub fn user(&self) -> Option<&StoreReader> {
        self.user.as_ref()
    }
    pub fn has_user(&self) -> bool {
        self.user.is_some()
    }

    // ------------- Merge machinery -------------
    fn highest_first(&self) -> impl Iterator<Item = &StoreReader> {
        self.user.iter().chain(self.bases.iter().rev())
    }

    fn lowest_first(&self) -> impl Iterator<Item = &StoreReader> {
        self.bases.iter().chain(self.user.iter())
    }

    fn first_found<T>(
        &self,
        mut lookup: impl FnMut(&StoreReader) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        for reader in self.highest_first() {
            if let Some(found) = lookup(reader)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Collects items from every store, lowest priority first, keeping one
    /// item per key in order of first appearance.
    fn keyed<T, K>(
        &self,
        conflict: Conflict,
        mut list: impl FnMut(&StoreReader) -> Result<Vec<T>>,
        key: impl Fn(&T) -> K,
    ) -> Result<Vec<T>>
    where
        K: Eq + Hash,
    {
        let mut positions: HashMap<K, usize> = HashMap::new();
        let mut merged: Vec<T> = Vec::new();
        for reader in self.lowest_first() {
            for item in list(reader)? {
                match positions.entry(key(&item)) {
                    Entry::Occupied(position) => {
                        if conflict == Conflict::Overwrite {
                            merged[*position.get()] = item;
                        }
                    }
                    Entry::Vacant(position) => {
                        position.insert(merged.len());
                        merged.push(item);
                    }
                }
            }
        }
        Ok(merged)
    }

    fn fold<T, A>(
        &self,
        init: A,
        mut read: impl FnMut(&StoreReader) -> Result<T>,
        mut combine: impl FnMut(A, T) -> A,
    ) -> Result<A> {
        let mut acc = init;
        for reader in self.lowest_first() {
            acc = combine(acc, read(reader)?);
        }
        Ok(acc)
    }

    // ------------- First found -------------
    pub fn get_tag_id_by_name(&self, keyword: &str, partial: bool) -> Result<Option<TagId>> {
        self.first_found(|r| r.get_tag_id_by_name(keyword, partial))
    }

    /// Exact lookup that treats wildcard characters literally.
    pub fn find_tag_id(&self, tag: &str) -> Result<Option<TagId>> {
        self.first_found(|r| r.find_tag_id(tag))
    }

    pub fn get_tag_by_id(&self, tag_id: TagId) -> Result<Option<Tag>> {
        self.first_found(|r| r.get_tag_by_id(tag_id))
    }

    pub fn get_tag_status(&self, tag_id: TagId, format_id: FormatId) -> Result<Option<TagStatus>> {
        self.first_found(|r| r.get_tag_status(tag_id, format_id))
    }

    /// `None` only when no store has a row.
    pub fn get_usage_count(&self, tag_id: TagId, format_id: FormatId) -> Result<Option<i64>> {
        self.first_found(|r| r.get_usage_count(tag_id, format_id))
    }

    /// Usage with a missing row read as 0.
    pub fn usage_count(&self, tag_id: TagId, format_id: FormatId) -> Result<i64> {
        Ok(self.get_usage_count(tag_id, format_id)?.unwrap_or(0))
    }

    pub fn get_format_id(&self, format_name: &str) -> Result<Option<FormatId>> {
        self.first_found(|r| r.get_format_id(format_name))
    }

    pub fn get_format_name(&self, format_id: FormatId) -> Result<Option<String>> {
        self.first_found(|r| r.get_format_name(format_id))
    }

    pub fn get_type_name_by_format_type_id(
        &self,
        format_id: FormatId,
        type_id: TypeId,
    ) -> Result<Option<String>> {
        self.first_found(|r| r.get_type_name_by_format_type_id(format_id, type_id))
    }

    pub fn get_type_id(&self, type_name: &str) -> Result<Option<TypeNameId>> {
        self.first_found(|r| r.get_type_id(type_name))
    }

    pub fn get_type_id_for_name(&self, format_id: FormatId, type_name: &str) -> Result<Option<TypeId>> {
        self.first_found(|r| r.get_type_id_for_name(format_id, type_name))
    }

    pub fn get_metadata_value(&self, key: &str) -> Result<Option<String>> {
        self.first_found(|r| r.get_metadata_value(key))
    }

    pub fn get_database_version(&self) -> Result<Option<String>> {
        self.first_found(|r| r.get_database_version())
    }

    // ------------- Merge by key -------------
    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        self.keyed(Conflict::Overwrite, |r| r.list_tags(), |t| t.tag_id)
    }

    pub fn list_tag_statuses(&self, tag_id: Option<TagId>) -> Result<Vec<TagStatus>> {
        self.keyed(
            Conflict::Overwrite,
            |r| r.list_tag_statuses(tag_id),
            |s| (s.tag_id, s.format_id),
        )
    }

    pub fn list_usage_counts(
        &self,
        tag_id: Option<TagId>,
        format_id: Option<FormatId>,
    ) -> Result<Vec<TagUsageCount>> {
        self.keyed(
            Conflict::Overwrite,
            |r| r.list_usage_counts(tag_id, format_id),
            |u| (u.tag_id, u.format_id),
        )
    }

    pub fn get_format_map(&self) -> Result<BTreeMap<FormatId, String>> {
        let entries = self.keyed(
            Conflict::Overwrite,
            |r| Ok(r.get_format_map()?.into_iter().collect()),
            |(format_id, _): &(FormatId, String)| *format_id,
        )?;
        Ok(entries.into_iter().collect())
    }

    pub fn get_type_mapping_map(&self) -> Result<BTreeMap<(FormatId, TypeId), String>> {
        let entries = self.keyed(
            Conflict::Overwrite,
            |r| Ok(r.get_type_mapping_map()?.into_iter().collect()),
            |(key, _): &((FormatId, TypeId), String)| *key,
        )?;
        Ok(entries.into_iter().collect())
    }

    /// Rows keyed by their (resolved) tag id; a higher priority store's row
    /// replaces a lower one's. Tag ids are local to each store, so two
    /// different tags sharing an id in different stores surface as one row,
    /// the higher priority store's.
    pub fn search_tags(&self, keyword: &str, filters: &SearchFilters) -> Result<Vec<TagSearchRow>> {
        let rows = self.keyed(
            Conflict::Overwrite,
            |r| r.search_tags(keyword, filters),
            |row| row.tag_id,
        )?;
        debug!(keyword, rows = rows.len(), "merged search");
        Ok(rows)
    }

    pub fn search_tags_bulk(
        &self,
        keywords: &[String],
        format_name: Option<&str>,
        resolve_preferred: bool,
    ) -> Result<BTreeMap<String, TagSearchRow>> {
        let entries = self.keyed(
            Conflict::Overwrite,
            |r| {
                Ok(r
                    .search_tags_bulk(keywords, format_name, resolve_preferred)?
                    .into_iter()
                    .collect())
            },
            |(keyword, _): &(String, TagSearchRow)| keyword.clone(),
        )?;
        Ok(entries.into_iter().collect())
    }

    // ------------- Accumulate unique -------------
    pub fn get_translations(&self, tag_id: TagId) -> Result<Vec<TagTranslation>> {
        self.keyed(
            Conflict::KeepFirst,
            |r| r.get_translations(tag_id),
            |t| (t.language.clone(), t.translation.clone()),
        )
    }

    pub fn list_translations(&self) -> Result<Vec<TagTranslation>> {
        self.keyed(
            Conflict::KeepFirst,
            |r| r.list_translations(),
            |t| (t.tag_id, t.language.clone(), t.translation.clone()),
        )
    }

    // ------------- Aggregates -------------
    pub fn get_max_tag_id(&self) -> Result<Option<TagId>> {
        self.fold(None, |r| r.get_max_tag_id(), |a, b| a.max(b))
    }

    pub fn get_max_format_id(&self) -> Result<Option<FormatId>> {
        self.fold(None, |r| r.get_max_format_id(), |a, b| a.max(b))
    }

    pub fn get_max_type_id(&self, format_id: FormatId) -> Result<Option<TypeId>> {
        self.fold(None, |r| r.get_max_type_id(format_id), |a, b| a.max(b))
    }

    pub fn get_all_tag_ids(&self) -> Result<RoaringTreemap> {
        self.fold(RoaringTreemap::new(), |r| r.get_all_tag_ids(), |all, ids| all | ids)
    }

    pub fn get_tag_format_ids(&self) -> Result<BTreeSet<FormatId>> {
        self.fold(BTreeSet::new(), |r| r.get_tag_format_ids(), union)
    }

    pub fn search_tag_ids(&self, keyword: &str, partial: bool) -> Result<RoaringTreemap> {
        self.fold(
            RoaringTreemap::new(),
            |r| r.search_tag_ids(keyword, partial),
            |all, ids| all | ids,
        )
    }

    // ------------- Set union -------------
    pub fn get_tag_formats(&self) -> Result<BTreeSet<String>> {
        self.fold(BTreeSet::new(), |r| r.get_tag_formats(), union)
    }

    pub fn get_tag_languages(&self) -> Result<BTreeSet<String>> {
        self.fold(BTreeSet::new(), |r| r.get_tag_languages(), union)
    }

    pub fn get_tag_types(&self, format_id: FormatId) -> Result<BTreeSet<String>> {
        self.fold(BTreeSet::new(), |r| r.get_tag_types(format_id), union)
    }

    /// Every tag string some store holds under `tag_id`.
    pub fn get_tags_by_id(&self, tag_id: TagId) -> Result<BTreeSet<String>> {
        self.fold(
            BTreeSet::new(),
            |r| Ok(r.get_tag_by_id(tag_id)?.into_iter().map(|t| t.tag).collect()),
            union,
        )
    }

    pub fn get_all_types(&self) -> Result<BTreeSet<String>> {
        self.fold(BTreeSet::new(), |r| r.get_all_types(), union)
    }

    // ------------- Public surface -------------
    /// Partial search across all stores followed by the request's filters
    /// and paging. A single format or type name also narrows the per-store
    /// search; several are only applied as post-filters.
    pub fn search(&self, request: &TagSearchRequest) -> Result<TagSearchResult> {
        let single = |names: &[String]| match names {
            [only] => Some(only.clone()),
            _ => None,
        };
        let filters = SearchFilters {
            partial: true,
            format_name: single(&request.format_names),
            type_name: single(&request.type_names),
            resolve_preferred: request.resolve_preferred,
            ..SearchFilters::default()
        };
        let rows = self.search_tags(&request.query, &filters)?;
        let matching: Vec<TagSearchRow> = rows
            .into_iter()
            .filter(|row| request.include_aliases || !row.alias)
            .filter(|row| request.include_deprecated || !row.deprecated)
            .filter(|row| {
                request.format_names.is_empty()
                    || request
                        .format_names
                        .iter()
                        .any(|name| row.format_statuses.contains_key(name))
            })
            .filter(|row| {
                request.type_names.is_empty()
                    || row
                        .type_name
                        .as_ref()
                        .is_some_and(|name| request.type_names.contains(name))
            })
            .filter(|row| request.min_usage.is_none_or(|min| row.usage_count >= min))
            .filter(|row| request.max_usage.is_none_or(|max| row.usage_count <= max))
            .collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(request.offset)
            .take(request.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(TagSearchResult { items, total })
    }

    /// Rewrites a comma separated prompt into the preferred spelling of each
    /// tag in `format_name`. Unknown tags pass through; a multi-word tag
    /// without a match is converted word by word.
    pub fn convert_tags(&self, text: &str, format_name: &str, separator: &str) -> Result<String> {
        if text.trim().is_empty() || self.get_format_id(format_name)?.is_none() {
            return Ok(text.to_string());
        }
        let tags = split_prompt(text);
        if tags.is_empty() {
            return Ok(text.to_string());
        }
        let tag_map = self.lookup_preferred(&tags, format_name)?;
        let mut word_map: BTreeMap<String, String> = BTreeMap::new();
        let mut converted: Vec<String> = Vec::with_capacity(tags.len());
        for tag in &tags {
            if let Some(preferred) = tag_map.get(tag) {
                converted.push(preferred.clone());
                continue;
            }
            if tag.contains(' ') {
                let words: Vec<String> = tag
                    .split(' ')
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect();
                let missing: Vec<String> = words
                    .iter()
                    .filter(|w| !word_map.contains_key(*w))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    word_map.extend(self.lookup_preferred(&missing, format_name)?);
                }
                converted.extend(
                    words
                        .into_iter()
                        .map(|w| word_map.get(&w).cloned().unwrap_or(w)),
                );
                continue;
            }
            converted.push(tag.clone());
        }
        Ok(converted.join(separator))
    }

    fn lookup_preferred(&self, tags: &[String], format_name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .search_tags_bulk(tags, Some(format_name), true)?
            .into_iter()
            .filter(|(_, row)| !row.tag.is_empty())
            .map(|(keyword, row)| (keyword, row.tag))
            .collect())
    }

    pub fn statistics(&self) -> Result<TagStatistics> {
        let aliased: BTreeSet<TagId> = self
            .list_tag_statuses(None)?
            .into_iter()
            .filter(|s| s.alias)
            .map(|s| s.tag_id)
            .collect();
        Ok(TagStatistics {
            total_tags: self.list_tags()?.len(),
            total_aliases: aliased.len(),
            total_formats: self.get_tag_formats()?.len(),
            total_types: self.get_all_types()?.len(),
        })
    }
}

fn union<T: Ord>(mut all: BTreeSet<T>, more: BTreeSet<T>) -> BTreeSet<T> {
    all.extend(more);
    all
}
