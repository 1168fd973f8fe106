use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

// ------------- Identifiers -------------
// All identifiers are local to the store that issued them. Two stores agree
// on a tag only through its string, and on a format only through an explicit
// reservation of the same format_id.
pub type TagId = i64;
pub type FormatId = i64;
pub type TypeId = i64;
pub type TypeNameId = i64;

pub type Timestamp = DateTime<Utc>;

// ------------- Tag -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub tag_id: TagId,
    pub tag: String,
    pub source_tag: String,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}

/// Input for inserting tags whose identifiers the store chooses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTag {
    pub source_tag: String,
    pub tag: String,
}
impl NewTag {
    pub fn new(source_tag: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            tag: tag.into(),
        }
    }
}

// ------------- TagStatus -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStatus {
    pub tag_id: TagId,
    pub format_id: FormatId,
    pub type_id: TypeId,
    pub alias: bool,
    pub preferred_tag_id: TagId,
    pub deprecated: bool,
    pub deprecated_at: Option<Timestamp>,
    pub source_created_at: Option<Timestamp>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}
impl TagStatus {
    /// `alias == false` exactly when the tag prefers itself.
    pub fn is_consistent(&self) -> bool {
        self.alias == (self.preferred_tag_id != self.tag_id)
    }
}

/// Requested state of one (tag, format) status row.
///
/// `type_id: None` keeps the type of an existing row, or 0 for a new one.
/// The remaining optional fields leave the stored value untouched when `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagStatusUpdate {
    pub tag_id: TagId,
    pub format_id: FormatId,
    pub alias: bool,
    pub preferred_tag_id: TagId,
    pub type_id: Option<TypeId>,
    pub deprecated: Option<bool>,
    pub deprecated_at: Option<Timestamp>,
    pub source_created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
}
impl TagStatusUpdate {
    pub fn preferred(tag_id: TagId, format_id: FormatId) -> Self {
        Self::alias_of(tag_id, format_id, tag_id)
    }
    pub fn alias_of(tag_id: TagId, format_id: FormatId, preferred_tag_id: TagId) -> Self {
        Self {
            tag_id,
            format_id,
            alias: preferred_tag_id != tag_id,
            preferred_tag_id,
            type_id: None,
            deprecated: None,
            deprecated_at: None,
            source_created_at: None,
            updated_at: None,
        }
    }
    pub fn with_type(mut self, type_id: TypeId) -> Self {
        self.type_id = Some(type_id);
        self
    }
    pub fn with_deprecated(mut self, deprecated: bool) -> Self {
        self.deprecated = Some(deprecated);
        self
    }
}
impl From<&TagStatus> for TagStatusUpdate {
    fn from(status: &TagStatus) -> Self {
        Self {
            tag_id: status.tag_id,
            format_id: status.format_id,
            alias: status.alias,
            preferred_tag_id: status.preferred_tag_id,
            type_id: Some(status.type_id),
            deprecated: Some(status.deprecated),
            deprecated_at: status.deprecated_at,
            source_created_at: status.source_created_at,
            updated_at: status.updated_at,
        }
    }
}

// ------------- Translation -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagTranslation {
    pub translation_id: i64,
    pub tag_id: TagId,
    pub language: String,
    pub translation: String,
}

// ------------- Usage -------------
// A missing (tag, format) row is a count of zero, never "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagUsageCount {
    pub tag_id: TagId,
    pub format_id: FormatId,
    pub count: i64,
    pub updated_at: Option<Timestamp>,
}

// ------------- Vocabulary -------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub format_id: FormatId,
    pub format_name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeName {
    pub type_name_id: TypeNameId,
    pub type_name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFormatMapping {
    pub format_id: FormatId,
    pub type_id: TypeId,
    pub type_name_id: TypeNameId,
    pub description: Option<String>,
}

/// One entry of a batch type reassignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTypeUpdate {
    pub tag_id: TagId,
    pub type_name: String,
}

// ------------- Search -------------
/// Filters applied by a single-store search, in the order they narrow the
/// candidate set. `None` (or a name of `all`) disables a filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub partial: bool,
    pub format_name: Option<String>,
    pub type_name: Option<String>,
    pub language: Option<String>,
    pub min_usage: Option<i64>,
    pub max_usage: Option<i64>,
    pub alias: Option<bool>,
    pub resolve_preferred: bool,
}
impl SearchFilters {
    pub fn partial() -> Self {
        Self {
            partial: true,
            ..Self::default()
        }
    }
    pub fn in_format(format_name: impl Into<String>) -> Self {
        Self {
            format_name: Some(format_name.into()),
            ..Self::default()
        }
    }
}

/// Status of the resolved tag in one format, independent of the search's
/// active format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatStatusView {
    pub alias: bool,
    pub deprecated: bool,
    pub usage_count: i64,
    pub type_id: TypeId,
    pub type_name: Option<String>,
}

/// A denormalized search hit.
///
/// `alias`, `deprecated`, `usage_count` and the type fields describe the tag
/// in the active format; without an active format they are the neutral
/// values (`false`, `false`, 0, `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSearchRow {
    pub tag_id: TagId,
    pub tag: String,
    pub source_tag: String,
    pub usage_count: i64,
    pub alias: bool,
    pub deprecated: bool,
    pub type_id: Option<TypeId>,
    pub type_name: Option<String>,
    pub translations: BTreeMap<String, Vec<String>>,
    pub format_statuses: BTreeMap<String, FormatStatusView>,
}

/// Merged search with the post-filters of the public search surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSearchRequest {
    pub query: String,
    pub format_names: Vec<String>,
    pub type_names: Vec<String>,
    pub resolve_preferred: bool,
    pub include_aliases: bool,
    pub include_deprecated: bool,
    pub min_usage: Option<i64>,
    pub max_usage: Option<i64>,
    pub limit: Option<usize>,
    pub offset: usize,
}
impl TagSearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            format_names: Vec::new(),
            type_names: Vec::new(),
            resolve_preferred: true,
            include_aliases: true,
            include_deprecated: false,
            min_usage: None,
            max_usage: None,
            limit: None,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagSearchResult {
    pub items: Vec<TagSearchRow>,
    pub total: usize,
}

// ------------- Registration -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationInput {
    pub language: String,
    pub translation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRegisterRequest {
    pub tag: String,
    /// Defaults to `tag` when absent.
    pub source_tag: Option<String>,
    pub format_name: String,
    pub type_name: String,
    /// Preferred tag string; registers `tag` as its alias.
    pub alias_of: Option<String>,
    pub translations: Vec<TranslationInput>,
    pub usage_count: Option<i64>,
}
impl TagRegisterRequest {
    pub fn new(
        tag: impl Into<String>,
        format_name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            source_tag: None,
            format_name: format_name.into(),
            type_name: type_name.into(),
            alias_of: None,
            translations: Vec::new(),
            usage_count: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRegisterResult {
    pub tag_id: TagId,
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TagStatistics {
    pub total_tags: usize,
    pub total_aliases: usize,
    pub total_formats: usize,
    pub total_types: usize,
}
impl fmt::Display for TagStatistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} tags ({} aliased), {} formats, {} types",
            self.total_tags, self.total_aliases, self.total_formats, self.total_types
        )
    }
}

// ------------- Normalization -------------
lazy_static! {
    static ref REPEATED_BACKSLASH: Regex = Regex::new(r"\\+").unwrap();
    static ref REPEATED_COMMA: Regex = Regex::new(r",+").unwrap();
    static ref REPEATED_SPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref BRACKET: Regex = Regex::new(r"[()]").unwrap();
}

/// Brings free text into the canonical tag spelling: underscores become
/// spaces (except inside `^_^`), markup is dropped, brackets are escaped and
/// repeated separators collapse.
pub fn normalize_tag(text: &str) -> String {
    let text = text
        .replace("^_^", "^\u{1}^")
        .replace('_', " ")
        .replace("^\u{1}^", "^_^")
        .replace('#', "")
        .replace("**", "")
        .replace('\n', ", ")
        .replace('\u{2014}', "-");
    let text = BRACKET.replace_all(&text, r"\$0");
    let text = REPEATED_BACKSLASH.replace_all(&text, r"\");
    let text = REPEATED_COMMA.replace_all(&text, ",");
    let text = REPEATED_SPACE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Splits a comma separated prompt into normalized, duplicate-free tags,
/// keeping their first-seen order.
pub fn split_prompt(prompt: &str) -> Vec<String> {
    let normalized = normalize_tag(prompt);
    let mut seen = std::collections::HashSet::new();
    normalized
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underscores_become_spaces_except_in_faces() {
        assert_eq!(normalize_tag("long_hair"), "long hair");
        assert_eq!(normalize_tag("smile ^_^"), "smile ^_^");
    }

    #[test]
    fn brackets_are_escaped_once() {
        assert_eq!(normalize_tag("saber (fate)"), r"saber \(fate\)");
        assert_eq!(normalize_tag(r"saber \(fate\)"), r"saber \(fate\)");
    }

    #[test]
    fn separators_collapse() {
        assert_eq!(normalize_tag("  a,,, b   c\n"), "a, b c,");
    }

    #[test]
    fn prompt_split_dedupes_in_order() {
        assert_eq!(
            split_prompt("1girl, long_hair, 1girl,, smile"),
            vec!["1girl", "long hair", "smile"]
        );
    }

    #[test]
    fn status_update_constructors_keep_invariant() {
        let own = TagStatusUpdate::preferred(3, 1);
        assert!(!own.alias);
        assert_eq!(own.preferred_tag_id, 3);
        let alias = TagStatusUpdate::alias_of(3, 1, 9);
        assert!(alias.alias);
        assert_eq!(alias.preferred_tag_id, 9);
    }
}
