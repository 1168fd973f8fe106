use std::collections::BTreeMap;

use tracing::warn;

use crate::construct::{FormatId, FormatStatusView, TagId, TagSearchRow};
use crate::preload::Preloaded;

/// Assembles denormalized rows from preloaded data. Never touches the store.
#[derive(Debug, Clone, Copy)]
pub struct ResultBuilder {
    format_id: Option<FormatId>,
    resolve_preferred: bool,
}

impl ResultBuilder {
    pub fn new(format_id: Option<FormatId>, resolve_preferred: bool) -> Self {
        Self {
            format_id,
            resolve_preferred,
        }
    }

    /// `None` drops the candidate: either its tag row is missing or its
    /// status in the active format has an unreadable alias flag.
    pub fn build_row(&self, tag_id: TagId, preloaded: &Preloaded) -> Option<TagSearchRow> {
        let tag = preloaded.tags.get(&tag_id)?;
        let mut row = TagSearchRow {
            tag_id,
            tag: tag.tag.clone(),
            source_tag: tag.source_tag.clone(),
            usage_count: 0,
            alias: false,
            deprecated: false,
            type_id: None,
            type_name: None,
            translations: BTreeMap::new(),
            format_statuses: BTreeMap::new(),
        };
        let mut preferred_tag_id = tag_id;
        if let Some(format_id) = self.format_id {
            if let Some(status) = preloaded.status(tag_id, format_id) {
                let Some(alias) = status.alias else {
                    warn!(tag_id, format_id, "skipping status with unreadable alias flag");
                    return None;
                };
                row.alias = alias;
                row.deprecated = status.deprecated;
                row.type_id = Some(status.type_id);
                row.type_name = preloaded
                    .type_names
                    .get(&(format_id, status.type_id))
                    .cloned();
                preferred_tag_id = status.preferred_tag_id;
            }
            row.usage_count = preloaded.usage_count(tag_id, format_id);
        }
        if self.resolve_preferred && preferred_tag_id != tag_id {
            // a dangling preferred id keeps the original tag
            if let Some(preferred) = preloaded.tags.get(&preferred_tag_id) {
                row.tag_id = preferred.tag_id;
                row.tag = preferred.tag.clone();
                row.source_tag = preferred.source_tag.clone();
            }
        }
        row.translations = translations_of(row.tag_id, preloaded);
        row.format_statuses = format_statuses_of(row.tag_id, preloaded);
        Some(row)
    }
}

fn translations_of(tag_id: TagId, preloaded: &Preloaded) -> BTreeMap<String, Vec<String>> {
    let mut by_language: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (language, translation) in preloaded.translations.get(&tag_id).into_iter().flatten() {
        let texts = by_language.entry(language.clone()).or_default();
        if !texts.contains(translation) {
            texts.push(translation.clone());
        }
    }
    by_language
}

fn format_statuses_of(tag_id: TagId, preloaded: &Preloaded) -> BTreeMap<String, FormatStatusView> {
    let mut views = BTreeMap::new();
    for status in preloaded.statuses_by_tag.get(&tag_id).into_iter().flatten() {
        let Some(format_name) = preloaded.format_names.get(&status.format_id) else {
            continue;
        };
        let Some(alias) = status.alias else {
            warn!(
                tag_id,
                format_id = status.format_id,
                "leaving out format status with unreadable alias flag"
            );
            continue;
        };
        views.insert(
            format_name.clone(),
            FormatStatusView {
                alias,
                deprecated: status.deprecated,
                usage_count: preloaded.usage_count(tag_id, status.format_id),
                type_id: status.type_id,
                type_name: preloaded
                    .type_names
                    .get(&(status.format_id, status.type_id))
                    .cloned(),
            },
        );
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::Tag;
    use crate::preload::StatusRow;

    fn tag(tag_id: TagId, text: &str) -> Tag {
        Tag {
            tag_id,
            tag: text.into(),
            source_tag: text.into(),
            created_at: None,
            updated_at: None,
        }
    }

    fn status(tag_id: TagId, alias: Option<bool>, preferred_tag_id: TagId) -> StatusRow {
        StatusRow {
            tag_id,
            format_id: 1,
            type_id: 0,
            alias,
            preferred_tag_id,
            deprecated: false,
        }
    }

    fn preloaded() -> Preloaded {
        let mut preloaded = Preloaded::default();
        preloaded.tags.insert(1, tag(1, "cat"));
        preloaded.tags.insert(2, tag(2, "kitten"));
        preloaded.tags.insert(3, tag(3, "broken"));
        for row in [status(1, Some(true), 2), status(2, Some(false), 2), status(3, None, 3)] {
            preloaded
                .statuses_by_tag
                .entry(row.tag_id)
                .or_default()
                .push(row.clone());
            preloaded.statuses.insert((row.tag_id, row.format_id), row);
        }
        preloaded.usage.insert((2, 1), 40);
        preloaded.format_names.insert(1, "danbooru".into());
        preloaded.type_names.insert((1, 0), "general".into());
        preloaded.translations.insert(
            2,
            vec![
                ("ja".into(), "子猫".into()),
                ("ja".into(), "子猫".into()),
                ("en".into(), "kitty".into()),
            ],
        );
        preloaded
    }

    #[test]
    fn aliases_resolve_to_their_preferred_tag() {
        let preloaded = preloaded();
        let row = ResultBuilder::new(Some(1), true)
            .build_row(1, &preloaded)
            .unwrap();
        assert_eq!(row.tag_id, 2);
        assert_eq!(row.tag, "kitten");
        assert!(row.alias);
        assert_eq!(row.usage_count, 0);
        assert_eq!(row.type_name.as_deref(), Some("general"));
        assert_eq!(row.translations["ja"], vec!["子猫"]);
        assert_eq!(row.format_statuses["danbooru"].usage_count, 40);
    }

    #[test]
    fn unresolved_aliases_keep_their_own_tag() {
        let row = ResultBuilder::new(Some(1), false)
            .build_row(1, &preloaded())
            .unwrap();
        assert_eq!(row.tag, "cat");
        assert!(row.alias);
    }

    #[test]
    fn unreadable_alias_drops_the_row() {
        assert!(ResultBuilder::new(Some(1), true).build_row(3, &preloaded()).is_none());
    }

    #[test]
    fn no_active_format_gives_neutral_values() {
        let row = ResultBuilder::new(None, true).build_row(1, &preloaded()).unwrap();
        assert_eq!(row.tag, "cat");
        assert!(!row.alias);
        assert_eq!(row.type_id, None);
        assert!(row.format_statuses["danbooru"].alias);
    }
}
