mod common;

use chrono::{TimeZone, Utc};
use common::{DANBOORU, base_store, context, user_store};
use tagmerge::TagDbError;
use tagmerge::construct::{
    NewTag, TagRegisterRequest, TagStatus, TagStatusUpdate, TagTypeUpdate, TranslationInput,
};
use tagmerge::interface::CancelToken;
use tagmerge::persist::{Store, StoreRole};
use tagmerge::reader::StoreReader;
use tagmerge::writer::StoreWriter;

fn is_validation<T>(result: tagmerge::Result<T>) -> bool {
    matches!(result, Err(TagDbError::Validation(_)))
}

// an unbound writer over a store holding cat (1), kitten (2) and danbooru
fn local_writer() -> StoreWriter {
    let store = user_store();
    store
        .write(|c| {
            c.execute_batch(&format!(
                "{DANBOORU}
                insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat'), (2, 'kitten', 'kitten');"
            ))?;
            Ok(())
        })
        .unwrap();
    StoreWriter::new(store, None).unwrap()
}

#[test]
fn creating_a_tag_twice_returns_the_same_id() {
    let context = context(Vec::new());
    let writer = context.writer().unwrap();
    let first = writer.create_tag("long_hair", "long hair").unwrap();
    let second = writer.create_tag("long_hair", "long hair").unwrap();
    assert_eq!(first, second);
    assert_eq!(context.reader().list_tags().unwrap().len(), 1);
    assert!(is_validation(writer.create_tag("x", " ")));
}

#[test]
fn new_tags_are_numbered_above_every_store() {
    let base = base_store(
        "base",
        "insert into TAGS (tag_id, source_tag, tag) values (41, 'cat', 'cat');",
    );
    let context = context(vec![base]);
    let writer = context.writer().unwrap();
    assert_eq!(writer.create_tag("cat", "cat").unwrap(), 41);
    assert_eq!(writer.create_tag("dog", "dog").unwrap(), 42);
    let inserted = writer
        .bulk_insert_tags(&[
            NewTag::new("bird", "bird"),
            NewTag::new("bird", "bird"),
            NewTag::new("dog", "dog"),
        ])
        .unwrap();
    assert_eq!(inserted, 1);
    assert_eq!(context.reader().find_tag_id("bird").unwrap(), Some(43));
}

#[test]
fn unbound_writers_let_sqlite_choose_ids() {
    let writer = StoreWriter::new(user_store(), None).unwrap();
    assert_eq!(writer.create_tag("cat", "cat").unwrap(), 1);
    assert_eq!(writer.create_format_if_not_exists("danbooru", None).unwrap(), 1);
    assert_eq!(writer.create_format_if_not_exists("e621", None).unwrap(), 2);
    assert_eq!(writer.create_format_if_not_exists("danbooru", None).unwrap(), 1);
}

#[test]
fn status_updates_are_validated() {
    let writer = local_writer();
    let mut not_alias = TagStatusUpdate::preferred(1, 1);
    not_alias.preferred_tag_id = 2;
    assert!(is_validation(writer.update_tag_status(&not_alias)));

    let self_alias = TagStatusUpdate {
        alias: true,
        ..TagStatusUpdate::preferred(1, 1)
    };
    assert!(is_validation(writer.update_tag_status(&self_alias)));

    assert!(is_validation(writer.update_tag_status(&TagStatusUpdate::preferred(99, 1))));
    assert!(is_validation(writer.update_tag_status(&TagStatusUpdate::alias_of(1, 1, 99))));
    assert!(is_validation(writer.update_tag_status(&TagStatusUpdate::preferred(1, 7))));
    assert!(is_validation(
        writer.update_tag_status(&TagStatusUpdate::preferred(1, 1).with_type(3))
    ));

    let reader = StoreReader::new(writer.store().clone());
    assert!(reader.list_tag_statuses(None).unwrap().is_empty());

    writer
        .update_tag_status(&TagStatusUpdate::alias_of(1, 1, 2).with_type(4))
        .unwrap();
    // type is kept when not given
    writer
        .update_tag_status(&TagStatusUpdate::preferred(1, 1).with_deprecated(true))
        .unwrap();
    let status = reader.get_tag_status(1, 1).unwrap().unwrap();
    assert!(!status.alias);
    assert_eq!(status.preferred_tag_id, 1);
    assert_eq!(status.type_id, 4);
    assert!(status.deprecated);
    assert!(writer.delete_tag_status(1, 1).unwrap());
    assert!(!writer.delete_tag_status(1, 1).unwrap());
}

#[test]
fn failed_transactions_leave_no_trace() {
    let writer = local_writer();
    let result: tagmerge::Result<()> = writer.store().write(|c| {
        c.execute_batch("insert into TAGS (tag_id, source_tag, tag) values (3, 'dog', 'dog');")?;
        Err(TagDbError::validation("stop"))
    });
    assert!(result.is_err());
    let reader = StoreReader::new(writer.store().clone());
    assert_eq!(reader.get_tag_by_id(3).unwrap(), None);
    assert!(is_validation(writer.create_tag_with_id(1, "dog", "dog")));
    assert_eq!(reader.list_tags().unwrap().len(), 2);
}

#[test]
fn new_formats_are_numbered_above_every_store() {
    let low = base_store(
        "low",
        "insert into TAG_FORMATS (format_id, format_name) values (5, 'e621');",
    );
    let high = base_store(
        "high",
        "insert into TAG_FORMATS (format_id, format_name) values (7, 'derpibooru');",
    );
    let context = context(vec![low, high]);
    let writer = context.writer().unwrap();
    assert_eq!(writer.create_format_if_not_exists("Lorairo", None).unwrap(), 8);
    assert_eq!(writer.create_format_if_not_exists("Lorairo", None).unwrap(), 8);
    // a base format keeps its id in the user store
    assert_eq!(writer.create_format_if_not_exists("e621", None).unwrap(), 5);
    assert_eq!(context.reader().get_format_id("Lorairo").unwrap(), Some(8));
    assert_eq!(context.reader().get_max_format_id().unwrap(), Some(8));
}

#[test]
fn types_reuse_known_ids_and_extend_the_format() {
    let base = base_store("base", DANBOORU);
    let context = context(vec![base]);
    let writer = context.writer().unwrap();
    assert_eq!(writer.create_format_if_not_exists("danbooru", None).unwrap(), 1);
    assert_eq!(writer.get_next_type_id(1).unwrap(), 5);
    assert_eq!(writer.ensure_type_for_format(1, "character").unwrap(), 4);
    assert_eq!(writer.ensure_type_for_format(1, "meta").unwrap(), 5);
    assert_eq!(writer.ensure_type_for_format(1, "meta").unwrap(), 5);
    assert_eq!(writer.get_next_type_id(1).unwrap(), 6);

    let format_id = writer.create_format_if_not_exists("Lorairo", None).unwrap();
    assert_eq!(writer.get_next_type_id(format_id).unwrap(), 0);
    assert_eq!(writer.ensure_type_for_format(format_id, "general").unwrap(), 0);
    assert_eq!(
        context
            .reader()
            .get_type_name_by_format_type_id(format_id, 0)
            .unwrap()
            .as_deref(),
        Some("general")
    );
}

#[test]
fn type_batches_provision_types_and_stop_when_cancelled() {
    let base = base_store(
        "base",
        &format!(
            "{DANBOORU}
            insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat');
            insert into TAG_STATUS (tag_id, format_id, type_id, alias, preferred_tag_id)
                values (1, 1, 0, false, 1);"
        ),
    );
    let context = context(vec![base]);
    let writer = context.writer().unwrap();
    let registered = writer
        .register_tag(&TagRegisterRequest::new("cat", "danbooru", "general"))
        .unwrap();
    assert_eq!(registered.tag_id, 1);
    assert!(!registered.created);

    let updates = vec![TagTypeUpdate {
        tag_id: 1,
        type_name: "meta".into(),
    }];
    assert_eq!(
        writer.update_tags_type_batch(1, &updates, &CancelToken::new()).unwrap(),
        1
    );
    let status = context.reader().get_tag_status(1, 1).unwrap().unwrap();
    assert_eq!(status.type_id, 5);
    assert_eq!(
        context.reader().get_type_name_by_format_type_id(1, 5).unwrap().as_deref(),
        Some("meta")
    );

    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(
        writer.update_tags_type_batch(1, &updates, &cancel),
        Err(TagDbError::Cancelled)
    ));
}

#[test]
fn translations_and_usage_are_checked() {
    let writer = local_writer();
    assert!(writer.add_or_update_translation(1, "ja", "ねこ").unwrap());
    assert!(!writer.add_or_update_translation(1, "ja", "ねこ").unwrap());
    assert!(writer.add_or_update_translation(1, "ja", "猫").unwrap());
    assert!(is_validation(writer.add_or_update_translation(99, "ja", "ねこ")));
    let reader = StoreReader::new(writer.store().clone());
    assert_eq!(reader.get_translations(1).unwrap().len(), 2);

    assert!(is_validation(writer.update_usage_count(1, 1, -1, None)));
    writer.update_usage_count(1, 1, 10, None).unwrap();
    writer.update_usage_count(1, 1, 12, None).unwrap();
    assert_eq!(reader.get_usage_count(1, 1).unwrap(), Some(12));
    assert_eq!(reader.get_usage_count(2, 1).unwrap(), None);
}

#[test]
fn exported_statuses_import_back() {
    let context = context(Vec::new());
    let writer = context.writer().unwrap();
    let mut request = TagRegisterRequest::new("cat", "danbooru", "general");
    request.alias_of = Some("kitten".into());
    request.translations.push(TranslationInput {
        language: "ja".into(),
        translation: "ねこ".into(),
    });
    request.usage_count = Some(3);
    writer.register_tag(&request).unwrap();

    let stamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let format_id = context.reader().get_format_id("danbooru").unwrap().unwrap();
    let kitten = context.reader().find_tag_id("kitten").unwrap().unwrap();
    writer
        .update_tag_status(&TagStatusUpdate {
            deprecated: Some(true),
            deprecated_at: Some(stamp),
            source_created_at: Some(stamp),
            updated_at: Some(stamp),
            ..TagStatusUpdate::preferred(kitten, format_id)
        })
        .unwrap();

    let local = StoreReader::new(writer.store().clone());
    let exported = serde_json::to_string(&local.list_tag_statuses(None).unwrap()).unwrap();
    let statuses: Vec<TagStatus> = serde_json::from_str(&exported).unwrap();
    assert_eq!(statuses.len(), 2);
    for status in &statuses {
        assert!(writer.delete_tag_status(status.tag_id, status.format_id).unwrap());
    }
    assert!(local.list_tag_statuses(None).unwrap().is_empty());

    assert_eq!(
        writer.import_tag_statuses(&statuses, &CancelToken::new()).unwrap(),
        2
    );
    let row = |s: &TagStatus| {
        (
            (s.tag_id, s.format_id, s.type_id, s.alias, s.preferred_tag_id),
            (s.deprecated, s.deprecated_at, s.source_created_at, s.updated_at),
        )
    };
    let mut before: Vec<_> = statuses.iter().map(row).collect();
    let mut after: Vec<_> = local.list_tag_statuses(None).unwrap().iter().map(row).collect();
    before.sort();
    after.sort();
    assert_eq!(before, after);

    let restored = local.get_tag_status(kitten, format_id).unwrap().unwrap();
    assert!(restored.deprecated);
    assert_eq!(restored.deprecated_at, Some(stamp));
    assert_eq!(restored.source_created_at, Some(stamp));
    assert_eq!(restored.updated_at, Some(stamp));
}

#[test]
fn explicit_ids_must_not_clash() {
    let writer = StoreWriter::new(user_store(), None).unwrap();
    assert_eq!(writer.create_tag_with_id(10, "a", "a").unwrap(), 10);
    assert_eq!(writer.create_tag_with_id(10, "a", "a").unwrap(), 10);
    assert!(is_validation(writer.create_tag_with_id(10, "b", "b")));
    assert!(is_validation(writer.create_tag_with_id(11, "a", "a")));

    writer.update_tag(10, None, Some("aa")).unwrap();
    assert!(is_validation(writer.update_tag(12, None, Some("c"))));
    let reader = StoreReader::new(writer.store().clone());
    assert_eq!(reader.get_tag_by_id(10).unwrap().unwrap().tag, "aa");
}

#[test]
fn materialized_ids_follow_the_merged_view() {
    let base = base_store(
        "base",
        "insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat');",
    );
    let context = context(vec![base]);
    let writer = context.writer().unwrap();
    assert!(is_validation(writer.ensure_tag_with_id(1, "dog", "dog")));
    assert_eq!(writer.ensure_tag_with_id(1, "cat", "cat").unwrap(), 1);
    let local = StoreReader::new(writer.store().clone());
    assert_eq!(local.get_tag_by_id(1).unwrap().unwrap().tag, "cat");
}

#[test]
fn registering_across_bases_sharing_an_id() {
    let low = base_store(
        "low",
        "insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat');",
    );
    let high = base_store(
        "high",
        "insert into TAGS (tag_id, source_tag, tag) values (1, 'dog', 'dog');",
    );
    let context = context(vec![low, high]);
    let writer = context.writer().unwrap();

    let cat = writer
        .register_tag(&TagRegisterRequest::new("cat", "danbooru", "general"))
        .unwrap();
    assert!(!cat.created);
    assert_eq!(cat.tag_id, 2);
    let dog = writer
        .register_tag(&TagRegisterRequest::new("dog", "danbooru", "general"))
        .unwrap();
    assert!(!dog.created);
    assert_eq!(dog.tag_id, 3);

    let reader = context.reader();
    assert_eq!(reader.find_tag_id("cat").unwrap(), Some(2));
    assert_eq!(reader.find_tag_id("dog").unwrap(), Some(3));
    assert_eq!(reader.get_tag_by_id(1).unwrap().unwrap().tag, "dog");
    let local = StoreReader::new(writer.store().clone());
    assert_eq!(local.get_tag_by_id(1).unwrap(), None);
    assert_eq!(local.get_tag_by_id(2).unwrap().unwrap().tag, "cat");
    assert!(local.get_tag_status(2, 1).unwrap().is_some());
}

#[test]
fn type_mappings_resolve_name_and_id_collisions() {
    let seed = "
        insert into TAG_FORMATS (format_id, format_name) values (1000, 'Test');
        insert into TAG_TYPE_NAME (type_name_id, type_name) values (1, 'character'), (2, 'general');
    ";
    let writer = StoreWriter::new(user_store(), None).unwrap();
    writer
        .store()
        .write(|c| {
            c.execute_batch(&format!(
                "{seed}
                insert into TAG_TYPE_FORMAT_MAPPING (format_id, type_id, type_name_id) values (1000, 3, 1);"
            ))?;
            Ok(())
        })
        .unwrap();
    // the name is already mapped, so its type id is kept
    assert_eq!(
        writer.create_type_format_mapping_if_not_exists(1000, 9, 1, None).unwrap(),
        3
    );
    let reader = StoreReader::new(writer.store().clone());
    assert_eq!(reader.get_type_mapping_map().unwrap().len(), 1);

    let writer = StoreWriter::new(user_store(), None).unwrap();
    writer
        .store()
        .write(|c| {
            c.execute_batch(&format!(
                "{seed}
                insert into TAG_TYPE_FORMAT_MAPPING (format_id, type_id, type_name_id) values (1000, 1, 1);"
            ))?;
            Ok(())
        })
        .unwrap();
    // type id 1 belongs to another name
    assert_eq!(
        writer.create_type_format_mapping_if_not_exists(1000, 1, 2, None).unwrap(),
        2
    );
    let reader = StoreReader::new(writer.store().clone());
    let mappings: Vec<_> = reader.get_type_mapping_map().unwrap().into_iter().collect();
    assert_eq!(
        mappings,
        vec![
            ((1000, 1), "character".to_string()),
            ((1000, 2), "general".to_string()),
        ]
    );
}

#[test]
fn type_batches_copy_base_only_tags() {
    let base = base_store(
        "base",
        &format!(
            "{DANBOORU}
            insert into TAGS (tag_id, source_tag, tag) values (1, 'cat', 'cat'), (2, 'kitten', 'kitten');
            insert into TAG_STATUS (tag_id, format_id, type_id, alias, preferred_tag_id)
                values (1, 1, 0, false, 1), (2, 1, 0, true, 1);"
        ),
    );
    let context = context(vec![base]);
    let writer = context.writer().unwrap();
    let updates = vec![
        TagTypeUpdate {
            tag_id: 1,
            type_name: "character".into(),
        },
        TagTypeUpdate {
            tag_id: 2,
            type_name: "general".into(),
        },
    ];
    assert_eq!(
        writer.update_tags_type_batch(1, &updates, &CancelToken::new()).unwrap(),
        2
    );

    let local = StoreReader::new(writer.store().clone());
    assert_eq!(local.get_format_name(1).unwrap().as_deref(), Some("danbooru"));
    let cat = local.get_tag_status(1, 1).unwrap().unwrap();
    assert_eq!(cat.type_id, 4);
    assert!(!cat.alias);
    let kitten = local.get_tag_status(2, 1).unwrap().unwrap();
    assert_eq!(kitten.type_id, 0);
    assert!(kitten.alias);
    assert_eq!(kitten.preferred_tag_id, 1);
    assert_eq!(context.reader().get_tag_status(1, 1).unwrap().unwrap().type_id, 4);

    let unknown = vec![TagTypeUpdate {
        tag_id: 99,
        type_name: "general".into(),
    }];
    assert!(is_validation(
        writer.update_tags_type_batch(1, &unknown, &CancelToken::new())
    ));
}

#[test]
fn ids_do_not_wrap_around() {
    let base = base_store(
        "base",
        "
        insert into TAGS (tag_id, source_tag, tag) values (9223372036854775807, 'cat', 'cat');
        insert into TAG_FORMATS (format_id, format_name) values (9223372036854775807, 'e621');
        ",
    );
    let context = context(vec![base]);
    let writer = context.writer().unwrap();
    assert!(is_validation(writer.create_tag("dog", "dog")));
    assert!(is_validation(writer.create_format_if_not_exists("Lorairo", None)));
    assert_eq!(writer.create_format_if_not_exists("e621", None).unwrap(), i64::MAX);
}

#[test]
fn base_stores_cannot_be_written() {
    let store = Store::open_in_memory("base", StoreRole::Base).unwrap();
    assert!(matches!(
        StoreWriter::new(store, None),
        Err(TagDbError::Config(_))
    ));
}

#[test]
fn metadata_is_overwritten_by_key() {
    let context = context(Vec::new());
    let writer = context.writer().unwrap();
    writer.set_metadata_value("version", "1").unwrap();
    writer.set_metadata_value("version", "2").unwrap();
    assert_eq!(
        context.reader().get_database_version().unwrap().as_deref(),
        Some("2")
    );
    assert_eq!(context.reader().get_metadata_value("missing").unwrap(), None);
}
