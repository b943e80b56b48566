// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use antler_lib::item::Item;
use antler_lib::schema::FieldMap;
use antler_lib::schema::FieldSpec;
use antler_lib::schema::Registry;
use antler_lib::schema::Schema;
use antler_lib::value::FieldType;
use antler_lib::value::Value;
use testutils::TestDb;

fn note_v1() -> Arc<Schema> {
    Schema::new("note", 1)
        .field("text", FieldSpec::new(FieldType::String))
        .build()
}

fn note_v2() -> Arc<Schema> {
    Schema::new("note", 2)
        .field("title", FieldSpec::new(FieldType::String))
        .with_upgrade(|data, _from| {
            if let Some(text) = data.shift_remove("text") {
                data.insert("title".to_owned(), text);
            }
        })
        .build()
}

fn note_db() -> TestDb {
    TestDb::init_with(|mut config| {
        let registry = Registry::with_builtins();
        registry.register(note_v1());
        config.registry = registry;
        config
    })
}

#[test]
fn test_upgrade_on_open() {
    let test_db = note_db();
    let mut v1_item = Item::new(note_v1(), FieldMap::new()).unwrap();
    v1_item.set("text", "remember me").unwrap();
    test_db.db.set_item("/notes/n/one", &v1_item).unwrap();

    // v2 lands later; already-stored items upgrade when opened.
    test_db.db.registry().register(note_v2());
    let managed = test_db.db.manage("/notes/n/one").unwrap();
    managed.read(|item| {
        assert_eq!(item.schema().marker(), "note/2");
        assert_eq!(item.get("title").unwrap(), Some(Value::from("remember me")));
    });

    managed
        .with_mut(|item| item.set("title", "remember me!"))
        .unwrap();
    managed.commit().unwrap().expect("a commit");

    // The persisted head now speaks v2.
    let handle = test_db.db.open_repo("/notes/n").unwrap();
    let (item_marker, wire_marker) = handle.with_state(|repo| {
        let head = repo.head("one").unwrap();
        let item_marker = repo.item_for_commit(&head).schema().marker();
        let wire_marker = repo
            .commit(&head)
            .and_then(|commit| commit.record())
            .map(|record| record.schema_marker.clone());
        (item_marker, wire_marker)
    });
    assert_eq!(item_marker, "note/2");
    // Full commits carry the marker on the wire; deltas pin it through
    // their destination checksum instead.
    if let Some(marker) = wire_marker {
        assert_eq!(marker, "note/2");
    }
}

#[test]
fn test_missing_intermediate_version_keeps_item_as_is() {
    let test_db = note_db();
    let mut v1_item = Item::new(note_v1(), FieldMap::new()).unwrap();
    v1_item.set("text", "stuck").unwrap();
    test_db.db.set_item("/notes/n/one", &v1_item).unwrap();

    // v3 exists but v2 was never registered: no upgrade path.
    test_db.db.registry().register(
        Schema::new("note", 3)
            .field("title", FieldSpec::new(FieldType::String))
            .build(),
    );
    let managed = test_db.db.manage("/notes/n/one").unwrap();
    managed.read(|item| {
        assert_eq!(item.schema().marker(), "note/1");
        assert_eq!(item.get("text").unwrap(), Some(Value::from("stuck")));
    });
}

#[test]
fn test_mixed_versions_merge_at_highest() {
    let test_db = note_db();
    test_db.db.registry().register(note_v2());
    let mut item = Item::new(note_v2(), FieldMap::new()).unwrap();
    item.set("title", "both").unwrap();
    test_db.db.set_item("/notes/n/one", &item).unwrap();
    let loaded = test_db.db.item("/notes/n/one").unwrap();
    assert_eq!(loaded.schema().version(), 2);
}
