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
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use antler_lib::query::Predicate;
use antler_lib::query::QuerySource;
use antler_lib::query::QuerySpec;
use antler_lib::query::SortDescriptor;
use antler_lib::value::Value;
use testutils::TestDb;
use testutils::task_item;

fn count_over_10() -> Predicate {
    Predicate::new("count>10", |ctx| {
        matches!(ctx.item.get("count"), Ok(Some(Value::Number(n))) if n > 10.0)
    })
}

fn count_query(test_db: &TestDb) -> QuerySpec {
    let handle = test_db.db.open_repo("/data/t").unwrap();
    let mut spec = QuerySpec::new(QuerySource::Repo(handle), count_over_10());
    spec.sort = Some(SortDescriptor::Field("count".to_owned()));
    spec.schema_ns = Some("task".to_owned());
    spec
}

fn set_count(test_db: &TestDb, key: &str, count: i64) {
    let path = format!("/data/t/{key}");
    let current = test_db.db.item(&path).unwrap();
    let mut next = if current.is_null() {
        task_item(test_db.db.registry(), key, 0)
    } else {
        current.clone_unlocked()
    };
    next.set("count", count).unwrap();
    test_db.db.set_item(&path, &next).unwrap();
}

#[test]
fn test_incremental_update() {
    let test_db = TestDb::init();
    for (key, count) in [("k5", 5_i64), ("k15", 15), ("k25", 25)] {
        set_count(&test_db, key, count);
    }
    let query = test_db.db.query(count_query(&test_db)).unwrap();
    assert!(query.is_loading_finished());
    let paths: Vec<String> = query
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    assert_eq!(paths, ["/data/t/k15", "/data/t/k25"]);

    let changes = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let changes = changes.clone();
        query.on_document_changed(move |_| {
            changes.fetch_add(1, Ordering::SeqCst);
        })
    };
    set_count(&test_db, "k5", 20);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
    let paths: Vec<String> = query
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    assert_eq!(paths, ["/data/t/k15", "/data/t/k5", "/data/t/k25"]);
}

#[test]
fn test_removal_when_item_stops_matching() {
    let test_db = TestDb::init();
    set_count(&test_db, "a", 50);
    let query = test_db.db.query(count_query(&test_db)).unwrap();
    assert_eq!(query.len(), 1);

    set_count(&test_db, "a", 1);
    assert_eq!(query.len(), 0);
    assert!(query.results().is_empty());
}

#[test]
fn test_deleted_items_are_excluded() {
    let test_db = TestDb::init();
    set_count(&test_db, "a", 50);
    let query = test_db.db.query(count_query(&test_db)).unwrap();
    assert_eq!(query.len(), 1);
    test_db.db.delete_item("/data/t/a").unwrap();
    assert_eq!(query.len(), 0);
}

#[test]
fn test_limit_and_find() {
    let test_db = TestDb::init();
    for (key, count) in [("a", 30_i64), ("b", 20), ("c", 40), ("d", 11)] {
        set_count(&test_db, key, count);
    }
    let mut spec = count_query(&test_db);
    spec.limit = 3;
    let query = test_db.db.query(spec).unwrap();
    let paths: Vec<String> = query
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    // Sorted by count ascending, then truncated.
    assert_eq!(paths, ["/data/t/d", "/data/t/b", "/data/t/a"]);

    // Binary search on the sort field.
    let hit = query.find("count", &Value::from(20_i64)).unwrap();
    assert_eq!(hit.as_str(), "/data/t/b");
    assert!(query.find("count", &Value::from(12_i64)).is_none());
}

#[test]
fn test_chained_query() {
    let test_db = TestDb::init();
    for (key, count) in [("a", 5_i64), ("b", 15), ("c", 25)] {
        set_count(&test_db, key, count);
    }
    let upstream = test_db.db.query(count_query(&test_db)).unwrap();
    let mut spec = QuerySpec::new(
        QuerySource::Query(upstream.clone()),
        Predicate::new("count<20", |ctx| {
            matches!(ctx.item.get("count"), Ok(Some(Value::Number(n))) if n < 20.0)
        }),
    );
    spec.schema_ns = Some("task".to_owned());
    let narrowed = test_db.db.query(spec).unwrap();
    let paths: Vec<String> = narrowed
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    // 10 < count < 20.
    assert_eq!(paths, ["/data/t/b"]);

    // Updates flow through the chain.
    set_count(&test_db, "a", 12);
    assert_eq!(narrowed.len(), 2);
    set_count(&test_db, "b", 99);
    let paths: Vec<String> = narrowed
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    assert_eq!(paths, ["/data/t/a"]);
}

#[test]
fn test_same_identity_shares_instance() {
    let test_db = TestDb::init();
    set_count(&test_db, "a", 50);
    let first = test_db.db.query(count_query(&test_db)).unwrap();
    let second = test_db.db.query(count_query(&test_db)).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn test_result_cache_survives_reopen() {
    let test_db = TestDb::init();
    for (key, count) in [("a", 15_i64), ("b", 5)] {
        set_count(&test_db, key, count);
    }
    let query = test_db.db.query(count_query(&test_db)).unwrap();
    let before: Vec<String> = query
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    test_db.db.flush().unwrap();
    let cache_file = test_db.path().join("data").join("t.query-cache.json");
    assert!(cache_file.is_file());

    let test_db = test_db.reopen();
    let query = test_db.db.query(count_query(&test_db)).unwrap();
    let after: Vec<String> = query
        .results()
        .iter()
        .map(|path| path.as_str().to_owned())
        .collect();
    assert_eq!(before, after);
    assert!(query.age() > 0);
}

#[test]
fn test_closed_query_stops_updating() {
    let test_db = TestDb::init();
    set_count(&test_db, "a", 50);
    let query = test_db.db.query(count_query(&test_db)).unwrap();
    assert_eq!(query.len(), 1);
    query.close();
    set_count(&test_db, "b", 60);
    assert_eq!(query.len(), 1);
}
