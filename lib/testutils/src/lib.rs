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

#![allow(missing_docs)]

use std::sync::Arc;

use antler_lib::bloom::BloomFilter;
use antler_lib::commit::ANCESTORS_FPR;
use antler_lib::commit::CommitContents;
use antler_lib::commit::CommitData;
use antler_lib::commit::FullContents;
use antler_lib::db::Database;
use antler_lib::db::DatabaseConfig;
use antler_lib::db::RepoHandle;
use antler_lib::item::Item;
use antler_lib::object_id::CommitId;
use antler_lib::object_id::ObjectId as _;
use antler_lib::schema::FieldMap;
use antler_lib::schema::FieldSpec;
use antler_lib::schema::Registry;
use antler_lib::schema::Schema;
use antler_lib::settings::DbSettings;
use antler_lib::settings::StoredSession;
use antler_lib::value::FieldType;
use rand::Rng as _;
use rand::SeedableRng as _;
use rand_chacha::ChaCha12Rng;
use smallvec::SmallVec;
use tempfile::TempDir;

/// The canned "task" schema used across tests.
pub fn task_schema() -> Arc<Schema> {
    Schema::new("task", 1)
        .field("title", FieldSpec::new(FieldType::String))
        .field("count", FieldSpec::new(FieldType::Number))
        .field("tags", FieldSpec::new(FieldType::Set))
        .field("body", FieldSpec::new(FieldType::RichText))
        .build()
}

/// A registry with the builtins plus the task schema.
pub fn test_registry() -> Arc<Registry> {
    let registry = Registry::with_builtins();
    registry.register(task_schema());
    registry
}

pub fn task_item(registry: &Registry, title: &str, count: i64) -> Item {
    let schema = registry.latest("task").unwrap();
    let mut item = Item::new(schema, FieldMap::new()).unwrap();
    item.set("title", title).unwrap();
    item.set("count", count).unwrap();
    item
}

/// A deterministic RNG for reproducible fixtures.
pub fn deterministic_rng() -> ChaCha12Rng {
    ChaCha12Rng::seed_from_u64(0x0a271e5)
}

pub fn random_key(rng: &mut ChaCha12Rng) -> String {
    let n: u64 = rng.random();
    format!("k{n:016x}")
}

/// A database in a temp directory, acting as its own trust root.
pub struct TestDb {
    temp_dir: TempDir,
    pub db: Database,
}

impl TestDb {
    pub fn init() -> Self {
        Self::init_with(|config| config)
    }

    pub fn init_with(tweak: impl FnOnce(DatabaseConfig) -> DatabaseConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = DatabaseConfig::new(temp_dir.path().join("db"));
        config.registry = test_registry();
        let config = tweak(config);
        let db = Database::open(config).unwrap();
        Self { temp_dir, db }
    }

    /// Closes the database and reopens the same directory, as after a
    /// process restart.
    pub fn reopen(self) -> Self {
        let Self { temp_dir, db } = self;
        db.close().unwrap();
        drop(db);
        let mut config = DatabaseConfig::new(temp_dir.path().join("db"));
        config.registry = test_registry();
        let db = Database::open(config).unwrap();
        Self { temp_dir, db }
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("db")
    }
}

/// Two databases sharing one trust domain: `a` is the root peer, `b` runs
/// a session that `a`'s root signed into `/sys/sessions`.
pub fn peer_pair() -> (TestDb, TestDb) {
    let a = TestDb::init();
    let b_session = a.db.create_session(Some("peer-b".to_owned())).unwrap();
    let roots: Vec<_> = a
        .db
        .trust()
        .read()
        .unwrap()
        .roots()
        .cloned()
        .collect();
    let b_temp = TempDir::new().unwrap();
    let b_path = b_temp.path().join("db");
    std::fs::create_dir_all(&b_path).unwrap();
    let settings = DbSettings {
        current: StoredSession::from_owned(&b_session),
        roots,
        sessions: vec![],
    };
    settings.store(&b_path.join("settings.json")).unwrap();
    let mut config = DatabaseConfig::new(b_path.clone());
    config.registry = test_registry();
    let b = Database::open(config).unwrap();
    (
        a,
        TestDb {
            temp_dir: b_temp,
            db: b,
        },
    )
}

/// Commits a full-item commit with an explicit timestamp, bypassing the
/// facade. Used to simulate writers that have fallen silent.
pub fn commit_item_at(
    db: &Database,
    repo_path: &str,
    key: &str,
    item: &Item,
    timestamp: i64,
) -> CommitId {
    let handle = db.open_repo(repo_path).unwrap();
    let commit = build_commit_at(db, &handle, key, item, timestamp);
    let persisted = handle.persist_commits(vec![commit]).unwrap();
    assert_eq!(persisted.len(), 1);
    persisted.into_iter().next().unwrap()
}

/// Builds (and signs) a full-item commit with an explicit timestamp
/// without persisting it.
pub fn build_commit_at(
    db: &Database,
    handle: &Arc<RepoHandle>,
    key: &str,
    item: &Item,
    timestamp: i64,
) -> CommitData {
    let (parents, ancestors) = handle.with_state(|repo| {
        let head = repo.head(key);
        let mut ancestors: Vec<CommitId> = vec![];
        let mut frontier: Vec<CommitId> = head.iter().cloned().collect();
        while let Some(id) = frontier.pop() {
            if ancestors.contains(&id) {
                continue;
            }
            if let Some(commit) = repo.commit(&id) {
                frontier.extend(commit.parents.iter().cloned());
            }
            ancestors.push(id);
        }
        let parents: SmallVec<[CommitId; 2]> = head.into_iter().collect();
        (parents, ancestors)
    });
    let mut filter = BloomFilter::new(ancestors.len().max(1), ANCESTORS_FPR);
    for id in &ancestors {
        filter.insert(&id.hex());
    }
    let connection_id = handle.read(|repo| repo.connection_id().clone());
    let trust = db.trust().read().unwrap();
    let mut commit = CommitData::new(
        trust.current_id(),
        &connection_id,
        "local",
        key,
        parents,
        filter,
        ancestors.len() as u32,
        CommitContents::Full(FullContents {
            record: item.encode(),
        }),
    );
    commit.timestamp = timestamp;
    commit.sign(trust.current());
    commit
}
