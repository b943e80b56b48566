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

use antler_lib::db::RepoHandle;
use antler_lib::object_id::ObjectId as _;
use antler_lib::session::OwnedSession;
use chrono::Utc;
use testutils::TestDb;
use testutils::peer_pair;
use testutils::task_item;

fn key_count(handle: &std::sync::Arc<RepoHandle>) -> usize {
    handle.read(|repo| repo.key_count())
}

#[test]
fn test_stranger_commits_are_discarded() {
    let test_db = TestDb::init();
    let db = &test_db.db;
    let handle = db.open_repo("/data/t").unwrap();
    let item = task_item(db.registry(), "x", 1);

    let stranger = OwnedSession::generate(None);
    let mut commit = testutils::build_commit_at(
        db,
        &handle,
        "k",
        &item,
        Utc::now().timestamp_millis(),
    );
    // Re-author the commit as the stranger.
    commit.session = stranger.id().clone();
    commit.signature = None;
    commit.sign(&stranger);

    let persisted = handle.persist_commits(vec![commit]).unwrap();
    assert!(persisted.is_empty());
    assert_eq!(key_count(&handle), 0);
}

#[test]
fn test_tampered_commits_are_discarded() {
    let test_db = TestDb::init();
    let db = &test_db.db;
    let handle = db.open_repo("/data/t").unwrap();
    let item = task_item(db.registry(), "x", 1);
    let mut commit = testutils::build_commit_at(
        db,
        &handle,
        "k",
        &item,
        Utc::now().timestamp_millis(),
    );
    commit.timestamp += 1;

    let persisted = handle.persist_commits(vec![commit]).unwrap();
    assert!(persisted.is_empty());
}

#[test]
fn test_expired_session_commits_are_discarded() {
    let test_db = TestDb::init();
    let db = &test_db.db;
    let handle = db.open_repo("/data/t").unwrap();
    let item = task_item(db.registry(), "x", 1);

    let keypair = antler_lib::signing::Keypair::generate();
    let session = antler_lib::session::Session {
        id: antler_lib::object_id::SessionId::random(),
        public_key: keypair.public_key(),
        expiration: Utc::now() - chrono::Duration::days(1),
        owner: None,
    };
    db.trust().write().unwrap().add_session(session.clone());
    let expired = OwnedSession::from_parts(session.clone(), keypair);

    let mut commit = testutils::build_commit_at(
        db,
        &handle,
        "k",
        &item,
        Utc::now().timestamp_millis(),
    );
    commit.session = session.id.clone();
    commit.signature = None;
    commit.sign(&expired);

    let persisted = handle.persist_commits(vec![commit]).unwrap();
    assert!(persisted.is_empty());
}

#[test]
fn test_unauthorized_writes_are_dropped_during_sync() {
    let (a, b) = peer_pair();
    // Peer B's session is not a root, so its write to the root-only
    // `/sys/users` repository commits locally but is dropped by A.
    let user_schema = a.db.registry().latest("user").unwrap();
    let mut user = antler_lib::item::Item::new(
        user_schema,
        antler_lib::schema::FieldMap::new(),
    )
    .unwrap();
    user.set("email", "b@example.com").unwrap();
    b.db.set_item("/sys/users/u1", &user).unwrap();

    a.db.sync_repo_with(&b.db, "/sys/users").unwrap();

    let b_handle = b.db.open_repo("/sys/users").unwrap();
    let a_handle = a.db.open_repo("/sys/users").unwrap();
    assert_eq!(key_count(&b_handle), 1);
    assert_eq!(key_count(&a_handle), 0);
}

#[test]
fn test_sessions_propagate_through_sync() {
    let (a, b) = peer_pair();
    let b_session_id = b.db.current_session().id.clone();
    // A has B's session only because its root signed it; a fresh sync
    // carries the record over to B's own sessions repo as well.
    a.db.sync_repo_with(&b.db, "/sys/sessions").unwrap();
    let b_sessions = b.db.open_repo("/sys/sessions").unwrap();
    let item = b_sessions.head_item(&b_session_id.hex());
    assert!(!item.is_null());
    let roots_known_to_b: usize = b.db.trust().read().unwrap().roots().count();
    assert_eq!(roots_known_to_b, 1);
}

#[test]
fn test_trusted_mode_accepts_unsigned_commits() {
    let test_db = TestDb::init_with(|mut config| {
        config.trusted = true;
        config
    });
    let db = &test_db.db;
    let handle = db.open_repo("/data/t").unwrap();
    let item = task_item(db.registry(), "x", 1);
    let mut commit = testutils::build_commit_at(
        db,
        &handle,
        "k",
        &item,
        Utc::now().timestamp_millis(),
    );
    commit.signature = None;

    let persisted = handle.persist_commits(vec![commit]).unwrap();
    assert_eq!(persisted.len(), 1);
}
