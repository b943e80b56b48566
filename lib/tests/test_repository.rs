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
use std::sync::RwLock;

use antler_lib::bloom::BloomFilter;
use antler_lib::commit::ANCESTORS_FPR;
use antler_lib::commit::CommitContents;
use antler_lib::commit::CommitData;
use antler_lib::commit::FullContents;
use antler_lib::doc_path::RepoId;
use antler_lib::item::Item;
use antler_lib::object_id::CommitId;
use antler_lib::object_id::ConnectionId;
use antler_lib::object_id::ObjectId as _;
use antler_lib::repository::Repository;
use antler_lib::repository::RepositoryOptions;
use antler_lib::session::OwnedSession;
use antler_lib::trust_pool::TrustPool;
use smallvec::SmallVec;
use smallvec::smallvec;
use testutils::task_item;
use testutils::test_registry;

struct TestRepo {
    repo: Repository,
    session: Arc<RwLock<TrustPool>>,
}

impl TestRepo {
    fn init() -> Self {
        let registry = test_registry();
        let trust = Arc::new(RwLock::new(TrustPool::new(
            OwnedSession::generate_root(),
            [],
            [],
        )));
        let repo = Repository::new(
            RepoId::parse("/data/t").unwrap(),
            registry,
            trust.clone(),
            None,
            RepositoryOptions::default(),
        );
        Self {
            repo,
            session: trust,
        }
    }

    /// A signed full commit with explicit parents, ancestor filter, and a
    /// timestamp nudge so ordering in assertions is deterministic.
    fn make_commit(
        &self,
        key: &str,
        item: &Item,
        parents: SmallVec<[CommitId; 2]>,
        ancestors: &[CommitId],
        ts_offset_ms: i64,
    ) -> CommitData {
        let mut filter = BloomFilter::new(ancestors.len().max(1), ANCESTORS_FPR);
        for id in ancestors {
            filter.insert(&id.hex());
        }
        let trust = self.session.read().unwrap();
        let mut commit = CommitData::new(
            trust.current_id(),
            &ConnectionId::random(),
            "local",
            key,
            parents,
            filter,
            ancestors.len() as u32,
            CommitContents::Full(FullContents {
                record: item.encode(),
            }),
        );
        commit.timestamp += ts_offset_ms;
        commit.sign(trust.current());
        commit
    }
}

#[test]
fn test_partially_replicated_graph_converges_on_newest() {
    let mut test_repo = TestRepo::init();
    let registry = test_registry();
    let item_v1 = task_item(&registry, "v1", 1);
    let item_v3 = task_item(&registry, "v3", 3);

    // The chain is C0 <- C1 <- C2, but C1 never reached this peer. C2's
    // ancestor filter still names C0, so C0 must not be chosen as a head
    // even though it has no local children.
    let c0 = test_repo.make_commit("k", &item_v1, smallvec![], &[], 0);
    let c0_id = c0.id.clone();
    let c1_id = CommitId::random();
    let c2 = test_repo.make_commit(
        "k",
        &item_v3,
        smallvec![c1_id.clone()],
        &[c0_id.clone(), c1_id],
        2_000,
    );
    let c2_id = c2.id.clone();
    test_repo.repo.persist_commits([c0, c2]).unwrap();

    assert_eq!(test_repo.repo.leaves("k"), vec![c2_id.clone()]);
    assert_eq!(test_repo.repo.head("k"), Some(c2_id.clone()));
    assert!(test_repo.repo.item_for_key("k").is_equal(&item_v3));
}

#[test]
fn test_merge_base_of_linear_history() {
    let mut test_repo = TestRepo::init();
    let registry = test_registry();
    let a = test_repo.make_commit("k", &task_item(&registry, "a", 1), smallvec![], &[], 0);
    let a_id = a.id.clone();
    let b = test_repo.make_commit(
        "k",
        &task_item(&registry, "b", 2),
        smallvec![a_id.clone()],
        &[a_id.clone()],
        1_000,
    );
    let b_id = b.id.clone();
    test_repo.repo.persist_commits([a, b]).unwrap();

    let (base, _) = test_repo.repo.merge_base(&a_id, &b_id);
    assert_eq!(base, Some(a_id));
}

#[test]
fn test_merge_base_of_disjoint_roots_reaches_root() {
    let mut test_repo = TestRepo::init();
    let registry = test_registry();
    let a = test_repo.make_commit("k", &task_item(&registry, "a", 1), smallvec![], &[], 0);
    let b = test_repo.make_commit("k", &task_item(&registry, "b", 2), smallvec![], &[], 1_000);
    let (a_id, b_id) = (a.id.clone(), b.id.clone());
    test_repo.repo.persist_commits([a, b]).unwrap();

    let (base, reached_root) = test_repo.repo.merge_base(&a_id, &b_id);
    assert_eq!(base, None);
    assert!(reached_root);
}

#[test]
fn test_revert_restores_earlier_contents() {
    let mut test_repo = TestRepo::init();
    let registry = test_registry();
    let first = task_item(&registry, "original", 1);
    let second = task_item(&registry, "edited", 2);
    let first_id = test_repo.repo.commit_item("k", &first).unwrap().unwrap();
    test_repo.repo.commit_item("k", &second).unwrap().unwrap();
    assert!(test_repo.repo.item_for_key("k").is_equal(&second));

    let revert_id = test_repo.repo.revert_to("k", &first_id).unwrap().unwrap();
    assert!(test_repo.repo.item_for_key("k").is_equal(&first));
    let revert_commit = test_repo.repo.commit(&revert_id).unwrap();
    assert_eq!(revert_commit.revert, Some(first_id));
}

#[test]
fn test_ages_are_monotonic_and_local() {
    let mut test_repo = TestRepo::init();
    let registry = test_registry();
    assert_eq!(test_repo.repo.age_for_key("k"), 0);
    test_repo
        .repo
        .commit_item("k", &task_item(&registry, "a", 1))
        .unwrap();
    let first_age = test_repo.repo.age_for_key("k");
    test_repo
        .repo
        .commit_item("other", &task_item(&registry, "b", 2))
        .unwrap();
    test_repo
        .repo
        .commit_item("k", &task_item(&registry, "c", 3))
        .unwrap();
    assert!(test_repo.repo.age_for_key("k") > first_age);
    assert!(test_repo.repo.age_for_key("other") > first_age);
    assert_eq!(test_repo.repo.max_age(), 3);
}

#[test]
fn test_events_follow_persist_order() {
    let mut test_repo = TestRepo::init();
    let registry = test_registry();
    test_repo
        .repo
        .commit_item("k", &task_item(&registry, "a", 1))
        .unwrap();
    let events = test_repo.repo.take_events();
    use antler_lib::repository::RepoEvent;
    assert!(matches!(events[0], RepoEvent::NewCommitSync { .. }));
    assert!(matches!(events[1], RepoEvent::NewCommit { .. }));
    assert!(matches!(
        &events[2],
        RepoEvent::DocumentChanged { key } if key == "k"
    ));
    // Draining leaves the queue empty.
    assert!(test_repo.repo.take_events().is_empty());
}
