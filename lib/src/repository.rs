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

#![expect(missing_docs)]

//! The per-key commit graph.
//!
//! A repository owns one log file and the in-memory graph loaded from it:
//! commit storage, per-key ordering, ancestry edges, and the caches behind
//! head selection. All mutation goes through the persistence pipeline,
//! which verifies, authorizes, appends, indexes, and queues events in that
//! order. Materialized items are immutable snapshots behind `Arc`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use chrono::Utc;
use clru::CLruCache;
use itertools::Itertools as _;
use rayon::prelude::*;
use smallvec::SmallVec;
use thiserror::Error;

use crate::authorization::AuthContext;
use crate::authorization::AuthOp;
use crate::authorization::Authorizer;
use crate::bloom::BloomFilter;
use crate::checksum::Checksum;
use crate::commit::ANCESTORS_FPR;
use crate::commit::CommitData;
use crate::commit::choose_contents;
use crate::commit_log::CommitLog;
use crate::commit_log::LogError;
use crate::diff::DataChanges;
use crate::diff::diff_items;
use crate::diff::patch_item;
use crate::doc_path::RepoId;
use crate::item::Item;
use crate::item::ItemError;
use crate::object_id::CommitId;
use crate::object_id::ConnectionId;
use crate::object_id::ObjectId as _;
use crate::object_id::SessionId;
use crate::schema::FieldMap;
use crate::schema::Registry;
use crate::trust_pool::TrustPool;

/// Leaves younger than this take part in merge-leader election; older
/// writers are considered silent and any peer may merge.
pub const MERGE_WINDOW_MS: i64 = 5_000;

/// Commits appended to the log per write batch.
const APPEND_BATCH: usize = 500;

/// Minimum signature-verification batch per worker.
const VERIFY_BATCH_MIN: usize = 16;

const ITEM_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error("Namespace {ns:?} cannot be written to {repo}")]
    ForbiddenNamespace { ns: String, repo: RepoId },
}

/// Events queued by the persistence pipeline. `NewCommitSync` is dispatched
/// synchronously in persist order; the rest may be deferred by the host.
#[derive(Clone, Debug, PartialEq)]
pub enum RepoEvent {
    NewCommitSync { ids: Vec<CommitId> },
    NewCommit { ids: Vec<CommitId> },
    DocumentChanged { key: String },
}

/// Knobs fixed at open time.
pub struct RepositoryOptions {
    pub org_id: String,
    pub connection_id: ConnectionId,
    /// Skips signature verification and authorization. Operator opt-in for
    /// private deployments.
    pub trusted: bool,
    pub authorizer: Option<Authorizer>,
    /// When set, only items of these namespaces may live here.
    pub allowed_namespaces: Option<Vec<String>>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            org_id: "local".to_owned(),
            connection_id: ConnectionId::random(),
            trusted: false,
            authorizer: None,
            allowed_namespaces: None,
        }
    }
}

pub struct Repository {
    id: RepoId,
    registry: Arc<Registry>,
    trust: Arc<RwLock<TrustPool>>,
    log: Option<CommitLog>,
    options: RepositoryOptions,
    muted: bool,

    commits: HashMap<CommitId, CommitData>,
    // Per key, newest first by (timestamp, id).
    commits_by_key: HashMap<String, Vec<CommitId>>,
    children: HashMap<CommitId, SmallVec<[CommitId; 2]>>,
    corrupted: HashSet<CommitId>,
    head_cache: HashMap<String, CommitId>,
    leaves_cache: HashMap<String, Vec<CommitId>>,
    item_cache: Mutex<CLruCache<CommitId, Arc<Item>>>,
    ages: HashMap<CommitId, u64>,
    age_for_key: HashMap<String, u64>,
    next_age: u64,
    pending_events: Vec<RepoEvent>,
}

impl Repository {
    pub fn new(
        id: RepoId,
        registry: Arc<Registry>,
        trust: Arc<RwLock<TrustPool>>,
        log: Option<CommitLog>,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            id,
            registry,
            trust,
            log,
            options,
            muted: false,
            commits: HashMap::new(),
            commits_by_key: HashMap::new(),
            children: HashMap::new(),
            corrupted: HashSet::new(),
            head_cache: HashMap::new(),
            leaves_cache: HashMap::new(),
            item_cache: Mutex::new(CLruCache::new(
                NonZeroUsize::new(ITEM_CACHE_CAPACITY).unwrap(),
            )),
            ages: HashMap::new(),
            age_for_key: HashMap::new(),
            next_age: 0,
            pending_events: vec![],
        }
    }

    pub fn id(&self) -> &RepoId {
        &self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn trust(&self) -> &Arc<RwLock<TrustPool>> {
        &self.trust
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.options.connection_id
    }

    /// While muted, the pipeline queues no events. Used for the initial
    /// bulk load.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Drains events queued by pipeline runs since the last call.
    pub fn take_events(&mut self) -> Vec<RepoEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Replays this repository's log into the in-memory graph. Records were
    /// verified when first persisted, so the replay indexes them directly.
    pub fn load_from_log(&mut self) -> Result<usize, RepoError> {
        let Some(log) = self.log.as_mut() else {
            return Ok(0);
        };
        let entries = log.scan()?;
        let mut loaded = 0;
        for entry in entries {
            match serde_json::from_value::<CommitData>(entry) {
                Ok(commit) => {
                    if !self.commits.contains_key(&commit.id) {
                        self.index_commit(commit);
                        loaded += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(repo = %self.id, %error, "skipping undecodable log record");
                }
            }
        }
        tracing::debug!(repo = %self.id, commits = loaded, "loaded repository");
        Ok(loaded)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    pub fn key_count(&self) -> usize {
        self.commits_by_key.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.commits_by_key.keys().map(String::as_str)
    }

    pub fn commit(&self, id: &CommitId) -> Option<&CommitData> {
        self.commits.get(id)
    }

    pub fn commits_for_key(&self, key: &str) -> &[CommitId] {
        self.commits_by_key
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every commit, for peer exchange.
    pub fn all_commits(&self) -> impl Iterator<Item = &CommitData> {
        self.commits.values()
    }

    /// Local persist order marker for `key`; never synced.
    pub fn age_for_key(&self, key: &str) -> u64 {
        self.age_for_key.get(key).copied().unwrap_or(0)
    }

    pub fn max_age(&self) -> u64 {
        self.next_age
    }

    // ---- persistence pipeline ----

    /// Runs the persistence pipeline: filter, verify, authorize, append,
    /// index, queue events, register sessions. Returns the ids persisted.
    pub fn persist_commits(
        &mut self,
        incoming: impl IntoIterator<Item = CommitData>,
    ) -> Result<Vec<CommitId>, RepoError> {
        let mut pending: Vec<CommitData> = incoming
            .into_iter()
            .filter(|commit| self.admits(commit))
            .collect();
        let mut persisted = vec![];
        let mut retried = false;
        while !pending.is_empty() {
            let (verified, failed) = self.verify_batch(pending);
            let accepted: Vec<CommitData> = verified
                .into_iter()
                .filter(|commit| self.authorizes_write(commit))
                .collect();
            if let Some(log) = self.log.as_mut() {
                for chunk in accepted.chunks(APPEND_BATCH) {
                    let lines: Vec<serde_json::Value> = chunk
                        .iter()
                        .map(|commit| serde_json::to_value(commit).unwrap())
                        .collect();
                    log.append(&lines)?;
                }
            }
            let ids: Vec<CommitId> = accepted.iter().map(|commit| commit.id.clone()).collect();
            let keys: Vec<String> = accepted
                .iter()
                .map(|commit| commit.key.clone())
                .unique()
                .collect();
            for commit in &accepted {
                self.index_commit(commit.clone());
            }
            if !self.muted && !ids.is_empty() {
                self.pending_events.push(RepoEvent::NewCommitSync { ids: ids.clone() });
                self.pending_events.push(RepoEvent::NewCommit { ids: ids.clone() });
                for key in keys {
                    self.pending_events.push(RepoEvent::DocumentChanged { key });
                }
            }
            let mut registered = false;
            if self.id.is_sessions() {
                let mut trust = self.trust.write().unwrap();
                for commit in &accepted {
                    match trust.register_session_commit(commit, &self.registry) {
                        Ok(added) => registered |= added,
                        Err(error) => {
                            tracing::warn!(id = %commit.id, %error, "bad session commit");
                        }
                    }
                }
            }
            persisted.extend(ids);
            // A batch may carry a session record and commits by that very
            // session; retry the failures once after registration.
            if registered && !failed.is_empty() && !retried {
                retried = true;
                pending = failed;
            } else {
                for commit in &failed {
                    tracing::warn!(repo = %self.id, id = %commit.id, "discarding unverifiable commit");
                }
                break;
            }
        }
        Ok(persisted)
    }

    /// Step 1 of the pipeline: drop duplicates, foreign orgs, forbidden
    /// namespaces and null items.
    fn admits(&self, commit: &CommitData) -> bool {
        if self.commits.contains_key(&commit.id) {
            return false;
        }
        if commit.org_id != self.options.org_id {
            tracing::debug!(id = %commit.id, org = %commit.org_id, "dropping foreign-org commit");
            return false;
        }
        if let Some(record) = commit.record() {
            if record.schema_marker == "null" {
                return false;
            }
            if let Some(allowed) = &self.options.allowed_namespaces {
                let ns = record
                    .schema_marker
                    .rsplit_once('/')
                    .map(|(ns, _)| ns)
                    .unwrap_or(&record.schema_marker);
                if !allowed.iter().any(|a| a == ns) {
                    return false;
                }
            }
        }
        true
    }

    /// Step 2: signature verification in parallel batches sized by the
    /// available hardware concurrency. Trusted mode skips it.
    fn verify_batch(&self, commits: Vec<CommitData>) -> (Vec<CommitData>, Vec<CommitData>) {
        if self.options.trusted {
            return (commits, vec![]);
        }
        let trust = self.trust.read().unwrap();
        let workers = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let batch = commits.len().div_ceil(workers).max(VERIFY_BATCH_MIN);
        let flags: Vec<bool> = commits
            .par_chunks(batch)
            .flat_map_iter(|chunk| {
                let trust = &trust;
                chunk
                    .iter()
                    .map(move |commit| trust.verify_commit(commit).is_ok())
            })
            .collect();
        drop(trust);
        let mut verified = vec![];
        let mut failed = vec![];
        for (commit, ok) in commits.into_iter().zip(flags) {
            if ok {
                verified.push(commit);
            } else {
                failed.push(commit);
            }
        }
        (verified, failed)
    }

    /// Step 3: write authorization. Roots and the local session bypass.
    fn authorizes_write(&self, commit: &CommitData) -> bool {
        if self.options.trusted {
            return true;
        }
        let Some(authorizer) = &self.options.authorizer else {
            return true;
        };
        let trust = self.trust.read().unwrap();
        if &commit.session == trust.current_id() || trust.is_root(&commit.session) {
            return true;
        }
        let Some(session) = trust.session(&commit.session) else {
            return false;
        };
        let allowed = authorizer.allows(&AuthContext {
            repo: &self.id,
            item_key: Some(&commit.key),
            session,
            op: AuthOp::Write,
        });
        if !allowed {
            tracing::debug!(id = %commit.id, key = %commit.key, "dropping unauthorized commit");
        }
        allowed
    }

    /// Step 5: graph and index updates, plus age assignment.
    fn index_commit(&mut self, commit: CommitData) {
        let id = commit.id.clone();
        let key = commit.key.clone();
        for parent in &commit.parents {
            self.children.entry(parent.clone()).or_default().push(id.clone());
        }
        self.next_age += 1;
        self.ages.insert(id.clone(), self.next_age);
        self.age_for_key.insert(key.clone(), self.next_age);
        self.commits.insert(id.clone(), commit);
        let by_key = self.commits_by_key.entry(key.clone()).or_default();
        by_key.push(id);
        let ranks: HashMap<CommitId, (i64, CommitId)> = by_key
            .iter()
            .map(|id| {
                let commit = &self.commits[id];
                (id.clone(), (commit.timestamp, id.clone()))
            })
            .collect();
        by_key.sort_by(|a, b| ranks[b].cmp(&ranks[a]));
        self.head_cache.remove(&key);
        self.leaves_cache.remove(&key);
    }

    // ---- materialization ----

    /// Materializes exactly the item of `id`, or `None` when the commit is
    /// corrupted, its delta base is missing, or its schema is unknown.
    /// Checksum mismatches mark the commit corrupted as a side effect.
    pub fn materialize_exact(&mut self, id: &CommitId) -> Option<Arc<Item>> {
        if self.corrupted.contains(id) {
            return None;
        }
        if let Some(item) = self.item_cache.lock().unwrap().get(id) {
            return Some(item.clone());
        }
        let commit = self.commits.get(id)?.clone();
        let item = match &commit.contents {
            crate::commit::CommitContents::Full(full) => {
                match Item::decode(&self.registry, &full.record) {
                    Ok(item) => Arc::new(item),
                    Err(error) => {
                        tracing::debug!(id = %commit.id, %error, "cannot decode item yet");
                        return None;
                    }
                }
            }
            crate::commit::CommitContents::Delta(delta) => {
                let base = self.materialize_exact(&delta.base)?;
                if base.checksum() != delta.edit.src_checksum {
                    self.mark_corrupted(id, &commit.key);
                    return None;
                }
                let mut patched = base.clone_unlocked();
                if patch_item(&mut patched, &delta.edit.changes).is_err()
                    || patched.checksum() != delta.edit.dst_checksum
                {
                    self.mark_corrupted(id, &commit.key);
                    return None;
                }
                Arc::new(patched)
            }
        };
        item.checksum();
        self.item_cache
            .lock()
            .unwrap()
            .put(id.clone(), item.clone());
        Some(item)
    }

    /// The item for `id`, falling back to the latest non-corrupted ancestor
    /// for the same key, and to the null item when nothing materializes.
    pub fn item_for_commit(&mut self, id: &CommitId) -> Arc<Item> {
        if let Some(item) = self.materialize_exact(id) {
            return item;
        }
        let mut candidates: Vec<CommitId> = vec![];
        let mut frontier = vec![id.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = frontier.pop() {
            let Some(commit) = self.commits.get(&current) else {
                continue;
            };
            for parent in commit.parents.clone() {
                if seen.insert(parent.clone()) {
                    candidates.push(parent.clone());
                    frontier.push(parent);
                }
            }
        }
        candidates.sort_by_key(|id| {
            let ts = self.commits.get(id).map(|c| c.timestamp).unwrap_or(0);
            std::cmp::Reverse((ts, id.clone()))
        });
        for candidate in candidates {
            if let Some(item) = self.materialize_exact(&candidate) {
                return item;
            }
        }
        Arc::new(Item::null())
    }

    /// The current item at `key` under this peer's view.
    pub fn item_for_key(&mut self, key: &str) -> Arc<Item> {
        match self.head(key) {
            Some(head) => self.item_for_commit(&head),
            None => Arc::new(Item::null()),
        }
    }

    fn mark_corrupted(&mut self, id: &CommitId, key: &str) {
        tracing::warn!(repo = %self.id, id = %id, key, "delta checksum mismatch, commit marked corrupted");
        self.corrupted.insert(id.clone());
        self.head_cache.remove(key);
        self.leaves_cache.remove(key);
    }

    pub fn is_corrupted(&self, id: &CommitId) -> bool {
        self.corrupted.contains(id)
    }

    // ---- head selection ----

    /// Leaves of the per-key ancestry subgraph, filtered to commits with a
    /// materializable item and passing the high-probability filter check.
    pub fn leaves(&mut self, key: &str) -> Vec<CommitId> {
        if let Some(cached) = self.leaves_cache.get(key) {
            return cached.clone();
        }
        let leaves = loop {
            let ids: Vec<CommitId> = self.commits_for_key(key).to_vec();
            let candidates: Vec<CommitId> = ids
                .iter()
                .filter(|id| !self.corrupted.contains(id) && !self.has_live_children(id))
                .cloned()
                .collect();
            let corrupted_before = self.corrupted.len();
            let mut live: Vec<CommitId> = candidates
                .into_iter()
                .filter(|id| self.materialize_exact(id).is_some())
                .collect();
            // Materialization may have exposed corruption; the subgraph
            // changed, so recompute.
            if self.corrupted.len() != corrupted_before {
                continue;
            }
            self.probabilistic_leaf_filter(&ids, &mut live);
            break live;
        };
        self.leaves_cache.insert(key.to_owned(), leaves.clone());
        leaves
    }

    fn has_live_children(&self, id: &CommitId) -> bool {
        self.children
            .get(id)
            .is_some_and(|children| children.iter().any(|child| !self.corrupted.contains(child)))
    }

    /// High-probability leaf check: a candidate stays a leaf if at least
    /// one of the newest `⌈2·log₄ N⌉` commits for the key does not claim it
    /// as an ancestor. With the ancestor filters' 0.25 false-positive rate,
    /// the probability of wrongly dropping a real leaf decays as 0.25^k.
    /// This is what lets partially replicated graphs converge. Corrupted
    /// commits are unreachable for head selection, so their filters are
    /// not consulted.
    fn probabilistic_leaf_filter(&self, ids_newest_first: &[CommitId], live: &mut Vec<CommitId>) {
        let reachable: Vec<&CommitData> = ids_newest_first
            .iter()
            .filter(|id| !self.corrupted.contains(id))
            .filter_map(|id| self.commits.get(id))
            .collect();
        let max_ancestors = reachable
            .iter()
            .map(|commit| commit.ancestors_count as usize)
            .max()
            .unwrap_or(0);
        let n = reachable.len().max(max_ancestors);
        if n < 2 {
            return;
        }
        let k = (2.0 * (n as f64).log(4.0)).ceil().max(1.0) as usize;
        let newest = &reachable[..k.min(reachable.len())];
        live.retain(|candidate| {
            let hex = candidate.hex();
            let others: Vec<&&CommitData> =
                newest.iter().filter(|d| &d.id != candidate).collect();
            others.is_empty() || others.iter().any(|d| !d.ancestors_filter.has(&hex))
        });
    }

    /// Chooses the head commit for `key`.
    pub fn head(&mut self, key: &str) -> Option<CommitId> {
        if let Some(cached) = self.head_cache.get(key) {
            let ours = self
                .commits
                .get(cached)
                .is_some_and(|commit| commit.connection_id == self.options.connection_id);
            if ours {
                return Some(cached.clone());
            }
        }
        let leaves = self.leaves(key);
        let chosen = match leaves.len() {
            0 => return None,
            1 => leaves[0].clone(),
            _ => self.pick_head(&leaves),
        };
        self.head_cache.insert(key.to_owned(), chosen.clone());
        Some(chosen)
    }

    /// Among multiple leaves: prefer our connection, then our session, then
    /// the highest `(timestamp, id)`.
    fn pick_head(&self, leaves: &[CommitId]) -> CommitId {
        let current_session = self.trust.read().unwrap().current_id().clone();
        let rank = |id: &CommitId| {
            let commit = &self.commits[id];
            (
                commit.connection_id == self.options.connection_id,
                commit.session == current_session,
                commit.timestamp,
                id.clone(),
            )
        };
        leaves.iter().max_by_key(|id| rank(id)).unwrap().clone()
    }

    // ---- merge ----

    /// The merge base of two commits: expand parent frontiers until they
    /// intersect, then take the newest intersection member that
    /// materializes. Exhausting either side without a usable intersection
    /// reports "reached root".
    pub fn merge_base(&mut self, a: &CommitId, b: &CommitId) -> (Option<CommitId>, bool) {
        let mut seen_a: HashSet<CommitId> = [a.clone()].into();
        let mut seen_b: HashSet<CommitId> = [b.clone()].into();
        let mut frontier_a = vec![a.clone()];
        let mut frontier_b = vec![b.clone()];
        let mut reached_root = false;
        let mut tried: HashSet<CommitId> = HashSet::new();
        loop {
            let mut intersection: Vec<CommitId> = seen_a
                .intersection(&seen_b)
                .filter(|id| !tried.contains(*id))
                .cloned()
                .collect();
            intersection.sort_by_key(|id| {
                let ts = self.commits.get(id).map(|c| c.timestamp).unwrap_or(0);
                std::cmp::Reverse((ts, id.clone()))
            });
            for id in intersection {
                if self.materialize_exact(&id).is_some() {
                    return (Some(id), reached_root);
                }
                tried.insert(id);
            }
            if frontier_a.is_empty() && frontier_b.is_empty() {
                return (None, true);
            }
            for (frontier, seen) in [(&mut frontier_a, &mut seen_a), (&mut frontier_b, &mut seen_b)]
            {
                let mut next = vec![];
                for id in frontier.drain(..) {
                    let Some(commit) = self.commits.get(&id) else {
                        continue;
                    };
                    if commit.parents.is_empty() {
                        reached_root = true;
                    }
                    for parent in commit.parents.clone() {
                        if seen.insert(parent.clone()) {
                            next.push(parent);
                        }
                    }
                }
                *frontier = next;
            }
        }
    }

    /// Folds [`Self::merge_base`] pairwise over `commits`, skipping entries
    /// that cannot be materialized.
    fn merge_base_of_set(&mut self, commits: &[CommitId]) -> (Option<CommitId>, bool) {
        let mut reached_root = false;
        let mut current: Option<CommitId> = None;
        for id in commits {
            if self.materialize_exact(id).is_none() {
                continue;
            }
            current = match current {
                None => Some(id.clone()),
                Some(previous) => {
                    let (base, root) = self.merge_base(&previous, id);
                    reached_root |= root;
                    match base {
                        Some(base) => Some(base),
                        None => return (None, true),
                    }
                }
            };
        }
        (current, reached_root)
    }

    /// Elects the merge leader for `key` by rendezvous-hashing session ids
    /// against the key. Only leaves written within [`MERGE_WINDOW_MS`] take
    /// part; when every recent writer has fallen silent, any peer may lead.
    fn may_lead_merge(&self, key: &str, leaves: &[CommitId]) -> bool {
        let now = Utc::now().timestamp_millis();
        let recent: Vec<SessionId> = leaves
            .iter()
            .filter_map(|id| self.commits.get(id))
            .filter(|commit| commit.timestamp >= now - MERGE_WINDOW_MS)
            .map(|commit| commit.session.clone())
            .collect();
        if recent.is_empty() {
            return true;
        }
        let current = self.trust.read().unwrap().current_id().clone();
        let score =
            |session: &SessionId| Checksum::of_bytes(format!("{}|{key}", session.hex()).as_bytes());
        let leader = recent.iter().max_by_key(|session| score(session)).unwrap();
        leader == &current
    }

    /// Merges the key's leaves into one signed merge commit, if this peer
    /// currently leads. Returns the merge commit id when one was created.
    pub fn merge_heads(&mut self, key: &str) -> Result<Option<CommitId>, RepoError> {
        let leaves = self.leaves(key);
        if leaves.len() < 2 {
            return Ok(None);
        }
        if !self.may_lead_merge(key, &leaves) {
            tracing::debug!(repo = %self.id, key, "backing off merge, not the leader");
            return Ok(None);
        }
        let mut merge_set: Vec<(CommitId, Arc<Item>)> = leaves
            .iter()
            .filter_map(|id| self.materialize_exact(id).map(|item| (id.clone(), item)))
            .collect();
        if merge_set.len() < 2 {
            return Ok(None);
        }
        // Commit order: roots first, then by (timestamp, id), so edits on
        // top of creation can override it.
        merge_set.sort_by_key(|(id, _)| {
            let commit = &self.commits[id];
            (!commit.is_root(), commit.timestamp, id.clone())
        });

        // Target schema: the highest version among the merged items that
        // share the newest item's namespace.
        let ns = merge_set
            .iter()
            .rev()
            .find_map(|(_, item)| item.schema().ns().map(str::to_owned));
        let Some(ns) = ns else {
            return Ok(None);
        };
        let target_schema = merge_set
            .iter()
            .map(|(_, item)| item.schema())
            .filter(|schema| schema.ns() == Some(ns.as_str()))
            .max_by_key(|schema| schema.version())
            .unwrap()
            .clone();

        let (base_id, _reached_root) =
            self.merge_base_of_set(&merge_set.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>());
        let base_item = match &base_id {
            Some(id) => self.materialize_exact(id).unwrap_or_else(|| Arc::new(Item::null())),
            None => Arc::new(Item::null()),
        };
        let mut base = if base_item.is_null() || base_item.schema().ns() != Some(ns.as_str()) {
            Item::new(target_schema.clone(), FieldMap::new())?
        } else {
            let mut base = base_item.clone_unlocked();
            base.upgrade_schema(&self.registry, Some(target_schema.version()))?;
            base
        };

        let current_session = self.trust.read().unwrap().current_id().clone();
        let changes = DataChanges::concat(merge_set.iter().map(|(id, item)| {
            let local = self.commits[id].session == current_session;
            let mut side = item.clone_unlocked();
            let _ = side.upgrade_schema(&self.registry, Some(target_schema.version()));
            diff_items(&base, &side, local)
        }));
        patch_item(&mut base, &changes)?;

        let parents: SmallVec<[CommitId; 2]> =
            merge_set.iter().map(|(id, _)| id.clone()).collect();
        let mut commit = self.build_commit(key, &base, parents)?;
        commit.merge_base = base_id;
        commit.merge_leader = Some(current_session);
        let id = commit.id.clone();
        {
            let trust = self.trust.read().unwrap();
            commit.sign(trust.current());
        }
        tracing::info!(repo = %self.id, key, id = %id, "created merge commit");
        let persisted = self.persist_commits([commit])?;
        Ok(persisted.first().is_some().then_some(id))
    }

    // ---- writes ----

    /// Commits a new version of `key`. No-op edits (equal to the current
    /// head item) return `None`. Null items are never persisted.
    pub fn commit_item(&mut self, key: &str, item: &Item) -> Result<Option<CommitId>, RepoError> {
        if item.is_null() {
            return Ok(None);
        }
        if let Some(allowed) = &self.options.allowed_namespaces {
            let ns = item.schema().ns().unwrap_or_default();
            if !allowed.iter().any(|a| a == ns) {
                return Err(RepoError::ForbiddenNamespace {
                    ns: ns.to_owned(),
                    repo: self.id.clone(),
                });
            }
        }
        let head = self.head(key);
        if let Some(head) = &head
            && self.item_for_commit(head).is_equal(item)
        {
            return Ok(None);
        }
        let parents: SmallVec<[CommitId; 2]> = head.into_iter().collect();
        let mut commit = self.build_commit(key, item, parents)?;
        let id = commit.id.clone();
        {
            let trust = self.trust.read().unwrap();
            commit.sign(trust.current());
        }
        let persisted = self.persist_commits([commit])?;
        Ok(persisted.first().is_some().then_some(id))
    }

    /// Re-commits the item of an earlier commit, marking the revert.
    pub fn revert_to(&mut self, key: &str, target: &CommitId) -> Result<Option<CommitId>, RepoError> {
        let item = self.item_for_commit(target);
        if item.is_null() {
            return Ok(None);
        }
        let head = self.head(key);
        let parents: SmallVec<[CommitId; 2]> = head.into_iter().collect();
        let mut commit = self.build_commit(key, &item, parents)?;
        commit.revert = Some(target.clone());
        let id = commit.id.clone();
        {
            let trust = self.trust.read().unwrap();
            commit.sign(trust.current());
        }
        let persisted = self.persist_commits([commit])?;
        Ok(persisted.first().is_some().then_some(id))
    }

    /// Recomputes a locally edited item against the current head: the
    /// head's changes apply first, the local ones after, so local scalar
    /// edits win while set and map edits union.
    pub fn rebase_item(
        &mut self,
        key: &str,
        local: &Item,
        base: Option<&CommitId>,
    ) -> Result<(Item, Option<CommitId>), RepoError> {
        let head = self.head(key);
        if head.as_ref() == base {
            return Ok((local.clone(), head));
        }
        let base_item = match base {
            Some(id) => self.item_for_commit(id),
            None => Arc::new(Item::null()),
        };
        let head_item = match &head {
            Some(id) => self.item_for_commit(id),
            None => Arc::new(Item::null()),
        };
        let changes = DataChanges::concat([
            diff_items(&base_item, &head_item, false),
            diff_items(&base_item, local, true),
        ]);
        let mut rebased = if base_item.is_null() {
            Item::new(local.schema().clone(), FieldMap::new())?
        } else {
            base_item.clone_unlocked()
        };
        patch_item(&mut rebased, &changes)?;
        Ok((rebased, head))
    }

    fn build_commit(
        &mut self,
        key: &str,
        item: &Item,
        parents: SmallVec<[CommitId; 2]>,
    ) -> Result<CommitData, RepoError> {
        let (filter, count) = self.ancestors_filter(&parents);
        let prev_full = self.latest_full_commit(key);
        let contents = {
            let prev = prev_full
                .as_ref()
                .map(|(id, item)| (id, item.as_ref()));
            choose_contents(item.schema().ns(), prev, item)
        };
        let trust = self.trust.read().unwrap();
        Ok(CommitData::new(
            trust.current_id(),
            &self.options.connection_id,
            &self.options.org_id,
            key,
            parents,
            filter,
            count,
            contents,
        ))
    }

    /// The newest full-item commit for `key` that materializes; the base
    /// candidate for delta compression.
    fn latest_full_commit(&mut self, key: &str) -> Option<(CommitId, Arc<Item>)> {
        let ids = self.commits_for_key(key).to_vec();
        for id in ids {
            let is_full = self
                .commits
                .get(&id)
                .is_some_and(|commit| !commit.is_delta());
            if is_full && let Some(item) = self.materialize_exact(&id) {
                return Some((id, item));
            }
        }
        None
    }

    /// Bloom filter and count over the local ancestor set of `parents`
    /// (inclusive).
    fn ancestors_filter(&self, parents: &[CommitId]) -> (BloomFilter, u32) {
        let mut ancestors: HashSet<CommitId> = HashSet::new();
        let mut frontier: Vec<CommitId> = parents.to_vec();
        while let Some(id) = frontier.pop() {
            if !ancestors.insert(id.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&id) {
                frontier.extend(commit.parents.iter().cloned());
            }
        }
        let inherited = parents
            .iter()
            .filter_map(|id| self.commits.get(id))
            .map(|commit| commit.ancestors_count + 1)
            .max()
            .unwrap_or(0);
        let count = (ancestors.len() as u32).max(inherited);
        let mut filter = BloomFilter::new(count.max(1) as usize, ANCESTORS_FPR);
        for id in &ancestors {
            filter.insert(&id.hex());
        }
        (filter, count)
    }

    /// Flushes buffered log writes.
    pub fn barrier(&mut self) -> Result<(), RepoError> {
        if let Some(log) = self.log.as_mut() {
            log.barrier()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.id)
            .field("commits", &self.commits.len())
            .field("keys", &self.commits_by_key.len())
            .finish_non_exhaustive()
    }
}
