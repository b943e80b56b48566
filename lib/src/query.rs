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

//! Live queries over a repository or another query.
//!
//! A query maintains the set of paths whose head items pass its predicate,
//! updated incrementally from `DocumentChanged` events. Initial scans reuse
//! disk-cached result sets for paths whose commits are no newer than the
//! cached age. Predicates and comparators carry explicit fingerprint
//! strings; together with the source, sort, context and namespace they form
//! the query's deterministic identity.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;

use indexmap::IndexSet;
use thiserror::Error;

use crate::bloom::BloomFilter;
use crate::checksum::Checksum;
use crate::db::RepoHandle;
use crate::doc_path::DocPath;
use crate::events::EventEmitter;
use crate::events::Subscription;
use crate::item::Item;
use crate::object_id::CommitId;
use crate::query_cache::QueryCache;
use crate::value::Value;

/// Paths evaluated between cancellation checks during a scan.
const SCAN_CHUNK: usize = 64;

/// Initial capacity of the included-paths bloom filter.
const FILTER_CAPACITY: usize = 64;
const FILTER_FPR: f64 = 0.01;
/// Growth factor applied when the filter nears saturation.
const FILTER_GROWTH: usize = 10;
/// Fraction of capacity after which the filter is considered near-full.
const FILTER_FULL_RATIO: f64 = 0.9;
/// Accumulated deletions beyond this fraction of capacity trigger a
/// rebuild, restoring the configured false-positive rate.
const FILTER_DELETION_RATIO: f64 = 0.1;

#[derive(Debug, Error)]
pub enum QueryError {
    /// The source chain transitively references this query.
    #[error("Query source cycle for {id}")]
    SourceCycle { id: String },
}

/// Where a query draws its path domain from.
#[derive(Clone)]
pub enum QuerySource {
    Repo(Arc<RepoHandle>),
    Query(Arc<Query>),
}

impl QuerySource {
    fn identity(&self) -> String {
        match self {
            Self::Repo(handle) => handle.id().to_string(),
            Self::Query(query) => query.id().to_owned(),
        }
    }
}

/// A filtering predicate with an explicit identity.
#[derive(Clone)]
pub struct Predicate {
    fingerprint: String,
    func: Arc<dyn Fn(&PredicateContext<'_>) -> bool + Send + Sync>,
}

pub struct PredicateContext<'a> {
    pub path: &'a DocPath,
    pub item: &'a Item,
    pub ctx: &'a serde_json::Value,
}

impl Predicate {
    pub fn new(
        fingerprint: &str,
        func: impl Fn(&PredicateContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            fingerprint: fingerprint.to_owned(),
            func: Arc::new(func),
        }
    }

    /// Accepts everything.
    pub fn all() -> Self {
        Self::new("all", |_| true)
    }
}

/// Result ordering: a schema field compared canonically, or an arbitrary
/// comparator with its own fingerprint.
#[derive(Clone)]
pub enum SortDescriptor {
    Field(String),
    Comparator {
        fingerprint: String,
        func: Arc<dyn Fn(&Item, &Item) -> Ordering + Send + Sync>,
    },
}

impl SortDescriptor {
    fn identity(&self) -> &str {
        match self {
            Self::Field(name) => name,
            Self::Comparator { fingerprint, .. } => fingerprint,
        }
    }
}

/// Everything needed to build a query.
pub struct QuerySpec {
    pub source: QuerySource,
    pub predicate: Predicate,
    pub sort: Option<SortDescriptor>,
    pub context: serde_json::Value,
    pub schema_ns: Option<String>,
    /// Zero means unlimited.
    pub limit: usize,
}

impl QuerySpec {
    pub fn new(source: QuerySource, predicate: Predicate) -> Self {
        Self {
            source,
            predicate,
            sort: None,
            context: serde_json::Value::Null,
            schema_ns: None,
            limit: 0,
        }
    }
}

struct QueryState {
    included: IndexSet<DocPath>,
    filter: BloomFilter,
    filter_capacity: usize,
    deletions: usize,
    head_for_key: HashMap<String, CommitId>,
    age: u64,
    loading_finished: bool,
    results_cache: Option<(u64, Vec<DocPath>)>,
}

impl QueryState {
    fn new() -> Self {
        Self {
            included: IndexSet::new(),
            filter: BloomFilter::new(FILTER_CAPACITY, FILTER_FPR),
            filter_capacity: FILTER_CAPACITY,
            deletions: 0,
            head_for_key: HashMap::new(),
            age: 0,
            loading_finished: false,
            results_cache: None,
        }
    }

    fn include(&mut self, path: DocPath) -> bool {
        if !self.included.insert(path.clone()) {
            return false;
        }
        self.filter.insert(path.as_str());
        self.maybe_rebuild_filter();
        self.results_cache = None;
        true
    }

    fn exclude(&mut self, path: &DocPath) -> bool {
        if !self.included.shift_remove(path) {
            return false;
        }
        // Bloom filters cannot delete; count removals and rebuild when the
        // advertised false-positive rate would degrade.
        self.deletions += 1;
        self.maybe_rebuild_filter();
        self.results_cache = None;
        true
    }

    fn maybe_rebuild_filter(&mut self) {
        let near_full =
            self.included.len() as f64 >= FILTER_FULL_RATIO * self.filter_capacity as f64;
        let too_many_deletions =
            self.deletions as f64 > FILTER_DELETION_RATIO * self.filter_capacity as f64;
        if !near_full && !too_many_deletions {
            return;
        }
        if near_full {
            self.filter_capacity *= FILTER_GROWTH;
        }
        let mut filter = BloomFilter::new(self.filter_capacity, FILTER_FPR);
        for path in &self.included {
            filter.insert(path.as_str());
        }
        self.filter = filter;
        self.deletions = 0;
    }
}

/// A live, incrementally maintained query.
pub struct Query {
    id: String,
    source: QuerySource,
    predicate: Predicate,
    sort: Option<SortDescriptor>,
    context: serde_json::Value,
    schema_ns: Option<String>,
    limit: usize,
    cache: Option<Arc<QueryCache>>,
    state: Mutex<QueryState>,
    document_changed: EventEmitter<DocPath>,
    loading_finished: EventEmitter<()>,
    closed: AtomicBool,
    source_sub: Mutex<Option<Subscription>>,
}

impl Query {
    /// Builds the query without activating it. Fails if the source chain
    /// already contains a query with the same identity.
    pub fn new(spec: QuerySpec, cache: Option<Arc<QueryCache>>) -> Result<Arc<Self>, QueryError> {
        let id = Self::identity_hash(&spec);
        let mut source = &spec.source;
        while let QuerySource::Query(upstream) = source {
            if upstream.id == id {
                return Err(QueryError::SourceCycle { id });
            }
            source = &upstream.source;
        }
        Ok(Arc::new(Self {
            id,
            source: spec.source,
            predicate: spec.predicate,
            sort: spec.sort,
            context: spec.context,
            schema_ns: spec.schema_ns,
            limit: spec.limit,
            cache,
            state: Mutex::new(QueryState::new()),
            document_changed: EventEmitter::new(),
            loading_finished: EventEmitter::new(),
            closed: AtomicBool::new(false),
            source_sub: Mutex::new(None),
        }))
    }

    fn identity_hash(spec: &QuerySpec) -> String {
        let parts = format!(
            "{}|{}|{}|{}|{}",
            spec.source.identity(),
            spec.predicate.fingerprint,
            spec.sort.as_ref().map(SortDescriptor::identity).unwrap_or(""),
            serde_json::to_string(&spec.context).unwrap(),
            spec.schema_ns.as_deref().unwrap_or(""),
        );
        Checksum::of_bytes(parts.as_bytes()).hex()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The repository at the root of the source chain.
    pub fn base_repo(&self) -> Arc<RepoHandle> {
        match &self.source {
            QuerySource::Repo(handle) => handle.clone(),
            QuerySource::Query(upstream) => upstream.base_repo(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    pub fn is_loading_finished(&self) -> bool {
        self.state.lock().unwrap().loading_finished
    }

    /// The max commit age this query has observed.
    pub fn age(&self) -> u64 {
        self.state.lock().unwrap().age
    }

    pub fn on_document_changed(
        &self,
        handler: impl Fn(&DocPath) + Send + Sync + 'static,
    ) -> Subscription {
        self.document_changed.attach(handler)
    }

    pub fn on_loading_finished(
        &self,
        handler: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        self.loading_finished.attach(handler)
    }

    /// Subscribes to the source and runs the initial scan.
    pub fn activate(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscription = match &self.source {
            QuerySource::Repo(handle) => handle.on_document_changed(move |key: &String| {
                if let Some(query) = weak.upgrade() {
                    query.source_key_changed(key);
                }
            }),
            QuerySource::Query(upstream) => upstream.on_document_changed(move |path: &DocPath| {
                if let Some(query) = weak.upgrade()
                    && let Some(key) = path.item_key()
                {
                    query.source_key_changed(key);
                }
            }),
        };
        *self.source_sub.lock().unwrap() = Some(subscription);
        self.scan();
    }

    /// Detaches from the source and unregisters from persistence. Paths
    /// already admitted stay readable; nothing further updates.
    pub fn close(&self) {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(cache) = &self.cache {
            cache.unregister(&self.id);
        }
        *self.source_sub.lock().unwrap() = None;
    }

    /// The full scan: iterates the source's paths, reusing the cached
    /// result set for paths whose commits are no newer than the cached
    /// age. Cancellation is checked between chunks; a closed query keeps
    /// whatever it had admitted.
    pub fn scan(self: &Arc<Self>) {
        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.entry(self.id()));
        let (cached_age, cached_results) = match &cached {
            Some(entry) => (entry.age, Some(&entry.results)),
            None => (0, None),
        };
        let repo = self.base_repo();
        let paths = self.source_paths();
        for chunk in paths.chunks(SCAN_CHUNK) {
            if self.is_closed() {
                return;
            }
            for path in chunk {
                let Some(key) = path.item_key() else {
                    continue;
                };
                let age = repo.read(|repo| repo.age_for_key(key));
                if age <= cached_age {
                    let in_cache = cached_results.is_some_and(|results| results.contains(path));
                    let head = in_cache.then(|| repo.with_state(|repo| repo.head(key)));
                    let mut state = self.state.lock().unwrap();
                    if in_cache {
                        state.include(path.clone());
                        if let Some(head) = head.flatten() {
                            state.head_for_key.insert(key.to_owned(), head);
                        }
                    }
                    state.age = state.age.max(age);
                    continue;
                }
                self.evaluate_path(path, false);
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            state.loading_finished = true;
        }
        self.loading_finished.emit(&());
        if let Some(cache) = &self.cache {
            cache.register(self);
            cache.request_flush();
        }
    }

    /// The iteration domain: repository keys, or the upstream's paths.
    fn source_paths(&self) -> Vec<DocPath> {
        match &self.source {
            QuerySource::Repo(handle) => handle.read(|repo| {
                repo.keys()
                    .filter_map(|key| repo.id().item_path(key).ok())
                    .collect()
            }),
            QuerySource::Query(upstream) => upstream.paths(),
        }
    }

    /// Included paths in insertion order.
    pub fn paths(&self) -> Vec<DocPath> {
        self.state.lock().unwrap().included.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().included.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probabilistic-then-exact membership.
    pub fn includes(&self, path: &DocPath) -> bool {
        let state = self.state.lock().unwrap();
        state.filter.has(path.as_str()) && state.included.contains(path)
    }

    /// Incremental update for one source key.
    fn source_key_changed(&self, key: &str) {
        if self.is_closed() {
            return;
        }
        let repo = self.base_repo();
        let Ok(path) = repo.id().item_path(key) else {
            return;
        };
        let new_head = repo.with_state(|repo| repo.head(key));
        let prev_head = self
            .state
            .lock()
            .unwrap()
            .head_for_key
            .get(key)
            .cloned();
        if prev_head == new_head {
            return;
        }
        // If the head moved but the item did not change, nothing to do.
        if let (Some(prev), Some(new)) = (&prev_head, &new_head) {
            let same = repo.with_state(|repo| {
                let prev_item = repo.item_for_commit(prev);
                let new_item = repo.item_for_commit(new);
                prev_item.is_equal(&new_item)
            });
            if same {
                let mut state = self.state.lock().unwrap();
                state.head_for_key.insert(key.to_owned(), new.clone());
                return;
            }
        }
        self.evaluate_path(&path, true);
    }

    /// Evaluates the predicate at `path` and applies the resulting
    /// transition. `emit` controls whether changes fire `DocumentChanged`.
    fn evaluate_path(&self, path: &DocPath, emit: bool) {
        let Some(key) = path.item_key() else {
            return;
        };
        let repo = self.base_repo();
        let (head, item, age) = repo.with_state(|repo| {
            let head = repo.head(key);
            let item = match &head {
                Some(id) => repo.item_for_commit(id),
                None => Arc::new(Item::null()),
            };
            (head, item, repo.age_for_key(key))
        });
        let in_domain = match &self.source {
            QuerySource::Repo(_) => true,
            QuerySource::Query(upstream) => upstream.includes(path),
        };
        let passes = in_domain
            && !item.is_null()
            && !item.is_deleted()
            && self
                .schema_ns
                .as_deref()
                .is_none_or(|ns| item.schema().ns() == Some(ns))
            && (self.predicate.func)(&PredicateContext {
                path,
                item: &item,
                ctx: &self.context,
            });
        let (was_included, changed) = {
            let mut state = self.state.lock().unwrap();
            let was_included = state.included.contains(path);
            let changed = if passes {
                state.include(path.clone())
            } else {
                state.exclude(path)
            };
            match &head {
                Some(id) => {
                    state.head_for_key.insert(key.to_owned(), id.clone());
                }
                None => {
                    state.head_for_key.remove(key);
                }
            }
            state.age = state.age.max(age);
            if was_included && passes {
                // in→in: the item changed, so sorts may need to reorder.
                state.results_cache = None;
            }
            (was_included, changed)
        };
        let fire = changed || (was_included && passes);
        if emit && fire {
            self.document_changed.emit(path);
        }
    }

    /// The sorted (and limited) result paths. Lazily recomputed per age
    /// tick.
    pub fn results(&self) -> Vec<DocPath> {
        {
            let state = self.state.lock().unwrap();
            if let Some((age, results)) = &state.results_cache
                && *age == state.age
            {
                return results.clone();
            }
        }
        let repo = self.base_repo();
        let paths = self.paths();
        let mut keyed: Vec<(DocPath, Arc<Item>)> = repo.with_state(|repo| {
            paths
                .into_iter()
                .map(|path| {
                    let item = path
                        .item_key()
                        .map(|key| repo.item_for_key(key))
                        .unwrap_or_else(|| Arc::new(Item::null()));
                    (path, item)
                })
                .collect()
        });
        match &self.sort {
            Some(SortDescriptor::Field(field)) => {
                keyed.sort_by(|(pa, a), (pb, b)| {
                    compare_field(a, b, field).then_with(|| pa.cmp(pb))
                });
            }
            Some(SortDescriptor::Comparator { func, .. }) => {
                keyed.sort_by(|(pa, a), (pb, b)| func(a, b).then_with(|| pa.cmp(pb)));
            }
            None => keyed.sort_by(|(pa, _), (pb, _)| pa.cmp(pb)),
        }
        let mut results: Vec<DocPath> = keyed.into_iter().map(|(path, _)| path).collect();
        if self.limit > 0 {
            results.truncate(self.limit);
        }
        let mut state = self.state.lock().unwrap();
        state.results_cache = Some((state.age, results.clone()));
        results
    }

    /// Finds a result whose `field` equals `value`. Binary search when the
    /// query is sorted by that same field, linear scan otherwise.
    pub fn find(&self, field: &str, value: &Value) -> Option<DocPath> {
        let results = self.results();
        let repo = self.base_repo();
        let item_at = |path: &DocPath| {
            repo.with_state(|repo| {
                path.item_key()
                    .map(|key| repo.item_for_key(key))
                    .unwrap_or_else(|| Arc::new(Item::null()))
            })
        };
        let sorted_by_field =
            matches!(&self.sort, Some(SortDescriptor::Field(sorted)) if sorted == field);
        if sorted_by_field {
            let index = results
                .binary_search_by(|path| {
                    let item = item_at(path);
                    match item.get(field).ok().flatten() {
                        Some(actual) => actual.canonical_cmp(value),
                        None => Ordering::Greater,
                    }
                })
                .ok()?;
            return results.get(index).cloned();
        }
        results.into_iter().find(|path| {
            item_at(path).get(field).ok().flatten().as_ref() == Some(value)
        })
    }
}

fn compare_field(a: &Item, b: &Item, field: &str) -> Ordering {
    let value_a = a.get(field).ok().flatten();
    let value_b = b.get(field).ok().flatten();
    match (value_a, value_b) {
        (Some(a), Some(b)) => a.canonical_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("included", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
