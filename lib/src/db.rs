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

//! The database facade.
//!
//! Opens repositories on demand, routes items to the repository owning
//! their path, wires the standing listeners (merge on document change,
//! query cache flushing), and holds the trust domain loaded from
//! `settings.json`. One facade instance owns one on-disk database
//! directory, guarded by an advisory instance-slot lock.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use thiserror::Error;

use crate::authorization::AuthContext;
use crate::authorization::AuthOp;
use crate::authorization::Authorizer;
use crate::authorization::UnauthorizedError;
use crate::authorization::UserRule;
use crate::commit::CommitData;
use crate::commit_log::CommitLog;
use crate::doc_path::DocPath;
use crate::doc_path::InvalidPathError;
use crate::doc_path::RepoId;
use crate::events::EventEmitter;
use crate::events::Subscription;
use crate::file_util::PathError;
use crate::file_util::create_or_reuse_dir;
use crate::item::Item;
use crate::item::ItemError;
use crate::managed_item::ManagedItem;
use crate::object_id::CommitId;
use crate::object_id::ConnectionId;
use crate::object_id::ObjectId as _;
use crate::query::Query;
use crate::query::QueryError;
use crate::query::QuerySpec;
use crate::query_cache::QueryCache;
use crate::repository::RepoError;
use crate::repository::RepoEvent;
use crate::repository::Repository;
use crate::repository::RepositoryOptions;
use crate::schema::Registry;
use crate::schema::SESSION_NS;
use crate::session::OwnedSession;
use crate::session::Session;
use crate::settings::DbSettings;
use crate::settings::SettingsError;
use crate::settings::StoredSession;
use crate::signing::SignError;
use crate::trust_pool::TrustPool;

/// Advisory instance slots per database directory.
const MAX_INSTANCE_SLOTS: u8 = 64;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Log(#[from] crate::commit_log::LogError),
    #[error(transparent)]
    Path(#[from] InvalidPathError),
    #[error(transparent)]
    Io(#[from] PathError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Unauthorized(#[from] UnauthorizedError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Item(#[from] ItemError),
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
    #[error(transparent)]
    Sign(#[from] SignError),
    /// Transient; the caller retries.
    #[error("Operation already in progress for {path}; retry")]
    ServiceUnavailable { path: String },
    #[error("No free instance slot under {path}")]
    NoFreeSlot { path: PathBuf },
}

/// Construction-time configuration.
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub org_id: String,
    /// Skips signature verification and authorization entirely. Operator
    /// opt-in for private deployments.
    pub trusted: bool,
    /// When no settings file exists yet, start this peer as its own trust
    /// root; otherwise an anonymous session is generated.
    pub bootstrap_root: bool,
    pub rules: Vec<UserRule>,
    pub registry: Arc<Registry>,
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            org_id: "local".to_owned(),
            trusted: false,
            bootstrap_root: true,
            rules: vec![],
            registry: Registry::with_builtins(),
        }
    }
}

/// An opened repository: the single-owner state behind a lock, plus the
/// emitters living outside it so handlers can re-enter.
pub struct RepoHandle {
    id: RepoId,
    state: RwLock<Repository>,
    query_cache: Arc<QueryCache>,
    document_changed: EventEmitter<String>,
    new_commit: EventEmitter<Vec<CommitId>>,
    new_commit_sync: EventEmitter<Vec<CommitId>>,
}

impl RepoHandle {
    fn new(repo: Repository, query_cache: Arc<QueryCache>) -> Arc<Self> {
        Arc::new(Self {
            id: repo.id().clone(),
            state: RwLock::new(repo),
            query_cache,
            document_changed: EventEmitter::new(),
            new_commit: EventEmitter::new(),
            new_commit_sync: EventEmitter::new(),
        })
    }

    pub fn id(&self) -> &RepoId {
        &self.id
    }

    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    /// Shared read access to the repository state.
    pub fn read<R>(&self, f: impl FnOnce(&Repository) -> R) -> R {
        f(&self.state.read().unwrap())
    }

    /// Exclusive access. Events queued by the call are dispatched after
    /// the lock is released, so handlers may re-enter the repository.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Repository) -> R) -> R {
        let (result, events) = {
            let mut repo = self.state.write().unwrap();
            let result = f(&mut repo);
            (result, repo.take_events())
        };
        self.dispatch(events);
        result
    }

    fn dispatch(&self, events: Vec<RepoEvent>) {
        for event in events {
            match event {
                RepoEvent::NewCommitSync { ids } => self.new_commit_sync.emit(&ids),
                RepoEvent::NewCommit { ids } => self.new_commit.emit(&ids),
                RepoEvent::DocumentChanged { key } => self.document_changed.emit(&key),
            }
        }
    }

    pub fn on_document_changed(
        &self,
        handler: impl Fn(&String) + Send + Sync + 'static,
    ) -> Subscription {
        self.document_changed.attach(handler)
    }

    pub fn on_new_commit(
        &self,
        handler: impl Fn(&Vec<CommitId>) + Send + Sync + 'static,
    ) -> Subscription {
        self.new_commit.attach(handler)
    }

    /// Fires synchronously, in the order commits were persisted.
    pub fn on_new_commit_sync(
        &self,
        handler: impl Fn(&Vec<CommitId>) + Send + Sync + 'static,
    ) -> Subscription {
        self.new_commit_sync.attach(handler)
    }

    /// Feeds foreign commits through the persistence pipeline.
    pub fn persist_commits(&self, commits: Vec<CommitData>) -> Result<Vec<CommitId>, RepoError> {
        self.with_state(|repo| repo.persist_commits(commits))
    }

    /// Every local commit, for peer exchange.
    pub fn export_commits(&self) -> Vec<CommitData> {
        self.read(|repo| repo.all_commits().cloned().collect())
    }

    /// The current item at `key`.
    pub fn head_item(&self, key: &str) -> Arc<Item> {
        self.with_state(|repo| repo.item_for_key(key))
    }
}

impl std::fmt::Debug for RepoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

struct DbInner {
    config: DatabaseConfig,
    trust: Arc<RwLock<TrustPool>>,
    connection_id: ConnectionId,
    lock_file: Mutex<Option<PathBuf>>,
    repos: Mutex<HashMap<RepoId, Arc<RepoHandle>>>,
    queries: Mutex<HashMap<String, Weak<Query>>>,
    standing_subs: Mutex<Vec<Subscription>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if let Some(path) = self.lock_file.lock().unwrap().take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// The embeddable database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens (or initializes) the database at `config.path`.
    pub fn open(config: DatabaseConfig) -> Result<Self, DbError> {
        std::fs::create_dir_all(&config.path).map_err(|source| PathError {
            path: config.path.clone(),
            source,
        })?;
        let (slot, lock_file) = acquire_instance_slot(&config.path)?;
        let settings_path = config.path.join("settings.json");
        let settings = match DbSettings::load(&settings_path)? {
            Some(settings) => settings,
            None => {
                let owned = if config.bootstrap_root {
                    OwnedSession::generate_root()
                } else {
                    OwnedSession::generate(None)
                };
                let settings = DbSettings::bootstrap(&owned);
                settings.store(&settings_path)?;
                settings
            }
        };
        let current = settings.current.to_owned_session()?;
        tracing::info!(
            path = %config.path.display(),
            session = %current.id(),
            slot,
            "opening database"
        );
        let trust = Arc::new(RwLock::new(TrustPool::new(
            current,
            settings.roots,
            settings.sessions,
        )));
        let mut connection_bytes = ConnectionId::random().to_bytes();
        connection_bytes[0] = slot;
        let db = Self {
            inner: Arc::new(DbInner {
                config,
                trust,
                connection_id: ConnectionId::new(connection_bytes),
                lock_file: Mutex::new(Some(lock_file)),
                repos: Mutex::new(HashMap::new()),
                queries: Mutex::new(HashMap::new()),
                standing_subs: Mutex::new(vec![]),
                in_flight: Mutex::new(HashSet::new()),
            }),
        };
        db.bootstrap_sessions_repo()?;
        Ok(db)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.config.registry
    }

    pub fn trust(&self) -> &Arc<RwLock<TrustPool>> {
        &self.inner.trust
    }

    pub fn current_session(&self) -> Session {
        self.inner.trust.read().unwrap().current().session().clone()
    }

    /// Opens `/sys/sessions`, replays known session records into the trust
    /// pool, and makes sure this peer's own record is committed.
    fn bootstrap_sessions_repo(&self) -> Result<(), DbError> {
        let handle = self.open_repo("/sys/sessions")?;
        let trust = self.inner.trust.clone();
        handle.with_state(|repo| {
            let keys: Vec<String> = repo.keys().map(str::to_owned).collect();
            for key in keys {
                let item = repo.item_for_key(&key);
                if let Ok(session) = Session::from_item(&item) {
                    trust.write().unwrap().add_session(session);
                }
            }
        });
        let (own_id, own_item) = {
            let trust = self.inner.trust.read().unwrap();
            let current = trust.current();
            (
                current.id().hex(),
                current.session().to_item(self.registry())?,
            )
        };
        let missing = handle.with_state(|repo| repo.head(&own_id).is_none());
        if missing {
            handle.with_state(|repo| repo.commit_item(&own_id, &own_item))?;
        }
        Ok(())
    }

    /// Opens the repository owning `path`, or returns the cached handle.
    pub fn open_repo(&self, path: &str) -> Result<Arc<RepoHandle>, DbError> {
        let repo_id = RepoId::parse(path)?;
        if let Some(handle) = self.inner.repos.lock().unwrap().get(&repo_id) {
            return Ok(handle.clone());
        }
        let config = &self.inner.config;
        let authorizer = Authorizer::resolve(&repo_id, &config.rules);
        let dir = config.path.join(repo_id.kind());
        create_or_reuse_dir(&dir)?;
        let log_path = dir.join(format!("{}.jsonl", repo_id.name()));
        let cache_path = dir.join(format!("{}.query-cache.json", repo_id.name()));
        let log = CommitLog::open(&log_path, false)?;
        let allowed_namespaces = repo_id
            .is_sessions()
            .then(|| vec![SESSION_NS.to_owned()]);
        let mut repo = Repository::new(
            repo_id.clone(),
            config.registry.clone(),
            self.inner.trust.clone(),
            Some(log),
            RepositoryOptions {
                org_id: config.org_id.clone(),
                connection_id: self.inner.connection_id.clone(),
                trusted: config.trusted,
                authorizer: Some(authorizer),
                allowed_namespaces,
            },
        );
        // Initial bulk load happens muted: no events for replayed history.
        repo.set_muted(true);
        repo.load_from_log()?;
        repo.set_muted(false);
        let handle = RepoHandle::new(repo, QueryCache::load(&cache_path));

        // Standing listener: concurrent leaves are merged as soon as a
        // change exposes them, leader permitting.
        let weak = Arc::downgrade(&handle);
        let merge_sub = handle.on_document_changed(move |key: &String| {
            if let Some(handle) = weak.upgrade()
                && let Err(error) = handle.with_state(|repo| repo.merge_heads(key))
            {
                tracing::warn!(%error, key = %key, "merge attempt failed");
            }
        });
        self.inner.standing_subs.lock().unwrap().push(merge_sub);
        self.inner
            .repos
            .lock()
            .unwrap()
            .insert(repo_id, handle.clone());
        Ok(handle)
    }

    /// The current item at `path` under this peer's view.
    pub fn item(&self, path: &str) -> Result<Arc<Item>, DbError> {
        let session = self.current_session();
        self.item_for_session(path, &session)
    }

    /// Reads an item on behalf of `session`, applying read authorization.
    /// Roots and the local session bypass the check.
    pub fn item_for_session(&self, path: &str, session: &Session) -> Result<Arc<Item>, DbError> {
        let doc_path = DocPath::parse(path)?;
        let key = require_item_key(&doc_path)?;
        let handle = self.open_repo(path)?;
        self.check_read(&doc_path, session)?;
        Ok(handle.head_item(key))
    }

    fn check_read(&self, path: &DocPath, session: &Session) -> Result<(), DbError> {
        if self.inner.config.trusted {
            return Ok(());
        }
        let trust = self.inner.trust.read().unwrap();
        if &session.id == trust.current_id() || trust.is_root(&session.id) {
            return Ok(());
        }
        drop(trust);
        let repo_id = path.repo_id();
        let authorizer = Authorizer::resolve(&repo_id, &self.inner.config.rules);
        authorizer.check(&AuthContext {
            repo: &repo_id,
            item_key: path.item_key(),
            session,
            op: AuthOp::Read,
        })?;
        Ok(())
    }

    /// Commits `item` at `path`. At most one commit per key may be in
    /// flight; overlapping calls get [`DbError::ServiceUnavailable`] and
    /// retry.
    pub fn set_item(&self, path: &str, item: &Item) -> Result<Option<CommitId>, DbError> {
        let doc_path = DocPath::parse(path)?;
        let key = require_item_key(&doc_path)?.to_owned();
        let handle = self.open_repo(path)?;
        let gate = doc_path.as_str().to_owned();
        if !self.inner.in_flight.lock().unwrap().insert(gate.clone()) {
            return Err(DbError::ServiceUnavailable { path: gate });
        }
        let result = handle
            .with_state(|repo| repo.commit_item(&key, item))
            .map_err(DbError::from);
        self.inner.in_flight.lock().unwrap().remove(&gate);
        self.flush_caches_due();
        result
    }

    /// Marks the item deleted. Deleted items stay in history and sync, but
    /// queries skip them.
    pub fn delete_item(&self, path: &str) -> Result<Option<CommitId>, DbError> {
        let current = self.item(path)?;
        if current.is_null() || current.is_deleted() {
            return Ok(None);
        }
        let mut tombstone = current.clone_unlocked();
        tombstone.set_deleted(true)?;
        self.set_item(path, &tombstone)
    }

    /// A live item handle that commits through this database and rebases
    /// itself when the head moves.
    pub fn manage(&self, path: &str) -> Result<ManagedItem, DbError> {
        let current = self.item(path)?;
        ManagedItem::new(self.clone(), path, current.clone_unlocked())
    }

    /// Like [`Self::manage`], seeding a fresh working copy for paths with
    /// no item yet.
    pub fn manage_with(&self, path: &str, seed: Item) -> Result<ManagedItem, DbError> {
        let current = self.item(path)?;
        let working = if current.is_null() {
            seed
        } else {
            current.clone_unlocked()
        };
        ManagedItem::new(self.clone(), path, working)
    }

    /// Opens (or returns the shared instance of) a query. Queries with the
    /// same identity share one instance.
    pub fn query(&self, spec: QuerySpec) -> Result<Arc<Query>, DbError> {
        let cache = match &spec.source {
            crate::query::QuerySource::Repo(handle) => handle.query_cache().clone(),
            crate::query::QuerySource::Query(upstream) => {
                upstream.base_repo().query_cache().clone()
            }
        };
        let query = Query::new(spec, Some(cache))?;
        {
            let mut queries = self.inner.queries.lock().unwrap();
            if let Some(existing) = queries
                .get(query.id())
                .and_then(Weak::upgrade)
                .filter(|existing| !existing.is_closed())
            {
                return Ok(existing);
            }
            queries.insert(query.id().to_owned(), Arc::downgrade(&query));
        }
        query.activate();
        Ok(query)
    }

    /// Issues a new session signed into `/sys/sessions` by the current
    /// (root) session, extending the trust chain to other peers.
    pub fn create_session(&self, owner: Option<String>) -> Result<OwnedSession, DbError> {
        let owned = OwnedSession::generate(owner);
        let item = owned.session().to_item(self.registry())?;
        let handle = self.open_repo("/sys/sessions")?;
        handle.with_state(|repo| repo.commit_item(&owned.id().hex(), &item))?;
        self.inner
            .trust
            .write()
            .unwrap()
            .add_session(owned.session().clone());
        self.persist_settings()?;
        Ok(owned)
    }

    /// Two-way exchange of `/sys/sessions` and the given repository with
    /// another (in-process) database. Network transports drive the same
    /// two entry points: [`RepoHandle::export_commits`] and
    /// [`RepoHandle::persist_commits`].
    pub fn sync_repo_with(&self, other: &Self, path: &str) -> Result<(), DbError> {
        for repo_path in ["/sys/sessions", path] {
            let ours = self.open_repo(repo_path)?;
            let theirs = other.open_repo(repo_path)?;
            theirs.persist_commits(ours.export_commits())?;
            ours.persist_commits(theirs.export_commits())?;
        }
        Ok(())
    }

    /// Flushes query caches that are due and the repository logs.
    pub fn flush(&self) -> Result<(), DbError> {
        let handles: Vec<Arc<RepoHandle>> =
            self.inner.repos.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.query_cache().flush().map_err(DbError::Io)?;
            handle.with_state(|repo| repo.barrier())?;
        }
        Ok(())
    }

    /// Drains pending flushes and detaches standing listeners. The value
    /// remains usable as a handle but repositories stop receiving merges.
    pub fn close(&self) -> Result<(), DbError> {
        self.persist_settings()?;
        let handles: Vec<Arc<RepoHandle>> =
            self.inner.repos.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.query_cache().close().map_err(DbError::Io)?;
            handle.with_state(|repo| repo.barrier())?;
        }
        self.inner.standing_subs.lock().unwrap().clear();
        Ok(())
    }

    fn flush_caches_due(&self) {
        let handles: Vec<Arc<RepoHandle>> =
            self.inner.repos.lock().unwrap().values().cloned().collect();
        for handle in handles {
            if let Err(error) = handle.query_cache().flush_due() {
                tracing::warn!(%error, "query cache flush failed");
            }
        }
    }

    fn persist_settings(&self) -> Result<(), DbError> {
        let settings_path = self.inner.config.path.join("settings.json");
        let trust = self.inner.trust.read().unwrap();
        let current = trust.current();
        let roots: Vec<Session> = trust.roots().cloned().collect();
        let sessions: Vec<Session> = trust
            .sessions()
            .filter(|session| {
                &session.id != current.id() && !trust.is_root(&session.id)
            })
            .cloned()
            .collect();
        let settings = DbSettings {
            current: StoredSession::from_owned(current),
            roots,
            sessions,
        };
        drop(trust);
        settings.store(&settings_path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.config.path)
            .finish_non_exhaustive()
    }
}

fn require_item_key(path: &DocPath) -> Result<&str, DbError> {
    path.item_key().ok_or_else(|| {
        DbError::Path(InvalidPathError {
            input: path.as_str().to_owned(),
        })
    })
}

fn acquire_instance_slot(dir: &std::path::Path) -> Result<(u8, PathBuf), DbError> {
    for slot in 0..MAX_INSTANCE_SLOTS {
        let path = dir.join(format!("lock-{slot}"));
        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match created {
            Ok(_) => return Ok((slot, path)),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(PathError {
                    path,
                    source,
                }
                .into());
            }
        }
    }
    Err(DbError::NoFreeSlot {
        path: dir.to_path_buf(),
    })
}
