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

//! Live item handles.
//!
//! A managed item is a mutable working copy bound to a path. Local edits
//! accumulate in the copy until [`ManagedItem::commit`]; whenever the key's
//! head moves underneath it, the copy is rebased automatically, so local
//! edits survive concurrent writers.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::db::Database;
use crate::db::DbError;
use crate::db::RepoHandle;
use crate::doc_path::DocPath;
use crate::doc_path::InvalidPathError;
use crate::events::Subscription;
use crate::item::Item;
use crate::object_id::CommitId;

struct ManagedState {
    working: Item,
    base: Option<CommitId>,
}

struct ManagedItemInner {
    db: Database,
    repo: Arc<RepoHandle>,
    path: DocPath,
    key: String,
    state: Mutex<ManagedState>,
    _rebase_sub: Subscription,
}

impl ManagedItemInner {
    fn rebase(&self) {
        let (working, base) = {
            let state = self.state.lock().unwrap();
            (state.working.clone(), state.base.clone())
        };
        let rebased = self
            .repo
            .with_state(|repo| repo.rebase_item(&self.key, &working, base.as_ref()));
        match rebased {
            Ok((item, new_base)) => {
                let mut state = self.state.lock().unwrap();
                state.working = item;
                state.base = new_base;
            }
            Err(error) => {
                tracing::warn!(path = %self.path, %error, "rebase failed");
            }
        }
    }
}

/// A live, auto-rebasing item bound to a path.
#[derive(Clone)]
pub struct ManagedItem {
    inner: Arc<ManagedItemInner>,
}

impl ManagedItem {
    pub(crate) fn new(db: Database, path: &str, working: Item) -> Result<Self, DbError> {
        let doc_path = DocPath::parse(path)?;
        let key = doc_path
            .item_key()
            .ok_or_else(|| {
                DbError::Path(InvalidPathError {
                    input: doc_path.as_str().to_owned(),
                })
            })?
            .to_owned();
        let repo = db.open_repo(path)?;
        let base = repo.with_state(|state| state.head(&key));
        // The editing surface always presents the latest registered schema
        // version. When the upgrade path is incomplete the copy stays at
        // its current version until the missing schema is registered.
        let mut working = working;
        if let Err(error) = working.upgrade_schema(db.registry(), None) {
            tracing::debug!(path, %error, "keeping item at its current schema version");
        }
        let inner = Arc::new_cyclic(|weak: &Weak<ManagedItemInner>| {
            let weak = weak.clone();
            let sub_key = key.clone();
            let rebase_sub = repo.on_document_changed(move |changed: &String| {
                if changed == &sub_key
                    && let Some(inner) = weak.upgrade()
                {
                    inner.rebase();
                }
            });
            ManagedItemInner {
                db,
                repo: repo.clone(),
                path: doc_path,
                key,
                state: Mutex::new(ManagedState { working, base }),
                _rebase_sub: rebase_sub,
            }
        });
        Ok(Self { inner })
    }

    pub fn path(&self) -> &DocPath {
        &self.inner.path
    }

    /// Reads from the working copy.
    pub fn read<R>(&self, f: impl FnOnce(&Item) -> R) -> R {
        f(&self.inner.state.lock().unwrap().working)
    }

    /// Mutates the working copy. Nothing is persisted until
    /// [`Self::commit`].
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Item) -> R) -> R {
        f(&mut self.inner.state.lock().unwrap().working)
    }

    /// A snapshot of the working copy.
    pub fn item(&self) -> Item {
        self.inner.state.lock().unwrap().working.clone()
    }

    /// Commits the working copy through the database. The handle then
    /// tracks the new head; a no-op edit returns `None`.
    pub fn commit(&self) -> Result<Option<CommitId>, DbError> {
        let working = self.item();
        let committed = self
            .inner
            .db
            .set_item(self.inner.path.as_str(), &working)?;
        if let Some(id) = &committed {
            let mut state = self.inner.state.lock().unwrap();
            if state.base.is_none() || state.base.as_ref() != Some(id) {
                state.base = Some(id.clone());
            }
        }
        Ok(committed)
    }
}

impl std::fmt::Debug for ManagedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedItem")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}
