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

//! The registry of sessions trusted to author commits.
//!
//! A commit verifies iff its author session is known, was unexpired at the
//! commit's timestamp, and the signature over the canonical commit bytes
//! validates against the session's public key. Session records observed in
//! `/sys/sessions` whose commits verify against an already-trusted root are
//! added automatically, extending the trust chain.

use std::collections::HashMap;

use thiserror::Error;

use crate::commit::CommitData;
use crate::item::Item;
use crate::object_id::SessionId;
use crate::schema::Registry;
use crate::session::OwnedSession;
use crate::session::Session;
use crate::session::SessionError;
use crate::signing::SignError;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("Commit author session {session} is unknown")]
    UnknownSession { session: SessionId },
    #[error("Commit author session {session} was expired at commit time")]
    Expired { session: SessionId },
    #[error(transparent)]
    Signature(#[from] SignError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Process-wide, read-mostly session registry. Additions are serialized by
/// the owner's lock.
pub struct TrustPool {
    current: OwnedSession,
    roots: HashMap<SessionId, Session>,
    sessions: HashMap<SessionId, Session>,
}

impl TrustPool {
    pub fn new(
        current: OwnedSession,
        roots: impl IntoIterator<Item = Session>,
        known: impl IntoIterator<Item = Session>,
    ) -> Self {
        let mut sessions = HashMap::new();
        let mut root_map = HashMap::new();
        for root in roots {
            sessions.insert(root.id.clone(), root.clone());
            root_map.insert(root.id.clone(), root);
        }
        for session in known {
            sessions.insert(session.id.clone(), session);
        }
        sessions.insert(current.id().clone(), current.session().clone());
        if current.session().is_root() {
            root_map.insert(current.id().clone(), current.session().clone());
        }
        Self {
            current,
            roots: root_map,
            sessions,
        }
    }

    pub fn current(&self) -> &OwnedSession {
        &self.current
    }

    pub fn current_id(&self) -> &SessionId {
        self.current.id()
    }

    pub fn is_root(&self, id: &SessionId) -> bool {
        self.roots.contains_key(id)
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn roots(&self) -> impl Iterator<Item = &Session> {
        self.roots.values()
    }

    /// Adds a session observed elsewhere (settings file, peer exchange).
    pub fn add_session(&mut self, session: Session) {
        tracing::debug!(id = %session.id, owner = ?session.owner, "trusting session");
        if session.is_root() {
            self.roots.insert(session.id.clone(), session.clone());
        }
        self.sessions.insert(session.id.clone(), session);
    }

    /// Verifies `commit` against the known sessions.
    pub fn verify_commit(&self, commit: &CommitData) -> Result<(), TrustError> {
        let session = self
            .sessions
            .get(&commit.session)
            .ok_or_else(|| TrustError::UnknownSession {
                session: commit.session.clone(),
            })?;
        if session.is_expired(commit.timestamp_datetime()) {
            return Err(TrustError::Expired {
                session: commit.session.clone(),
            });
        }
        commit.verify_signature(&session.public_key)?;
        Ok(())
    }

    /// Registers the session carried by a verified `/sys/sessions` commit.
    ///
    /// The commit must already have passed [`Self::verify_commit`]; on top
    /// of that its author must be a trusted root (or the session's own
    /// record during bootstrap). Returns whether a session was added.
    pub fn register_session_commit(
        &mut self,
        commit: &CommitData,
        registry: &Registry,
    ) -> Result<bool, TrustError> {
        let Some(record) = commit.record() else {
            // Session commits are never delta-compressed.
            return Ok(false);
        };
        let item = Item::decode(registry, record).map_err(SessionError::from)?;
        if item.is_null() || item.is_deleted() {
            return Ok(false);
        }
        let session = Session::from_item(&item)?;
        let self_signed = commit.session == session.id;
        if !self.is_root(&commit.session) && !self_signed {
            return Ok(false);
        }
        if self.sessions.get(&session.id) == Some(&session) {
            return Ok(false);
        }
        // A self-signed record is only trusted for a session we already
        // know; it cannot introduce new authority.
        if self_signed && !self.sessions.contains_key(&session.id) {
            return Ok(false);
        }
        self.add_session(session);
        Ok(true)
    }
}

impl std::fmt::Debug for TrustPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustPool")
            .field("current", &self.current.id())
            .field("roots", &self.roots.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use smallvec::smallvec;

    use super::*;
    use crate::bloom::BloomFilter;
    use crate::commit::ANCESTORS_FPR;
    use crate::commit::CommitContents;
    use crate::commit::FullContents;
    use crate::object_id::ConnectionId;

    use crate::object_id::ObjectId as _;

    fn session_commit(author: &OwnedSession, subject: &Session, registry: &Registry) -> CommitData {
        let item = subject.to_item(registry).unwrap();
        let mut commit = CommitData::new(
            author.id(),
            &ConnectionId::random(),
            "local",
            &subject.id.hex(),
            smallvec![],
            BloomFilter::new(1, ANCESTORS_FPR),
            0,
            CommitContents::Full(FullContents {
                record: item.encode(),
            }),
        );
        commit.sign(author);
        commit
    }

    #[test]
    fn test_verify_known_session() {
        let registry = Registry::with_builtins();
        let pool = TrustPool::new(OwnedSession::generate_root(), [], []);
        let commit = {
            let current = pool.current();
            session_commit(current, &current.session().clone(), &registry)
        };
        pool.verify_commit(&commit).unwrap();
    }

    #[test]
    fn test_unknown_session_is_rejected() {
        let registry = Registry::with_builtins();
        let pool = TrustPool::new(OwnedSession::generate_root(), [], []);
        let stranger = OwnedSession::generate(None);
        let commit = session_commit(&stranger, stranger.session(), &registry);
        assert_matches!(
            pool.verify_commit(&commit),
            Err(TrustError::UnknownSession { .. })
        );
    }

    #[test]
    fn test_root_extends_trust_chain() {
        let registry = Registry::with_builtins();
        let root = OwnedSession::generate_root();
        let child = OwnedSession::generate(Some("u1".to_owned()));
        let mut pool = TrustPool::new(root, [], []);
        let commit = {
            let current = pool.current();
            session_commit(current, child.session(), &registry)
        };
        pool.verify_commit(&commit).unwrap();
        assert!(pool.register_session_commit(&commit, &registry).unwrap());
        assert!(pool.session(child.id()).is_some());

        // The newly trusted child can author verifiable commits now.
        let grandchild = OwnedSession::generate(None);
        let child_commit = session_commit(&child, grandchild.session(), &registry);
        pool.verify_commit(&child_commit).unwrap();
        // But a non-root cannot introduce further sessions.
        assert!(!pool.register_session_commit(&child_commit, &registry).unwrap());
    }
}
