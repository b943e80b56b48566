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

//! The `settings.json` file: this peer's keypair and its view of the trust
//! domain. The private key never leaves this file.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::file_util::PathError;
use crate::file_util::persist_atomically;
use crate::session::OwnedSession;
use crate::session::Session;
use crate::signing::Keypair;
use crate::signing::SignError;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Malformed settings file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Key(#[from] SignError),
}

/// The current session with its private half.
#[derive(Serialize, Deserialize)]
pub struct StoredSession {
    #[serde(flatten)]
    pub session: Session,
    #[serde(rename = "privateKey")]
    pub private_key: String,
}

impl StoredSession {
    pub fn from_owned(owned: &OwnedSession) -> Self {
        Self {
            session: owned.session().clone(),
            private_key: owned.keypair().seed_base64(),
        }
    }

    pub fn to_owned_session(&self) -> Result<OwnedSession, SettingsError> {
        let keypair = Keypair::from_seed_base64(&self.private_key)?;
        Ok(OwnedSession::from_parts(self.session.clone(), keypair))
    }
}

/// On-disk shape of `settings.json`.
#[derive(Serialize, Deserialize)]
pub struct DbSettings {
    #[serde(rename = "currentSession")]
    pub current: StoredSession,
    /// Trusted root session records.
    pub roots: Vec<Session>,
    /// All other known session records.
    pub sessions: Vec<Session>,
}

impl DbSettings {
    /// Fresh settings around a newly generated session.
    pub fn bootstrap(owned: &OwnedSession) -> Self {
        let roots = if owned.session().is_root() {
            vec![owned.session().clone()]
        } else {
            vec![]
        };
        Self {
            current: StoredSession::from_owned(owned),
            roots,
            sessions: vec![],
        }
    }

    /// Loads the settings file; `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, SettingsError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(PathError {
                    path: path.to_path_buf(),
                    source: error,
                }
                .into());
            }
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Rewrites the settings file atomically.
    pub fn store(&self, path: &Path) -> Result<(), SettingsError> {
        let bytes = serde_json::to_vec_pretty(self).unwrap();
        persist_atomically(path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        let owned = OwnedSession::generate_root();
        let settings = DbSettings::bootstrap(&owned);
        settings.store(&path).unwrap();

        let loaded = DbSettings::load(&path).unwrap().unwrap();
        assert_eq!(&loaded.current.session, owned.session());
        assert_eq!(loaded.roots.len(), 1);
        let restored = loaded.current.to_owned_session().unwrap();
        assert_eq!(restored.keypair().public_key(), owned.keypair().public_key());
    }

    #[test]
    fn test_missing_file_is_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(
            DbSettings::load(&temp_dir.path().join("settings.json"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_anonymous_session_has_no_roots() {
        let owned = OwnedSession::generate(None);
        let settings = DbSettings::bootstrap(&owned);
        assert!(settings.roots.is_empty());
    }
}
