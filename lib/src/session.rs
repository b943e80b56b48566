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

//! Authentication sessions.
//!
//! A session is a public key with an expiration, stored as an item at
//! `/sys/sessions/<sessionId>`. The local peer additionally holds the
//! private half of its own session.

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::item::Item;
use crate::item::ItemError;
use crate::object_id::ObjectId as _;
use crate::object_id::SessionId;
use crate::schema::FieldMap;
use crate::schema::Registry;
use crate::schema::SESSION_NS;
use crate::signing::Keypair;
use crate::signing::PublicKey;
use crate::signing::SignError;
use crate::signing::SignatureBytes;
use crate::value::Value;

/// Default lifetime of a newly issued session.
pub const SESSION_TTL_DAYS: i64 = 30;

/// Owner marker designating a root session.
pub const ROOT_OWNER: &str = "root";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session item is missing field {field:?}")]
    MissingField { field: &'static str },
    #[error(transparent)]
    BadKey(#[from] SignError),
    #[error(transparent)]
    Item(#[from] ItemError),
}

/// The public record of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(rename = "publicKey")]
    pub public_key: PublicKey,
    pub expiration: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<String>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    pub fn is_root(&self) -> bool {
        self.owner.as_deref() == Some(ROOT_OWNER)
    }

    /// Encodes this session as a `/sys/sessions` item.
    pub fn to_item(&self, registry: &Registry) -> Result<Item, SessionError> {
        let schema = registry
            .latest(SESSION_NS)
            .expect("builtin session schema is registered");
        let mut data = FieldMap::new();
        data.insert("id".to_owned(), Value::from(self.id.hex()));
        data.insert(
            "publicKey".to_owned(),
            Value::from(self.public_key.to_jwk_string()),
        );
        data.insert("expiration".to_owned(), Value::from(self.expiration));
        if let Some(owner) = &self.owner {
            data.insert("owner".to_owned(), Value::from(owner.as_str()));
        }
        Ok(Item::new(schema, data)?)
    }

    /// Decodes a `/sys/sessions` item.
    pub fn from_item(item: &Item) -> Result<Self, SessionError> {
        let get_string = |field: &'static str| -> Result<Option<String>, SessionError> {
            match item.get(field)? {
                Some(Value::String(s)) => Ok(Some(s)),
                _ => Ok(None),
            }
        };
        let id = get_string("id")?
            .and_then(|hex| SessionId::try_from_hex(hex))
            .ok_or(SessionError::MissingField { field: "id" })?;
        let public_key = PublicKey::from_jwk_string(
            &get_string("publicKey")?.ok_or(SessionError::MissingField { field: "publicKey" })?,
        )?;
        let expiration = match item.get("expiration")? {
            Some(Value::Date(d)) => d,
            _ => return Err(SessionError::MissingField { field: "expiration" }),
        };
        Ok(Self {
            id,
            public_key,
            expiration,
            owner: get_string("owner")?,
        })
    }
}

/// A session together with its private key. Only the local peer's own
/// sessions are owned.
pub struct OwnedSession {
    session: Session,
    keypair: Keypair,
}

impl OwnedSession {
    /// Generates a root session: self-owned trust anchor with a long
    /// lifetime.
    pub fn generate_root() -> Self {
        Self::generate_with(Some(ROOT_OWNER.to_owned()), Duration::days(365 * 10))
    }

    /// Generates a session for `owner` (or an anonymous one) with the
    /// default lifetime.
    pub fn generate(owner: Option<String>) -> Self {
        Self::generate_with(owner, Duration::days(SESSION_TTL_DAYS))
    }

    fn generate_with(owner: Option<String>, ttl: Duration) -> Self {
        let keypair = Keypair::generate();
        // Millisecond precision matches the item encoding, so a session
        // round-trips through its own record unchanged.
        let expiration = Utc::now() + ttl;
        let expiration = DateTime::from_timestamp_millis(expiration.timestamp_millis()).unwrap();
        let session = Session {
            id: SessionId::random(),
            public_key: keypair.public_key(),
            expiration,
            owner,
        };
        Self { session, keypair }
    }

    pub fn from_parts(session: Session, keypair: Keypair) -> Self {
        Self { session, keypair }
    }

    pub fn id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn sign(&self, data: &[u8]) -> SignatureBytes {
        self.keypair.sign(data)
    }
}

impl std::fmt::Debug for OwnedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedSession")
            .field("id", &self.session.id)
            .field("owner", &self.session.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_round_trip() {
        let registry = Registry::with_builtins();
        let owned = OwnedSession::generate(Some("u1".to_owned()));
        let item = owned.session().to_item(&registry).unwrap();
        let restored = Session::from_item(&item).unwrap();
        assert_eq!(&restored, owned.session());
    }

    #[test]
    fn test_expiry() {
        let owned = OwnedSession::generate(None);
        assert!(!owned.session().is_expired(Utc::now()));
        assert!(
            owned
                .session()
                .is_expired(Utc::now() + Duration::days(SESSION_TTL_DAYS + 1))
        );
    }

    #[test]
    fn test_root_marker() {
        assert!(OwnedSession::generate_root().session().is_root());
        assert!(!OwnedSession::generate(None).session().is_root());
    }
}
