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

//! Immutable signed commit records.
//!
//! A commit either carries a full item or a delta against an earlier
//! commit. The signature covers the canonical JSON serialization of every
//! field except the signature itself; struct field order makes that
//! serialization deterministic.

use chrono::DateTime;
use chrono::Utc;
use rand::Rng as _;
use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;

use crate::bloom::BloomFilter;
use crate::checksum::Checksum;
use crate::diff::DataChanges;
use crate::diff::diff_items;
use crate::item::EncodedItem;
use crate::item::Item;
use crate::object_id::CommitId;
use crate::object_id::ConnectionId;
use crate::object_id::SessionId;
use crate::schema::SESSION_NS;
use crate::session::OwnedSession;
use crate::signing::PublicKey;
use crate::signing::SignError;
use crate::signing::SignatureBytes;

/// False-positive rate of per-commit ancestor filters. High by design
/// intent: the leaf check probes several filters, so precision per filter
/// can be cheap.
pub const ANCESTORS_FPR: f64 = 0.25;

/// A delta is kept only when its encoding is at most this fraction of the
/// full item's encoding.
pub const DELTA_SAVINGS_RATIO: f64 = 0.85;

/// One commit in this many is forced to carry a full item, bounding delta
/// chain length.
pub const FULL_COMMIT_ONE_IN: u32 = 20;

/// The payload of a commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommitContents {
    Full(FullContents),
    Delta(DeltaContents),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FullContents {
    #[serde(rename = "r")]
    pub record: EncodedItem,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeltaContents {
    #[serde(rename = "b")]
    pub base: CommitId,
    #[serde(rename = "e")]
    pub edit: Edit,
}

/// The edit of a delta commit, with the checksums that pin both ends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    #[serde(rename = "c")]
    pub changes: DataChanges,
    #[serde(rename = "sc")]
    pub src_checksum: Checksum,
    #[serde(rename = "dc")]
    pub dst_checksum: Checksum,
}

/// An immutable commit record as it travels on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitData {
    pub id: CommitId,
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "s")]
    pub session: SessionId,
    #[serde(rename = "cid")]
    pub connection_id: ConnectionId,
    /// Milliseconds since the epoch.
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(rename = "o")]
    pub org_id: String,
    #[serde(rename = "p")]
    pub parents: SmallVec<[CommitId; 2]>,
    /// Bloom filter over this key's ancestor commit ids.
    #[serde(rename = "af")]
    pub ancestors_filter: BloomFilter,
    #[serde(rename = "ac")]
    pub ancestors_count: u32,
    #[serde(rename = "c")]
    pub contents: CommitContents,
    #[serde(rename = "mb", skip_serializing_if = "Option::is_none", default)]
    pub merge_base: Option<CommitId>,
    #[serde(rename = "ml", skip_serializing_if = "Option::is_none", default)]
    pub merge_leader: Option<SessionId>,
    #[serde(rename = "rv", skip_serializing_if = "Option::is_none", default)]
    pub revert: Option<CommitId>,
    #[serde(rename = "sig", skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<SignatureBytes>,
}

impl CommitData {
    /// Starts an unsigned commit with a fresh random id and the current
    /// wall clock.
    pub fn new(
        session: &SessionId,
        connection_id: &ConnectionId,
        org_id: &str,
        key: &str,
        parents: SmallVec<[CommitId; 2]>,
        ancestors_filter: BloomFilter,
        ancestors_count: u32,
        contents: CommitContents,
    ) -> Self {
        Self {
            id: CommitId::random(),
            key: key.to_owned(),
            session: session.clone(),
            connection_id: connection_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            org_id: org_id.to_owned(),
            parents,
            ancestors_filter,
            ancestors_count,
            contents,
            merge_base: None,
            merge_leader: None,
            revert: None,
            signature: None,
        }
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_delta(&self) -> bool {
        matches!(self.contents, CommitContents::Delta(_))
    }

    /// The encoded item, for full commits.
    pub fn record(&self) -> Option<&EncodedItem> {
        match &self.contents {
            CommitContents::Full(full) => Some(&full.record),
            CommitContents::Delta(_) => None,
        }
    }

    pub fn delta(&self) -> Option<&DeltaContents> {
        match &self.contents {
            CommitContents::Full(_) => None,
            CommitContents::Delta(delta) => Some(delta),
        }
    }

    pub fn timestamp_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }

    /// The canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned).unwrap()
    }

    pub fn sign(&mut self, session: &OwnedSession) {
        self.signature = Some(session.sign(&self.signing_bytes()));
    }

    pub fn verify_signature(&self, public_key: &PublicKey) -> Result<(), SignError> {
        let signature = self.signature.as_ref().ok_or(SignError::VerificationFailed)?;
        public_key.verify(&self.signing_bytes(), signature)
    }
}

impl PartialEq for CommitData {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CommitData {}

/// Chooses full or delta contents for a new edit of `item` whose latest
/// full-item predecessor is `prev_full`.
///
/// Session records are never delta-compressed: they bootstrap signature
/// verification and must be readable standalone. Elsewhere a delta is
/// emitted when its encoding is small enough, except for a random one in
/// [`FULL_COMMIT_ONE_IN`] commits which stays full.
pub fn choose_contents(
    ns: Option<&str>,
    prev_full: Option<(&CommitId, &Item)>,
    item: &Item,
) -> CommitContents {
    let full = || {
        CommitContents::Full(FullContents {
            record: item.encode(),
        })
    };
    if ns == Some(SESSION_NS) {
        return full();
    }
    if rand::rng().random_range(0..FULL_COMMIT_ONE_IN) == 0 {
        return full();
    }
    let Some((base_id, base_item)) = prev_full else {
        return full();
    };
    if base_item.schema().ns() != ns {
        return full();
    }
    let changes = diff_items(base_item, item, false);
    let delta_size = serde_json::to_vec(&changes).unwrap().len();
    let full_size = serde_json::to_vec(&item.encode()).unwrap().len();
    if (delta_size as f64) > DELTA_SAVINGS_RATIO * (full_size as f64) {
        return full();
    }
    CommitContents::Delta(DeltaContents {
        base: base_id.clone(),
        edit: Edit {
            changes,
            src_checksum: base_item.checksum(),
            dst_checksum: item.checksum(),
        },
    })
}
