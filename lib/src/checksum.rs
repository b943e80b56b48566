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

//! Deterministic content checksums.
//!
//! Item checksums hash the normalized, type-tagged, depth-flattened field
//! representation: every leaf becomes a `(path, tag, scalar)` triple, the
//! triples are fed to BLAKE2b in sorted path order, and the digest is
//! truncated to 32 bytes. Equal checksums imply equal normalized contents up
//! to hash collision.

use std::fmt;

use blake2::Blake2b512;
use digest::Digest as _;
use itertools::Itertools as _;

use crate::value::Value;

/// A 32-byte content checksum, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
        let bytes = hex::decode(hex).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }

    /// Hashes raw bytes. Used for non-item content (query identities).
    pub fn of_bytes(data: &[u8]) -> Self {
        let digest = Blake2b512::digest(data);
        Self(digest[..32].try_into().unwrap())
    }

    /// Hashes flattened `(path, tag, scalar)` leaf entries. Entries must
    /// already be in canonical (sorted-path) order.
    pub fn of_entries<'a>(entries: impl IntoIterator<Item = &'a FlatEntry>) -> Self {
        let mut hasher = Blake2b512::new();
        for entry in entries {
            // Length-prefixed parts keep adjacent entries unambiguous.
            for part in [entry.path.as_str(), entry.tag, entry.scalar.as_str()] {
                hasher.update((part.len() as u64).to_le_bytes());
                hasher.update(part.as_bytes());
            }
        }
        let digest = hasher.finalize();
        Self(digest[..32].try_into().unwrap())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Checksum").field(&self.hex()).finish()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.hex())
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&self.hex(), serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex: String = serde::Deserialize::deserialize(deserializer)?;
        Self::try_from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("bad checksum {hex:?}")))
    }
}

/// One flattened leaf of an item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlatEntry {
    /// Slash-separated path from the field name down to the leaf.
    pub path: String,
    /// The leaf's type tag.
    pub tag: &'static str,
    /// Canonical scalar rendering of the leaf.
    pub scalar: String,
}

/// Flattens `value` rooted at `path` into leaf entries, depth first.
/// Collections must already be normalized so the order is canonical.
pub fn flatten_value(path: &str, value: &Value, out: &mut Vec<FlatEntry>) {
    match value {
        Value::Set(values) => {
            for (index, element) in values.iter().enumerate() {
                flatten_value(&format!("{path}/{index}"), element, out);
            }
        }
        Value::Map(entries) => {
            for key in entries.keys().sorted() {
                flatten_value(&format!("{path}/{key}"), &entries[key], out);
            }
        }
        Value::RichText(rt) => {
            for (index, paragraph) in rt.paragraphs().iter().enumerate() {
                out.push(FlatEntry {
                    path: format!("{path}/p/{index}"),
                    tag: "str",
                    scalar: paragraph.clone(),
                });
            }
        }
        scalar => out.push(FlatEntry {
            path: path.to_owned(),
            tag: scalar.type_tag(),
            scalar: scalar_repr(scalar),
        }),
    }
}

fn scalar_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Date(d) => d.timestamp_millis().to_string(),
        _ => unreachable!("collections are flattened by the caller"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_distinguishes_tags() {
        let as_string = [FlatEntry {
            path: "count".into(),
            tag: "str",
            scalar: "1".into(),
        }];
        let as_number = [FlatEntry {
            path: "count".into(),
            tag: "num",
            scalar: "1".into(),
        }];
        assert_ne!(
            Checksum::of_entries(&as_string),
            Checksum::of_entries(&as_number)
        );
    }

    #[test]
    fn test_checksum_boundary_is_unambiguous() {
        let a = [FlatEntry {
            path: "ab".into(),
            tag: "str",
            scalar: "c".into(),
        }];
        let b = [FlatEntry {
            path: "a".into(),
            tag: "str",
            scalar: "bc".into(),
        }];
        assert_ne!(Checksum::of_entries(&a), Checksum::of_entries(&b));
    }

    #[test]
    fn test_flatten_nested_value() {
        let mut set = Value::Set(vec![Value::from("b"), Value::from("a")]);
        set.normalize();
        let mut out = vec![];
        flatten_value("tags", &set, &mut out);
        assert_eq!(out[0].path, "tags/0");
        assert_eq!(out[0].scalar, "a");
        assert_eq!(out[1].scalar, "b");
    }

    #[test]
    fn test_hex_round_trip() {
        let checksum = Checksum::of_bytes(b"payload");
        assert_eq!(Checksum::try_from_hex(checksum.hex()), Some(checksum));
    }
}
