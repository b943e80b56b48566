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

use std::fmt;

use rand::Rng as _;

/// Number of random bytes in a freshly generated id.
pub const ID_BYTES: usize = 16;

pub trait ObjectId {
    fn object_type(&self) -> String;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;
}

// Defines a new struct type with visibility `vis` and name `ident` containing
// a single Vec<u8> used to store an identifier (typically 16 random bytes) as
// bytes. Types defined using this macro automatically implement the
// `ObjectId` trait and hex-string serde.
// Documentation comments written inside the macro definition will be captured
// and associated with the type defined by the macro.
macro_rules! id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(Vec<u8>);
        $crate::object_id::impl_id_type!($name);
    };
}

macro_rules! impl_id_type {
    ($name:ident) => {
        #[allow(dead_code)]
        impl $name {
            pub fn new(value: Vec<u8>) -> Self {
                Self(value)
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            /// Generates a fresh random id.
            pub fn random() -> Self {
                Self($crate::object_id::random_id_bytes())
            }

            /// Parses the given hex string into an id.
            pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
                hex::decode(hex).ok().map(Self)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.debug_tuple(stringify!($name))
                    .field(&$crate::object_id::ObjectId::hex(self))
                    .finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.pad(&$crate::object_id::ObjectId::hex(self))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serde::Serialize::serialize(&$crate::object_id::ObjectId::hex(self), serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let hex: String = serde::Deserialize::deserialize(deserializer)?;
                Self::try_from_hex(&hex)
                    .ok_or_else(|| serde::de::Error::custom(format!("bad id {hex:?}")))
            }
        }

        impl $crate::object_id::ObjectId for $name {
            fn object_type(&self) -> String {
                stringify!($name)
                    .strip_suffix("Id")
                    .unwrap()
                    .to_ascii_lowercase()
                    .to_string()
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn hex(&self) -> String {
                hex::encode(&self.0)
            }
        }
    };
}

pub(crate) use id_type;
pub(crate) use impl_id_type;

pub(crate) fn random_id_bytes() -> Vec<u8> {
    let bytes: [u8; ID_BYTES] = rand::rng().random();
    bytes.to_vec()
}

id_type!(
    /// Identifier for a commit record. Assigned at random when the commit is
    /// built and never reused.
    pub CommitId
);
id_type!(
    /// Identifier for an authentication session. Doubles as the session's
    /// item key under `/sys/sessions`.
    pub SessionId
);
id_type!(
    /// Process-local nonce distinguishing concurrent connections by the same
    /// session. Never synced beyond the commits it stamps.
    pub ConnectionId
);

impl fmt::Debug for dyn ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.object_type(), self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_distinct() {
        let a = CommitId::random();
        let b = CommitId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), ID_BYTES);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = CommitId::random();
        assert_eq!(CommitId::try_from_hex(id.hex()).unwrap(), id);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = SessionId::from_bytes(&[0xab, 0xcd]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abcd\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
