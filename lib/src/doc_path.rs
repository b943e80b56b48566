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

//! Document paths of the form `/type/repo/item[/embed]`.
//!
//! The pair `(type, repo)` names a repository; the third component is an item
//! key within it, and the optional fourth component addresses an embedded
//! sub-document. All components are lowercase `[a-z0-9_-]`.

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/[a-z0-9_-]+/[a-z0-9_-]+(/[a-z0-9_-]+(/[a-z0-9_-]+)?)?$").unwrap()
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid document path {input:?}")]
pub struct InvalidPathError {
    /// The offending input, after normalization.
    pub input: String,
}

/// Identifies a repository: the first two path components.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoId {
    kind: String,
    name: String,
}

impl RepoId {
    /// Parses `/type/repo` (an optional longer path is truncated to its
    /// repository part).
    pub fn parse(input: &str) -> Result<Self, InvalidPathError> {
        Ok(DocPath::parse(input)?.repo_id())
    }

    pub(crate) fn from_parts(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            name: name.to_owned(),
        }
    }

    /// The `type` component.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The `repo` component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path of the item `key` inside this repository.
    pub fn item_path(&self, key: &str) -> Result<DocPath, InvalidPathError> {
        DocPath::parse(&format!("/{}/{}/{}", self.kind, self.name, key))
    }

    /// True for the builtin authentication roots repository.
    pub fn is_sessions(&self) -> bool {
        self.kind == "sys" && self.name == "sessions"
    }

    /// Builtin repository holding session records.
    pub fn sessions() -> Self {
        Self::from_parts("sys", "sessions")
    }

    /// Builtin repository holding user records.
    pub fn users() -> Self {
        Self::from_parts("sys", "users")
    }
}

impl Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.kind, self.name)
    }
}

impl Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({self})")
    }
}

/// A validated, normalized document path.
///
/// Holds two, three or four components: a bare repository path, an item path,
/// or an embedded-document path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocPath {
    raw: String,
}

impl DocPath {
    /// Parses and normalizes `input`. Normalization lowercases the path and
    /// drops a trailing slash; anything that then fails the path grammar is
    /// an [`InvalidPathError`].
    pub fn parse(input: &str) -> Result<Self, InvalidPathError> {
        let mut raw = input.trim().to_ascii_lowercase();
        if raw.len() > 1 && raw.ends_with('/') {
            raw.pop();
        }
        if !PATH_PATTERN.is_match(&raw) {
            return Err(InvalidPathError { input: raw });
        }
        Ok(Self { raw })
    }

    /// Builds the item path for `key` within `repo`.
    pub fn for_item(repo: &RepoId, key: &str) -> Result<Self, InvalidPathError> {
        repo.item_path(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.raw.split('/').skip(1)
    }

    /// The `type` component.
    pub fn kind(&self) -> &str {
        self.components().next().unwrap()
    }

    /// The `repo` component.
    pub fn repo_name(&self) -> &str {
        self.components().nth(1).unwrap()
    }

    /// The item key, if the path has one.
    pub fn item_key(&self) -> Option<&str> {
        self.components().nth(2)
    }

    /// The embedded-document component, if present.
    pub fn embed(&self) -> Option<&str> {
        self.components().nth(3)
    }

    /// The repository owning this path.
    pub fn repo_id(&self) -> RepoId {
        RepoId::from_parts(self.kind(), self.repo_name())
    }
}

impl Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.raw)
    }
}

impl Debug for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocPath({:?})", self.raw)
    }
}

impl FromStr for DocPath {
    type Err = InvalidPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for DocPath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde::Serialize::serialize(&self.raw, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for DocPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: String = serde::Deserialize::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
