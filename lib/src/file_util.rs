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

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Creates one directory level, treating an already-existing directory as
/// success. The parent must exist; this is for carving a known child (a
/// repository's `type` directory) out of an existing database root, not
/// for recursive creation.
pub fn create_or_reuse_dir(dirname: &Path) -> Result<(), PathError> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(error) => Err(error).context(dirname),
    }
}

/// Writes `contents` to `target` atomically: the bytes go to a sibling temp
/// file which is synchronized and renamed over the target.
///
/// After a system crash the target holds either the previous or the new
/// contents, never a torn mix. The directory entry itself is not fsynced;
/// callers that need that guarantee synchronize the parent directory.
pub fn persist_atomically(target: &Path, contents: &[u8]) -> Result<(), PathError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(dir).context(dir)?;
    temp_file.write_all(contents).context(temp_file.path())?;
    temp_file.as_file().sync_data().context(temp_file.path())?;
    temp_file
        .persist(target)
        .map_err(|tempfile::PersistError { error, file: _ }| PathError {
            path: target.to_path_buf(),
            source: error,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_persist_atomically_replaces_contents() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("settings.json");
        persist_atomically(&target, b"one").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"one");
        persist_atomically(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
    }

    #[test]
    fn test_create_or_reuse_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("sub");
        create_or_reuse_dir(&dir).unwrap();
        create_or_reuse_dir(&dir).unwrap();
        assert!(dir.is_dir());
        // One level only: a missing parent is an error, not a mkdir -p.
        assert!(create_or_reuse_dir(&temp_dir.path().join("a/b")).is_err());
    }
}
