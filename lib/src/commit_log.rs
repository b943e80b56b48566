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

//! Append-only, line-delimited JSON logs.
//!
//! One file per repository. Records are single-line JSON blobs separated by
//! `\n`; a blank line between blobs is accepted but not required. Opening a
//! log scans it forward and, in write mode, self-heals torn tails by
//! truncating to the last byte offset that ended a parseable record.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read as _;
use std::io::Seek as _;
use std::io::SeekFrom;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;

/// Read granularity of both forward and reverse scans.
const SCAN_BLOCK: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Path(#[from] PathError),
    /// Appends are only valid once the initial scan has completed.
    #[error("Log {path} has not been scanned")]
    NotScanned { path: PathBuf },
    #[error("Log {path} is read-only")]
    ReadOnly { path: PathBuf },
}

/// A file-backed log. Appends and barriers are serialized by the exclusive
/// borrow; callers that share a log wrap it in their own queue.
#[derive(Debug)]
pub struct CommitLog {
    path: PathBuf,
    // None when a read-only log could not be opened; such logs read empty.
    file: Option<File>,
    read_only: bool,
    scanned: bool,
    end_offset: u64,
}

impl CommitLog {
    /// Opens the log. In write mode the file is created if missing; in
    /// read-only mode an open failure degrades to an empty log.
    pub fn open(path: &Path, read_only: bool) -> Result<Self, LogError> {
        let file = if read_only {
            File::open(path).ok()
        } else {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
                    .context(path)?,
            )
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            read_only,
            scanned: false,
            end_offset: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last record that scanned or appended
    /// cleanly.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Scans the log from the start, yielding every parsed record.
    ///
    /// On a parse failure the scan stops; in write mode the file is then
    /// truncated to the last good offset so subsequent appends continue
    /// from a clean boundary.
    pub fn scan(&mut self) -> Result<Vec<serde_json::Value>, LogError> {
        let Some(file) = self.file.as_mut() else {
            self.scanned = true;
            return Ok(vec![]);
        };
        file.seek(SeekFrom::Start(0)).context(&self.path)?;
        let mut entries = vec![];
        let mut pending: Vec<u8> = vec![];
        let mut offset: u64 = 0;
        let mut last_good: u64 = 0;
        let mut corrupted = false;
        let mut block = vec![0u8; SCAN_BLOCK];
        'read: loop {
            let n = file.read(&mut block).context(&self.path)?;
            if n == 0 {
                break;
            }
            for &byte in &block[..n] {
                offset += 1;
                if byte != b'\n' {
                    pending.push(byte);
                    continue;
                }
                let line = pending.trim_ascii();
                if !line.is_empty() {
                    match serde_json::from_slice(line) {
                        Ok(value) => entries.push(value),
                        Err(_) => {
                            corrupted = true;
                            break 'read;
                        }
                    }
                }
                last_good = offset;
                pending.clear();
            }
        }
        // A tail with no terminator is a torn write.
        if !corrupted && !pending.trim_ascii().is_empty() {
            corrupted = true;
        }
        if corrupted && !self.read_only {
            tracing::warn!(
                path = %self.path.display(),
                truncate_to = last_good,
                "corrupted log tail, truncating"
            );
            file.set_len(last_good).context(&self.path)?;
            file.sync_data().context(&self.path)?;
        }
        self.end_offset = last_good;
        self.scanned = true;
        Ok(entries)
    }

    /// Appends records as JSON lines. Requires a completed [`Self::scan`].
    pub fn append(&mut self, entries: &[serde_json::Value]) -> Result<(), LogError> {
        if self.read_only {
            return Err(LogError::ReadOnly {
                path: self.path.clone(),
            });
        }
        if !self.scanned {
            return Err(LogError::NotScanned {
                path: self.path.clone(),
            });
        }
        if entries.is_empty() {
            return Ok(());
        }
        let file = self.file.as_mut().expect("write logs always have a file");
        let lines: Vec<String> = entries
            .iter()
            .map(|entry| serde_json::to_string(entry).unwrap())
            .collect();
        let payload = format!("\n{}\n", lines.join("\n\n"));
        file.seek(SeekFrom::End(0)).context(&self.path)?;
        file.write_all(payload.as_bytes()).context(&self.path)?;
        self.end_offset += payload.len() as u64;
        Ok(())
    }

    /// Resolves after all buffered writes have reached the disk.
    pub fn barrier(&mut self) -> Result<(), LogError> {
        if let Some(file) = self.file.as_mut()
            && !self.read_only
        {
            file.flush().context(&self.path)?;
            file.sync_data().context(&self.path)?;
        }
        Ok(())
    }

    /// Reads records from the end of the file backward, newest first.
    /// Unparseable stretches are skipped rather than fatal; this is a
    /// debugging and fast-tail facility, not the source of truth.
    pub fn reverse_scan(&self) -> Result<Vec<serde_json::Value>, LogError> {
        let Ok(mut file) = File::open(&self.path) else {
            return Ok(vec![]);
        };
        let len = file.seek(SeekFrom::End(0)).context(&self.path)?;
        let mut entries = vec![];
        // Bytes of the record currently being accumulated, in file order.
        let mut pending: Vec<u8> = vec![];
        let mut block_end = len;
        let mut block = vec![0u8; SCAN_BLOCK];
        while block_end > 0 {
            let block_start = block_end.saturating_sub(SCAN_BLOCK as u64);
            let block_len = (block_end - block_start) as usize;
            file.seek(SeekFrom::Start(block_start)).context(&self.path)?;
            file.read_exact(&mut block[..block_len]).context(&self.path)?;
            for &byte in block[..block_len].iter().rev() {
                if byte != b'\n' {
                    pending.insert(0, byte);
                    continue;
                }
                let line = pending.trim_ascii();
                if !line.is_empty()
                    && let Ok(value) = serde_json::from_slice(line)
                {
                    entries.push(value);
                }
                pending.clear();
            }
            block_end = block_start;
        }
        let line = pending.trim_ascii();
        if !line.is_empty()
            && let Ok(value) = serde_json::from_slice(line)
        {
            entries.push(value);
        }
        Ok(entries)
    }
}
