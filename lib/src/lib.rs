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

#![warn(missing_docs)]
#![deny(unused_must_use)]

//! Antler: an embeddable distributed document database.
//!
//! Every node keeps a fully functional local replica. Documents live in
//! per-key, content-addressed commit graphs with cryptographically signed
//! history; edits produce new commits that peers exchange and verify
//! independently, converging through automatic three-way merge. Live
//! queries stay incrementally up to date and cache their result sets on
//! disk.
//!
//! Open a [`db::Database`], address documents by `/type/repo/item` paths,
//! and subscribe queries to watch them change.

pub mod authorization;
pub mod bloom;
pub mod checksum;
pub mod commit;
pub mod commit_log;
pub mod db;
pub mod diff;
pub mod doc_path;
pub mod events;
pub mod file_util;
pub mod item;
pub mod managed_item;
pub mod object_id;
pub mod query;
pub mod query_cache;
pub mod repository;
pub mod richtext;
pub mod schema;
pub mod session;
pub mod settings;
pub mod signing;
pub mod trust_pool;
pub mod value;
