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

//! Schema-typed documents.
//!
//! An [`Item`] pairs a schema with a field map. It is normalized exactly
//! once after every mutation; computing its checksum locks it, after which
//! mutators fail and callers clone first.

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::OnceLock;

use itertools::Itertools as _;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::checksum::Checksum;
use crate::checksum::FlatEntry;
use crate::checksum::flatten_value;
use crate::schema::DELETED_FIELD;
use crate::schema::FieldMap;
use crate::schema::Registry;
use crate::schema::Schema;
use crate::schema::SchemaError;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ItemError {
    /// The item's checksum has been computed; clone before mutating.
    #[error("Item is locked")]
    Locked,
    #[error("Unknown field {field:?} for schema {marker}")]
    UnknownField { field: String, marker: String },
    #[error("Value for field {field:?} does not coerce to its declared type")]
    TypeMismatch { field: String },
    #[error("Missing required field {field:?}")]
    MissingField { field: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

static NULL_ITEM: LazyLock<Item> = LazyLock::new(|| {
    let item = Item {
        schema: Schema::null(),
        data: FieldMap::new(),
        checksum: OnceLock::new(),
    };
    item.lock();
    item
});

/// A schema-typed document value.
pub struct Item {
    schema: Arc<Schema>,
    data: FieldMap,
    // Lazily computed; once present the item is locked.
    checksum: OnceLock<Checksum>,
}

impl Item {
    /// Builds and normalizes an item. Unknown fields are dropped; fields
    /// that fail coercion or validation drop unless required, in which case
    /// construction fails.
    pub fn new(schema: Arc<Schema>, data: FieldMap) -> Result<Self, ItemError> {
        let mut item = Self {
            schema,
            data,
            checksum: OnceLock::new(),
        };
        item.normalize()?;
        Ok(item)
    }

    /// The shared null item: locked, empty, schema-less. Mutating
    /// operations on it must clone first.
    pub fn null() -> Self {
        NULL_ITEM.clone()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn is_null(&self) -> bool {
        self.schema.is_null()
    }

    pub fn fields(&self) -> &FieldMap {
        &self.data
    }

    /// Returns the field value, or the field's default computed against the
    /// item's own data when unset. Unknown fields are an error except on
    /// null items, which answer `None` for everything.
    pub fn get(&self, field: &str) -> Result<Option<Value>, ItemError> {
        if self.is_null() {
            return Ok(None);
        }
        let spec = self
            .schema
            .field_spec(field)
            .ok_or_else(|| ItemError::UnknownField {
                field: field.to_owned(),
                marker: self.schema.marker(),
            })?;
        if let Some(value) = self.data.get(field) {
            return Ok(Some(value.clone()));
        }
        Ok(spec.default_value(&self.data))
    }

    /// Sets `field` to `value`, coercing to the declared type, then
    /// re-normalizes. Fails on locked items and unknown fields.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), ItemError> {
        if self.is_locked() {
            return Err(ItemError::Locked);
        }
        let spec = self
            .schema
            .field_spec(field)
            .ok_or_else(|| ItemError::UnknownField {
                field: field.to_owned(),
                marker: self.schema.marker(),
            })?;
        let value = value.into();
        let coerced = if value.field_type() == spec.field_type() {
            value
        } else {
            Value::from_json(spec.field_type(), &value.to_json()).ok_or_else(|| {
                ItemError::TypeMismatch {
                    field: field.to_owned(),
                }
            })?
        };
        self.data.insert(field.to_owned(), coerced);
        self.normalize()
    }

    /// Removes `field`. Returns whether a change occurred.
    pub fn delete_field(&mut self, field: &str) -> Result<bool, ItemError> {
        if self.is_locked() {
            return Err(ItemError::Locked);
        }
        let removed = self.data.shift_remove(field).is_some();
        if removed {
            self.normalize()?;
        }
        Ok(removed)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.data.get(DELETED_FIELD), Some(Value::Boolean(true)))
    }

    pub fn set_deleted(&mut self, deleted: bool) -> Result<(), ItemError> {
        self.set(DELETED_FIELD, deleted)
    }

    pub fn is_locked(&self) -> bool {
        self.checksum.get().is_some()
    }

    /// Computes the checksum, locking the item.
    pub fn lock(&self) -> Checksum {
        self.checksum()
    }

    /// The checksum over the normalized, type-tagged, flattened fields,
    /// excluding local-only ones. Computing it locks the item.
    pub fn checksum(&self) -> Checksum {
        *self
            .checksum
            .get_or_init(|| Checksum::of_entries(&self.flat_entries()))
    }

    /// An unlocked copy sharing the schema but free to mutate.
    pub fn clone_unlocked(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            data: self.data.clone(),
            checksum: OnceLock::new(),
        }
    }

    /// Short-circuits on schema mismatch, then compares checksums.
    pub fn is_equal(&self, other: &Self) -> bool {
        if !self.schema.same_as(&other.schema) {
            return false;
        }
        self.checksum() == other.checksum()
    }

    /// Flattened `(path, tag, scalar)` leaves in sorted field order,
    /// excluding local-only fields.
    pub fn flat_entries(&self) -> Vec<FlatEntry> {
        let mut out = vec![];
        for field in self.data.keys().sorted() {
            let local = self
                .schema
                .field_spec(field)
                .is_some_and(|spec| spec.is_local());
            if local {
                continue;
            }
            flatten_value(field, &self.data[field], &mut out);
        }
        out
    }

    /// Upgrades the item's schema to `target` (or the latest registered
    /// version), applying every intermediate upgrade function. Fails with
    /// [`SchemaError::UpgradeImpossible`] when a step is missing; the item
    /// is left untouched in that case.
    pub fn upgrade_schema(
        &mut self,
        registry: &Registry,
        target: Option<u32>,
    ) -> Result<bool, ItemError> {
        if self.is_locked() {
            return Err(ItemError::Locked);
        }
        let Some(ns) = self.schema.ns().map(str::to_owned) else {
            return Ok(false);
        };
        let to_version = match target {
            Some(version) => version,
            None => match registry.latest(&ns) {
                Some(latest) => latest.version(),
                None => return Ok(false),
            },
        };
        if to_version <= self.schema.version() {
            return Ok(false);
        }
        let path = registry.upgrade_path(&ns, self.schema.version(), to_version)?;
        for next in path {
            if let Some(upgrade) = next.upgrade_fn() {
                upgrade(&mut self.data, &self.schema);
            }
            self.schema = next;
        }
        self.normalize()?;
        Ok(true)
    }

    /// Serializes to the wire form.
    pub fn encode(&self) -> EncodedItem {
        let data = serde_json::Value::Object(
            self.data
                .iter()
                .map(|(field, value)| {
                    let json = match value {
                        // Collection elements are untyped, so they go tagged.
                        Value::Set(_) | Value::Map(_) => value.to_tagged_json()["v"].clone(),
                        other => other.to_json(),
                    };
                    (field.clone(), json)
                })
                .collect(),
        );
        EncodedItem {
            schema_marker: self.schema.marker(),
            data,
            normalized: true,
            checksum: Some(self.checksum()),
        }
    }

    /// Decodes the wire form, resolving the schema through `registry`.
    /// Data whose schema is not registered stays in the log untouched; this
    /// call reports [`SchemaError::UnknownSchema`] until it is.
    pub fn decode(registry: &Registry, encoded: &EncodedItem) -> Result<Self, ItemError> {
        let schema = registry.resolve_marker(&encoded.schema_marker)?;
        if schema.is_null() {
            return Ok(Self::null());
        }
        let mut data = FieldMap::new();
        let object = encoded.data.as_object().cloned().unwrap_or_default();
        for (field, json) in &object {
            let Some(spec) = schema.field_spec(field) else {
                continue;
            };
            if let Some(value) = Value::from_json(spec.field_type(), json) {
                data.insert(field.clone(), value);
            }
        }
        Self::new(schema, data)
    }

    pub(crate) fn replace_data(&mut self, data: FieldMap) -> Result<(), ItemError> {
        if self.is_locked() {
            return Err(ItemError::Locked);
        }
        self.data = data;
        self.normalize()
    }

    pub(crate) fn take_data(&self) -> FieldMap {
        self.data.clone()
    }

    /// Normalizes in place: coerce declared fields, fill defaults, drop
    /// unknowns, canonicalize collections. Runs after every mutation.
    fn normalize(&mut self) -> Result<(), ItemError> {
        if self.is_null() {
            self.data.clear();
            return Ok(());
        }
        let mut normalized = FieldMap::new();
        for field in self.schema.field_names() {
            let spec = self.schema.field_spec(field).unwrap();
            let value = match self.data.get(field) {
                Some(value) if value.field_type() == spec.field_type() => Some(value.clone()),
                Some(value) => Value::from_json(spec.field_type(), &value.to_json()),
                None => spec.default_value(&self.data),
            };
            match value {
                Some(mut value) => {
                    value.normalize();
                    normalized.insert(field.to_owned(), value);
                }
                None if spec.is_required() => {
                    return Err(ItemError::MissingField {
                        field: field.to_owned(),
                    });
                }
                None => {}
            }
        }
        // Validation runs against the coerced data.
        let mut dropped = vec![];
        for field in normalized.keys() {
            let spec = self.schema.field_spec(field).unwrap();
            if !spec.validates(&normalized) {
                if spec.is_required() {
                    return Err(ItemError::MissingField {
                        field: field.clone(),
                    });
                }
                dropped.push(field.clone());
            }
        }
        for field in dropped {
            normalized.shift_remove(&field);
        }
        self.data = normalized;
        Ok(())
    }
}

impl Clone for Item {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            data: self.data.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

impl Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("schema", &self.schema.marker())
            .field("fields", &self.data.keys().collect::<Vec<_>>())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

/// Wire form of an item: `{s, d, n, cs}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodedItem {
    #[serde(rename = "s")]
    pub schema_marker: String,
    #[serde(rename = "d")]
    pub data: serde_json::Value,
    #[serde(rename = "n")]
    pub normalized: bool,
    #[serde(rename = "cs", skip_serializing_if = "Option::is_none", default)]
    pub checksum: Option<Checksum>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::schema::FieldSpec;
    use crate::value::FieldType;

    fn todo_schema() -> Arc<Schema> {
        Schema::new("todo", 1)
            .field("title", FieldSpec::new(FieldType::String))
            .field("count", FieldSpec::new(FieldType::Number))
            .field("tags", FieldSpec::new(FieldType::Set))
            .build()
    }

    fn todo_item(title: &str, count: i64) -> Item {
        let mut item = Item::new(todo_schema(), FieldMap::new()).unwrap();
        item.set("title", title).unwrap();
        item.set("count", count).unwrap();
        item
    }

    #[test]
    fn test_normalize_fills_deleted_default() {
        let item = Item::new(todo_schema(), FieldMap::new()).unwrap();
        assert!(!item.is_deleted());
        assert_eq!(
            item.get(DELETED_FIELD).unwrap(),
            Some(Value::Boolean(false))
        );
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut item = todo_item("a", 1);
        assert_matches!(item.set("nope", 1_i64), Err(ItemError::UnknownField { .. }));
        assert_matches!(item.get("nope"), Err(ItemError::UnknownField { .. }));
    }

    #[test]
    fn test_lock_blocks_mutation() {
        let mut item = todo_item("a", 1);
        item.lock();
        assert_matches!(item.set("title", "b"), Err(ItemError::Locked));
        let mut copy = item.clone_unlocked();
        copy.set("title", "b").unwrap();
        assert!(!item.is_equal(&copy));
    }

    #[test]
    fn test_checksum_is_stable_across_field_order() {
        let mut a = Item::new(todo_schema(), FieldMap::new()).unwrap();
        a.set("title", "x").unwrap();
        a.set("count", 7_i64).unwrap();
        let mut b = Item::new(todo_schema(), FieldMap::new()).unwrap();
        b.set("count", 7_i64).unwrap();
        b.set("title", "x").unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert!(a.is_equal(&b));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let registry = Registry::new();
        registry.register(todo_schema());
        let mut item = todo_item("buy milk", 2);
        item.set(
            "tags",
            Value::Set(vec![Value::from("home"), Value::from("errand")]),
        )
        .unwrap();
        let encoded = item.encode();
        let decoded = Item::decode(&registry, &encoded).unwrap();
        assert!(item.is_equal(&decoded));
        assert_eq!(encoded.checksum, Some(decoded.checksum()));
    }

    #[test]
    fn test_decode_unknown_schema() {
        let registry = Registry::new();
        let encoded = todo_item("a", 1).encode();
        assert_matches!(
            Item::decode(&registry, &encoded),
            Err(ItemError::Schema(SchemaError::UnknownSchema { .. }))
        );
    }

    #[test]
    fn test_upgrade_renames_field() {
        let registry = Registry::new();
        registry.register(
            Schema::new("note", 1)
                .field("text", FieldSpec::new(FieldType::String))
                .build(),
        );
        registry.register(
            Schema::new("note", 2)
                .field("title", FieldSpec::new(FieldType::String))
                .with_upgrade(|data, _from| {
                    if let Some(text) = data.shift_remove("text") {
                        data.insert("title".to_owned(), text);
                    }
                })
                .build(),
        );
        let v1 = registry.get("note", 1).unwrap();
        let mut item = Item::new(v1, FieldMap::new()).unwrap();
        item.set("text", "hello").unwrap();
        assert!(item.upgrade_schema(&registry, None).unwrap());
        assert_eq!(item.schema().marker(), "note/2");
        assert_eq!(item.get("title").unwrap(), Some(Value::from("hello")));
    }

    #[test]
    fn test_null_item_is_inert() {
        let null = Item::null();
        assert!(null.is_null());
        assert!(null.is_locked());
        assert_eq!(null.get("anything").unwrap(), None);
        let mut copy = null.clone_unlocked();
        assert_matches!(copy.set("x", 1_i64), Err(ItemError::UnknownField { .. }));
    }
}
