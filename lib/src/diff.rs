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

//! Field-level diffs between items, and their application.
//!
//! Scalars record the new value; sets and maps record add/remove deltas so
//! concurrent edits union instead of clobbering; rich text records splices.
//! Changes concatenate and apply in order, which is what gives merges and
//! rebases their last-writer-wins behavior for scalars.

use indexmap::IndexMap;
use itertools::Itertools as _;
use serde_json::json;

use crate::item::Item;
use crate::item::ItemError;
use crate::richtext::RichText;
use crate::richtext::RichTextChange;
use crate::value::Value;

/// One edit to a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldOp {
    /// Replace the field with a new value.
    Write(Value),
    /// Remove the field.
    Delete,
    /// Element-wise set delta.
    SetDelta { add: Vec<Value>, del: Vec<Value> },
    /// Entry-wise map delta.
    MapDelta {
        add: IndexMap<String, Value>,
        del: Vec<String>,
    },
    /// Rich text splices.
    RichDelta(Vec<RichTextChange>),
}

/// An edit to one field, tagged with whether the local writer made it.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub op: FieldOp,
    pub local: bool,
}

/// An ordered list of field edits.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataChanges(pub Vec<FieldChange>);

impl DataChanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Concatenates change sets; application order is left to right.
    pub fn concat(parts: impl IntoIterator<Item = Self>) -> Self {
        Self(parts.into_iter().flat_map(|part| part.0).collect())
    }

    /// The distinct fields touched.
    pub fn fields(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(|change| change.field.as_str())
            .unique()
            .collect()
    }
}

/// Computes the changes that turn `base` into `other`.
///
/// Local-only fields (per each side's schema) are skipped; `local` tags
/// every produced change as authored by the local writer.
pub fn diff_items(base: &Item, other: &Item, local: bool) -> DataChanges {
    let mut changes = vec![];
    let base_fields = base.fields();
    let other_fields = other.fields();
    let is_local_field = |item: &Item, field: &str| {
        item.schema()
            .field_spec(field)
            .is_some_and(|spec| spec.is_local())
    };
    let all_fields: Vec<&String> = base_fields
        .keys()
        .chain(other_fields.keys())
        .unique()
        .collect();
    for field in all_fields {
        if is_local_field(base, field) || is_local_field(other, field) {
            continue;
        }
        let op = match (base_fields.get(field), other_fields.get(field)) {
            (None, None) => continue,
            (Some(_), None) => FieldOp::Delete,
            (None, Some(new)) => FieldOp::Write(new.clone()),
            (Some(old), Some(new)) if old == new => continue,
            (Some(Value::Set(old)), Some(Value::Set(new))) => FieldOp::SetDelta {
                add: new.iter().filter(|v| !old.contains(v)).cloned().collect(),
                del: old.iter().filter(|v| !new.contains(v)).cloned().collect(),
            },
            (Some(Value::Map(old)), Some(Value::Map(new))) => FieldOp::MapDelta {
                add: new
                    .iter()
                    .filter(|(k, v)| old.get(*k) != Some(v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                del: old
                    .keys()
                    .filter(|k| !new.contains_key(*k))
                    .cloned()
                    .collect(),
            },
            (Some(Value::RichText(old)), Some(Value::RichText(new))) => {
                FieldOp::RichDelta(old.diff(new))
            }
            (Some(_), Some(new)) => FieldOp::Write(new.clone()),
        };
        changes.push(FieldChange {
            field: field.clone(),
            op,
            local,
        });
    }
    DataChanges(changes)
}

/// The fields on which `base` and `other` differ.
pub fn diff_keys(base: &Item, other: &Item, local: bool) -> Vec<String> {
    diff_items(base, other, local)
        .fields()
        .into_iter()
        .map(str::to_owned)
        .collect()
}

/// Applies `changes` in order, then normalizes once. Edits to fields the
/// item's schema does not know are dropped by that normalization.
pub fn patch_item(item: &mut Item, changes: &DataChanges) -> Result<(), ItemError> {
    let mut data = item.take_data();
    for change in &changes.0 {
        match &change.op {
            FieldOp::Write(value) => {
                data.insert(change.field.clone(), value.clone());
            }
            FieldOp::Delete => {
                data.shift_remove(&change.field);
            }
            FieldOp::SetDelta { add, del } => {
                let mut elements = match data.shift_remove(&change.field) {
                    Some(Value::Set(elements)) => elements,
                    _ => vec![],
                };
                elements.retain(|v| !del.contains(v));
                elements.extend(add.iter().cloned());
                data.insert(change.field.clone(), Value::Set(elements));
            }
            FieldOp::MapDelta { add, del } => {
                let mut entries = match data.shift_remove(&change.field) {
                    Some(Value::Map(entries)) => entries,
                    _ => IndexMap::new(),
                };
                for key in del {
                    entries.shift_remove(key);
                }
                for (key, value) in add {
                    entries.insert(key.clone(), value.clone());
                }
                data.insert(change.field.clone(), Value::Map(entries));
            }
            FieldOp::RichDelta(ops) => {
                let mut body = match data.shift_remove(&change.field) {
                    Some(Value::RichText(body)) => body,
                    _ => RichText::default(),
                };
                body.patch(ops);
                data.insert(change.field.clone(), Value::RichText(body));
            }
        }
    }
    item.replace_data(data)
}

impl serde::Serialize for DataChanges {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire: Vec<serde_json::Value> = self.0.iter().map(change_to_json).collect();
        serde::Serialize::serialize(&wire, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for DataChanges {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire: Vec<serde_json::Value> = serde::Deserialize::deserialize(deserializer)?;
        let changes = wire
            .iter()
            .map(change_from_json)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| serde::de::Error::custom("bad change encoding"))?;
        Ok(Self(changes))
    }
}

fn change_to_json(change: &FieldChange) -> serde_json::Value {
    let op = match &change.op {
        FieldOp::Write(value) => json!({"k": "w", "v": value.to_tagged_json()}),
        FieldOp::Delete => json!({"k": "d"}),
        FieldOp::SetDelta { add, del } => json!({
            "k": "s",
            "a": add.iter().map(Value::to_tagged_json).collect::<Vec<_>>(),
            "r": del.iter().map(Value::to_tagged_json).collect::<Vec<_>>(),
        }),
        FieldOp::MapDelta { add, del } => json!({
            "k": "m",
            "a": add
                .iter()
                .map(|(k, v)| (k.clone(), v.to_tagged_json()))
                .collect::<serde_json::Map<_, _>>(),
            "r": del,
        }),
        FieldOp::RichDelta(ops) => json!({"k": "r", "o": ops}),
    };
    json!({"f": change.field, "l": change.local, "o": op})
}

fn change_from_json(json: &serde_json::Value) -> Option<FieldChange> {
    let field = json.get("f")?.as_str()?.to_owned();
    let local = json.get("l")?.as_bool()?;
    let op_json = json.get("o")?;
    let op = match op_json.get("k")?.as_str()? {
        "w" => FieldOp::Write(Value::from_tagged_json(op_json.get("v")?)?),
        "d" => FieldOp::Delete,
        "s" => FieldOp::SetDelta {
            add: tagged_array(op_json.get("a")?)?,
            del: tagged_array(op_json.get("r")?)?,
        },
        "m" => FieldOp::MapDelta {
            add: op_json
                .get("a")?
                .as_object()?
                .iter()
                .map(|(k, v)| Some((k.clone(), Value::from_tagged_json(v)?)))
                .collect::<Option<IndexMap<_, _>>>()?,
            del: op_json
                .get("r")?
                .as_array()?
                .iter()
                .map(|v| Some(v.as_str()?.to_owned()))
                .collect::<Option<Vec<_>>>()?,
        },
        "r" => FieldOp::RichDelta(serde_json::from_value(op_json.get("o")?.clone()).ok()?),
        _ => return None,
    };
    Some(FieldChange { field, op, local })
}

fn tagged_array(json: &serde_json::Value) -> Option<Vec<Value>> {
    json.as_array()?
        .iter()
        .map(Value::from_tagged_json)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::schema::FieldMap;
    use crate::schema::FieldSpec;
    use crate::schema::Schema;
    use crate::value::FieldType;

    fn schema() -> Arc<Schema> {
        Schema::new("doc", 1)
            .field("title", FieldSpec::new(FieldType::String))
            .field("count", FieldSpec::new(FieldType::Number))
            .field("tags", FieldSpec::new(FieldType::Set))
            .field("meta", FieldSpec::new(FieldType::Map))
            .field("body", FieldSpec::new(FieldType::RichText))
            .build()
    }

    fn item(build: impl FnOnce(&mut Item)) -> Item {
        let mut item = Item::new(schema(), FieldMap::new()).unwrap();
        build(&mut item);
        item
    }

    #[test]
    fn test_diff_patch_round_trip() {
        let a = item(|it| {
            it.set("title", "old").unwrap();
            it.set("count", 1_i64).unwrap();
            it.set("tags", Value::Set(vec![Value::from("x"), Value::from("y")]))
                .unwrap();
        });
        let b = item(|it| {
            it.set("title", "new").unwrap();
            it.set("tags", Value::Set(vec![Value::from("y"), Value::from("z")]))
                .unwrap();
            it.set("body", RichText::from_plain_text("hello")).unwrap();
        });
        let changes = diff_items(&a, &b, true);
        let mut patched = a.clone_unlocked();
        patch_item(&mut patched, &changes).unwrap();
        assert!(patched.is_equal(&b));
    }

    #[test]
    fn test_set_deltas_union_under_concat() {
        let base = item(|it| {
            it.set("tags", Value::Set(vec![Value::from("a")])).unwrap();
        });
        let ours = item(|it| {
            it.set("tags", Value::Set(vec![Value::from("a"), Value::from("b")]))
                .unwrap();
        });
        let theirs = item(|it| {
            it.set("tags", Value::Set(vec![Value::from("a"), Value::from("c")]))
                .unwrap();
        });
        let merged_changes = DataChanges::concat([
            diff_items(&base, &theirs, false),
            diff_items(&base, &ours, true),
        ]);
        let mut merged = base.clone_unlocked();
        patch_item(&mut merged, &merged_changes).unwrap();
        assert_eq!(
            merged.get("tags").unwrap(),
            Some(Value::Set(vec![
                Value::from("a"),
                Value::from("b"),
                Value::from("c"),
            ]))
        );
    }

    #[test]
    fn test_scalar_concat_is_last_writer_wins() {
        let base = item(|it| it.set("count", 1_i64).unwrap());
        let first = item(|it| it.set("count", 2_i64).unwrap());
        let second = item(|it| it.set("count", 3_i64).unwrap());
        let changes = DataChanges::concat([
            diff_items(&base, &first, false),
            diff_items(&base, &second, true),
        ]);
        let mut merged = base.clone_unlocked();
        patch_item(&mut merged, &changes).unwrap();
        assert_eq!(merged.get("count").unwrap(), Some(Value::from(3_i64)));
    }

    #[test]
    fn test_wire_round_trip() {
        let a = item(|it| it.set("count", 1_i64).unwrap());
        let b = item(|it| {
            it.set("title", "t").unwrap();
            it.set(
                "meta",
                Value::Map(
                    [("k".to_owned(), Value::from("v"))]
                        .into_iter()
                        .collect::<IndexMap<_, _>>(),
                ),
            )
            .unwrap();
        });
        let changes = diff_items(&a, &b, false);
        let encoded = serde_json::to_string(&changes).unwrap();
        let decoded: DataChanges = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, changes);
    }

    #[test]
    fn test_diff_keys_reports_touched_fields() {
        let a = item(|it| it.set("count", 1_i64).unwrap());
        let b = item(|it| it.set("title", "t").unwrap());
        let mut keys = diff_keys(&a, &b, false);
        keys.sort();
        assert_eq!(keys, ["count", "title"]);
    }
}
