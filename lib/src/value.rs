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

//! Runtime-typed field values.
//!
//! Items carry heterogenous fields whose types are decided at runtime by the
//! schema, so values are a tagged union with an explicit coercion table
//! rather than compile-time generics. Two encodings exist: the *plain* JSON
//! form used inside item payloads (decoded under schema direction), and the
//! *tagged* `{"t": ..., "v": ...}` form used where no schema is in scope,
//! e.g. inside delta changes.

use std::cmp::Ordering;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use itertools::Itertools as _;
use serde_json::json;

use crate::richtext::RichText;

/// The wire/storage types a schema field may take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Set,
    Map,
    RichText,
}

/// A single field value.
#[derive(Clone, Debug)]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    /// Millisecond precision; sub-millisecond parts are dropped on
    /// normalization so wire round-trips are lossless.
    Date(DateTime<Utc>),
    /// Kept sorted and deduplicated by [`Value::canonical_cmp`].
    Set(Vec<Value>),
    Map(IndexMap<String, Value>),
    RichText(RichText),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::String(_) => FieldType::String,
            Self::Number(_) => FieldType::Number,
            Self::Boolean(_) => FieldType::Boolean,
            Self::Date(_) => FieldType::Date,
            Self::Set(_) => FieldType::Set,
            Self::Map(_) => FieldType::Map,
            Self::RichText(_) => FieldType::RichText,
        }
    }

    /// Short type tag mixed into checksums and the tagged encoding.
    pub fn type_tag(&self) -> &'static str {
        match self.field_type() {
            FieldType::String => "str",
            FieldType::Number => "num",
            FieldType::Boolean => "bool",
            FieldType::Date => "date",
            FieldType::Set => "set",
            FieldType::Map => "map",
            FieldType::RichText => "rt",
        }
    }

    /// Total order over all values: by type rank first, then by content.
    /// Numbers order by `total_cmp`, dates by millisecond timestamp,
    /// collections lexicographically.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        fn rank(value: &Value) -> u8 {
            match value {
                Value::String(_) => 0,
                Value::Number(_) => 1,
                Value::Boolean(_) => 2,
                Value::Date(_) => 3,
                Value::Set(_) => 4,
                Value::Map(_) => 5,
                Value::RichText(_) => 6,
            }
        }
        match (self, other) {
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.timestamp_millis().cmp(&b.timestamp_millis()),
            (Self::Set(a), Self::Set(b)) => {
                let by_elem = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| x.canonical_cmp(y))
                    .find(|ord| ord.is_ne());
                by_elem.unwrap_or_else(|| a.len().cmp(&b.len()))
            }
            (Self::Map(a), Self::Map(b)) => {
                let a_keys: Vec<&String> = a.keys().sorted().collect();
                let b_keys: Vec<&String> = b.keys().sorted().collect();
                let by_entry = a_keys
                    .iter()
                    .zip(&b_keys)
                    .map(|(ka, kb)| {
                        ka.cmp(kb)
                            .then_with(|| a[ka.as_str()].canonical_cmp(&b[kb.as_str()]))
                    })
                    .find(|ord| ord.is_ne());
                by_entry.unwrap_or_else(|| a_keys.len().cmp(&b_keys.len()))
            }
            (Self::RichText(a), Self::RichText(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    /// Plain JSON encoding. Dates become millisecond epochs, sets arrays in
    /// canonical order, rich text its `{"p": [...]}` object.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(s) => json!(s),
            Self::Number(n) => {
                // Integral values encode as JSON integers so payloads stay
                // stable across languages that distinguish int from float.
                if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
                    json!(*n as i64)
                } else {
                    json!(n)
                }
            }
            Self::Boolean(b) => json!(b),
            Self::Date(d) => json!(d.timestamp_millis()),
            Self::Set(values) => {
                serde_json::Value::Array(values.iter().map(Self::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::RichText(rt) => serde_json::to_value(rt).unwrap(),
        }
    }

    /// Decodes plain JSON as a value of `field_type`, coercing where a
    /// loss-free reading exists. Returns `None` when no coercion applies.
    pub fn from_json(field_type: FieldType, json: &serde_json::Value) -> Option<Self> {
        use serde_json::Value as Json;
        match (field_type, json) {
            (FieldType::String, Json::String(s)) => Some(Self::String(s.clone())),
            (FieldType::Number, Json::Number(n)) => n.as_f64().map(Self::Number),
            (FieldType::Number, Json::String(s)) => s.parse().ok().map(Self::Number),
            (FieldType::Boolean, Json::Bool(b)) => Some(Self::Boolean(*b)),
            (FieldType::Date, Json::Number(n)) => {
                let millis = n.as_i64()?;
                DateTime::from_timestamp_millis(millis).map(Self::Date)
            }
            (FieldType::Date, Json::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| Self::Date(d.with_timezone(&Utc))),
            (FieldType::Set, Json::Array(elems)) => {
                let values = elems.iter().map(Self::from_tagged_or_plain).collect::<Option<Vec<_>>>()?;
                let mut set = Self::Set(values);
                set.normalize();
                Some(set)
            }
            (FieldType::Map, Json::Object(entries)) => {
                let values = entries
                    .iter()
                    .map(|(k, v)| Some((k.clone(), Self::from_tagged_or_plain(v)?)))
                    .collect::<Option<IndexMap<_, _>>>()?;
                let mut map = Self::Map(values);
                map.normalize();
                Some(map)
            }
            (FieldType::RichText, json) => serde_json::from_value(json.clone())
                .ok()
                .map(Self::RichText),
            _ => None,
        }
    }

    /// Self-describing `{"t": tag, "v": payload}` encoding for contexts with
    /// no schema in scope.
    pub fn to_tagged_json(&self) -> serde_json::Value {
        let v = match self {
            Self::Set(values) => {
                serde_json::Value::Array(values.iter().map(Self::to_tagged_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_tagged_json()))
                    .collect(),
            ),
            other => other.to_json(),
        };
        json!({ "t": self.type_tag(), "v": v })
    }

    pub fn from_tagged_json(json: &serde_json::Value) -> Option<Self> {
        let tag = json.get("t")?.as_str()?;
        let v = json.get("v")?;
        let field_type = match tag {
            "str" => FieldType::String,
            "num" => FieldType::Number,
            "bool" => FieldType::Boolean,
            "date" => FieldType::Date,
            "set" => FieldType::Set,
            "map" => FieldType::Map,
            "rt" => FieldType::RichText,
            _ => return None,
        };
        Self::from_json(field_type, v)
    }

    /// Element values inside sets and maps are untyped on the wire, so they
    /// carry the tagged form; bare scalars are also accepted for robustness.
    fn from_tagged_or_plain(json: &serde_json::Value) -> Option<Self> {
        use serde_json::Value as Json;
        if json.get("t").is_some() {
            return Self::from_tagged_json(json);
        }
        match json {
            Json::String(s) => Some(Self::String(s.clone())),
            Json::Number(n) => n.as_f64().map(Self::Number),
            Json::Bool(b) => Some(Self::Boolean(*b)),
            _ => None,
        }
    }

    /// Canonicalizes collection contents in place: sets sort and dedupe,
    /// maps sort by key, dates truncate to millisecond precision.
    pub fn normalize(&mut self) {
        match self {
            Self::Date(d) => {
                *d = DateTime::from_timestamp_millis(d.timestamp_millis()).unwrap();
            }
            Self::Set(values) => {
                for value in values.iter_mut() {
                    value.normalize();
                }
                values.sort_by(|a, b| a.canonical_cmp(b));
                values.dedup_by(|a, b| a.canonical_cmp(b).is_eq());
            }
            Self::Map(entries) => {
                for value in entries.values_mut() {
                    value.normalize();
                }
                entries.sort_keys();
            }
            _ => {}
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_cmp(other).is_eq()
    }
}

impl Eq for Value {}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<RichText> for Value {
    fn from(rt: RichText) -> Self {
        Self::RichText(rt)
    }
}
