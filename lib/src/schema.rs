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

//! Named, versioned record shapes and the registry that resolves them.
//!
//! There is no hidden global registry: a [`Registry`] handle is passed to
//! the database and flows to every item constructor.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;

use indexmap::IndexMap;
use thiserror::Error;

use crate::value::FieldType;
use crate::value::Value;

/// Field storage of an item: name to value, insertion ordered.
pub type FieldMap = IndexMap<String, Value>;

/// Computes a field's initial value from the item's own data.
pub type DefaultFn = Arc<dyn Fn(&FieldMap) -> Value + Send + Sync>;
/// Validates the item's data; returning false fails normalization for
/// required fields and drops the field otherwise.
pub type ValidateFn = Arc<dyn Fn(&FieldMap) -> bool + Send + Sync>;
/// Rewrites `data` in place when upgrading from the given older schema.
pub type UpgradeFn = Arc<dyn Fn(&mut FieldMap, &Schema) + Send + Sync>;

/// Namespace of the builtin session schema.
pub const SESSION_NS: &str = "session";
/// Namespace of the builtin user schema.
pub const USER_NS: &str = "user";
/// Deletion marker implicitly present on every schema.
pub const DELETED_FIELD: &str = "isDeleted";

#[derive(Debug, Error)]
pub enum SchemaError {
    /// The (namespace, version) pair is not registered; the caller must
    /// register the missing schema before the item can be decoded.
    #[error("Unknown schema {marker}")]
    UnknownSchema { marker: String },
    /// An intermediate version on the upgrade path is missing.
    #[error("No upgrade path for {ns} from version {from} to {to}")]
    UpgradeImpossible { ns: String, from: u32, to: u32 },
}

/// Declares one field of a schema.
#[derive(Clone)]
pub struct FieldSpec {
    field_type: FieldType,
    required: bool,
    default: Option<DefaultFn>,
    validate: Option<ValidateFn>,
    local: bool,
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default: None,
            validate: None,
            local: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Fn(&FieldMap) -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(Arc::new(default));
        self
    }

    pub fn with_validate(
        mut self,
        validate: impl Fn(&FieldMap) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validate));
        self
    }

    /// Local-only fields never leave this peer: they are excluded from
    /// checksums and from diffs destined for other peers.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn default_value(&self, data: &FieldMap) -> Option<Value> {
        self.default.as_ref().map(|f| f(data))
    }

    pub fn validates(&self, data: &FieldMap) -> bool {
        self.validate.as_ref().is_none_or(|f| f(data))
    }
}

impl Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("field_type", &self.field_type)
            .field("required", &self.required)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

static DELETED_SPEC: LazyLock<FieldSpec> = LazyLock::new(|| {
    FieldSpec::new(FieldType::Boolean).with_default(|_| Value::Boolean(false))
});

static NULL_SCHEMA: LazyLock<Arc<Schema>> = LazyLock::new(|| {
    Arc::new(Schema {
        ns: None,
        version: 0,
        fields: IndexMap::new(),
        upgrade: None,
    })
});

/// A named, versioned record shape.
pub struct Schema {
    ns: Option<String>,
    version: u32,
    fields: IndexMap<String, FieldSpec>,
    upgrade: Option<UpgradeFn>,
}

impl Schema {
    /// Starts a schema for `ns` at `version`. Finish with [`Self::build`].
    pub fn new(ns: &str, version: u32) -> Self {
        Self {
            ns: Some(ns.to_owned()),
            version,
            fields: IndexMap::new(),
            upgrade: None,
        }
    }

    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.insert(name.to_owned(), spec);
        self
    }

    /// Installs the function that upgrades data from this schema's
    /// predecessor version.
    pub fn with_upgrade(
        mut self,
        upgrade: impl Fn(&mut FieldMap, &Self) + Send + Sync + 'static,
    ) -> Self {
        self.upgrade = Some(Arc::new(upgrade));
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The shared sentinel for unknown or unset items. Null items are
    /// neither persisted nor synced.
    pub fn null() -> Arc<Self> {
        NULL_SCHEMA.clone()
    }

    pub fn is_null(&self) -> bool {
        self.ns.is_none()
    }

    pub fn ns(&self) -> Option<&str> {
        self.ns.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Wire marker: `"null"` or `"<ns>/<version>"`.
    pub fn marker(&self) -> String {
        match &self.ns {
            None => "null".to_owned(),
            Some(ns) => format!("{ns}/{}", self.version),
        }
    }

    /// Looks up a declared field or the builtin deletion marker.
    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .get(name)
            .or_else(|| (name == DELETED_FIELD).then(|| &*DELETED_SPEC))
    }

    /// Declared field names followed by the builtins.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .chain([DELETED_FIELD])
    }

    pub fn upgrade_fn(&self) -> Option<&UpgradeFn> {
        self.upgrade.as_ref()
    }

    /// Two schemas are the same shape if namespace and version agree.
    pub fn same_as(&self, other: &Self) -> bool {
        self.ns == other.ns && self.version == other.version
    }
}

impl Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("marker", &self.marker())
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Process-wide, read-mostly store of registered schemas.
pub struct Registry {
    schemas: RwLock<HashMap<String, BTreeMap<u32, Arc<Schema>>>>,
}

impl Registry {
    /// An empty registry. Most callers want [`Self::with_builtins`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// A registry preloaded with the `/sys/*` schemas.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        registry.register(session_schema());
        registry.register(user_schema());
        registry
    }

    /// Registers `schema`, replacing any previous registration of the same
    /// namespace and version. The null schema is never registered.
    pub fn register(&self, schema: Arc<Schema>) {
        let Some(ns) = schema.ns() else {
            return;
        };
        self.schemas
            .write()
            .unwrap()
            .entry(ns.to_owned())
            .or_default()
            .insert(schema.version(), schema.clone());
    }

    pub fn get(&self, ns: &str, version: u32) -> Option<Arc<Schema>> {
        self.schemas.read().unwrap().get(ns)?.get(&version).cloned()
    }

    /// The highest registered version for `ns`.
    pub fn latest(&self, ns: &str) -> Option<Arc<Schema>> {
        let schemas = self.schemas.read().unwrap();
        let (_, schema) = schemas.get(ns)?.last_key_value()?;
        Some(schema.clone())
    }

    /// Resolves a wire marker (`"null"` or `"<ns>/<version>"`).
    pub fn resolve_marker(&self, marker: &str) -> Result<Arc<Schema>, SchemaError> {
        if marker == "null" {
            return Ok(Schema::null());
        }
        let unknown = || SchemaError::UnknownSchema {
            marker: marker.to_owned(),
        };
        let (ns, version) = marker.rsplit_once('/').ok_or_else(unknown)?;
        let version: u32 = version.parse().map_err(|_| unknown())?;
        self.get(ns, version).ok_or_else(unknown)
    }

    /// The intermediate schemas to walk when upgrading `ns` from
    /// `from_version` (exclusive) to `to_version` (inclusive). Fails with
    /// [`SchemaError::UpgradeImpossible`] when any step is missing.
    pub fn upgrade_path(
        &self,
        ns: &str,
        from_version: u32,
        to_version: u32,
    ) -> Result<Vec<Arc<Schema>>, SchemaError> {
        let mut path = vec![];
        for version in (from_version + 1)..=to_version {
            let schema = self.get(ns, version).ok_or(SchemaError::UpgradeImpossible {
                ns: ns.to_owned(),
                from: from_version,
                to: to_version,
            })?;
            path.push(schema);
        }
        Ok(path)
    }
}

fn session_schema() -> Arc<Schema> {
    Schema::new(SESSION_NS, 1)
        .field("id", FieldSpec::new(FieldType::String).required())
        .field("publicKey", FieldSpec::new(FieldType::String).required())
        .field("expiration", FieldSpec::new(FieldType::Date).required())
        .field("owner", FieldSpec::new(FieldType::String))
        .build()
}

fn user_schema() -> Arc<Schema> {
    Schema::new(USER_NS, 1)
        .field("email", FieldSpec::new(FieldType::String))
        .field("name", FieldSpec::new(FieldType::String))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_format() {
        assert_eq!(Schema::null().marker(), "null");
        let schema = Schema::new("todo", 2).build();
        assert_eq!(schema.marker(), "todo/2");
    }

    #[test]
    fn test_builtin_deleted_field() {
        let schema = Schema::new("todo", 1).build();
        let spec = schema.field_spec(DELETED_FIELD).unwrap();
        assert_eq!(spec.field_type(), FieldType::Boolean);
        assert_eq!(
            spec.default_value(&FieldMap::new()),
            Some(Value::Boolean(false))
        );
    }

    #[test]
    fn test_registry_resolution() {
        let registry = Registry::with_builtins();
        assert!(registry.get(SESSION_NS, 1).is_some());
        assert!(registry.resolve_marker("session/1").is_ok());
        assert!(registry.resolve_marker("null").unwrap().is_null());
        assert_matches::assert_matches!(
            registry.resolve_marker("nope/9"),
            Err(SchemaError::UnknownSchema { .. })
        );
    }

    #[test]
    fn test_upgrade_path_requires_every_step() {
        let registry = Registry::new();
        registry.register(Schema::new("todo", 1).build());
        registry.register(Schema::new("todo", 3).build());
        assert_matches::assert_matches!(
            registry.upgrade_path("todo", 1, 3),
            Err(SchemaError::UpgradeImpossible { from: 1, to: 3, .. })
        );
        registry.register(Schema::new("todo", 2).build());
        assert_eq!(registry.upgrade_path("todo", 1, 3).unwrap().len(), 2);
    }
}
