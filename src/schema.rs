//! Schema descriptors consumed by the query compiler.
//!
//! The modeling layer owns document definitions; this module only mirrors the
//! parts the compiler needs: attribute names, storage names, field kinds, list
//! flags and references to embedded document types. Descriptors are immutable
//! once registered and are shared as `Arc<SchemaDescriptor>`.

use crate::errors::MapperError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Storage name used for primary keys without an explicit `db_field`.
pub const ID_FIELD: &str = "_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    DateTime,
    ObjectId,
    Reference,
    Embedded,
    /// Free-form mapping; any sub-key below it resolves.
    Dict,
    /// Untyped value; any sub-key below it resolves.
    Dynamic,
    /// Legacy coordinate pair indexed as `2d`.
    GeoPoint,
    Point,
    LineString,
    Polygon,
}

impl FieldKind {
    #[must_use]
    pub fn is_geo(self) -> bool {
        matches!(self, Self::GeoPoint | Self::Point | Self::LineString | Self::Polygon)
    }

    #[must_use]
    pub fn is_free_form(self) -> bool {
        matches!(self, Self::Dict | Self::Dynamic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub db_field: Option<String>,
    pub kind: FieldKind,
    /// Document type of the embedded schema (for `Embedded` fields and lists of them).
    #[serde(default)]
    pub embedded: Option<String>,
    #[serde(default)]
    pub is_list: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            db_field: None,
            kind,
            embedded: None,
            is_list: false,
            primary_key: false,
        }
    }

    #[must_use]
    pub fn embedded(name: &str, doc_type: &str) -> Self {
        let mut f = Self::new(name, FieldKind::Embedded);
        f.embedded = Some(doc_type.to_string());
        f
    }

    #[must_use]
    pub fn with_db_field(mut self, db_field: &str) -> Self {
        self.db_field = Some(db_field.to_string());
        self
    }

    #[must_use]
    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Name of the field inside stored documents.
    #[must_use]
    pub fn db_name(&self) -> &str {
        match &self.db_field {
            Some(db) => db,
            None if self.primary_key => ID_FIELD,
            None => &self.name,
        }
    }

    #[must_use]
    pub fn matches(&self, segment: &str) -> bool {
        self.name == segment || self.db_field.as_deref() == Some(segment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    /// Collection backing this document type; `None` for embedded-only types.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl SchemaDescriptor {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), collection: Some(default_collection_name(name)), fields: Vec::new() }
    }

    #[must_use]
    pub fn embedded_type(name: &str) -> Self {
        Self { name: name.to_string(), collection: None, fields: Vec::new() }
    }

    #[must_use]
    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }

    /// Looks a field up by attribute name first, then by storage alias.
    #[must_use]
    pub fn lookup(&self, segment: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.name == segment)
            .or_else(|| self.fields.iter().find(|f| f.matches(segment)))
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Storage name of the primary key.
    #[must_use]
    pub fn pk_db_name(&self) -> &str {
        self.primary_key().map_or(ID_FIELD, FieldDescriptor::db_name)
    }

    /// # Errors
    /// Returns `CallerContract` when the type is embedded-only.
    pub fn collection_name(&self) -> Result<&str, MapperError> {
        self.collection.as_deref().ok_or_else(|| {
            MapperError::CallerContract(format!("{} is an embedded type without a collection", self.name))
        })
    }

    fn validate(&self) -> Result<(), MapperError> {
        let mut seen = std::collections::HashSet::new();
        for f in &self.fields {
            if f.name.is_empty() {
                return Err(MapperError::Config(format!("{}: empty field name", self.name)));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(MapperError::Config(format!("{}: duplicate field '{}'", self.name, f.name)));
            }
            if f.kind == FieldKind::Embedded && f.embedded.is_none() {
                return Err(MapperError::Config(format!(
                    "{}.{}: embedded field without a document type",
                    self.name, f.name
                )));
            }
        }
        if self.fields.iter().filter(|f| f.primary_key).count() > 1 {
            return Err(MapperError::Config(format!("{}: more than one primary key", self.name)));
        }
        Ok(())
    }
}

/// `BlogPost` -> `blog_post`
fn default_collection_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    schema: Vec<SchemaDescriptor>,
}

/// Lookup table of document types by name.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    types: HashMap<String, Arc<SchemaDescriptor>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a document type. Redefinition with a different shape is rejected.
    ///
    /// # Errors
    /// Returns `Config` when the descriptor is malformed or conflicts with an existing one.
    pub fn register(&mut self, schema: SchemaDescriptor) -> Result<Arc<SchemaDescriptor>, MapperError> {
        schema.validate()?;
        if let Some(existing) = self.types.get(&schema.name) {
            if **existing == schema {
                return Ok(Arc::clone(existing));
            }
            return Err(MapperError::Config(format!("document type '{}' already defined", schema.name)));
        }
        let arc = Arc::new(schema);
        self.types.insert(arc.name.clone(), Arc::clone(&arc));
        Ok(arc)
    }

    #[must_use]
    pub fn get(&self, doc_type: &str) -> Option<Arc<SchemaDescriptor>> {
        self.types.get(doc_type).cloned()
    }

    /// # Errors
    /// Returns `Resolution` when the document type is unknown.
    pub fn require(&self, doc_type: &str) -> Result<Arc<SchemaDescriptor>, MapperError> {
        self.get(doc_type)
            .ok_or_else(|| MapperError::resolution(doc_type, "unknown document type"))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.types.keys().cloned().collect();
        v.sort();
        v
    }

    /// Parses `[[schema]]` tables from TOML.
    ///
    /// # Errors
    /// Returns an error on malformed TOML or invalid descriptors.
    pub fn from_toml_str(s: &str) -> Result<Self, MapperError> {
        let file: SchemaFile = toml::from_str(s)?;
        Self::from_file(file)
    }

    /// Parses `{"schema": [...]}` from JSON.
    ///
    /// # Errors
    /// Returns an error on malformed JSON or invalid descriptors.
    pub fn from_json_str(s: &str) -> Result<Self, MapperError> {
        let file: SchemaFile = serde_json::from_str(s)?;
        Self::from_file(file)
    }

    fn from_file(file: SchemaFile) -> Result<Self, MapperError> {
        let mut reg = Self::new();
        for schema in file.schema {
            reg.register(schema)?;
        }
        Ok(reg)
    }

    /// Loads definitions from a `.json` file, or TOML for any other extension.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, MapperError> {
        let s = std::fs::read_to_string(path)?;
        log::debug!("loading schema definitions from {}", path.display());
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) {
            Self::from_json_str(&s)
        } else {
            Self::from_toml_str(&s)
        }
    }
}
