//! Field path resolution.
//!
//! A filter key such as `posts__1__comments__by__ne` is split on `__` and walked
//! against the schema: field names (or their storage aliases) are matched greedily,
//! longest first, numeric segments index into list fields, and the trailing tokens
//! are bound as the operator. Resolution is purely a function of the schema; it
//! never touches stored data.

use std::sync::Arc;

use bson::{Bson, Document};

use super::operators::{self, NOT_TOKEN, Operator};
use super::types::{DELIMITER, MAX_PATH_DEPTH};
use crate::errors::MapperError;
use crate::schema::{FieldDescriptor, FieldKind, SchemaDescriptor, SchemaRegistry};

/// Marker for "the array element matched by the query" in update keys.
pub const POSITIONAL_MARKER: &str = "S";
/// Placeholder emitted on the wire for the positional marker.
pub const POSITIONAL_PLACEHOLDER: &str = "$";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field { name: String, db_field: String, list: bool },
    /// Free-form key below a dict or dynamic field.
    Key(String),
    Index(usize),
    Positional,
}

/// Where a key is being resolved; decides which trailing tokens are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathContext {
    Query,
    Update,
    /// Sort keys, projections and aggregate fields: no operator, no positional marker.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub segments: Vec<Segment>,
    pub operator: Option<Operator>,
    pub negated: bool,
    /// Descriptor of the last field matched, when the path ends on a schema field.
    pub field: Option<FieldDescriptor>,
}

impl FieldPath {
    /// Dotted storage path, e.g. `posts.1.comments.$.by`.
    #[must_use]
    pub fn db_key(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Field { db_field, .. } => db_field.clone(),
                Segment::Key(k) => k.clone(),
                Segment::Index(i) => i.to_string(),
                Segment::Positional => POSITIONAL_PLACEHOLDER.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Canonical filter-key form; resolving it again yields an equal path.
    #[must_use]
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Field { name, .. } => name.clone(),
                Segment::Key(k) => k.clone(),
                Segment::Index(i) => i.to_string(),
                Segment::Positional => POSITIONAL_MARKER.to_string(),
            })
            .collect();
        if self.negated {
            parts.push(NOT_TOKEN.to_string());
        }
        if let Some(op) = self.operator {
            parts.push(op.token().to_string());
        }
        parts.join(DELIMITER)
    }

    #[must_use]
    pub fn has_positional(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Positional))
    }

    /// Position of the first list field among the segments.
    #[must_use]
    pub fn first_list(&self) -> Option<usize> {
        self.segments.iter().position(|s| matches!(s, Segment::Field { list: true, .. }))
    }

    /// Storage path split into its parts.
    #[must_use]
    pub fn db_parts(&self) -> Vec<String> {
        self.db_key().split('.').map(str::to_string).collect()
    }
}

/// Resolves `key` against `schema`.
///
/// # Errors
/// `Resolution` for unknown or malformed segments, `UnsupportedOperator` for trailing
/// tokens that are not operators valid in `ctx`.
pub fn resolve(
    registry: &SchemaRegistry,
    schema: &SchemaDescriptor,
    key: &str,
    ctx: PathContext,
) -> Result<FieldPath, MapperError> {
    if key.is_empty() {
        return Err(MapperError::resolution(key, "empty key"));
    }
    let parts: Vec<&str> = key.split(DELIMITER).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(MapperError::resolution(key, "empty segment"));
    }
    if parts.len() > MAX_PATH_DEPTH {
        return Err(MapperError::resolution(key, format!("more than {MAX_PATH_DEPTH} segments")));
    }
    let walker = Walker { registry, key, ctx };
    let mut segments = Vec::with_capacity(parts.len());
    let tail = walker.walk(Level::Schema(schema), &parts, None, &mut segments)?;
    if segments.is_empty() {
        return Err(MapperError::resolution(key, "no field segment before the operator"));
    }
    if segments.iter().filter(|s| matches!(s, Segment::Positional)).count() > 1 {
        return Err(MapperError::resolution(key, "only one positional marker is supported"));
    }
    Ok(FieldPath { segments, operator: tail.operator, negated: tail.negated, field: tail.field })
}

struct Tail {
    operator: Option<Operator>,
    negated: bool,
    field: Option<FieldDescriptor>,
}

enum Level<'a> {
    Schema(&'a SchemaDescriptor),
    Nested(Arc<SchemaDescriptor>),
    /// Directly after a list field: an index, the positional marker, or element-level segments.
    List(FieldDescriptor),
    FreeForm,
    Scalar,
}

struct Walker<'a> {
    registry: &'a SchemaRegistry,
    key: &'a str,
    ctx: PathContext,
}

impl Walker<'_> {
    fn walk(
        &self,
        level: Level<'_>,
        rest: &[&str],
        field: Option<FieldDescriptor>,
        out: &mut Vec<Segment>,
    ) -> Result<Tail, MapperError> {
        let Some((&head, tail)) = rest.split_first() else {
            return Ok(Tail { operator: None, negated: false, field });
        };
        match level {
            Level::Schema(schema) => self.walk_schema(schema, rest, field, out),
            Level::Nested(schema) => self.walk_schema(&schema, rest, field, out),
            Level::List(fd) => {
                if let Some(idx) = as_index(head) {
                    out.push(Segment::Index(idx));
                    let element = self.element_level(&fd)?;
                    return self.walk(element, tail, Some(fd), out);
                }
                if is_positional(head) {
                    if self.ctx != PathContext::Update {
                        return Err(MapperError::resolution(self.key, "positional marker is only valid in updates"));
                    }
                    out.push(Segment::Positional);
                    let element = self.element_level(&fd)?;
                    return self.walk(element, tail, Some(fd), out);
                }
                // Unindexed element access matches across all elements.
                let element = self.element_level(&fd)?;
                self.walk(element, rest, Some(fd), out)
            }
            Level::FreeForm => {
                if let Some(t) = self.operator_suffix(rest) {
                    return t.map(|(operator, negated)| Tail { operator, negated, field });
                }
                if is_positional(head) && self.ctx != PathContext::Update {
                    return Err(MapperError::resolution(self.key, "positional marker is only valid in updates"));
                }
                out.push(if is_positional(head) { Segment::Positional } else { Segment::Key(head.to_string()) });
                self.walk(Level::FreeForm, tail, field, out)
            }
            Level::Scalar => {
                if as_index(head).is_some() || is_positional(head) {
                    let name = field.as_ref().map_or("?", |f| f.name.as_str());
                    return Err(MapperError::resolution(self.key, format!("cannot index non-list field '{name}'")));
                }
                match self.operator_suffix(rest) {
                    Some(t) => t.map(|(operator, negated)| Tail { operator, negated, field }),
                    None => Err(MapperError::UnsupportedOperator(rest.join(DELIMITER))),
                }
            }
        }
    }

    fn walk_schema(
        &self,
        schema: &SchemaDescriptor,
        rest: &[&str],
        field: Option<FieldDescriptor>,
        out: &mut Vec<Segment>,
    ) -> Result<Tail, MapperError> {
        let mark = out.len();
        let mut deeper_err = None;
        // Longest field name first; shorter matches only when the remainder fails.
        for take in (1..=rest.len()).rev() {
            let name = rest[..take].join(DELIMITER);
            let Some(fd) = lookup(schema, &name) else { continue };
            out.push(Segment::Field { name: fd.name.clone(), db_field: fd.db_name().to_string(), list: fd.is_list });
            let next = self.field_level(&fd)?;
            match self.walk(next, &rest[take..], Some(fd), out) {
                Ok(t) => return Ok(t),
                Err(e) => {
                    out.truncate(mark);
                    deeper_err.get_or_insert(e);
                }
            }
        }
        if mark > 0
            && let Some(t) = self.operator_suffix(rest)
        {
            return t.map(|(operator, negated)| Tail { operator, negated, field });
        }
        if let Some(e) = deeper_err {
            return Err(e);
        }
        if is_positional(rest[0]) || as_index(rest[0]).is_some() {
            let name = field.as_ref().map_or(schema.name.as_str(), |f| f.name.as_str());
            return Err(MapperError::resolution(self.key, format!("cannot index non-list field '{name}'")));
        }
        Err(MapperError::resolution(self.key, format!("unknown field '{}' on {}", rest[0], schema.name)))
    }

    /// `None` when `rest` does not start with an operator or `not` at all.
    fn operator_suffix(&self, rest: &[&str]) -> Option<Result<(Option<Operator>, bool), MapperError>> {
        if self.ctx == PathContext::Plain {
            return None;
        }
        let allowed = |op: Operator| self.ctx == PathContext::Query || op.allowed_in_update();
        match rest {
            [tok] if *tok == NOT_TOKEN => Some(Err(MapperError::UnsupportedOperator(
                "'not' must precede exactly one operator".to_string(),
            ))),
            [tok] => Operator::from_token(tok).map(|op| {
                if allowed(op) {
                    Ok((Some(op), false))
                } else {
                    Err(MapperError::UnsupportedOperator(format!("{tok} is not valid in an update")))
                }
            }),
            [not, tok] if *not == NOT_TOKEN => Some(match Operator::from_token(tok) {
                Some(op) if allowed(op) => Ok((Some(op), true)),
                _ => Err(MapperError::UnsupportedOperator(format!("not__{tok}"))),
            }),
            [first, ..] if *first == NOT_TOKEN || Operator::from_token(first).is_some() => {
                Some(Err(MapperError::UnsupportedOperator(rest.join(DELIMITER))))
            }
            _ => None,
        }
    }

    fn field_level(&self, fd: &FieldDescriptor) -> Result<Level<'static>, MapperError> {
        if fd.is_list {
            return Ok(Level::List(fd.clone()));
        }
        self.element_level(fd)
    }

    fn element_level(&self, fd: &FieldDescriptor) -> Result<Level<'static>, MapperError> {
        match fd.kind {
            FieldKind::Embedded => {
                let doc_type = fd.embedded.as_deref().unwrap_or_default();
                Ok(Level::Nested(self.registry.require(doc_type)?))
            }
            k if k.is_free_form() => Ok(Level::FreeForm),
            _ => Ok(Level::Scalar),
        }
    }
}

/// Builds a storage document from `attribute-path -> value` pairs, e.g. for inserts.
///
/// # Errors
/// Resolution errors, or `Resolution` when a key addresses a list element.
pub(crate) fn storage_document<'a, I>(
    registry: &SchemaRegistry,
    schema: &SchemaDescriptor,
    pairs: I,
) -> Result<Document, MapperError>
where
    I: IntoIterator<Item = (&'a str, Bson)>,
{
    let mut out = Document::new();
    for (key, value) in pairs {
        let path = resolve(registry, schema, key, PathContext::Plain)?;
        insert_at(&mut out, &path, value)?;
    }
    Ok(out)
}

/// Writes `value` at the storage location of `path`, creating sub-documents.
/// List fields only take a whole sequence.
pub(crate) fn insert_at(out: &mut Document, path: &FieldPath, value: Bson) -> Result<(), MapperError> {
    if path.segments.iter().any(|s| matches!(s, Segment::Index(_) | Segment::Positional)) {
        return Err(MapperError::resolution(&path.render(), "cannot build a document through a list index"));
    }
    if let Some(at) = path.first_list() {
        if at + 1 < path.segments.len() {
            return Err(MapperError::resolution(&path.render(), "cannot build a document through a list field"));
        }
        if !matches!(value, Bson::Array(_) | Bson::Null) {
            return Err(MapperError::resolution(&path.render(), format!("list field needs a sequence, got {value}")));
        }
    }
    let value = operators::prepare_scalar(path.field.as_ref(), value);
    let parts = path.db_parts();
    let Some((last, parents)) = parts.split_last() else {
        return Ok(());
    };
    let mut cur = out;
    for p in parents {
        if !matches!(cur.get(p), Some(Bson::Document(_))) {
            cur.insert(p.clone(), Document::new());
        }
        cur = match cur.get_mut(p) {
            Some(Bson::Document(d)) => d,
            _ => return Err(MapperError::resolution(&path.render(), "conflicting document shape")),
        };
    }
    cur.insert(last.clone(), value);
    Ok(())
}

fn lookup(schema: &SchemaDescriptor, name: &str) -> Option<FieldDescriptor> {
    if let Some(fd) = schema.lookup(name) {
        return Some(fd.clone());
    }
    if name == "pk" {
        return Some(match schema.primary_key() {
            Some(pk) => pk.clone(),
            None => FieldDescriptor::new("pk", FieldKind::ObjectId).primary_key(),
        });
    }
    None
}

fn as_index(seg: &str) -> Option<usize> {
    if seg.bytes().all(|b| b.is_ascii_digit()) { seg.parse().ok() } else { None }
}

fn is_positional(seg: &str) -> bool {
    seg == POSITIONAL_MARKER || seg == POSITIONAL_PLACEHOLDER
}
