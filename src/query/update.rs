//! Update compiler: `{modifier: {key: value}}` mappings into wire-level update documents.

use std::collections::HashMap;

use bson::{Bson, Document, doc};

use super::operators::{self, is_number};
use super::path::{FieldPath, PathContext, resolve};
use super::types::RAW_KEY;
use crate::errors::MapperError;
use crate::schema::{SchemaDescriptor, SchemaRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Set,
    Unset,
    Inc,
    Dec,
    Pop,
    Push,
    Pull,
    PullAll,
    AddToSet,
    SetOnInsert,
}

impl Modifier {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "set" => Self::Set,
            "unset" => Self::Unset,
            "inc" => Self::Inc,
            "dec" => Self::Dec,
            "pop" => Self::Pop,
            "push" => Self::Push,
            "pull" => Self::Pull,
            "pull_all" => Self::PullAll,
            "add_to_set" => Self::AddToSet,
            "set_on_insert" => Self::SetOnInsert,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Unset => "unset",
            Self::Inc => "inc",
            Self::Dec => "dec",
            Self::Pop => "pop",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::PullAll => "pull_all",
            Self::AddToSet => "add_to_set",
            Self::SetOnInsert => "set_on_insert",
        }
    }

    /// `dec` shares the `$inc` group.
    #[must_use]
    pub fn wire(self) -> &'static str {
        match self {
            Self::Set => "$set",
            Self::Unset => "$unset",
            Self::Inc | Self::Dec => "$inc",
            Self::Pop => "$pop",
            Self::Push => "$push",
            Self::Pull => "$pull",
            Self::PullAll => "$pullAll",
            Self::AddToSet => "$addToSet",
            Self::SetOnInsert => "$setOnInsert",
        }
    }
}

/// A compiled update document, grouped by wire-level modifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    document: Document,
}

impl UpdateSpec {
    #[must_use]
    pub fn as_document(&self) -> &Document {
        &self.document
    }

    #[must_use]
    pub fn into_document(self) -> Document {
        self.document
    }

    /// The `{path: value}` group for a wire modifier such as `"$inc"`.
    #[must_use]
    pub fn group(&self, wire: &str) -> Option<&Document> {
        self.document.get_document(wire).ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }
}

/// Fluent construction of the `{modifier: {key: value}}` input mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modifiers(Document);

impl Modifiers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, modifier: Modifier, key: &str, value: impl Into<Bson>) -> Self {
        let value = value.into();
        match self.0.get_mut(modifier.name()) {
            Some(Bson::Document(group)) => {
                group.insert(key, value);
            }
            _ => {
                let mut group = Document::new();
                group.insert(key, value);
                self.0.insert(modifier.name(), group);
            }
        }
        self
    }

    #[must_use]
    pub fn set(self, key: &str, value: impl Into<Bson>) -> Self {
        self.with(Modifier::Set, key, value)
    }

    #[must_use]
    pub fn unset(self, key: &str) -> Self {
        self.with(Modifier::Unset, key, 1)
    }

    #[must_use]
    pub fn inc(self, key: &str, by: impl Into<Bson>) -> Self {
        self.with(Modifier::Inc, key, by)
    }

    #[must_use]
    pub fn dec(self, key: &str, by: impl Into<Bson>) -> Self {
        self.with(Modifier::Dec, key, by)
    }

    #[must_use]
    pub fn push(self, key: &str, value: impl Into<Bson>) -> Self {
        self.with(Modifier::Push, key, value)
    }

    #[must_use]
    pub fn pull(self, key: &str, value: impl Into<Bson>) -> Self {
        self.with(Modifier::Pull, key, value)
    }

    #[must_use]
    pub fn add_to_set(self, key: &str, values: impl Into<Bson>) -> Self {
        self.with(Modifier::AddToSet, key, values)
    }

    #[must_use]
    pub fn raw(mut self, document: Document) -> Self {
        self.0.insert(RAW_KEY, document);
        self
    }

    #[must_use]
    pub fn into_document(self) -> Document {
        self.0
    }
}

impl From<Modifiers> for Document {
    fn from(m: Modifiers) -> Self {
        m.0
    }
}

/// Compiles modifier mappings into an update document.
///
/// # Errors
/// `Resolution`/`UnsupportedOperator` for bad keys, `InvalidValueShape` for values a
/// modifier cannot take, `ConflictingModifier` when `inc` and `dec` share a field.
pub fn compile_update(
    registry: &SchemaRegistry,
    schema: &SchemaDescriptor,
    modifiers: &Document,
) -> Result<UpdateSpec, MapperError> {
    let mut out = Document::new();
    let mut counters: HashMap<String, Modifier> = HashMap::new();
    for (name, body) in modifiers {
        if name == RAW_KEY {
            let Bson::Document(raw) = body else {
                return Err(MapperError::shape(RAW_KEY, "expected a document"));
            };
            for (group, body) in raw {
                merge_raw_group(&mut out, group, body)?;
            }
            continue;
        }
        let modifier = Modifier::from_name(name).ok_or_else(|| MapperError::UnsupportedOperator(name.clone()))?;
        let Bson::Document(fields) = body else {
            return Err(MapperError::shape(name, "expected a mapping of field paths to values"));
        };
        for (key, value) in fields {
            let path = resolve(registry, schema, key, PathContext::Update)?;
            let value = modifier_value(modifier, &path, value.clone())?;
            let (entry_key, entry_value) = entry(modifier, &path, key, value)?;
            if modifier.wire() == "$inc"
                && let Some(prev) = counters.insert(entry_key.clone(), modifier)
            {
                log::debug!("{} and {} both target {entry_key}", prev.name(), modifier.name());
                return Err(MapperError::ConflictingModifier(entry_key));
            }
            insert_into_group(&mut out, modifier, entry_key, entry_value)?;
        }
    }
    if out.is_empty() {
        return Err(MapperError::CallerContract("an update needs at least one modifier".to_string()));
    }
    Ok(UpdateSpec { document: out })
}

fn modifier_value(modifier: Modifier, path: &FieldPath, value: Bson) -> Result<Bson, MapperError> {
    if path.operator.is_some() {
        return operators::expression(path, value);
    }
    let field = path.field.as_ref();
    match modifier {
        Modifier::Inc => {
            if !is_number(&value) {
                return Err(MapperError::shape("inc", format!("expected a number, got {value}")));
            }
            Ok(value)
        }
        Modifier::Dec => negate(value),
        Modifier::Pop => match value {
            Bson::Int32(n @ (1 | -1)) => Ok(Bson::Int32(n)),
            Bson::Int64(n @ (1 | -1)) => Ok(Bson::Int64(n)),
            other => Err(MapperError::shape("pop", format!("expected 1 or -1, got {other}"))),
        },
        Modifier::PullAll | Modifier::AddToSet => match value {
            Bson::Array(items) => {
                Ok(Bson::Array(items.into_iter().map(|v| operators::prepare_scalar(field, v)).collect()))
            }
            other => Err(MapperError::shape(modifier.name(), format!("expected a sequence, got {other}"))),
        },
        Modifier::Unset => Ok(value),
        Modifier::Set | Modifier::SetOnInsert | Modifier::Push | Modifier::Pull => {
            Ok(operators::prepare_scalar(field, value))
        }
    }
}

/// Positive amounts flip sign; zero and negative amounts are already decrements.
fn negate(value: Bson) -> Result<Bson, MapperError> {
    match value {
        Bson::Int32(n) if n <= 0 => Ok(Bson::Int32(n)),
        Bson::Int64(n) if n <= 0 => Ok(Bson::Int64(n)),
        Bson::Double(d) if d <= 0.0 => Ok(Bson::Double(d)),
        Bson::Int32(n) => n
            .checked_neg()
            .map(Bson::Int32)
            .ok_or_else(|| MapperError::shape("dec", "value out of range")),
        Bson::Int64(n) => n
            .checked_neg()
            .map(Bson::Int64)
            .ok_or_else(|| MapperError::shape("dec", "value out of range")),
        Bson::Double(d) => Ok(Bson::Double(-d)),
        other => Err(MapperError::shape("dec", format!("expected a number, got {other}"))),
    }
}

/// Storage key and value inside the modifier group. Pulls on nested paths use
/// nested documents since dotted keys do not apply to them.
fn entry(modifier: Modifier, path: &FieldPath, key: &str, value: Bson) -> Result<(String, Bson), MapperError> {
    match modifier {
        Modifier::Pull | Modifier::PullAll if path.segments.len() > 1 => {
            if modifier == Modifier::PullAll {
                return Err(MapperError::resolution(key, "pull_all only supports a single field depth"));
            }
            let parts = path.db_parts();
            let mut nested = value;
            for part in parts[1..].iter().rev() {
                let mut d = Document::new();
                d.insert(part.clone(), nested);
                nested = Bson::Document(d);
            }
            Ok((parts[0].clone(), nested))
        }
        Modifier::AddToSet => Ok((path.db_key(), Bson::Document(doc! { "$each": value }))),
        _ => Ok((path.db_key(), value)),
    }
}

/// Merges a raw `$group: {...}` entry field by field; a field already set in that
/// group is a conflict.
fn merge_raw_group(out: &mut Document, group: &str, body: &Bson) -> Result<(), MapperError> {
    match (out.get_mut(group), body) {
        (None, _) => {
            out.insert(group, body.clone());
        }
        (Some(Bson::Document(existing)), Bson::Document(more)) => {
            for (k, v) in more {
                if existing.contains_key(k) {
                    return Err(MapperError::ConflictingModifier(k.clone()));
                }
                existing.insert(k.clone(), v.clone());
            }
        }
        (Some(_), _) => return Err(MapperError::ConflictingModifier(group.to_string())),
    }
    Ok(())
}

fn insert_into_group(out: &mut Document, modifier: Modifier, key: String, value: Bson) -> Result<(), MapperError> {
    let wire = modifier.wire();
    if !out.contains_key(wire) {
        out.insert(wire, Document::new());
    }
    let Some(Bson::Document(group)) = out.get_mut(wire) else {
        return Err(MapperError::shape(wire, "raw update collides with a modifier group"));
    };
    match (group.get_mut(&key), value) {
        (None, v) => {
            group.insert(key, v);
        }
        (Some(Bson::Document(existing)), Bson::Document(more)) if !more.keys().any(|k| existing.contains_key(k)) => {
            for (k, v) in more {
                existing.insert(k, v);
            }
        }
        (Some(_), _) => return Err(MapperError::ConflictingModifier(key)),
    }
    Ok(())
}
