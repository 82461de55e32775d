//! Predicate trees (`Q`) and their compilation into query documents.
//!
//! A flat leaf-set is what a single call with several filter pairs produces: an
//! implicit AND whose conditions are merged key by key into one document. `and`
//! keeps that flat shape while the operands touch disjoint fields and otherwise
//! builds an explicit `$and`; `or` always builds an explicit `$or`.

use std::collections::HashSet;

use bson::{Bson, Document, doc};

use super::operators::{self, NOT_TOKEN, Operator};
use super::path::{FieldPath, PathContext, resolve};
use super::types::{DELIMITER, RAW_KEY};
use crate::errors::MapperError;
use crate::logger::QUERY_TARGET;
use crate::schema::{SchemaDescriptor, SchemaRegistry};

/// One `key=value` filter pair, unresolved until compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: String,
    pub value: Bson,
}

impl Condition {
    /// The key without its trailing operator tokens.
    #[must_use]
    pub fn field_key(&self) -> String {
        let mut parts: Vec<&str> = self.key.split(DELIMITER).collect();
        if parts.len() > 1 && parts.last().is_some_and(|p| Operator::from_token(p).is_some()) {
            parts.pop();
        }
        if parts.len() > 1 && parts.last() == Some(&NOT_TOKEN) {
            parts.pop();
        }
        parts.join(DELIMITER)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Q {
    #[default]
    Empty,
    /// Implicitly AND-ed pairs merged into a single document.
    Leaves(Vec<Condition>),
    Raw(Document),
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
}

impl Q {
    #[must_use]
    pub fn empty() -> Self {
        Self::Empty
    }

    /// A single filter pair, e.g. `Q::new("age__lte", 18)`.
    pub fn new(key: &str, value: impl Into<Bson>) -> Self {
        Self::Empty.with(key, value)
    }

    /// Several filter pairs in one flat leaf-set.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Bson>,
    {
        pairs.into_iter().fold(Self::Empty, |q, (k, v)| q.with(k.as_ref(), v))
    }

    #[must_use]
    pub fn raw(document: Document) -> Self {
        Self::Raw(document)
    }

    /// Adds a pair to this leaf-set; a repeated key replaces the earlier value.
    #[must_use]
    pub fn with(self, key: &str, value: impl Into<Bson>) -> Self {
        let value = value.into();
        if key == RAW_KEY
            && let Bson::Document(d) = value
        {
            return self.and(Self::Raw(d));
        }
        let cond = Condition { key: key.to_string(), value };
        match self {
            Self::Empty => Self::Leaves(vec![cond]),
            Self::Leaves(mut conds) => {
                match conds.iter_mut().find(|c| c.key == cond.key) {
                    Some(existing) => existing.value = cond.value,
                    None => conds.push(cond),
                }
                Self::Leaves(conds)
            }
            other => other.and(Self::Leaves(vec![cond])),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Conjunction. Disjoint flat leaf-sets merge; everything else nests under an
    /// explicit AND that keeps operand order.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, q) | (q, Self::Empty) => q,
            (Self::Leaves(mut a), Self::Leaves(b)) if disjoint(&a, &b) => {
                a.extend(b);
                Self::Leaves(a)
            }
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), q) => {
                a.push(q);
                Self::And(a)
            }
            (q, Self::And(mut b)) => {
                b.insert(0, q);
                Self::And(b)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Disjunction; always an explicit OR node.
    ///
    /// # Errors
    /// `CallerContract` when either side is empty: an empty disjunct has no meaning.
    pub fn or(self, other: Self) -> Result<Self, MapperError> {
        if self.is_empty() || other.is_empty() {
            return Err(MapperError::CallerContract("or() requires two non-empty predicates".to_string()));
        }
        Ok(match (self, other) {
            (Self::Or(mut a), Self::Or(b)) => {
                a.extend(b);
                Self::Or(a)
            }
            (Self::Or(mut a), q) => {
                a.push(q);
                Self::Or(a)
            }
            (q, Self::Or(mut b)) => {
                b.insert(0, q);
                Self::Or(b)
            }
            (a, b) => Self::Or(vec![a, b]),
        })
    }

    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            q => Self::Not(Box::new(q)),
        }
    }

    /// Renders the tree as a query document.
    ///
    /// # Errors
    /// Resolution and operator errors from any leaf.
    pub fn compile(&self, registry: &SchemaRegistry, schema: &SchemaDescriptor) -> Result<Document, MapperError> {
        match self {
            Self::Empty => Ok(Document::new()),
            Self::Leaves(conds) => compile_leaf_set(registry, schema, conds),
            Self::Raw(d) => Ok(d.clone()),
            Self::And(children) => Ok(doc! { "$and": compile_all(registry, schema, children)? }),
            Self::Or(children) => Ok(doc! { "$or": compile_all(registry, schema, children)? }),
            Self::Not(inner) => Ok(doc! { "$nor": [inner.compile(registry, schema)?] }),
        }
    }

    /// Leaf conditions reachable through conjunctions only.
    #[must_use]
    pub fn conjunctive_conditions(&self) -> Vec<&Condition> {
        match self {
            Self::Leaves(conds) => conds.iter().collect(),
            Self::And(children) => children.iter().flat_map(Self::conjunctive_conditions).collect(),
            _ => Vec::new(),
        }
    }
}

fn disjoint(a: &[Condition], b: &[Condition]) -> bool {
    let keys: HashSet<String> = a.iter().map(Condition::field_key).collect();
    b.iter().all(|c| !keys.contains(&c.field_key()))
}

fn compile_all(
    registry: &SchemaRegistry,
    schema: &SchemaDescriptor,
    children: &[Q],
) -> Result<Vec<Bson>, MapperError> {
    children.iter().map(|c| c.compile(registry, schema).map(Bson::Document)).collect()
}

/// Resolves every pair and merges them into one document. Operator expressions on
/// the same key merge; anything that cannot merge is kept side by side under `$and`.
pub(crate) fn compile_leaf_set(
    registry: &SchemaRegistry,
    schema: &SchemaDescriptor,
    conds: &[Condition],
) -> Result<Document, MapperError> {
    let mut out = Document::new();
    let mut mergeable: HashSet<String> = HashSet::new();
    let mut clashes: Vec<(String, Vec<Bson>)> = Vec::new();
    for cond in conds {
        if cond.key == RAW_KEY {
            return Err(MapperError::shape(RAW_KEY, "expected a document"));
        }
        let path = resolve(registry, schema, &cond.key, PathContext::Query)?;
        let key = path.db_key();
        let expr = operators::expression(&path, cond.value.clone())?;
        let is_operator = is_operator_path(&path);
        if let Some((_, values)) = clashes.iter_mut().find(|(k, _)| *k == key) {
            values.push(expr);
            continue;
        }
        if !out.contains_key(&key) {
            out.insert(key.clone(), expr);
            if is_operator {
                mergeable.insert(key);
            }
            continue;
        }
        let can_merge = is_operator
            && mergeable.contains(&key)
            && matches!((out.get(&key), &expr), (Some(Bson::Document(cur)), Bson::Document(new))
                if !new.keys().any(|k| cur.contains_key(k)));
        if can_merge {
            if let (Some(Bson::Document(cur)), Bson::Document(new)) = (out.get_mut(&key), expr) {
                for (k, v) in new {
                    cur.insert(k, v);
                }
                if let Some(max) = cur.remove("$maxDistance") {
                    cur.insert("$maxDistance", max);
                }
            }
        } else if let Some(prev) = out.remove(&key) {
            mergeable.remove(&key);
            clashes.push((key, vec![prev, expr]));
        }
    }
    if !clashes.is_empty() {
        let mut and = Vec::new();
        for (key, values) in clashes {
            for v in values {
                let mut d = Document::new();
                d.insert(key.clone(), v);
                and.push(Bson::Document(d));
            }
        }
        out.insert("$and", and);
    }
    log::trace!(target: QUERY_TARGET, "compiled leaf-set for {}: {out}", schema.name);
    Ok(out)
}

fn is_operator_path(path: &FieldPath) -> bool {
    path.operator.is_some() || path.negated
}
