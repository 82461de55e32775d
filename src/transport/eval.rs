//! Query-document evaluation for the in-memory transport.

use bson::{Bson, Document};
use std::cmp::Ordering;

use crate::errors::MapperError;
use crate::query::operators::as_f64;
use crate::query::{Order, SortSpec};

const GEO_OPERATORS: &[&str] = &[
    "$within",
    "$geoWithin",
    "$geoIntersects",
    "$near",
    "$nearSphere",
    "$maxDistance",
];

fn unsupported(what: &str) -> MapperError {
    MapperError::Transport(format!("{what} is not supported by the in-memory transport"))
}

/// Does `doc` satisfy the query document?
pub(super) fn matches(doc: &Document, query: &Document) -> Result<bool, MapperError> {
    for (key, cond) in query {
        let ok = match key.as_str() {
            "$and" => all_of(doc, key, cond)?.into_iter().all(|b| b),
            "$or" => all_of(doc, key, cond)?.into_iter().any(|b| b),
            "$nor" => !all_of(doc, key, cond)?.into_iter().any(|b| b),
            k if k.starts_with('$') => return Err(unsupported(k)),
            path => {
                let mut found = Vec::new();
                collect(doc, &path.split('.').collect::<Vec<_>>(), &mut found);
                field_matches(&found, cond)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_of(doc: &Document, op: &str, clauses: &Bson) -> Result<Vec<bool>, MapperError> {
    let Bson::Array(items) = clauses else {
        return Err(MapperError::Transport(format!("{op} expects an array")));
    };
    items
        .iter()
        .map(|c| match c {
            Bson::Document(q) => matches(doc, q),
            _ => Err(MapperError::Transport(format!("{op} clauses must be documents"))),
        })
        .collect()
}

/// Values reachable under `parts`, fanning out over arrays of documents.
pub(super) fn collect<'a>(doc: &'a Document, parts: &[&str], out: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = parts.split_first() else { return };
    if let Some(v) = doc.get(*head) {
        collect_value(v, rest, out);
    }
}

fn collect_value<'a>(value: &'a Bson, parts: &[&str], out: &mut Vec<&'a Bson>) {
    if parts.is_empty() {
        out.push(value);
        return;
    }
    match value {
        Bson::Document(d) => collect(d, parts, out),
        Bson::Array(items) => {
            if let Ok(idx) = parts[0].parse::<usize>() {
                if let Some(item) = items.get(idx) {
                    collect_value(item, &parts[1..], out);
                }
                return;
            }
            for item in items {
                if let Bson::Document(d) = item {
                    collect(d, parts, out);
                }
            }
        }
        _ => {}
    }
}

/// Plain dotted lookup through documents and numeric array indices.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut cur = doc.get(parts.next()?)?;
    for part in parts {
        cur = match cur {
            Bson::Document(d) => d.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn is_operator_doc(d: &Document) -> bool {
    d.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn field_matches(found: &[&Bson], cond: &Bson) -> Result<bool, MapperError> {
    match cond {
        Bson::Document(ops) if is_operator_doc(ops) => eval_ops(found, ops),
        value => Ok(equals_any(found, value)),
    }
}

/// Candidates for element-wise comparison: each value plus the members of array values.
fn expand<'a>(found: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut out = Vec::with_capacity(found.len());
    for v in found {
        out.push(*v);
        if let Bson::Array(items) = v {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(found: &[&Bson], value: &Bson) -> bool {
    if found.is_empty() {
        return matches!(value, Bson::Null);
    }
    expand(found).into_iter().any(|v| values_equal(v, value))
}

pub(super) fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn eval_ops(found: &[&Bson], ops: &Document) -> Result<bool, MapperError> {
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals_any(found, arg),
            "$ne" => !equals_any(found, arg),
            "$gt" => compare_any(found, arg, |o| o == Ordering::Greater),
            "$gte" => compare_any(found, arg, |o| o != Ordering::Less),
            "$lt" => compare_any(found, arg, |o| o == Ordering::Less),
            "$lte" => compare_any(found, arg, |o| o != Ordering::Greater),
            "$in" => array_arg(op, arg)?.iter().any(|v| equals_any(found, v)),
            "$nin" => !array_arg(op, arg)?.iter().any(|v| equals_any(found, v)),
            "$all" => {
                let wanted = array_arg(op, arg)?;
                !wanted.is_empty() && wanted.iter().all(|v| equals_any(found, v))
            }
            "$size" => {
                let n = as_f64(arg).ok_or_else(|| MapperError::Transport("$size expects a number".into()))?;
                found.iter().any(|v| matches!(v, Bson::Array(a) if a.len() as f64 == n))
            }
            "$exists" => !found.is_empty() == matches!(arg, Bson::Boolean(true)),
            "$mod" => modulo(found, arg)?,
            "$regex" => {
                let options = ops.get("$options").and_then(Bson::as_str).unwrap_or_default();
                regex_any(found, arg, options)?
            }
            "$options" => true,
            "$not" => match arg {
                Bson::Document(inner) => !eval_ops(found, inner)?,
                _ => return Err(MapperError::Transport("$not expects an operator document".into())),
            },
            "$elemMatch" => match arg {
                Bson::Document(inner) => elem_match(found, inner)?,
                _ => return Err(MapperError::Transport("$elemMatch expects a document".into())),
            },
            o if GEO_OPERATORS.contains(&o) => return Err(unsupported(&format!("geo operator {o}"))),
            o => return Err(unsupported(o)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn array_arg<'a>(op: &str, arg: &'a Bson) -> Result<&'a [Bson], MapperError> {
    match arg {
        Bson::Array(items) => Ok(items),
        _ => Err(MapperError::Transport(format!("{op} expects an array"))),
    }
}

fn compare_any(found: &[&Bson], arg: &Bson, pred: impl Fn(Ordering) -> bool) -> bool {
    expand(found)
        .into_iter()
        .any(|v| comparable(v, arg) && pred(compare_bson(v, arg)))
}

fn comparable(a: &Bson, b: &Bson) -> bool {
    (as_f64(a).is_some() && as_f64(b).is_some()) || type_rank(a) == type_rank(b)
}

#[allow(clippy::cast_possible_truncation)]
fn modulo(found: &[&Bson], arg: &Bson) -> Result<bool, MapperError> {
    let pair = array_arg("$mod", arg)?;
    let (Some(divisor), Some(remainder)) = (pair.first().and_then(as_f64), pair.get(1).and_then(as_f64)) else {
        return Err(MapperError::Transport("$mod expects [divisor, remainder]".into()));
    };
    let divisor = divisor as i64;
    if divisor == 0 {
        return Err(MapperError::Transport("$mod divisor must not be zero".into()));
    }
    Ok(expand(found)
        .into_iter()
        .filter_map(as_f64)
        .any(|v| (v as i64) % divisor == remainder as i64))
}

fn regex_any(found: &[&Bson], pattern: &Bson, options: &str) -> Result<bool, MapperError> {
    let Bson::String(pattern) = pattern else {
        return Err(MapperError::Transport("$regex expects a string".into()));
    };
    let re = regex::RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .build()
        .map_err(|e| MapperError::Transport(format!("invalid $regex: {e}")))?;
    Ok(expand(found).into_iter().any(|v| matches!(v, Bson::String(s) if re.is_match(s))))
}

fn elem_match(found: &[&Bson], inner: &Document) -> Result<bool, MapperError> {
    let scalar_form = is_operator_doc(inner) && !inner.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor"));
    for v in found {
        let Bson::Array(items) = v else { continue };
        for item in items {
            let hit = match item {
                _ if scalar_form => eval_ops(&[item], inner)?,
                Bson::Document(d) => matches(d, inner)?,
                _ => false,
            };
            if hit {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

pub(super) fn compare_docs(a: &Document, b: &Document, sort: &[SortSpec]) -> Ordering {
    for s in sort {
        let ord = match (get_path(a, &s.field), get_path(b, &s.field)) {
            (Some(x), Some(y)) => compare_bson(x, y),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return if s.order == Order::Asc { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

pub(super) fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.total_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Cross-type sort order; all numbers share one rank.
fn type_rank(v: &Bson) -> u8 {
    match v {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) => 13,
        Bson::MaxKey => 255,
    }
}

/// Applies a `{path: 1}` inclusion or `{path: 0}` exclusion projection.
pub(super) fn project(doc: &Document, projection: &Document) -> Document {
    let include = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .any(|(_, v)| as_f64(v).is_some_and(|n| n != 0.0));
    let keep_id = !projection.get("_id").and_then(as_f64).is_some_and(|n| n == 0.0);
    if include {
        let mut out = Document::new();
        if keep_id && let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
        for (path, _) in projection.iter().filter(|(k, _)| k.as_str() != "_id") {
            if let Some(v) = get_path(doc, path) {
                insert_path(&mut out, path, v.clone());
            }
        }
        return out;
    }
    let mut out = doc.clone();
    for (path, _) in projection {
        if path == "_id" && keep_id {
            continue;
        }
        remove_path(&mut out, path);
    }
    out
}

fn insert_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                insert_path(sub, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(sub)) = doc.get_mut(head) {
                remove_path(sub, rest);
            }
        }
    }
}
