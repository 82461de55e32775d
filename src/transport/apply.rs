//! Update-document application for the in-memory transport.

use bson::{Bson, Document};

use super::eval::{get_path, matches, values_equal};
use crate::errors::MapperError;
use crate::query::operators::as_f64;

fn fail(msg: impl Into<String>) -> MapperError {
    MapperError::Transport(msg.into())
}

/// Applies `update` to `doc`. `query` binds the positional `$` placeholder.
/// Returns whether the document changed.
pub(super) fn apply_update(doc: &mut Document, update: &Document, query: &Document) -> Result<bool, MapperError> {
    let mut changed = false;
    for (op, body) in update {
        let Bson::Document(fields) = body else {
            return Err(fail(format!("{op} expects a document")));
        };
        for (path, arg) in fields {
            let path = bind_positional(doc, path, query)?;
            let did = match op.as_str() {
                "$set" => set_path(doc, &path, arg.clone())?,
                "$unset" => unset_path(doc, &path),
                "$inc" => inc_path(doc, &path, arg)?,
                "$pop" => pop_path(doc, &path, arg)?,
                "$push" => push_path(doc, &path, arg, false)?,
                "$addToSet" => push_path(doc, &path, arg, true)?,
                "$pull" => pull_path(doc, &path, |item| pull_matches(item, arg))?,
                "$pullAll" => {
                    let Bson::Array(values) = arg else {
                        return Err(fail("$pullAll expects an array"));
                    };
                    pull_path(doc, &path, |item| Ok(values.iter().any(|v| values_equal(item, v))))?
                }
                // Only meaningful for upserts, which this transport does not perform.
                "$setOnInsert" => false,
                o if o.starts_with('$') => return Err(fail(format!("update operator {o} is not supported"))),
                _ => return Err(fail("replacement documents are not supported")),
            };
            changed |= did;
        }
    }
    Ok(changed)
}

/// Replaces the `$` segment with the index of the first array element the query matched.
fn bind_positional(doc: &Document, path: &str, query: &Document) -> Result<String, MapperError> {
    let parts: Vec<&str> = path.split('.').collect();
    let Some(pos) = parts.iter().position(|p| *p == "$") else {
        return Ok(path.to_string());
    };
    let prefix = parts[..pos].join(".");
    let Some(Bson::Array(items)) = get_path(doc, &prefix) else {
        return Err(fail(format!("positional operator needs an array at '{prefix}'")));
    };
    let relevant = conditions_under(query, &prefix);
    for (i, item) in items.iter().enumerate() {
        let mut probe = doc.clone();
        set_path(&mut probe, &prefix, Bson::Array(vec![item.clone()]))?;
        if !relevant.is_empty() && matches(&probe, &relevant)? {
            let mut bound: Vec<String> = parts.iter().map(|p| (*p).to_string()).collect();
            bound[pos] = i.to_string();
            return Ok(bound.join("."));
        }
    }
    Err(fail(format!("the positional operator did not find a match for '{path}' in the query")))
}

/// Top-level query conditions (and those inside `$and`) that reference `prefix`.
fn conditions_under(query: &Document, prefix: &str) -> Document {
    let mut out = Document::new();
    let mut and = Vec::new();
    for (k, v) in query {
        if k == prefix || k.starts_with(&format!("{prefix}.")) {
            out.insert(k.clone(), v.clone());
        } else if k == "$and"
            && let Bson::Array(clauses) = v
        {
            for c in clauses {
                if let Bson::Document(q) = c {
                    let sub = conditions_under(q, prefix);
                    if !sub.is_empty() {
                        and.push(Bson::Document(sub));
                    }
                }
            }
        }
    }
    if !and.is_empty() {
        out.insert("$and", and);
    }
    out
}

fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<bool, MapperError> {
    let parts: Vec<&str> = path.split('.').collect();
    set_in_doc(doc, &parts, value)
}

fn set_in_doc(doc: &mut Document, parts: &[&str], value: Bson) -> Result<bool, MapperError> {
    let Some((head, rest)) = parts.split_first() else {
        return Ok(false);
    };
    if rest.is_empty() {
        let old = doc.insert(*head, value.clone());
        return Ok(old.as_ref() != Some(&value));
    }
    let vacant = match doc.get(*head) {
        Some(Bson::Document(_) | Bson::Array(_)) => false,
        None | Some(Bson::Null) => true,
        Some(_) => return Err(fail(format!("cannot create field '{}' inside a scalar", rest[0]))),
    };
    if vacant {
        doc.insert(*head, Document::new());
    }
    match doc.get_mut(*head) {
        Some(slot) => set_in_value(slot, rest, value),
        None => Ok(false),
    }
}

fn set_in_value(slot: &mut Bson, parts: &[&str], value: Bson) -> Result<bool, MapperError> {
    match slot {
        Bson::Document(d) => set_in_doc(d, parts, value),
        Bson::Array(items) => {
            let idx: usize = parts[0]
                .parse()
                .map_err(|_| fail(format!("cannot use '{}' as an array index", parts[0])))?;
            while items.len() <= idx {
                items.push(Bson::Null);
            }
            if parts.len() == 1 {
                let changed = items[idx] != value;
                items[idx] = value;
                return Ok(changed);
            }
            if !matches!(items[idx], Bson::Document(_) | Bson::Array(_)) {
                items[idx] = Bson::Document(Document::new());
            }
            set_in_value(&mut items[idx], &parts[1..], value)
        }
        _ => Err(fail(format!("cannot create field '{}' inside a scalar", parts[0]))),
    }
}

fn unset_path(doc: &mut Document, path: &str) -> bool {
    match path.rsplit_once('.') {
        None => doc.remove(path).is_some(),
        Some((parent, last)) => match get_path_mut(doc, parent) {
            Some(Bson::Document(d)) => d.remove(last).is_some(),
            Some(Bson::Array(items)) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(slot) if *slot != Bson::Null => {
                    *slot = Bson::Null;
                    true
                }
                _ => false,
            },
            _ => false,
        },
    }
}

fn get_path_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Bson> {
    let mut parts = path.split('.');
    let mut cur = doc.get_mut(parts.next()?)?;
    for part in parts {
        cur = match cur {
            Bson::Document(d) => d.get_mut(part)?,
            Bson::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn inc_path(doc: &mut Document, path: &str, by: &Bson) -> Result<bool, MapperError> {
    let current = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
    let next = match (&current, by) {
        (Bson::Int32(a), Bson::Int32(b)) => a.checked_add(*b).map_or(Bson::Int64(i64::from(*a) + i64::from(*b)), Bson::Int32),
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let a = as_i64(&current);
            let b = as_i64(by);
            Bson::Int64(a.checked_add(b).ok_or_else(|| fail("$inc overflow"))?)
        }
        _ => match (as_f64(&current), as_f64(by)) {
            (Some(a), Some(b)) => Bson::Double(a + b),
            (None, _) => return Err(fail(format!("cannot apply $inc to non-numeric field '{path}'"))),
            (_, None) => return Err(fail("$inc expects a number")),
        },
    };
    set_path(doc, path, next)
}

fn as_i64(v: &Bson) -> i64 {
    match v {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        _ => 0,
    }
}

/// Clones the array at `path` (None when absent) for read-modify-write.
fn array_at(doc: &Document, path: &str, op: &str) -> Result<Option<Vec<Bson>>, MapperError> {
    match get_path(doc, path) {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::Array(items)) => Ok(Some(items.clone())),
        Some(_) => Err(fail(format!("{op} needs an array at '{path}'"))),
    }
}

fn pop_path(doc: &mut Document, path: &str, arg: &Bson) -> Result<bool, MapperError> {
    let Some(mut items) = array_at(doc, path, "$pop")? else {
        return Ok(false);
    };
    if items.is_empty() {
        return Ok(false);
    }
    if as_f64(arg).is_some_and(|n| n < 0.0) {
        items.remove(0);
    } else {
        items.pop();
    }
    set_path(doc, path, Bson::Array(items))
}

fn push_path(doc: &mut Document, path: &str, arg: &Bson, unique: bool) -> Result<bool, MapperError> {
    let op = if unique { "$addToSet" } else { "$push" };
    let values = match arg {
        Bson::Document(d) if d.contains_key("$each") => match d.get("$each") {
            Some(Bson::Array(each)) => each.clone(),
            _ => return Err(fail(format!("{op} $each expects an array"))),
        },
        v => vec![v.clone()],
    };
    let mut items = array_at(doc, path, op)?.unwrap_or_default();
    let before = items.len();
    for v in values {
        if unique && items.iter().any(|i| values_equal(i, &v)) {
            continue;
        }
        items.push(v);
    }
    if items.len() == before && get_path(doc, path).is_some() {
        return Ok(false);
    }
    set_path(doc, path, Bson::Array(items))
}

fn pull_path(
    doc: &mut Document,
    path: &str,
    mut remove: impl FnMut(&Bson) -> Result<bool, MapperError>,
) -> Result<bool, MapperError> {
    let Some(items) = array_at(doc, path, "$pull")? else {
        return Ok(false);
    };
    let before = items.len();
    let mut kept = Vec::with_capacity(before);
    for item in items {
        if !remove(&item)? {
            kept.push(item);
        }
    }
    if kept.len() == before {
        return Ok(false);
    }
    set_path(doc, path, Bson::Array(kept))
}

/// `$pull` conditions: operator documents test the element itself, other documents
/// are queries against document elements, anything else is equality.
fn pull_matches(item: &Bson, cond: &Bson) -> Result<bool, MapperError> {
    match cond {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => {
            let mut probe = Document::new();
            probe.insert("v", item.clone());
            let mut q = Document::new();
            q.insert("v", d.clone());
            matches(&probe, &q)
        }
        Bson::Document(q) => match item {
            Bson::Document(e) => matches(e, q),
            _ => Ok(false),
        },
        v => Ok(values_equal(item, v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn inc_keeps_integer_width() {
        let mut d = doc! { "n": 0 };
        assert!(apply_update(&mut d, &doc! { "$inc": { "n": 1 } }, &doc! {}).unwrap());
        assert_eq!(d.get("n"), Some(&Bson::Int32(1)));
        apply_update(&mut d, &doc! { "$inc": { "n": 0.5 } }, &doc! {}).unwrap();
        assert_eq!(d.get("n"), Some(&Bson::Double(1.5)));
    }

    #[test]
    fn positional_binds_first_matching_element() {
        let mut d = doc! { "comments": [ { "by": "ann", "votes": 0 }, { "by": "bob", "votes": 0 } ] };
        let q = doc! { "comments.by": "bob" };
        apply_update(&mut d, &doc! { "$inc": { "comments.$.votes": 1 } }, &q).unwrap();
        assert_eq!(get_path(&d, "comments.1.votes"), Some(&Bson::Int32(1)));
        assert_eq!(get_path(&d, "comments.0.votes"), Some(&Bson::Int32(0)));
    }

    #[test]
    fn pull_with_nested_document_condition() {
        let mut d = doc! { "comments": [ { "by": "ann" }, { "by": "bob" } ] };
        apply_update(&mut d, &doc! { "$pull": { "comments": { "by": "ann" } } }, &doc! {}).unwrap();
        assert_eq!(d, doc! { "comments": [ { "by": "bob" } ] });
    }

    #[test]
    fn add_to_set_skips_present_values() {
        let mut d = doc! { "tags": ["a"] };
        apply_update(&mut d, &doc! { "$addToSet": { "tags": { "$each": ["a", "b"] } } }, &doc! {}).unwrap();
        assert_eq!(d, doc! { "tags": ["a", "b"] });
    }
}
