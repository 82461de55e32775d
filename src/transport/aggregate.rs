use bson::{Bson, Document};

use super::eval::{compare_docs, get_path, matches, values_equal};
use crate::errors::MapperError;
use crate::query::operators::as_f64;
use crate::query::{Order, SortSpec};

/// Runs a `$match`/`$sort`/`$skip`/`$limit`/`$group`/`$count` pipeline over `docs`.
pub(super) fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> Result<Vec<Document>, MapperError> {
    for stage in pipeline {
        let mut entries = stage.iter();
        let (Some((name, arg)), None) = (entries.next(), entries.next()) else {
            return Err(MapperError::Transport("a pipeline stage must have exactly one key".into()));
        };
        docs = match (name.as_str(), arg) {
            ("$match", Bson::Document(q)) => {
                let mut kept = Vec::with_capacity(docs.len());
                for d in docs {
                    if matches(&d, q)? {
                        kept.push(d);
                    }
                }
                kept
            }
            ("$sort", Bson::Document(spec)) => {
                let sort: Vec<SortSpec> = spec
                    .iter()
                    .map(|(field, dir)| SortSpec {
                        field: field.clone(),
                        order: if as_f64(dir).is_some_and(|n| n < 0.0) { Order::Desc } else { Order::Asc },
                    })
                    .collect();
                docs.sort_by(|a, b| compare_docs(a, b, &sort));
                docs
            }
            ("$skip", n) => docs.into_iter().skip(count_arg("$skip", n)?).collect(),
            ("$limit", n) => docs.into_iter().take(count_arg("$limit", n)?).collect(),
            ("$group", Bson::Document(spec)) => group(&docs, spec)?,
            ("$count", Bson::String(field)) => {
                let mut out = Document::new();
                out.insert(field.clone(), i64::try_from(docs.len()).unwrap_or(i64::MAX));
                vec![out]
            }
            (other, _) => return Err(MapperError::Transport(format!("unsupported pipeline stage {other}"))),
        };
    }
    Ok(docs)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count_arg(stage: &str, n: &Bson) -> Result<usize, MapperError> {
    match as_f64(n) {
        Some(v) if v >= 0.0 => Ok(v as usize),
        _ => Err(MapperError::Transport(format!("{stage} expects a non-negative number"))),
    }
}

/// `"$field"` reads a document path; anything else is a constant.
fn evaluate<'a>(doc: &'a Document, expr: &'a Bson) -> Option<&'a Bson> {
    match expr {
        Bson::String(s) if s.starts_with('$') => get_path(doc, &s[1..]),
        other => Some(other),
    }
}

struct Bucket {
    key: Bson,
    members: Vec<usize>,
}

fn group(docs: &[Document], spec: &Document) -> Result<Vec<Document>, MapperError> {
    let id_expr = spec.get("_id").cloned().unwrap_or(Bson::Null);
    let mut buckets: Vec<Bucket> = Vec::new();
    for (i, d) in docs.iter().enumerate() {
        let key = evaluate(d, &id_expr).cloned().unwrap_or(Bson::Null);
        match buckets.iter_mut().find(|b| values_equal(&b.key, &key)) {
            Some(b) => b.members.push(i),
            None => buckets.push(Bucket { key, members: vec![i] }),
        }
    }
    let mut out = Vec::with_capacity(buckets.len());
    for b in buckets {
        let mut row = Document::new();
        row.insert("_id", b.key);
        for (name, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            let Bson::Document(acc) = acc else {
                return Err(MapperError::Transport(format!("accumulator '{name}' must be a document")));
            };
            let value = match (acc.get("$sum"), acc.get("$avg")) {
                (Some(expr), None) => sum(b.members.iter().filter_map(|&i| evaluate(&docs[i], expr))),
                (None, Some(expr)) => avg(b.members.iter().filter_map(|&i| evaluate(&docs[i], expr))),
                _ => return Err(MapperError::Transport(format!("unsupported accumulator for '{name}'"))),
            };
            row.insert(name.clone(), value);
        }
        out.push(row);
    }
    Ok(out)
}

/// Non-numeric and missing values are ignored. Integer inputs keep an integer total.
fn sum<'a>(values: impl Iterator<Item = &'a Bson>) -> Bson {
    let mut int_total: Option<i64> = Some(0);
    let mut total = 0.0;
    for v in values {
        let Some(n) = as_f64(v) else { continue };
        total += n;
        int_total = match (int_total, v) {
            (Some(t), Bson::Int32(i)) => t.checked_add(i64::from(*i)),
            (Some(t), Bson::Int64(i)) => t.checked_add(*i),
            _ => None,
        };
    }
    match int_total {
        Some(t) => i32::try_from(t).map_or(Bson::Int64(t), Bson::Int32),
        None => Bson::Double(total),
    }
}

#[allow(clippy::cast_precision_loss)]
fn avg<'a>(values: impl Iterator<Item = &'a Bson>) -> Bson {
    let nums: Vec<f64> = values.filter_map(as_f64).collect();
    if nums.is_empty() {
        return Bson::Null;
    }
    Bson::Double(nums.iter().sum::<f64>() / nums.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn group_skips_missing_fields() {
        let docs = vec![doc! { "v": 2 }, doc! { "w": 1 }, doc! { "v": 4 }];
        let pipeline = [doc! { "$group": { "_id": Bson::Null, "total": { "$sum": "$v" } } }];
        let rows = run_pipeline(docs.clone(), &pipeline).unwrap();
        assert_eq!(rows, vec![doc! { "_id": Bson::Null, "total": 6 }]);
        let pipeline = [doc! { "$group": { "_id": Bson::Null, "avg": { "$avg": "$v" } } }];
        let rows = run_pipeline(docs, &pipeline).unwrap();
        assert_eq!(rows[0].get("avg"), Some(&Bson::Double(3.0)));
    }

    #[test]
    fn count_after_match() {
        let docs = vec![doc! { "a": 1 }, doc! { "a": 2 }];
        let pipeline = [doc! { "$match": { "a": { "$gt": 1 } } }, doc! { "$count": "n" }];
        assert_eq!(run_pipeline(docs, &pipeline).unwrap(), vec![doc! { "n": 1_i64 }]);
    }
}
