//! In-process transport: collections held in memory behind a lock.
//!
//! Implements enough of the document-database query, update and aggregation
//! language to execute everything the compiler emits, except geo operators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bson::oid::ObjectId;
use bson::{Bson, Document};
use parking_lot::RwLock;

use super::Transport;
use super::aggregate::run_pipeline;
use super::apply::apply_update;
use super::eval::{compare_docs, get_path, matches, project, values_equal};
use crate::errors::MapperError;
use crate::query::FindOptions;
use crate::schema::ID_FIELD;

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    pub queries: AtomicU64,
    pub updates: AtomicU64,
    pub aggregates: AtomicU64,
    pub inserts: AtomicU64,
    pub counts: AtomicU64,
}

impl TransportMetrics {
    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        TransportMetricsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            aggregates: self.aggregates.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            counts: self.counts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportMetricsSnapshot {
    pub queries: u64,
    pub updates: u64,
    pub aggregates: u64,
    pub inserts: u64,
    pub counts: u64,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    unique: RwLock<HashMap<String, Vec<String>>>,
    metrics: TransportMetrics,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects inserts whose value at `path` already exists in `collection`.
    pub fn add_unique(&self, collection: &str, path: &str) {
        self.unique.write().entry(collection.to_string()).or_default().push(path.to_string());
    }

    /// Snapshot of a collection in insertion order.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections.read().get(collection).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn matching(&self, collection: &str, query: &Document) -> Result<Vec<Document>, MapperError> {
        let guard = self.collections.read();
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for d in docs {
            if matches(d, query)? {
                out.push(d.clone());
            }
        }
        Ok(out)
    }

    fn check_unique(&self, collection: &str, existing: &[Document], doc: &Document) -> Result<(), MapperError> {
        let unique = self.unique.read();
        let paths = std::iter::once(ID_FIELD).chain(
            unique.get(collection).into_iter().flatten().map(String::as_str),
        );
        for path in paths {
            let Some(value) = get_path(doc, path) else { continue };
            if existing.iter().any(|e| get_path(e, path).is_some_and(|v| values_equal(v, value))) {
                return Err(MapperError::DuplicateKey(format!("{collection}.{path} = {value}")));
            }
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn execute_query(
        &self,
        collection: &str,
        query: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, MapperError> {
        self.metrics.queries.fetch_add(1, Ordering::Relaxed);
        let mut docs = self.matching(collection, query)?;
        if !options.sort.is_empty() {
            docs.sort_by(|a, b| compare_docs(a, b, &options.sort));
        }
        let docs = docs.into_iter().skip(options.skip).take(options.limit.unwrap_or(usize::MAX));
        Ok(match &options.projection {
            Some(p) => docs.map(|d| project(&d, p)).collect(),
            None => docs.collect(),
        })
    }

    fn execute_update(
        &self,
        collection: &str,
        query: &Document,
        update: &Document,
        multi: bool,
    ) -> Result<u64, MapperError> {
        self.metrics.updates.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.collections.write();
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let mut modified = 0u64;
        for slot in docs.iter_mut() {
            if !matches(slot, query)? {
                continue;
            }
            let mut next = slot.clone();
            if apply_update(&mut next, update, query)? {
                *slot = next;
                modified += 1;
            }
            if !multi {
                break;
            }
        }
        log::info!("update on {collection}: {modified} modified");
        Ok(modified)
    }

    fn execute_aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>, MapperError> {
        self.metrics.aggregates.fetch_add(1, Ordering::Relaxed);
        run_pipeline(self.documents(collection), pipeline)
    }

    fn execute_insert(&self, collection: &str, mut document: Document) -> Result<Document, MapperError> {
        self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
        if !document.contains_key(ID_FIELD) {
            document.insert(ID_FIELD, Bson::ObjectId(ObjectId::new()));
        }
        let mut guard = self.collections.write();
        let docs = guard.entry(collection.to_string()).or_default();
        self.check_unique(collection, docs, &document)?;
        docs.push(document.clone());
        log::info!("inserted into {collection}: {}", document.get(ID_FIELD).map_or(String::new(), ToString::to_string));
        Ok(document)
    }

    fn execute_count(
        &self,
        collection: &str,
        query: &Document,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<u64, MapperError> {
        self.metrics.counts.fetch_add(1, Ordering::Relaxed);
        let guard = self.collections.read();
        let mut n = 0usize;
        for d in guard.get(collection).into_iter().flatten() {
            if matches(d, query)? {
                n += 1;
            }
        }
        let n = n.saturating_sub(skip).min(limit.unwrap_or(usize::MAX));
        Ok(n as u64)
    }
}
