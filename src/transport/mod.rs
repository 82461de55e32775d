//! The database collaborator the compiler hands its documents to.
//!
//! Cursors never perform I/O themselves; every fetch, update, aggregation and insert
//! goes through a `Transport`. Timeouts, retries and connection handling belong to
//! the implementation.

mod aggregate;
mod apply;
pub(crate) mod eval;
pub mod memory;

use bson::Document;

use crate::errors::MapperError;
use crate::query::FindOptions;

pub use memory::{MemoryTransport, TransportMetrics, TransportMetricsSnapshot};

/// Pluggable query execution. Implementations must be Send + Sync so independent
/// cursors can share one transport.
pub trait Transport: Send + Sync {
    fn execute_query(
        &self,
        collection: &str,
        query: &Document,
        options: &FindOptions,
    ) -> Result<Vec<Document>, MapperError>;

    /// Returns the number of modified documents.
    fn execute_update(
        &self,
        collection: &str,
        query: &Document,
        update: &Document,
        multi: bool,
    ) -> Result<u64, MapperError>;

    fn execute_aggregate(&self, collection: &str, pipeline: &[Document]) -> Result<Vec<Document>, MapperError>;

    /// Persists `document` and returns it as stored (with its `_id`).
    fn execute_insert(&self, collection: &str, document: Document) -> Result<Document, MapperError>;

    fn execute_count(
        &self,
        collection: &str,
        query: &Document,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<u64, MapperError> {
        let options = FindOptions { skip, limit, ..FindOptions::default() };
        let docs = self.execute_query(collection, query, &options)?;
        Ok(docs.len() as u64)
    }
}
