//! Lazy, cached result sets.
//!
//! A cursor compiles its filter up front and defers all transport calls until the
//! first document is asked for. Fetched documents are kept in arrival order, so
//! iterating again replays the cache instead of querying. Refining a cursor that has
//! already fetched documents is rejected; call [`Cursor::invalidate`] first or work
//! on a [`Cursor::fork`].

use std::collections::HashSet;
use std::sync::Arc;

use bson::{Bson, Document, doc};

use super::operators::as_f64;
use super::path::{PathContext, insert_at, resolve};
use super::predicate::Q;
use super::types::{FindOptions, MAX_PROJECTION_FIELDS, MAX_SORT_FIELDS, Order, Projection, SortSpec};
use super::update::compile_update;
use crate::errors::MapperError;
use crate::schema::{SchemaDescriptor, SchemaRegistry};
use crate::transport::Transport;
use crate::transport::eval::get_path;

/// Documents requested per transport call unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unexecuted,
    Streaming,
    Exhausted,
    Invalidated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOrCreateOptions {
    /// On a unique-key conflict during create, look the document up again instead of failing.
    pub retry_on_conflict: bool,
}

pub struct Cursor {
    registry: Arc<SchemaRegistry>,
    schema: Arc<SchemaDescriptor>,
    transport: Arc<dyn Transport>,
    collection: String,
    filter: Q,
    query: Document,
    projection: Projection,
    sort: Vec<SortSpec>,
    skip: usize,
    limit: Option<usize>,
    batch_size: Option<usize>,
    cache: Vec<Document>,
    state: CursorState,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("doc_type", &self.schema.name)
            .field("query", &self.query)
            .field("projection", &self.projection)
            .field("sort", &self.sort)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .field("cached", &self.cache.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    /// Compiles `filter` against `schema`; nothing is fetched yet.
    ///
    /// # Errors
    /// Any compile error of the filter, or `CallerContract` for embedded-only types.
    pub fn new(
        registry: Arc<SchemaRegistry>,
        schema: Arc<SchemaDescriptor>,
        transport: Arc<dyn Transport>,
        filter: Q,
    ) -> Result<Self, MapperError> {
        let collection = schema.collection_name()?.to_string();
        let query = filter.compile(&registry, &schema)?;
        Ok(Self {
            registry,
            schema,
            transport,
            collection,
            filter,
            query,
            projection: Projection::All,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            batch_size: Some(DEFAULT_BATCH_SIZE),
            cache: Vec::new(),
            state: CursorState::Unexecuted,
        })
    }

    /// `None` fetches the whole result in a single call.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size.filter(|n| *n > 0);
        self
    }

    #[must_use]
    pub fn state(&self) -> CursorState {
        self.state
    }

    #[must_use]
    pub fn compiled_query(&self) -> &Document {
        &self.query
    }

    #[must_use]
    pub fn doc_type(&self) -> &str {
        &self.schema.name
    }

    /// Number of documents fetched so far.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn find_options(&self) -> FindOptions {
        FindOptions {
            projection: self.projection.to_document(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
        }
    }

    fn ensure_refinable(&mut self, what: &str) -> Result<(), MapperError> {
        match self.state {
            CursorState::Unexecuted => Ok(()),
            CursorState::Invalidated => {
                self.state = CursorState::Unexecuted;
                Ok(())
            }
            CursorState::Streaming | CursorState::Exhausted => Err(MapperError::CallerContract(format!(
                "{what}() on a cursor that already fetched documents; invalidate() or fork() it first"
            ))),
        }
    }

    /// Drops the cache; the next access queries again.
    pub fn invalidate(&mut self) {
        self.cache.clear();
        self.state = CursorState::Invalidated;
    }

    /// An unexecuted copy with the same query; the cache is not shared.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            schema: Arc::clone(&self.schema),
            transport: Arc::clone(&self.transport),
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            query: self.query.clone(),
            projection: self.projection.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            batch_size: self.batch_size,
            cache: Vec::new(),
            state: CursorState::Unexecuted,
        }
    }

    /// AND-s `q` into the cursor's filter.
    ///
    /// # Errors
    /// Compile errors of the combined filter; `CallerContract` once documents are cached.
    pub fn filter(&mut self, q: Q) -> Result<&mut Self, MapperError> {
        self.ensure_refinable("filter")?;
        let combined = self.filter.clone().and(q);
        self.query = combined.compile(&self.registry, &self.schema)?;
        self.filter = combined;
        Ok(self)
    }

    /// Restricts materialized documents to `fields`, replacing any earlier `only`/`exclude`.
    ///
    /// # Errors
    /// Resolution errors; `CallerContract` once documents are cached.
    pub fn only(&mut self, fields: &[&str]) -> Result<&mut Self, MapperError> {
        self.ensure_refinable("only")?;
        self.projection = Projection::Only(self.projection_paths("only", fields)?);
        Ok(self)
    }

    /// Drops `fields` from materialized documents, replacing any earlier `only`/`exclude`.
    ///
    /// # Errors
    /// Resolution errors; `CallerContract` once documents are cached.
    pub fn exclude(&mut self, fields: &[&str]) -> Result<&mut Self, MapperError> {
        self.ensure_refinable("exclude")?;
        self.projection = Projection::Exclude(self.projection_paths("exclude", fields)?);
        Ok(self)
    }

    fn projection_paths(&self, what: &str, fields: &[&str]) -> Result<Vec<String>, MapperError> {
        if fields.len() > MAX_PROJECTION_FIELDS {
            return Err(MapperError::shape(what, format!("more than {MAX_PROJECTION_FIELDS} fields")));
        }
        fields
            .iter()
            .map(|f| resolve(&self.registry, &self.schema, f, PathContext::Plain).map(|p| p.db_key()))
            .collect()
    }

    /// Sort keys in priority order; a leading `-` sorts descending.
    ///
    /// # Errors
    /// Resolution errors; `CallerContract` once documents are cached.
    pub fn order_by(&mut self, keys: &[&str]) -> Result<&mut Self, MapperError> {
        self.ensure_refinable("order_by")?;
        if keys.len() > MAX_SORT_FIELDS {
            return Err(MapperError::shape("order_by", format!("more than {MAX_SORT_FIELDS} keys")));
        }
        let mut sort = Vec::with_capacity(keys.len());
        for key in keys {
            let (order, name) = match key.strip_prefix('-') {
                Some(rest) => (Order::Desc, rest),
                None => (Order::Asc, key.strip_prefix('+').unwrap_or(key)),
            };
            let path = resolve(&self.registry, &self.schema, name, PathContext::Plain)?;
            sort.push(SortSpec { field: path.db_key(), order });
        }
        self.sort = sort;
        Ok(self)
    }

    /// # Errors
    /// `CallerContract` once documents are cached.
    pub fn skip(&mut self, n: usize) -> Result<&mut Self, MapperError> {
        self.ensure_refinable("skip")?;
        self.skip = n;
        Ok(self)
    }

    /// # Errors
    /// `CallerContract` once documents are cached.
    pub fn limit(&mut self, n: usize) -> Result<&mut Self, MapperError> {
        self.ensure_refinable("limit")?;
        self.limit = Some(n);
        Ok(self)
    }

    /// Iterates the result, replaying cached documents before fetching more.
    pub fn iter(&mut self) -> CursorIter<'_> {
        CursorIter { cursor: self, pos: 0, failed: false }
    }

    /// Materializes the whole result.
    ///
    /// # Errors
    /// Transport errors.
    pub fn to_vec(&mut self) -> Result<Vec<Document>, MapperError> {
        self.iter().collect()
    }

    fn fetch_batch(&mut self) -> Result<(), MapperError> {
        let fetched = self.cache.len();
        let remaining = self.limit.map(|l| l.saturating_sub(fetched));
        if remaining == Some(0) {
            self.state = CursorState::Exhausted;
            return Ok(());
        }
        let want = match (self.batch_size, remaining) {
            (Some(b), Some(r)) => Some(b.min(r)),
            (Some(b), None) => Some(b),
            (None, r) => r,
        };
        let options = FindOptions { skip: self.skip + fetched, limit: want, ..self.find_options() };
        let batch = self.transport.execute_query(&self.collection, &self.query, &options)?;
        log::debug!(
            "fetched {} {} documents (skip {}, limit {:?})",
            batch.len(),
            self.schema.name,
            options.skip,
            want
        );
        let short = want.is_none_or(|w| batch.len() < w);
        self.cache.extend(batch);
        let at_limit = self.limit.is_some_and(|l| self.cache.len() >= l);
        self.state = if short || at_limit { CursorState::Exhausted } else { CursorState::Streaming };
        Ok(())
    }

    /// Runs a one-off query over the window `[start, start + n)` of this cursor's result.
    fn fetch_window(&self, start: usize, n: usize) -> Result<Vec<Document>, MapperError> {
        let n = match self.limit {
            Some(l) => n.min(l.saturating_sub(start)),
            None => n,
        };
        if n == 0 {
            return Ok(Vec::new());
        }
        let options = FindOptions { skip: self.skip + start, limit: Some(n), ..self.find_options() };
        log::debug!("window query on {} (skip {}, limit {n})", self.collection, options.skip);
        self.transport.execute_query(&self.collection, &self.query, &options)
    }

    fn nth(&self, i: usize) -> Result<Option<Document>, MapperError> {
        if let Some(d) = self.cache.get(i) {
            return Ok(Some(d.clone()));
        }
        if self.state == CursorState::Exhausted {
            return Ok(None);
        }
        Ok(self.fetch_window(i, 1)?.into_iter().next())
    }

    /// The document at position `i`. Served from the cache when it covers `i`.
    ///
    /// # Errors
    /// `IndexRange` when the result has no document at `i`.
    pub fn index(&mut self, i: usize) -> Result<Document, MapperError> {
        if let Some(d) = self.nth(i)? {
            return Ok(d);
        }
        let len = if self.state == CursorState::Exhausted { self.cache.len() } else { self.len()? };
        Err(MapperError::IndexRange { index: i, len })
    }

    /// Documents in positions `[start, end)`; out-of-range positions are dropped.
    ///
    /// # Errors
    /// Transport errors.
    pub fn slice(&mut self, start: usize, end: usize) -> Result<Vec<Document>, MapperError> {
        if end <= start {
            return Ok(Vec::new());
        }
        if self.cache.len() >= end || self.state == CursorState::Exhausted {
            let len = self.cache.len();
            return Ok(self.cache[start.min(len)..end.min(len)].to_vec());
        }
        self.fetch_window(start, end - start)
    }

    /// The first document, or `None` for an empty result.
    ///
    /// # Errors
    /// Transport errors.
    pub fn first(&mut self) -> Result<Option<Document>, MapperError> {
        self.nth(0)
    }

    /// The single document matching this cursor's filter AND `q`.
    ///
    /// # Errors
    /// `DoesNotExist` with no match, `MultipleObjectsReturned` with more than one.
    pub fn get(&mut self, q: Q) -> Result<Document, MapperError> {
        let query = self.filter.clone().and(q).compile(&self.registry, &self.schema)?;
        let options = FindOptions { limit: Some(2), ..self.find_options() };
        let mut docs = self.transport.execute_query(&self.collection, &query, &options)?;
        match docs.len() {
            0 => Err(MapperError::DoesNotExist { doc_type: self.schema.name.clone() }),
            1 => Ok(docs.remove(0)),
            n => Err(MapperError::MultipleObjectsReturned { doc_type: self.schema.name.clone(), count: n }),
        }
    }

    /// Looks the document up with [`Cursor::get`]; when it does not exist, creates it from
    /// the equality conditions of `q` overlaid with `defaults`. Returns `(document, created)`.
    ///
    /// List fields can only come from `defaults`, as whole sequences.
    ///
    /// # Errors
    /// Errors from `get`, `Resolution` when an equality condition addresses a list field,
    /// `DuplicateKey` when a concurrent create won and retry is off.
    pub fn get_or_create(
        &mut self,
        q: Q,
        defaults: &Document,
        options: GetOrCreateOptions,
    ) -> Result<(Document, bool), MapperError> {
        match self.get(q.clone()) {
            Ok(d) => return Ok((d, false)),
            Err(MapperError::DoesNotExist { .. }) => {}
            Err(e) => return Err(e),
        }
        let combined = self.filter.clone().and(q.clone());
        let mut fields = Document::new();
        for cond in combined.conjunctive_conditions() {
            let path = resolve(&self.registry, &self.schema, &cond.key, PathContext::Query)?;
            if path.operator.is_some() || path.negated {
                continue;
            }
            insert_at(&mut fields, &path, cond.value.clone())?;
        }
        for (key, value) in defaults {
            let path = resolve(&self.registry, &self.schema, key, PathContext::Plain)?;
            insert_at(&mut fields, &path, value.clone())?;
        }
        match self.transport.execute_insert(&self.collection, fields) {
            Ok(doc) => {
                log::info!("created {} in {}", self.schema.name, self.collection);
                Ok((doc, true))
            }
            Err(MapperError::DuplicateKey(key)) if options.retry_on_conflict => {
                log::warn!("get_or_create on {} lost a create race ({key}); reading again", self.schema.name);
                Ok((self.get(q)?, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Number of documents in the result, honoring skip and limit.
    ///
    /// # Errors
    /// Transport errors.
    pub fn count(&mut self) -> Result<u64, MapperError> {
        if self.state == CursorState::Exhausted {
            return Ok(self.cache.len() as u64);
        }
        self.transport.execute_count(&self.collection, &self.query, self.skip, self.limit)
    }

    /// # Errors
    /// Transport errors.
    pub fn len(&mut self) -> Result<usize, MapperError> {
        Ok(usize::try_from(self.count()?).unwrap_or(usize::MAX))
    }

    /// # Errors
    /// Transport errors.
    pub fn is_empty(&mut self) -> Result<bool, MapperError> {
        Ok(self.first()?.is_none())
    }

    /// Sum of `field` over documents that have it.
    ///
    /// # Errors
    /// Resolution and transport errors.
    pub fn sum(&mut self, field: &str) -> Result<f64, MapperError> {
        let path = self.aggregate_path(field)?;
        if let Some(values) = self.cached_numbers(&path) {
            return Ok(values.iter().sum());
        }
        self.aggregate(&path, "$sum")
    }

    /// Mean of `field` over documents that have it; `0.0` when none do.
    ///
    /// # Errors
    /// Resolution and transport errors.
    #[allow(clippy::cast_precision_loss)]
    pub fn average(&mut self, field: &str) -> Result<f64, MapperError> {
        let path = self.aggregate_path(field)?;
        if let Some(values) = self.cached_numbers(&path) {
            if values.is_empty() {
                return Ok(0.0);
            }
            return Ok(values.iter().sum::<f64>() / values.len() as f64);
        }
        self.aggregate(&path, "$avg")
    }

    fn aggregate_path(&self, field: &str) -> Result<String, MapperError> {
        Ok(resolve(&self.registry, &self.schema, field, PathContext::Plain)?.db_key())
    }

    /// Values from the cache when it holds the complete, unprojected-away result.
    fn cached_numbers(&self, path: &str) -> Option<Vec<f64>> {
        if self.state != CursorState::Exhausted || !self.projection.includes(path) {
            return None;
        }
        Some(self.cache.iter().filter_map(|d| get_path(d, path)).filter_map(as_f64).collect())
    }

    fn aggregate(&self, path: &str, accumulator: &str) -> Result<f64, MapperError> {
        let mut pipeline = vec![doc! { "$match": self.query.clone() }];
        if !self.sort.is_empty() {
            pipeline.push(doc! { "$sort": SortSpec::to_document(&self.sort) });
        }
        if self.skip > 0 {
            pipeline.push(doc! { "$skip": i64::try_from(self.skip).unwrap_or(i64::MAX) });
        }
        if let Some(l) = self.limit {
            pipeline.push(doc! { "$limit": i64::try_from(l).unwrap_or(i64::MAX) });
        }
        let mut acc = Document::new();
        acc.insert(accumulator, format!("${path}"));
        pipeline.push(doc! { "$group": { "_id": Bson::Null, "total": acc } });
        log::debug!("aggregating {accumulator} of {path} on {}", self.collection);
        let rows = self.transport.execute_aggregate(&self.collection, &pipeline)?;
        Ok(rows.first().and_then(|r| r.get("total")).and_then(as_f64).unwrap_or(0.0))
    }

    /// Distinct values of `field`, in first-seen order. Array values contribute their members.
    ///
    /// # Errors
    /// Resolution and transport errors.
    pub fn distinct(&mut self, field: &str) -> Result<Vec<Bson>, MapperError> {
        let path = self.aggregate_path(field)?;
        let fetched;
        let docs: &[Document] = if self.state == CursorState::Exhausted && self.projection.includes(&path) {
            &self.cache
        } else {
            let mut projection = Document::new();
            projection.insert(path.clone(), 1);
            let options = FindOptions { projection: Some(projection), ..self.find_options() };
            fetched = self.transport.execute_query(&self.collection, &self.query, &options)?;
            &fetched
        };
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for d in docs {
            let values = match get_path(d, &path) {
                Some(Bson::Array(items)) => items.clone(),
                Some(v) => vec![v.clone()],
                None => continue,
            };
            for v in values {
                if seen.insert(v.to_string()) {
                    out.push(v);
                }
            }
        }
        Ok(out)
    }

    /// Applies `modifiers` to every document matching this cursor's filter.
    /// Cached documents are not refreshed.
    ///
    /// # Errors
    /// Update compile errors and transport errors.
    pub fn update(&self, modifiers: &Document) -> Result<u64, MapperError> {
        self.run_update(modifiers, true)
    }

    /// Applies `modifiers` to the first matching document.
    ///
    /// # Errors
    /// Update compile errors and transport errors.
    pub fn update_one(&self, modifiers: &Document) -> Result<u64, MapperError> {
        self.run_update(modifiers, false)
    }

    fn run_update(&self, modifiers: &Document, multi: bool) -> Result<u64, MapperError> {
        let spec = compile_update(&self.registry, &self.schema, modifiers)?;
        let modified = self.transport.execute_update(&self.collection, &self.query, spec.as_document(), multi)?;
        log::debug!("update on {} modified {modified}", self.collection);
        Ok(modified)
    }
}

/// Borrowing iterator over a cursor; yields `Err` once if a fetch fails.
pub struct CursorIter<'a> {
    cursor: &'a mut Cursor,
    pos: usize,
    failed: bool,
}

impl Iterator for CursorIter<'_> {
    type Item = Result<Document, MapperError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.pos >= self.cursor.cache.len() {
            if self.cursor.state == CursorState::Exhausted {
                return None;
            }
            if let Err(e) = self.cursor.fetch_batch() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let d = self.cursor.cache.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(d))
    }
}
