pub mod config;
pub mod errors;
pub mod logger;
pub mod query;
pub mod schema;
pub mod transport;

use std::sync::Arc;

use bson::{Bson, Document};

use crate::config::MapperConfig;
use crate::errors::MapperError;
use crate::query::path::storage_document;
use crate::query::{Cursor, Q};
use crate::schema::{SchemaDescriptor, SchemaRegistry};
use crate::transport::Transport;

pub use crate::query::{Modifier, Modifiers, UpdateSpec, compile_update};

/// Entry point tying a schema registry to a transport.
pub struct Database {
    registry: Arc<SchemaRegistry>,
    transport: Arc<dyn Transport>,
    config: MapperConfig,
}

impl Database {
    pub fn new(registry: SchemaRegistry, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(registry, transport, MapperConfig::default())
    }

    pub fn with_config(registry: SchemaRegistry, transport: Arc<dyn Transport>, config: MapperConfig) -> Self {
        Self { registry: Arc::new(registry), transport, config }
    }

    /// Builds the registry from `config.schema_path`.
    ///
    /// # Errors
    /// Returns `Config` when no schema path is configured, or the load error.
    pub fn from_config(config: MapperConfig, transport: Arc<dyn Transport>) -> Result<Self, MapperError> {
        let Some(path) = config.schema_path.as_deref() else {
            return Err(MapperError::Config("schema_path is not set".to_string()));
        };
        let registry = SchemaRegistry::load(path)?;
        Ok(Self::with_config(registry, transport, config))
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// # Errors
    /// Returns `Resolution` for unknown document types.
    pub fn schema(&self, doc_type: &str) -> Result<Arc<SchemaDescriptor>, MapperError> {
        self.registry.require(doc_type)
    }

    /// An unfiltered cursor over `doc_type`.
    ///
    /// # Errors
    /// See [`Database::query`].
    pub fn objects(&self, doc_type: &str) -> Result<Cursor, MapperError> {
        self.query(doc_type, Q::empty())
    }

    /// A cursor over `doc_type` filtered by `filter`. The filter is compiled here,
    /// so resolution and operator errors surface before any I/O.
    ///
    /// # Errors
    /// Unknown document types and filter compile errors.
    pub fn query(&self, doc_type: &str, filter: Q) -> Result<Cursor, MapperError> {
        let schema = self.schema(doc_type)?;
        let cursor = Cursor::new(Arc::clone(&self.registry), schema, Arc::clone(&self.transport), filter)?;
        Ok(cursor.with_batch_size(self.config.effective_batch_size()))
    }

    /// Inserts a document given by attribute paths and returns it as stored.
    ///
    /// # Errors
    /// Resolution errors and transport errors, e.g. `DuplicateKey`.
    pub fn create<'a, I>(&self, doc_type: &str, fields: I) -> Result<Document, MapperError>
    where
        I: IntoIterator<Item = (&'a str, Bson)>,
    {
        let schema = self.schema(doc_type)?;
        let document = storage_document(&self.registry, &schema, fields)?;
        let stored = self.transport.execute_insert(schema.collection_name()?, document)?;
        log::info!("created {doc_type}");
        Ok(stored)
    }
}
