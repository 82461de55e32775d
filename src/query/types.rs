use bson::Document;
use serde::{Deserialize, Serialize};

// Safety limits to prevent resource abuse
pub(crate) const MAX_PATH_DEPTH: usize = 32;
pub(crate) const MAX_IN_SET: usize = 1000;
pub(crate) const MAX_SORT_FIELDS: usize = 8;
pub(crate) const MAX_PROJECTION_FIELDS: usize = 64;

/// Separator between path segments and operator tokens in filter keys.
pub const DELIMITER: &str = "__";
/// Key whose document value is passed through verbatim.
pub const RAW_KEY: &str = "__raw__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Dotted storage path.
    pub field: String,
    pub order: Order,
}

impl SortSpec {
    /// Renders the sort list as a `{path: 1 | -1}` document.
    #[must_use]
    pub fn to_document(specs: &[Self]) -> Document {
        let mut d = Document::new();
        for s in specs {
            let dir = if s.order == Order::Asc { 1 } else { -1 };
            d.insert(s.field.clone(), dir);
        }
        d
    }
}

/// Parameters handed to the transport alongside the query document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Vec<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// Field selection for materialized documents. `Only` and `Exclude` never compose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    All,
    Only(Vec<String>),
    Exclude(Vec<String>),
}

impl Projection {
    #[must_use]
    pub fn to_document(&self) -> Option<Document> {
        let (fields, flag) = match self {
            Self::All => return None,
            Self::Only(f) => (f, 1),
            Self::Exclude(f) => (f, 0),
        };
        let mut d = Document::new();
        for f in fields {
            d.insert(f.clone(), flag);
        }
        Some(d)
    }

    #[must_use]
    pub fn includes(&self, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(f) => f.iter().any(|p| p == path || path.starts_with(&format!("{p}."))),
            Self::Exclude(f) => !f.iter().any(|p| p == path || path.starts_with(&format!("{p}."))),
        }
    }
}
