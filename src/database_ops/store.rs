//! Item, file and folder store interfaces consumed by the sync pipeline.
//!
//! The pipeline only ever talks to these traits; `pg_store` adapts them to a
//! Postgres-backed CMS schema and `memory_store` keeps everything in process.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// A flat record as exchanged with the item store.
pub type Item = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection `{0}` does not exist")]
    CollectionNotFound(String),
    #[error("field `{field}` does not exist in collection `{collection}`")]
    FieldNotFound { collection: String, field: String },
    #[error("store not connected: {0}")]
    NotConnected(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Schema is not (yet) provisioned for what the caller tried to do.
    pub fn is_not_provisioned(&self) -> bool {
        matches!(
            self,
            StoreError::CollectionNotFound(_) | StoreError::FieldNotFound { .. }
        )
    }

    pub fn missing_field(&self) -> Option<&str> {
        match self {
            StoreError::FieldNotFound { field, .. } => Some(field.as_str()),
            _ => None,
        }
    }
}

/// Filter predicates understood by every store adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    NotNull(String),
    Null(String),
    Gt(String, Value),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Filter::NotNull(field.into())
    }

    pub fn null(field: impl Into<String>) -> Self {
        Filter::Null(field.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    /// Every field name referenced by this filter.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Filter::Eq(f, _) | Filter::NotNull(f) | Filter::Null(f) | Filter::Gt(f, _) => {
                vec![f.as_str()]
            }
            Filter::And(parts) => parts.iter().flat_map(|p| p.fields()).collect(),
        }
    }

    /// Render in the CMS REST filter grammar (`{"field":{"_eq":...}}`).
    pub fn to_rest_json(&self) -> Value {
        match self {
            Filter::Eq(f, v) => json!({ f: { "_eq": v } }),
            Filter::NotNull(f) => json!({ f: { "_nnull": true } }),
            Filter::Null(f) => json!({ f: { "_null": true } }),
            Filter::Gt(f, v) => json!({ f: { "_gt": v } }),
            Filter::And(parts) => {
                json!({ "_and": parts.iter().map(Filter::to_rest_json).collect::<Vec<_>>() })
            }
        }
    }

    /// Evaluate against an in-memory record. Absent fields count as null.
    pub fn matches(&self, item: &Item) -> bool {
        let get = |f: &str| item.get(f).filter(|v| !v.is_null());
        match self {
            Filter::Eq(f, v) => get(f).is_some_and(|cur| loosely_equal(cur, v)),
            Filter::NotNull(f) => get(f).is_some(),
            Filter::Null(f) => get(f).is_none(),
            Filter::Gt(f, v) => get(f).is_some_and(|cur| compare_gt(cur, v)),
            Filter::And(parts) => parts.iter().all(|p| p.matches(item)),
        }
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(x), Value::String(s)) | (Value::String(s), Value::Number(x)) => {
            s.trim().parse::<f64>().ok() == x.as_f64()
        }
        _ => a == b,
    }
}

fn compare_gt(cur: &Value, bound: &Value) -> bool {
    let as_num = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match (as_num(cur), as_num(bound)) {
        (Some(a), Some(b)) => a > b,
        _ => match (cur.as_str(), bound.as_str()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
    }
}

/// `readByQuery` arguments. `limit: None` means no cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub fields: Vec<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Keep only the requested fields of `item` (all fields when none were requested).
    pub fn project(&self, mut item: Item) -> Item {
        if !self.fields.is_empty() {
            item.retain(|k, _| self.fields.iter().any(|f| f == k));
        }
        item
    }
}

/// Records of one collection.
#[async_trait]
pub trait ItemStore: Send + Sync {
    fn collection(&self) -> &str;

    /// Whether the collection is present in the current schema.
    async fn collection_exists(&self) -> Result<bool, StoreError>;

    async fn create_one(&self, fields: Item) -> Result<i64, StoreError>;

    async fn update_one(&self, id: i64, fields: Item) -> Result<(), StoreError>;

    async fn read_by_query(&self, query: &Query) -> Result<Vec<Item>, StoreError>;

    /// Convenience lookup by primary key.
    async fn read_one(&self, id: i64, fields: &[&str]) -> Result<Option<Item>, StoreError> {
        let query = Query::new()
            .filter(Filter::eq("id", id))
            .fields(fields.iter().copied())
            .limit(1);
        Ok(self.read_by_query(&query).await?.into_iter().next())
    }
}

/// Metadata attached to an uploaded binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMeta {
    pub filename_download: String,
    pub mime_type: String,
    pub folder: Option<String>,
    pub storage: String,
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store `bytes` and return the issued file id.
    async fn upload_one(&self, bytes: Bytes, meta: UploadMeta) -> Result<String, StoreError>;
}

#[async_trait]
pub trait FolderStore: Send + Sync {
    /// Root-level folder (no parent) with exactly this name.
    async fn find_root_folder(&self, name: &str) -> Result<Option<String>, StoreError>;

    async fn create_folder(&self, name: &str) -> Result<String, StoreError>;
}

/// Extract a numeric record id from a JSON value (`5` or `"5"`).
pub fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
