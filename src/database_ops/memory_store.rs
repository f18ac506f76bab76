//! In-process implementation of the item, file and folder stores.
//!
//! Every mutating call is recorded so callers can assert on exactly what a job
//! wrote. Failure switches let a caller simulate schema gaps and outages.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use super::store::{
    value_as_id, FileStore, FolderStore, Item, ItemStore, Query, StoreError, UploadMeta,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: String,
    pub bytes: Bytes,
    pub meta: UploadMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteCall {
    Create(i64),
    Update(i64, Item),
}

#[derive(Default)]
struct State {
    collection_present: bool,
    // None = accept any field.
    schema: Option<HashSet<String>>,
    items: BTreeMap<i64, Item>,
    next_id: i64,
    writes: Vec<WriteCall>,
    files: Vec<StoredFile>,
    folders: Vec<(String, String)>,
    folder_creates: usize,
    fail_uploads: bool,
    disconnected: bool,
}

pub struct MemoryStore {
    collection: String,
    state: Mutex<State>,
}

impl MemoryStore {
    /// An existing, schemaless collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            state: Mutex::new(State {
                collection_present: true,
                next_id: 1,
                ..State::default()
            }),
        }
    }

    /// A store whose collection has not been provisioned.
    pub fn without_collection(collection: impl Into<String>) -> Self {
        let store = Self::new(collection);
        store.lock().collection_present = false;
        store
    }

    /// Restrict the collection to a fixed set of fields.
    pub fn with_fields<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().schema = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a panicking test thread; the data is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed a record directly, bypassing write accounting.
    pub fn insert(&self, id: i64, mut item: Item) {
        item.insert("id".into(), Value::from(id));
        let mut st = self.lock();
        st.next_id = st.next_id.max(id + 1);
        st.items.insert(id, item);
    }

    pub fn item(&self, id: i64) -> Option<Item> {
        self.lock().items.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.lock().writes.clone()
    }

    pub fn create_count(&self) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|w| matches!(w, WriteCall::Create(_)))
            .count()
    }

    pub fn update_count(&self) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|w| matches!(w, WriteCall::Update(..)))
            .count()
    }

    pub fn files(&self) -> Vec<StoredFile> {
        self.lock().files.clone()
    }

    pub fn folder_creates(&self) -> usize {
        self.lock().folder_creates
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.lock().disconnected = disconnected;
    }

    fn precheck<'a>(
        &self,
        st: &State,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), StoreError> {
        if st.disconnected {
            return Err(StoreError::NotConnected("memory store offline".into()));
        }
        if !st.collection_present {
            return Err(StoreError::CollectionNotFound(self.collection.clone()));
        }
        if let Some(schema) = &st.schema {
            if let Some(field) = fields.into_iter().find(|f| !schema.contains(*f)) {
                return Err(StoreError::FieldNotFound {
                    collection: self.collection.clone(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn collection_exists(&self) -> Result<bool, StoreError> {
        let st = self.lock();
        if st.disconnected {
            return Err(StoreError::NotConnected("memory store offline".into()));
        }
        Ok(st.collection_present)
    }

    async fn create_one(&self, mut fields: Item) -> Result<i64, StoreError> {
        let mut st = self.lock();
        self.precheck(&st, fields.keys().map(String::as_str))?;
        let id = match fields.get("id") {
            Some(v) => value_as_id(v)
                .ok_or_else(|| StoreError::InvalidPayload(format!("non-numeric id {v}")))?,
            None => st.next_id,
        };
        if st.items.contains_key(&id) {
            return Err(StoreError::InvalidPayload(format!("duplicate id {id}")));
        }
        fields.insert("id".into(), Value::from(id));
        st.next_id = st.next_id.max(id + 1);
        st.items.insert(id, fields);
        st.writes.push(WriteCall::Create(id));
        Ok(id)
    }

    async fn update_one(&self, id: i64, fields: Item) -> Result<(), StoreError> {
        let mut st = self.lock();
        self.precheck(&st, fields.keys().map(String::as_str))?;
        st.writes.push(WriteCall::Update(id, fields.clone()));
        if let Some(existing) = st.items.get_mut(&id) {
            existing.extend(fields);
        }
        Ok(())
    }

    async fn read_by_query(&self, query: &Query) -> Result<Vec<Item>, StoreError> {
        let st = self.lock();
        let mut referenced: Vec<&str> = query.fields.iter().map(String::as_str).collect();
        if let Some(filter) = &query.filter {
            referenced.extend(filter.fields());
        }
        self.precheck(&st, referenced)?;
        let matching = st
            .items
            .values()
            .filter(|item| query.filter.as_ref().map_or(true, |f| f.matches(item)))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|item| query.project(item.clone()))
            .collect();
        Ok(matching)
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn upload_one(&self, bytes: Bytes, meta: UploadMeta) -> Result<String, StoreError> {
        let mut st = self.lock();
        if st.disconnected {
            return Err(StoreError::NotConnected("memory store offline".into()));
        }
        if st.fail_uploads {
            return Err(StoreError::Other(anyhow::anyhow!(
                "upload rejected: {}",
                meta.filename_download
            )));
        }
        let id = Uuid::new_v4().to_string();
        st.files.push(StoredFile {
            id: id.clone(),
            bytes,
            meta,
        });
        Ok(id)
    }
}

#[async_trait]
impl FolderStore for MemoryStore {
    async fn find_root_folder(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .folders
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_folder(&self, name: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut st = self.lock();
        st.folders.push((id.clone(), name.to_string()));
        st.folder_creates += 1;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::store::Filter;
    use serde_json::json;

    fn item(v: Value) -> Item {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids_and_unknown_fields() {
        let store = MemoryStore::new("codex").with_fields(["id", "name"]);
        store.create_one(item(json!({"id": 3, "name": "a"}))).await.unwrap();
        let dup = store.create_one(item(json!({"id": 3, "name": "b"}))).await;
        assert!(matches!(dup, Err(StoreError::InvalidPayload(_))));
        let unknown = store.create_one(item(json!({"id": 4, "owner": "0x1"}))).await;
        assert!(matches!(unknown, Err(StoreError::FieldNotFound { ref field, .. }) if field == "owner"));
        assert_eq!(store.create_count(), 1);
    }

    #[tokio::test]
    async fn read_by_query_filters_limits_and_projects() {
        let store = MemoryStore::new("codex");
        for id in 1..=5 {
            let price = if id % 2 == 0 { json!("1 ETH") } else { Value::Null };
            store.insert(id, item(json!({"price": price, "bio": "x"})));
        }
        let rows = store
            .read_by_query(&Query::new().filter(Filter::not_null("price")).fields(["id"]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], item(json!({"id": 2})));
        let capped = store.read_by_query(&Query::new().limit(3)).await.unwrap();
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn missing_collection_is_reported() {
        let store = MemoryStore::without_collection("codex");
        assert!(!store.collection_exists().await.unwrap());
        let err = store.read_by_query(&Query::new()).await.unwrap_err();
        assert!(err.is_not_provisioned());
    }
}
