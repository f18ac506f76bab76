//! Postgres adapter for the store traits, shaped after a Directus-style schema:
//! one table per collection, `directus_files` and `directus_folders`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::db::{quote_ident, Db};
use super::store::{
    value_as_id, FileStore, Filter, FolderStore, Item, ItemStore, Query, StoreError, UploadMeta,
};

const UNDEFINED_TABLE: &str = "42P01";
const UNDEFINED_COLUMN: &str = "42703";

fn map_sqlx(collection: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::NotConnected(err.to_string())
        }
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some(UNDEFINED_TABLE) => StoreError::CollectionNotFound(collection.to_string()),
            Some(UNDEFINED_COLUMN) => StoreError::FieldNotFound {
                collection: collection.to_string(),
                field: db_err.message().to_string(),
            },
            _ => StoreError::Other(err.into()),
        },
        _ => StoreError::Other(err.into()),
    }
}

/// Records of one collection table.
pub struct PgItemStore {
    db: Db,
    collection: String,
    columns: RwLock<Option<HashSet<String>>>,
}

impl PgItemStore {
    pub fn new(db: Db, collection: impl Into<String>) -> Self {
        Self {
            db,
            collection: collection.into(),
            columns: RwLock::new(None),
        }
    }

    async fn load_columns(&self) -> Result<HashSet<String>, StoreError> {
        let cols = self
            .db
            .table_columns(&self.collection)
            .await
            .map_err(|e| map_sqlx(&self.collection, e))?;
        if cols.is_empty() {
            return Err(StoreError::CollectionNotFound(self.collection.clone()));
        }
        *self.columns.write().await = Some(cols.clone());
        Ok(cols)
    }

    /// Validate that every field exists, refreshing the cached column set once
    /// before giving up (the schema may have been provisioned since).
    async fn check_fields<'a, I>(&self, fields: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        let cached = self.columns.read().await.clone();
        let cols = match cached {
            Some(c) => c,
            None => self.load_columns().await?,
        };
        if fields.clone().into_iter().all(|f| cols.contains(f)) {
            return Ok(());
        }
        let fresh = self.load_columns().await?;
        match fields.into_iter().find(|f| !fresh.contains(*f)) {
            Some(field) => Err(StoreError::FieldNotFound {
                collection: self.collection.clone(),
                field: field.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn table(&self) -> String {
        quote_ident(&self.collection)
    }

    fn push_filter(&self, qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
        match filter {
            // primary key lookups stay on the index
            Filter::Eq(field, value) if field == "id" && value_as_id(value).is_some() => {
                qb.push("t.id = ");
                qb.push_bind(value_as_id(value).unwrap_or_default());
            }
            Filter::Eq(field, value) => {
                qb.push("(to_jsonb(t) -> ");
                qb.push_bind(field.clone());
                qb.push(") = ");
                qb.push_bind(Json(value.clone()));
                qb.push("::jsonb");
            }
            Filter::NotNull(field) => {
                qb.push(format!("t.{} IS NOT NULL", quote_ident(field)));
            }
            Filter::Null(field) => {
                qb.push(format!("t.{} IS NULL", quote_ident(field)));
            }
            Filter::Gt(field, value) => match value {
                Value::Number(n) => {
                    qb.push(format!("(t.{})::numeric > ", quote_ident(field)));
                    qb.push_bind(n.to_string());
                    qb.push("::numeric");
                }
                other => {
                    qb.push(format!("(t.{})::text > ", quote_ident(field)));
                    qb.push_bind(other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string()));
                }
            },
            Filter::And(parts) => {
                if parts.is_empty() {
                    qb.push("TRUE");
                    return;
                }
                qb.push("(");
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        qb.push(" AND ");
                    }
                    self.push_filter(qb, part);
                }
                qb.push(")");
            }
        }
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn collection_exists(&self) -> Result<bool, StoreError> {
        self.db
            .table_exists(&self.collection)
            .await
            .map_err(|e| map_sqlx(&self.collection, e))
    }

    async fn create_one(&self, fields: Item) -> Result<i64, StoreError> {
        self.check_fields(fields.keys().map(String::as_str)).await?;
        let table = self.table();
        let sql = if fields.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING id::bigint")
        } else {
            let cols = fields
                .keys()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{table}, $1) RETURNING id::bigint"
            )
        };
        let id: i64 = sqlx::query_scalar(&sql)
            .persistent(false)
            .bind(Json(Value::Object(fields)))
            .fetch_one(&self.db.pool)
            .await
            .map_err(|e| map_sqlx(&self.collection, e))?;
        debug!(collection = %self.collection, id, "created item");
        Ok(id)
    }

    async fn update_one(&self, id: i64, fields: Item) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.check_fields(fields.keys().map(String::as_str)).await?;
        let table = self.table();
        let assignments = fields
            .keys()
            .map(|k| {
                let col = quote_ident(k);
                format!("{col} = r.{col}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {table} AS t SET {assignments} FROM jsonb_populate_record(NULL::{table}, $1) AS r WHERE t.id = $2"
        );
        sqlx::query(&sql)
            .persistent(false)
            .bind(Json(Value::Object(fields)))
            .bind(id)
            .execute(&self.db.pool)
            .await
            .map_err(|e| map_sqlx(&self.collection, e))?;
        Ok(())
    }

    async fn read_by_query(&self, query: &Query) -> Result<Vec<Item>, StoreError> {
        let mut referenced: Vec<&str> = query.fields.iter().map(String::as_str).collect();
        if let Some(filter) = &query.filter {
            referenced.extend(filter.fields());
        }
        self.check_fields(referenced.iter().copied()).await?;

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT to_jsonb(t) AS row FROM {} AS t", self.table()));
        if let Some(filter) = &query.filter {
            qb.push(" WHERE ");
            self.push_filter(&mut qb, filter);
        }
        qb.push(" ORDER BY t.id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        let rows: Vec<Json<Value>> = qb
            .build_query_scalar::<Json<Value>>()
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await
            .map_err(|e| map_sqlx(&self.collection, e))?;
        Ok(rows
            .into_iter()
            .filter_map(|Json(v)| match v {
                Value::Object(map) => Some(query.project(map)),
                _ => None,
            })
            .collect())
    }
}

/// Local-disk file storage registered in `directus_files`.
pub struct PgFileStore {
    db: Db,
    root: PathBuf,
}

impl PgFileStore {
    pub fn new(db: Db, root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn extension_of(filename: &str) -> &str {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
}

fn title_of(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .replace(['-', '_'], " ")
}

#[async_trait]
impl FileStore for PgFileStore {
    async fn upload_one(&self, bytes: Bytes, meta: UploadMeta) -> Result<String, StoreError> {
        let id = Uuid::new_v4();
        let folder = match meta.folder.as_deref() {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|e| {
                StoreError::InvalidPayload(format!("folder id {raw} is not a uuid: {e}"))
            })?),
            None => None,
        };
        let filename_disk = format!("{id}.{}", extension_of(&meta.filename_download));
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Other(e.into()))?;
        let path = self.root.join(&filename_disk);
        let filesize = bytes.len() as i64;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StoreError::Other(e.into()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO directus_files
                (id, storage, filename_disk, filename_download, title, type, folder, filesize, uploaded_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            "#,
        )
        .persistent(false)
        .bind(id)
        .bind(&meta.storage)
        .bind(&filename_disk)
        .bind(&meta.filename_download)
        .bind(title_of(&meta.filename_download))
        .bind(&meta.mime_type)
        .bind(folder)
        .bind(filesize)
        .execute(&self.db.pool)
        .await;

        if let Err(err) = inserted {
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %rm, "failed to remove orphaned upload");
            }
            return Err(map_sqlx("directus_files", err));
        }
        Ok(id.to_string())
    }
}

/// Folder records in `directus_folders`.
pub struct PgFolderStore {
    db: Db,
}

impl PgFolderStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FolderStore for PgFolderStore {
    async fn find_root_folder(&self, name: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar(
            "SELECT id::text FROM directus_folders WHERE name = $1 AND parent IS NULL LIMIT 1",
        )
        .persistent(false)
        .bind(name)
        .fetch_optional(&self.db.pool)
        .await
        .map_err(|e| map_sqlx("directus_folders", e))
    }

    async fn create_folder(&self, name: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO directus_folders (id, name) VALUES ($1, $2)")
            .persistent(false)
            .bind(id)
            .bind(name)
            .execute(&self.db.pool)
            .await
            .map_err(|e| map_sqlx("directus_folders", e))?;
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_names_derive_extension_and_title() {
        assert_eq!(extension_of("codex-7-thumbnail.jpg"), "jpg");
        assert_eq!(extension_of("blob"), "bin");
        assert_eq!(title_of("codex-7-character.jpg"), "codex 7 character");
    }
}
