//! Moves embedded and content-addressed images out of item payloads and into
//! the file store, leaving file ids behind.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::database_ops::ipfs::{gateway_url, BinaryFetch};
use crate::database_ops::store::{FileStore, FolderStore, Item, UploadMeta};

/// Inline image fields and the filename suffix each is uploaded under.
pub const INLINE_FIELDS: [(&str, &str); 2] =
    [("thumbnail", "thumbnail"), ("thumbnail_background", "background")];
pub const CHARACTER_HASH_FIELD: &str = "ipfs_character";
pub const CHARACTER_FIELD: &str = "thumbnail_character";

#[derive(Debug, Clone)]
pub struct AssetConfig {
    pub ipfs_gateway: String,
    pub folder_name: String,
    /// Use this folder id as-is instead of looking one up by name.
    pub folder_id: Option<String>,
    pub storage: String,
    pub fetch_timeout: Duration,
    pub fetch_retries: u32,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            ipfs_gateway: "https://ipfs.io".into(),
            folder_name: "Codex Images".into(),
            folder_id: None,
            storage: "local".into(),
            fetch_timeout: Duration::from_secs(10),
            fetch_retries: 3,
        }
    }
}

/// What happened to the asset fields of one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssetReport {
    pub uploaded: usize,
    pub failed: usize,
}

pub struct AssetMigrator<'a> {
    files: &'a dyn FileStore,
    folders: &'a dyn FolderStore,
    fetch: &'a dyn BinaryFetch,
    cfg: AssetConfig,
    folder: OnceCell<Option<String>>,
}

impl<'a> AssetMigrator<'a> {
    pub fn new(
        files: &'a dyn FileStore,
        folders: &'a dyn FolderStore,
        fetch: &'a dyn BinaryFetch,
        cfg: AssetConfig,
    ) -> Self {
        Self {
            files,
            folders,
            fetch,
            cfg,
            folder: OnceCell::new(),
        }
    }

    /// Shared upload folder, resolved on first use and cached for the
    /// lifetime of the migrator. `None` uploads to the storage root.
    pub async fn folder(&self) -> Option<String> {
        self.folder
            .get_or_init(|| self.resolve_folder())
            .await
            .clone()
    }

    async fn resolve_folder(&self) -> Option<String> {
        if let Some(id) = self.cfg.folder_id.as_deref().filter(|s| !s.is_empty()) {
            return Some(id.to_string());
        }
        match self.folders.find_root_folder(&self.cfg.folder_name).await {
            Ok(Some(id)) => {
                debug!(target = "assets", folder = %id, "using existing asset folder");
                Some(id)
            }
            Ok(None) => match self.folders.create_folder(&self.cfg.folder_name).await {
                Ok(id) => {
                    info!(target = "assets", folder = %id, name = %self.cfg.folder_name, "created asset folder");
                    Some(id)
                }
                Err(err) => {
                    warn!(target = "assets", error = %err, "could not create asset folder; uploading to root");
                    None
                }
            },
            Err(err) => {
                warn!(target = "assets", error = %err, "asset folder lookup failed; uploading to root");
                None
            }
        }
    }

    /// Rewrite all asset fields of `item` in place. Never fails the item:
    /// an asset that cannot be migrated is left absent.
    pub async fn migrate(&self, id: i64, item: &mut Item) -> AssetReport {
        let mut report = AssetReport::default();
        for (field, suffix) in INLINE_FIELDS {
            let Some(Value::String(raw)) = item.get(field) else {
                continue;
            };
            if !raw.starts_with("data:") {
                continue;
            }
            let uploaded = self.upload_inline(id, suffix, raw).await;
            match uploaded {
                Some(file_id) => {
                    item.insert(field.to_string(), Value::String(file_id));
                    report.uploaded += 1;
                }
                None => {
                    item.remove(field);
                    report.failed += 1;
                }
            }
        }

        let populated = item
            .get(CHARACTER_FIELD)
            .is_some_and(|v| !v.is_null() && v.as_str() != Some(""));
        let hash = item
            .get(CHARACTER_HASH_FIELD)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        if let (Some(hash), false) = (hash, populated) {
            match self.migrate_character(id, &hash).await {
                Some(file_id) => {
                    item.insert(CHARACTER_FIELD.to_string(), Value::String(file_id));
                    report.uploaded += 1;
                }
                None => {
                    item.remove(CHARACTER_FIELD);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Fetch the character image by content hash and upload it.
    pub async fn migrate_character(&self, id: i64, hash: &str) -> Option<String> {
        let url = gateway_url(&self.cfg.ipfs_gateway, hash);
        let Some(bytes) = self
            .fetch
            .fetch_binary(&url, self.cfg.fetch_timeout, self.cfg.fetch_retries)
            .await
        else {
            warn!(target = "assets", id, hash, "character image unavailable; leaving field empty");
            return None;
        };
        self.upload(bytes, format!("codex-{id}-character.jpg"), "image/jpeg".into())
            .await
    }

    async fn upload_inline(&self, id: i64, suffix: &str, data_uri: &str) -> Option<String> {
        let (mime, bytes) = match decode_data_uri(data_uri) {
            Ok(decoded) => decoded,
            Err(reason) => {
                warn!(target = "assets", id, field = suffix, reason, "dropping malformed inline image");
                return None;
            }
        };
        self.upload(Bytes::from(bytes), format!("codex-{id}-{suffix}.jpg"), mime)
            .await
    }

    async fn upload(&self, bytes: Bytes, filename: String, mime_type: String) -> Option<String> {
        let meta = UploadMeta {
            filename_download: filename,
            mime_type,
            folder: self.folder().await,
            storage: self.cfg.storage.clone(),
        };
        let name = meta.filename_download.clone();
        match self.files.upload_one(bytes, meta).await {
            Ok(file_id) => {
                debug!(target = "assets", file = %name, file_id = %file_id, "asset uploaded");
                Some(file_id)
            }
            Err(err) => {
                warn!(target = "assets", file = %name, error = %err, "asset upload failed");
                None
            }
        }
    }
}

/// Split `data:<mime>;base64,<payload>` into its MIME type and decoded bytes.
pub fn decode_data_uri(raw: &str) -> Result<(String, Vec<u8>), &'static str> {
    let rest = raw.strip_prefix("data:").ok_or("missing data: prefix")?;
    let (header, payload) = rest.split_once(',').ok_or("missing payload separator")?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or("payload is not base64 encoded")?;
    let mime = if mime.is_empty() { "application/octet-stream" } else { mime };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|_| "invalid base64 payload")?;
    if bytes.is_empty() {
        return Err("empty payload");
    }
    Ok((mime.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFetch {
        body: Option<Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BinaryFetch for FakeFetch {
        async fn fetch_binary(&self, _url: &str, _t: Duration, _r: u32) -> Option<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.body.clone().map(Bytes::from)
        }
    }

    fn item(v: Value) -> Item {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn decodes_data_uris() {
        let (mime, bytes) = decode_data_uri("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
        assert!(decode_data_uri("data:image/png;base64,@@not base64@@").is_err());
        assert!(decode_data_uri("data:image/png,plain").is_err());
    }

    #[tokio::test]
    async fn inline_and_character_assets_are_replaced_by_file_ids() {
        let store = MemoryStore::new("codex");
        let fetch = FakeFetch { body: Some(vec![1, 2, 3]), calls: AtomicUsize::new(0) };
        let migrator = AssetMigrator::new(&store, &store, &fetch, AssetConfig::default());
        let mut it = item(json!({
            "thumbnail": "data:image/jpeg;base64,aGVsbG8=",
            "thumbnail_background": "data:image/webp;base64,d29ybGQ=",
            "ipfs_character": "QmChar"
        }));
        let report = migrator.migrate(9, &mut it).await;
        assert_eq!(report, AssetReport { uploaded: 3, failed: 0 });

        let files = store.files();
        let names: Vec<_> = files.iter().map(|f| f.meta.filename_download.as_str()).collect();
        assert_eq!(
            names,
            ["codex-9-thumbnail.jpg", "codex-9-background.jpg", "codex-9-character.jpg"]
        );
        assert_eq!(files[1].meta.mime_type, "image/webp");
        assert_eq!(files[2].meta.mime_type, "image/jpeg");
        assert_eq!(it["thumbnail"], json!(files[0].id));
        assert_eq!(it["thumbnail_character"], json!(files[2].id));
        // one folder shared by every upload
        assert_eq!(store.folder_creates(), 1);
        assert!(files.iter().all(|f| f.meta.folder == files[0].meta.folder));
    }

    #[tokio::test]
    async fn failures_leave_fields_absent() {
        let store = MemoryStore::new("codex");
        let fetch = FakeFetch { body: None, calls: AtomicUsize::new(0) };
        let migrator = AssetMigrator::new(&store, &store, &fetch, AssetConfig::default());
        let mut it = item(json!({
            "thumbnail": "data:image/jpeg;base64,%%%",
            "ipfs_character": "QmGone",
            "name": "kept"
        }));
        let report = migrator.migrate(4, &mut it).await;
        assert_eq!(report, AssetReport { uploaded: 0, failed: 2 });
        assert!(!it.contains_key("thumbnail"));
        assert!(!it.contains_key("thumbnail_character"));
        assert_eq!(it["name"], "kept");
        assert!(store.files().is_empty());
    }

    #[tokio::test]
    async fn populated_character_is_not_refetched_and_configured_folder_wins() {
        let store = MemoryStore::new("codex");
        let fetch = FakeFetch { body: Some(vec![7]), calls: AtomicUsize::new(0) };
        let cfg = AssetConfig { folder_id: Some("folder-1".into()), ..AssetConfig::default() };
        let migrator = AssetMigrator::new(&store, &store, &fetch, cfg);
        let mut it = item(json!({"ipfs_character": "QmX", "thumbnail_character": "file-1"}));
        migrator.migrate(1, &mut it).await;
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
        assert_eq!(migrator.folder().await.as_deref(), Some("folder-1"));
        assert_eq!(store.folder_creates(), 0);
    }
}
