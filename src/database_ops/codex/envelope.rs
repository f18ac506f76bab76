use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database_ops::store::value_as_id;

/// Field carrying the stable external sync id inside each envelope item.
pub const SYNC_ID_FIELD: &str = "_sync_id";

/// Upsert policy block; honored by the external sync mechanism, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub insert_order: u32,
    pub create: bool,
    pub update: bool,
    pub delete: bool,
    pub preserve_ids: bool,
    #[serde(default)]
    pub ignore_on_update: Vec<String>,
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            insert_order: 1,
            create: true,
            update: true,
            delete: true,
            preserve_ids: true,
            ignore_on_update: Vec::new(),
        }
    }
}

/// One source document prepared for bulk loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub collection: String,
    pub meta: SyncMeta,
    pub data: Vec<Value>,
}

impl Envelope {
    /// Wrap a fetched document, tagging it with its sync id.
    pub fn wrap(collection: &str, mut document: Value, index: u32) -> Self {
        let sync_id = sync_id_for(&document, index);
        if let Value::Object(map) = &mut document {
            map.insert(SYNC_ID_FIELD.to_string(), Value::String(sync_id));
        }
        Self {
            collection: collection.to_string(),
            meta: SyncMeta::default(),
            data: vec![document],
        }
    }
}

/// `codex-<id>` from the document's own id, else from the generation index.
pub fn sync_id_for(document: &Value, index: u32) -> String {
    match document.get("id").and_then(value_as_id) {
        Some(id) => format!("codex-{id}"),
        None => format!("codex-{index}"),
    }
}

/// Deterministic names for one position in the id universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAddress {
    pub index: u32,
    pub token: String,
    pub source_filename: String,
    pub output_path: PathBuf,
}

impl TokenAddress {
    pub fn new(index: u32, pad_width: usize, output_dir: &Path) -> Self {
        let token = format!("{index:0pad_width$}");
        Self {
            index,
            source_filename: format!("Art_DeCC0_{token}.codex.json"),
            output_path: output_dir.join(format!("codex-{token}.json")),
            token,
        }
    }
}
