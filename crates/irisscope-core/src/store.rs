//! Durable key-value storage used by the surrounding application to keep
//! reports and settings. The analysis pipeline itself never touches it.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::analysis::AnalysisReport;
use crate::error::{IrisError, Result};

/// Generic get/set capability over JSON values.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Process-local store, mostly for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

/// One pretty-printed JSON file per key under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(IrisError::Storage("empty key".to_string()));
        }
        Ok(self.root.join(format!("{}.json", escape_key(key))))
    }
}

/// File-name-safe, reversible key encoding: ASCII alphanumerics and `-` pass
/// through, every other byte becomes `_xx` (lowercase hex).
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key)?;
        let content = serde_json::to_string_pretty(&value)?;
        // Write-then-rename so readers never observe a half-written file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!("Stored {} at {}", key, path.display());
        Ok(())
    }
}

const LATEST_REPORT_KEY: &str = "report:latest";

/// Report persistence on top of any [`KeyValueStore`].
pub struct ReportArchive {
    store: Arc<dyn KeyValueStore>,
}

impl ReportArchive {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn report_key(id: &uuid::Uuid) -> String {
        format!("report:{}", id)
    }

    pub fn save(&self, report: &AnalysisReport) -> Result<()> {
        let value = serde_json::to_value(report)?;
        self.store.set(&Self::report_key(&report.id), value)?;
        self.store
            .set(LATEST_REPORT_KEY, Value::String(report.id.to_string()))
    }

    pub fn load(&self, id: &uuid::Uuid) -> Result<Option<AnalysisReport>> {
        match self.store.get(&Self::report_key(id))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn latest(&self) -> Result<Option<AnalysisReport>> {
        let id = match self.store.get(LATEST_REPORT_KEY)? {
            Some(Value::String(id)) => id,
            Some(other) => {
                return Err(IrisError::Storage(format!(
                    "malformed latest report pointer: {}",
                    other
                )))
            }
            None => return Ok(None),
        };
        let id = uuid::Uuid::parse_str(&id)
            .map_err(|e| IrisError::Storage(format!("invalid report id {}: {}", id, e)))?;
        self.load(&id)
    }
}
