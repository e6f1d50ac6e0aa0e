//! Named boolean flags that outlive a single resolver call.

use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// Get/set a named boolean. Unknown names read as `false`.
pub trait FlagStore: Send + Sync {
    fn get(&self, name: &str) -> bool;
    fn set(&self, name: &str, value: bool) -> Result<()>;
}

/// In-memory store, lives as long as the value that owns it.
#[derive(Default)]
pub struct MemoryFlagStore {
    flags: Mutex<HashMap<String, bool>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn get(&self, name: &str) -> bool {
        self.flags
            .lock()
            .map(|f| f.get(name).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    fn set(&self, name: &str, value: bool) -> Result<()> {
        let mut flags = self
            .flags
            .lock()
            .map_err(|e| anyhow::anyhow!("flag store lock poisoned: {}", e))?;
        flags.insert(name.to_string(), value);
        Ok(())
    }
}

/// Flags persisted as a JSON object on disk, rewritten on every `set`.
pub struct JsonFlagStore {
    file_path: PathBuf,
    flags: Mutex<HashMap<String, bool>>,
}

impl JsonFlagStore {
    /// Open the store, loading existing flags. A missing file starts empty.
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self> {
        let file_path = file_path.into();
        let flags = if file_path.exists() {
            let content = fs::read_to_string(&file_path)?;
            let flags: HashMap<String, bool> = serde_json::from_str(&content)?;
            tracing::debug!("Loaded {} flags from {}", flags.len(), file_path.display());
            flags
        } else {
            HashMap::new()
        };
        Ok(Self {
            file_path,
            flags: Mutex::new(flags),
        })
    }
}

impl FlagStore for JsonFlagStore {
    fn get(&self, name: &str) -> bool {
        self.flags
            .lock()
            .map(|f| f.get(name).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    fn set(&self, name: &str, value: bool) -> Result<()> {
        let mut flags = self
            .flags
            .lock()
            .map_err(|e| anyhow::anyhow!("flag store lock poisoned: {}", e))?;
        flags.insert(name.to_string(), value);

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&*flags)?;
        fs::write(&self.file_path, content)?;
        Ok(())
    }
}
