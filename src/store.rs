//! Durable key/value checkpoints for registries and the event log.
//!
//! Values are whole JSON documents; every save overwrites the previous one.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::config::{EngineConfig, StoreKind};

pub trait KeyValueStore {
    fn load(&self, key: &str) -> Result<Option<Value>>;
    fn save(&mut self, key: &str, value: &Value) -> Result<()>;
}

impl StoreKind {
    pub fn build(&self, cfg: &EngineConfig) -> Result<Box<dyn KeyValueStore>> {
        Ok(match self {
            StoreKind::Memory => Box::new(MemoryStore::new()),
            StoreKind::File => Box::new(FileStore::open(&cfg.store_path)?),
            StoreKind::Sqlite => {
                let mut store = SqliteStore::new(&cfg.store_path)?;
                store.init()?;
                Box::new(store)
            }
        })
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}

// =============================================================================
// One JSON file per key
// =============================================================================

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &str) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create store dir {}", dir))?;
        Ok(Self { dir: PathBuf::from(dir) })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KeyValueStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let value = serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(value))
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(value)?).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename onto {}", path.display()))?;
        Ok(())
    }
}

// =============================================================================
// SQLite
// =============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_ms INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, key: &str, value: &Value) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO kv (key, value, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms",
            params![key, value.to_string(), chrono::Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

// =============================================================================
// Always failing (persistence-failure paths)
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct FailingStore;

impl KeyValueStore for FailingStore {
    fn load(&self, key: &str) -> Result<Option<Value>> {
        bail!("store unavailable (load {})", key)
    }

    fn save(&mut self, key: &str, _value: &Value) -> Result<()> {
        bail!("store unavailable (save {})", key)
    }
}
