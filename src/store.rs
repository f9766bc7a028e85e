//! Namespaced key-value storage that survives restarts.
//!
//! The contract is session based: `begin` a namespace, read or write keys,
//! then `end`. Failures are reported through return values rather than
//! errors; callers treat an unavailable store as an empty one.

#[cfg(test)]
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

pub trait PersistentStore {
    /// Open `namespace`. Returns false if the store is unavailable.
    fn begin(&mut self, namespace: &str, read_only: bool) -> bool;
    fn get_uint(&mut self, key: &str, default: u32) -> u32;
    /// Returns the number of bytes written (0 on failure).
    fn put_uint(&mut self, key: &str, value: u32) -> usize;
    /// Copies the stored value into `buf`; returns the number of bytes copied.
    fn get_bytes(&mut self, key: &str, buf: &mut [u8]) -> usize;
    /// Returns the number of bytes written (0 on failure).
    fn put_bytes(&mut self, key: &str, value: &[u8]) -> usize;
    /// Remove every key in the open namespace.
    fn clear(&mut self) -> bool;
    fn end(&mut self);
}

/// Open (or create) the SQLite database with WAL mode.
fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS nv_storage (
            namespace TEXT NOT NULL,
            key       TEXT NOT NULL,
            value     BLOB NOT NULL,
            PRIMARY KEY(namespace, key)
        );",
    )?;

    Ok(conn)
}

struct Session {
    conn: Connection,
    namespace: String,
    read_only: bool,
}

/// [`PersistentStore`] on a local SQLite file.
pub struct SqliteStore {
    path: PathBuf,
    session: Option<Session>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session: None,
        }
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let session = self.session.as_ref()?;
        let result = session
            .conn
            .query_row(
                "SELECT value FROM nv_storage WHERE namespace = ?1 AND key = ?2",
                params![session.namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional();
        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Store: read {}/{} failed: {}", session.namespace, key, e);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> usize {
        let Some(session) = self.session.as_ref() else {
            return 0;
        };
        if session.read_only {
            tracing::warn!("Store: write to {} in read-only session", key);
            return 0;
        }
        let result = session.conn.execute(
            "INSERT INTO nv_storage (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![session.namespace, key, value],
        );
        match result {
            Ok(_) => value.len(),
            Err(e) => {
                tracing::warn!("Store: write {}/{} failed: {}", session.namespace, key, e);
                0
            }
        }
    }
}

impl PersistentStore for SqliteStore {
    fn begin(&mut self, namespace: &str, read_only: bool) -> bool {
        match open_db(&self.path) {
            Ok(conn) => {
                self.session = Some(Session {
                    conn,
                    namespace: namespace.to_string(),
                    read_only,
                });
                true
            }
            Err(e) => {
                tracing::warn!("Store: failed to open {}: {}", self.path.display(), e);
                self.session = None;
                false
            }
        }
    }

    fn get_uint(&mut self, key: &str, default: u32) -> u32 {
        self.read(key)
            .and_then(|bytes| <[u8; 4]>::try_from(bytes.as_slice()).ok())
            .map(u32::from_le_bytes)
            .unwrap_or(default)
    }

    fn put_uint(&mut self, key: &str, value: u32) -> usize {
        self.write(key, &value.to_le_bytes())
    }

    fn get_bytes(&mut self, key: &str, buf: &mut [u8]) -> usize {
        match self.read(key) {
            Some(value) => {
                let len = value.len().min(buf.len());
                buf[..len].copy_from_slice(&value[..len]);
                len
            }
            None => 0,
        }
    }

    fn put_bytes(&mut self, key: &str, value: &[u8]) -> usize {
        self.write(key, value)
    }

    fn clear(&mut self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if session.read_only {
            return false;
        }
        match session.conn.execute(
            "DELETE FROM nv_storage WHERE namespace = ?1",
            params![session.namespace],
        ) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Store: clear {} failed: {}", session.namespace, e);
                false
            }
        }
    }

    fn end(&mut self) {
        self.session = None;
    }
}

/// In-memory [`PersistentStore`]; `set_available(false)` makes `begin` fail.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespaces: HashMap<String, HashMap<String, Vec<u8>>>,
    open: Option<(String, bool)>,
    unavailable: bool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&mut self, available: bool) {
        self.unavailable = !available;
    }

    /// Raw access for inspection.
    pub fn raw(&self, namespace: &str, key: &str) -> Option<&[u8]> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|v| v.as_slice())
    }

    fn current(&self) -> Option<&HashMap<String, Vec<u8>>> {
        let (namespace, _) = self.open.as_ref()?;
        self.namespaces.get(namespace)
    }

    fn current_mut(&mut self) -> Option<&mut HashMap<String, Vec<u8>>> {
        match &self.open {
            Some((namespace, false)) => Some(self.namespaces.entry(namespace.clone()).or_default()),
            _ => None,
        }
    }
}

#[cfg(test)]
impl PersistentStore for MemoryStore {
    fn begin(&mut self, namespace: &str, read_only: bool) -> bool {
        if self.unavailable {
            return false;
        }
        self.open = Some((namespace.to_string(), read_only));
        true
    }

    fn get_uint(&mut self, key: &str, default: u32) -> u32 {
        self.current()
            .and_then(|ns| ns.get(key))
            .and_then(|bytes| <[u8; 4]>::try_from(bytes.as_slice()).ok())
            .map(u32::from_le_bytes)
            .unwrap_or(default)
    }

    fn put_uint(&mut self, key: &str, value: u32) -> usize {
        self.put_bytes(key, &value.to_le_bytes())
    }

    fn get_bytes(&mut self, key: &str, buf: &mut [u8]) -> usize {
        match self.current().and_then(|ns| ns.get(key)) {
            Some(value) => {
                let len = value.len().min(buf.len());
                buf[..len].copy_from_slice(&value[..len]);
                len
            }
            None => 0,
        }
    }

    fn put_bytes(&mut self, key: &str, value: &[u8]) -> usize {
        match self.current_mut() {
            Some(ns) => {
                ns.insert(key.to_string(), value.to_vec());
                value.len()
            }
            None => 0,
        }
    }

    fn clear(&mut self) -> bool {
        match self.current_mut() {
            Some(ns) => {
                ns.clear();
                true
            }
            None => false,
        }
    }

    fn end(&mut self) {
        self.open = None;
    }
}
