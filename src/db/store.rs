// src/db/store.rs

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Shared handle to the key-value store
///
/// The SQLite connection is not `Sync`, so all access is funneled through
/// a mutex. Each call holds it only for a single statement or transaction.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of writes applied atomically by [`Database::write`]
#[derive(Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    /// Queue a JSON-encoded value
    pub fn put_value<T: Serialize>(&mut self, key: impl Into<Vec<u8>>, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.put(key, encoded);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` when no such bound exists (prefix of all `0xff`).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

impl Database {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Open a throwaway in-memory store with the schema applied
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::migrate(&conn)?;
        Ok(Self::new(conn))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Fetch and decode a JSON value
    pub fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn();
        let rows = match prefix_upper_bound(prefix) {
            Some(upper) => {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key",
                )?;
                stmt.query_map(params![prefix, upper], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
                stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    /// All keys starting with `prefix`, in ascending byte order
    pub fn keys_by_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// All values whose keys start with `prefix`, in key order
    pub fn fetch_by_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Fetch and decode all values under `prefix`
    pub fn fetch_values<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        self.fetch_by_prefix(prefix)?
            .iter()
            .map(|raw| serde_json::from_slice(raw).map_err(Into::into))
            .collect()
    }

    pub fn has_prefix(&self, prefix: &[u8]) -> Result<bool> {
        Ok(!self.keys_by_prefix(prefix)?.is_empty())
    }

    pub fn create_batch(&self) -> Batch {
        Batch::new()
    }

    /// Apply every operation of the batch in one transaction
    pub fn write(&self, batch: Batch) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for op in &batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                BatchOp::Delete(key) => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
                }
            }
        }
        tx.commit()?;
        debug!("Committed batch of {} operations", batch.ops.len());
        Ok(())
    }

    /// Reclaim space left behind by deleted entries
    pub fn compact(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"L"), Some(b"M".to_vec()));
        assert_eq!(prefix_upper_bound(&[b'a', 0xff]), Some(b"b".to_vec()));
        assert_eq!(prefix_upper_bound(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_fetch_by_prefix_is_exact() {
        let db = Database::in_memory().unwrap();
        db.put(b"Lone", b"1").unwrap();
        db.put(b"Ltwo", b"2").unwrap();
        db.put(b"Sone", b"3").unwrap();
        db.put(b"M", b"4").unwrap();

        assert_eq!(db.fetch_by_prefix(b"L").unwrap(), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(db.keys_by_prefix(b"S").unwrap(), vec![b"Sone".to_vec()]);
        assert!(!db.has_prefix(b"U").unwrap());
    }

    #[test]
    fn test_batch_is_atomic_unit() {
        let db = Database::in_memory().unwrap();
        db.put(b"Eold", b"x").unwrap();

        let mut batch = db.create_batch();
        batch.put(b"Lnew".to_vec(), b"y".to_vec());
        batch.delete(b"Eold".to_vec());
        assert_eq!(batch.len(), 2);
        db.write(batch).unwrap();

        assert_eq!(db.get(b"Lnew").unwrap(), Some(b"y".to_vec()));
        assert_eq!(db.get(b"Eold").unwrap(), None);
    }

    #[test]
    fn test_json_values() {
        let db = Database::in_memory().unwrap();
        let mut batch = Batch::new();
        batch.put_value(b"Cpath".to_vec(), &vec![1u32, 2, 3]).unwrap();
        db.write(batch).unwrap();

        let decoded: Option<Vec<u32>> = db.get_value(b"Cpath").unwrap();
        assert_eq!(decoded, Some(vec![1, 2, 3]));
        let all: Vec<Vec<u32>> = db.fetch_values(b"C").unwrap();
        assert_eq!(all.len(), 1);
    }
}
