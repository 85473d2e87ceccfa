// src/db/mod.rs

//! Persistent key-value store for debpool
//!
//! Every entity (packages, repositories, snapshots, published repositories,
//! reference lists, pool checksums) is kept as a JSON value under a
//! prefixed binary key in a single SQLite table:
//! - `P` packages, `L` local repos, `R` remote repos, `S` snapshots
//! - `U` published repos, `E` reference lists, `C` pool checksums

pub mod schema;
mod store;

pub use store::{Batch, Database};

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Initialize a new debpool database at the specified path
///
/// Creates the database file and applies all schema migrations.
/// This is idempotent - calling it on an existing database is safe.
pub fn init(db_path: &Path) -> Result<()> {
    debug!("Initializing database at: {}", db_path.display());

    // Create parent directories if they don't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;

    info!("Database initialized successfully");
    Ok(())
}

/// Open an existing debpool database
pub fn open(db_path: &Path) -> Result<Database> {
    if !db_path.exists() {
        return Err(Error::DatabaseNotFound(db_path.display().to_string()));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    schema::migrate(&conn)?;

    Ok(Database::new(conn))
}

/// Open the database, creating it first when it does not exist yet
pub fn open_or_init(db_path: &Path) -> Result<Database> {
    if !db_path.exists() {
        init(db_path)?;
    }
    open(db_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("debpool.db");

        init(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_open_existing_database() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("debpool.db");

        init(&db_path).unwrap();
        let db = open(&db_path).unwrap();
        db.put(b"Ltest", b"{}").unwrap();
        assert_eq!(db.get(b"Ltest").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = open(Path::new("/nonexistent/path/debpool.db"));
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }
}
