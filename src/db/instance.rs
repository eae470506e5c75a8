//! Directory-backed embedded key-value instance

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::status::{Result, Status};

const DB_FILE: &str = "data.sqlite3";
const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)";

/// One initialized database instance: a directory holding a single SQLite
/// file with one key-value table.
///
/// Initialization ([`LedgerDb::init_at`]) and opening ([`LedgerDb::open`])
/// are deliberately split: the factory initializes an instance in a staging
/// directory, closes it, renames the directory into place, and only then
/// opens it. SQLite resolves journal paths by name, so a rename must never
/// happen under an open connection.
pub struct LedgerDb {
    root: PathBuf,
    conn: Connection,
}

impl LedgerDb {
    /// Create a fresh instance directory with its schema, then close it
    pub fn init_at(path: &Path) -> Result<()> {
        debug!(?path, "LedgerDb::init_at: called");
        std::fs::create_dir_all(path)?;
        let conn = Connection::open(path.join(DB_FILE))?;
        conn.execute(SCHEMA, [])?;
        Ok(())
    }

    /// Open an existing instance directory
    pub fn open(path: impl AsRef<Path>) -> Result<LedgerDb> {
        let root = path.as_ref().to_path_buf();
        debug!(?root, "LedgerDb::open: called");
        if !root.is_dir() {
            return Err(Status::Io(format!("not an instance directory: {}", root.display())));
        }
        let db_file = root.join(DB_FILE);
        if !db_file.is_file() {
            return Err(Status::Io(format!("missing database file: {}", db_file.display())));
        }
        let conn = Connection::open(&db_file)?;
        // schema creation is idempotent
        conn.execute(SCHEMA, [])?;
        Ok(LedgerDb { root, conn })
    }

    /// The instance directory this database lives in
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Insert or overwrite a value
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a value, `None` on a missing key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Remove a key; removing a missing key is not an error
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Whether a key is present
    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of stored keys
    pub fn key_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
