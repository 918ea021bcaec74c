use std::fs;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, Result as SqlResult};

use crate::error::StorageError;

/// Base database connection wrapper, shareable across threads.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database file, creating parent directories.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Opened {} (journal_mode={mode})", path.display());
        Ok(Self::wrap(conn)?)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::wrap(conn)?)
    }

    fn wrap(conn: Connection) -> SqlResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}
