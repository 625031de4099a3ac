//! Database layer: a single sqlite connection behind a blocking mutex.
//!
//! The runner core runs on OS threads, so the connection
//! is guarded by `std::sync::Mutex`, not `tokio::sync::Mutex`. The reporting
//! HTTP API reaches the same handle from async handlers through
//! `tokio::task::spawn_blocking`.

mod schema;
pub mod queries;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::{DaemonError, Result};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    /// Run `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DaemonError::Internal(anyhow::anyhow!("database mutex poisoned")))?;
        f(&conn)
    }

    /// Same as `with_conn`, but for callers that need `&mut Connection` to
    /// open a transaction (`create_suite`, `delete_suite`).
    pub fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| DaemonError::Internal(anyhow::anyhow!("database mutex poisoned")))?;
        f(&mut conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM benchmark_task", [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();
    }
}
