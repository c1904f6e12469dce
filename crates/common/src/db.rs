//! SQLite handle shared by every Meshgate service

use crate::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Database wrapper for state persistence
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL for concurrent readers; FKs so addresses and grants follow their machine
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Expose the underlying connection for subsystems that manage their own tables.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Run `f` inside a transaction, committing only if it returns `Ok`.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use rusqlite::params;

    fn create_table(db: &Database) {
        let conn = db.connection();
        let conn = conn.lock();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);")
            .unwrap();
    }

    fn count(db: &Database) -> i64 {
        let conn = db.connection();
        let conn = conn.lock();
        conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_transaction_commits() {
        let db = Database::open_memory().unwrap();
        create_table(&db);

        db.transaction(|tx| {
            tx.execute("INSERT INTO items (value) VALUES (?1)", params!["a"])?;
            tx.execute("INSERT INTO items (value) VALUES (?1)", params!["b"])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(count(&db), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_memory().unwrap();
        create_table(&db);

        let result: Result<()> = db.transaction(|tx| {
            tx.execute("INSERT INTO items (value) VALUES (?1)", params!["a"])?;
            tx.execute("INSERT INTO items (value) VALUES (?1)", params!["a"])?;
            Ok(())
        });

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let db = Database::open(&path).unwrap();
        create_table(&db);
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert_eq!(count(&reopened), 0);
    }
}
