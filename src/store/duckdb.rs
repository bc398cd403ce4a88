use super::traits::{KvBackend, KvTxn, Region, StoreError};
use duckdb::{Connection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Path::new("/proc").join(pid.to_string()).exists()
            || std::process::Command::new("kill")
                .arg("-0")
                .arg(pid.to_string())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the lock holder's PID from a DuckDB lock error, e.g. "... (PID 12345) ..."
fn extract_pid_from_lock_error(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

/// Remove the lock file a crashed or powered-off process left behind.
///
/// The WAL is never touched: it holds committed events that DuckDB replays
/// on the next open.
fn remove_stale_lock_file(db_path: &Path) -> std::io::Result<()> {
    let stale = PathBuf::from(format!("{}.lock", db_path.display()));
    if stale.exists() {
        std::fs::remove_file(&stale)?;
        info!(path = %stale.display(), "Removed stale lock file");
    }
    Ok(())
}

/// DuckDB implementation of [`KvBackend`].
///
/// Each region is a `(key BLOB, value BLOB)` table; sequence counters live in
/// `store_sequences`. The connection sits behind a mutex, so every call runs
/// one transaction at a time.
pub struct DuckDbBackend {
    conn: Mutex<Option<Connection>>,
}

impl DuckDbBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!(
                    "failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                warn!(error = %error_msg, "Database lock detected");
                let Some(pid) = extract_pid_from_lock_error(&error_msg) else {
                    return Err(e.into());
                };

                if is_process_running(pid) {
                    error!(pid = pid, "Database is locked by a running process");
                    return Err(e.into());
                }

                warn!(pid = pid, "Lock holder is gone, retrying open");
                if let Err(io_err) = remove_stale_lock_file(path) {
                    error!(error = %io_err, "Failed to remove stale lock file");
                    return Err(e.into());
                }

                let conn = Connection::open(path)?;
                Ok(Self::from_connection(conn))
            }
        }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
        }
    }

    fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Storage("connection lock poisoned".to_string()))?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

impl KvBackend for DuckDbBackend {
    fn create_regions(&self) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            for region in Region::ALL {
                tx.execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            key BLOB PRIMARY KEY,
                            value BLOB NOT NULL
                        )",
                        region.name()
                    ),
                    [],
                )?;
            }

            tx.execute(
                "CREATE TABLE IF NOT EXISTS store_sequences (
                    region VARCHAR NOT NULL,
                    value UBIGINT NOT NULL
                )",
                [],
            )?;

            for region in Region::ALL {
                tx.execute(
                    "INSERT INTO store_sequences (region, value)
                     SELECT ?, 0
                     WHERE NOT EXISTS (SELECT 1 FROM store_sequences WHERE region = ?)",
                    duckdb::params![region.name(), region.name()],
                )?;
            }

            Ok(())
        })
    }

    fn view(
        &self,
        f: &mut dyn FnMut(&dyn KvTxn) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| f(&DuckDbTxn { tx }))
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut dyn KvTxn) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| f(&mut DuckDbTxn { tx }))
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Storage("connection lock poisoned".to_string()))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::from(e))?;
        }
        Ok(())
    }
}

struct DuckDbTxn<'a, 'conn> {
    tx: &'a Transaction<'conn>,
}

impl KvTxn for DuckDbTxn<'_, '_> {
    fn get(&self, region: Region, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(&format!("SELECT value FROM {} WHERE key = ?", region.name()))?;
        let mut rows = stmt.query(duckdb::params![key])?;

        match rows.next()? {
            Some(row) => Ok(Some(row.get::<_, Vec<u8>>(0)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, region: Region, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.tx.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
                region.name()
            ),
            duckdb::params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, region: Region, key: &[u8]) -> Result<(), StoreError> {
        self.tx.execute(
            &format!("DELETE FROM {} WHERE key = ?", region.name()),
            duckdb::params![key],
        )?;
        Ok(())
    }

    fn scan(&self, region: Region) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(&format!("SELECT key, value FROM {} ORDER BY key", region.name()))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn keys(&self, region: Region) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut stmt = self
            .tx
            .prepare(&format!("SELECT key FROM {} ORDER BY key", region.name()))?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn next_sequence(&mut self, region: Region) -> Result<u64, StoreError> {
        let current: u64 = self.tx.query_row(
            "SELECT value FROM store_sequences WHERE region = ?",
            duckdb::params![region.name()],
            |row| row.get(0),
        )?;
        let next = current + 1;
        self.tx.execute(
            "UPDATE store_sequences SET value = ? WHERE region = ?",
            duckdb::params![next, region.name()],
        )?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_backend() -> DuckDbBackend {
        let backend = DuckDbBackend::in_memory().unwrap();
        backend.create_regions().unwrap();
        backend
    }

    #[test]
    fn test_create_regions_is_idempotent() {
        let backend = setup_backend();
        assert!(backend.create_regions().is_ok());
    }

    #[test]
    fn test_put_get_delete() {
        let backend = setup_backend();

        backend
            .update(&mut |txn| txn.put(Region::Legacy, b"k", b"v1"))
            .unwrap();
        backend
            .update(&mut |txn| txn.put(Region::Legacy, b"k", b"v2"))
            .unwrap();

        let mut value = None;
        backend
            .view(&mut |txn| {
                value = txn.get(Region::Legacy, b"k")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(value.as_deref(), Some(&b"v2"[..]));

        backend
            .update(&mut |txn| txn.delete(Region::Legacy, b"k"))
            .unwrap();
        backend
            .update(&mut |txn| txn.delete(Region::Legacy, b"missing"))
            .unwrap();

        let mut keys = Vec::new();
        backend
            .view(&mut |txn| {
                keys = txn.keys(Region::Legacy)?;
                Ok(())
            })
            .unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_regions_are_separate() {
        let backend = setup_backend();
        backend
            .update(&mut |txn| txn.put(Region::Events, b"a", b"1"))
            .unwrap();

        let mut legacy = Vec::new();
        let mut events = Vec::new();
        backend
            .view(&mut |txn| {
                legacy = txn.scan(Region::Legacy)?;
                events = txn.scan(Region::Events)?;
                Ok(())
            })
            .unwrap();
        assert!(legacy.is_empty());
        assert_eq!(events, vec![(b"a".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let backend = setup_backend();

        let result = backend.update(&mut |txn| {
            txn.put(Region::Events, b"a", b"1")?;
            txn.next_sequence(Region::Events)?;
            Err(StoreError::Storage("boom".to_string()))
        });
        assert!(result.is_err());

        let mut events = Vec::new();
        let mut seq = 0;
        backend
            .update(&mut |txn| {
                events = txn.scan(Region::Events)?;
                seq = txn.next_sequence(Region::Events)?;
                Ok(())
            })
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_sequences_are_per_region() {
        let backend = setup_backend();
        let mut seqs = Vec::new();
        backend
            .update(&mut |txn| {
                seqs.push(txn.next_sequence(Region::Events)?);
                seqs.push(txn.next_sequence(Region::Events)?);
                seqs.push(txn.next_sequence(Region::Legacy)?);
                Ok(())
            })
            .unwrap();
        assert_eq!(seqs, vec![1, 2, 1]);
    }

    #[test]
    fn test_closed_backend_rejects_operations() {
        let backend = setup_backend();
        backend.close().unwrap();

        let result = backend.view(&mut |_| Ok(()));
        assert!(matches!(result, Err(StoreError::Closed)));
    }

    #[test]
    fn test_extract_pid_from_lock_error() {
        let msg = "IO Error: Could not set lock on file \"x.db\": Conflicting lock is held in /usr/bin/event-reporter (PID 4242) by user pi";
        assert_eq!(extract_pid_from_lock_error(msg), Some(4242));
        assert_eq!(extract_pid_from_lock_error("no pid here"), None);
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_stale_lock_cleanup_keeps_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("events.db");
        let wal = dir.path().join("events.db.wal");
        let lock = dir.path().join("events.db.lock");
        std::fs::write(&wal, b"committed frames").unwrap();
        std::fs::write(&lock, b"").unwrap();

        remove_stale_lock_file(&db_path).unwrap();

        assert!(!lock.exists());
        assert_eq!(std::fs::read(&wal).unwrap(), b"committed frames");
        remove_stale_lock_file(&db_path).unwrap();
    }
}
