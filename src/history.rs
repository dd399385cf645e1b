//! Single-table SQLite log of requested downloads.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::download::DownloadId;
use crate::error::HistoryError;
use crate::model::{DownloadStatus, HistoryRecord};

const MAX_NAME_LEN: usize = 255;

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(db_path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening download history at {:?}", db_path);
        Self::init(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                request_key TEXT UNIQUE
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a `pending` row and returns its id.
    ///
    /// When `request_key` was already used, the id of that earlier row is
    /// returned and nothing is inserted.
    pub fn insert_pending(
        &self,
        name: &str,
        request_key: Option<&str>,
    ) -> Result<DownloadId, HistoryError> {
        let name = name.trim();
        let len = name.chars().count();
        if len > MAX_NAME_LEN {
            return Err(HistoryError::NameTooLong(len));
        }

        let conn = self.conn();
        if let Some(key) = request_key {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM downloads WHERE request_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                debug!("Replayed request {} for download {}", key, id);
                return Ok(DownloadId(id));
            }
        }

        conn.execute(
            "INSERT INTO downloads (name, status, request_key) VALUES (?1, ?2, ?3)",
            params![name, DownloadStatus::Pending.as_str(), request_key],
        )?;
        Ok(DownloadId(conn.last_insert_rowid()))
    }

    /// All rows, newest first, with names reduced to their basename.
    pub fn list(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, status FROM downloads ORDER BY id DESC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, status)| {
                Ok(HistoryRecord {
                    id: DownloadId(id),
                    name: basename(&name).to_string(),
                    status: status.parse()?,
                })
            })
            .collect()
    }

    /// Returns whether a row with that id existed.
    pub fn set_status(&self, id: DownloadId, status: DownloadStatus) -> Result<bool, HistoryError> {
        let changed = self.conn().execute(
            "UPDATE downloads SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.0],
        )?;
        Ok(changed > 0)
    }

    pub fn clear(&self) -> Result<(), HistoryError> {
        self.conn().execute("DELETE FROM downloads", [])?;
        Ok(())
    }
}

fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Parses an id taken from a URL; only positive integers are valid.
pub fn parse_id(raw: &str) -> Result<DownloadId, HistoryError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(DownloadId(id)),
        _ => Err(HistoryError::InvalidId(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_insert_list_and_update() {
        let store = HistoryStore::in_memory().unwrap();
        let first = store.insert_pending("  movies/a.mkv ", None).unwrap();
        let second = store.insert_pending("b.mp4", None).unwrap();
        assert!(second.0 > first.0);

        assert!(store.set_status(first, DownloadStatus::Complete).unwrap());
        assert!(!store.set_status(DownloadId(999), DownloadStatus::Failed).unwrap());

        let list = store.list().unwrap();
        assert_eq!(
            list,
            vec![
                HistoryRecord {
                    id: second,
                    name: "b.mp4".to_string(),
                    status: DownloadStatus::Pending
                },
                HistoryRecord {
                    id: first,
                    name: "a.mkv".to_string(),
                    status: DownloadStatus::Complete
                },
            ]
        );
    }

    #[test]
    fn test_request_key_dedups_inserts() {
        let store = HistoryStore::in_memory().unwrap();
        let a = store.insert_pending("a.mkv", Some("key-1")).unwrap();
        let again = store.insert_pending("a.mkv", Some("key-1")).unwrap();
        let other = store.insert_pending("a.mkv", Some("key-2")).unwrap();

        assert_eq!(a, again);
        assert_ne!(a, other);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_name_too_long() {
        let store = HistoryStore::in_memory().unwrap();
        let name = "x".repeat(256);
        assert!(matches!(
            store.insert_pending(&name, None),
            Err(HistoryError::NameTooLong(256))
        ));
        assert!(store.insert_pending(&"x".repeat(255), None).is_ok());
    }

    #[test]
    fn test_clear_and_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("data").join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.insert_pending("a.mkv", None).unwrap();
        }
        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        store.clear().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("12").unwrap(), DownloadId(12));
        assert!(parse_id("0").is_err());
        assert!(parse_id("-3").is_err());
        assert!(parse_id("abc").is_err());
    }
}
