//! SQLite contact store.
//!
//! One table keyed by e-mail address. Imports go through an [`ImportBatch`],
//! which wraps a single transaction: dropping the batch without calling
//! [`ImportBatch::commit`] rolls every row back.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A directory contact. `email` is the identity, stored exactly as given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub email: String,
    /// Free-text organisational path, e.g. `DRAAF Occitanie / SRAL`.
    pub structure_path: String,
    pub given_name: String,
    pub family_name: String,
    pub role_title: String,
    pub role_detail: String,
    pub phone: String,
    pub mobile: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

pub struct ContactStore {
    conn: Connection,
}

impl ContactStore {
    /// Open or create a database at `path`, creating the schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS contacts (
                email           TEXT PRIMARY KEY,
                structure_path  TEXT NOT NULL DEFAULT '',
                given_name      TEXT NOT NULL DEFAULT '',
                family_name     TEXT NOT NULL DEFAULT '',
                role_title      TEXT NOT NULL DEFAULT '',
                role_detail     TEXT NOT NULL DEFAULT '',
                phone           TEXT NOT NULL DEFAULT '',
                mobile          TEXT NOT NULL DEFAULT '',
                updated_at      INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Start an import transaction.
    pub fn begin_import(&mut self) -> Result<ImportBatch<'_>, StorageError> {
        let tx = self.conn.transaction()?;
        Ok(ImportBatch {
            tx,
            now: now_secs(),
        })
    }

    pub fn get_contact(&self, email: &str) -> Result<Option<ContactRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT email, structure_path, given_name, family_name, role_title, role_detail,
                    phone, mobile
             FROM contacts WHERE email = ?1",
        )?;
        let row = stmt
            .query_row(params![email], row_to_contact)
            .optional()?;
        Ok(row)
    }

    /// All contacts ordered by e-mail.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT email, structure_path, given_name, family_name, role_title, role_detail,
                    phone, mobile
             FROM contacts ORDER BY email",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    pub fn count_contacts(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contacts", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactRecord> {
    Ok(ContactRecord {
        email: row.get(0)?,
        structure_path: row.get(1)?,
        given_name: row.get(2)?,
        family_name: row.get(3)?,
        role_title: row.get(4)?,
        role_detail: row.get(5)?,
        phone: row.get(6)?,
        mobile: row.get(7)?,
    })
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One all-or-nothing import.
pub struct ImportBatch<'a> {
    tx: Transaction<'a>,
    now: u64,
}

impl ImportBatch<'_> {
    /// Insert the contact, or overwrite every attribute of the existing one.
    pub fn upsert(&self, record: &ContactRecord) -> Result<UpsertOutcome, StorageError> {
        let exists = self
            .tx
            .prepare_cached("SELECT 1 FROM contacts WHERE email = ?1")?
            .query_row(params![record.email], |_| Ok(()))
            .optional()?
            .is_some();

        self.tx
            .prepare_cached(
                "INSERT INTO contacts
                 (email, structure_path, given_name, family_name, role_title, role_detail,
                  phone, mobile, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(email) DO UPDATE SET
                    structure_path = excluded.structure_path,
                    given_name     = excluded.given_name,
                    family_name    = excluded.family_name,
                    role_title     = excluded.role_title,
                    role_detail    = excluded.role_detail,
                    phone          = excluded.phone,
                    mobile         = excluded.mobile,
                    updated_at     = excluded.updated_at",
            )?
            .execute(params![
                record.email,
                record.structure_path,
                record.given_name,
                record.family_name,
                record.role_title,
                record.role_detail,
                record.phone,
                record.mobile,
                self.now as i64,
            ])?;

        Ok(if exists {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        })
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(email: &str, family_name: &str) -> ContactRecord {
        ContactRecord {
            email: email.to_string(),
            family_name: family_name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_creates_then_updates() {
        let mut store = ContactStore::open_in_memory().unwrap();
        let batch = store.begin_import().unwrap();
        assert_eq!(
            batch.upsert(&contact("a@x.fr", "Durand")).unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            batch.upsert(&contact("a@x.fr", "Dupont")).unwrap(),
            UpsertOutcome::Updated
        );
        batch.commit().unwrap();

        assert_eq!(store.count_contacts().unwrap(), 1);
        let stored = store.get_contact("a@x.fr").unwrap().unwrap();
        assert_eq!(stored.family_name, "Dupont");
    }

    #[test]
    fn dropped_batch_rolls_back() {
        let mut store = ContactStore::open_in_memory().unwrap();
        {
            let batch = store.begin_import().unwrap();
            batch.upsert(&contact("a@x.fr", "Durand")).unwrap();
        }
        assert_eq!(store.count_contacts().unwrap(), 0);
    }

    #[test]
    fn email_identity_is_case_preserving() {
        let mut store = ContactStore::open_in_memory().unwrap();
        let batch = store.begin_import().unwrap();
        batch.upsert(&contact("Jean.Martin@x.fr", "Martin")).unwrap();
        batch.commit().unwrap();

        assert!(store.get_contact("Jean.Martin@x.fr").unwrap().is_some());
        assert!(store.get_contact("jean.martin@x.fr").unwrap().is_none());
    }
}
