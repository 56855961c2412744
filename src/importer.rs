//! Import of the decrypted contact export.
//!
//! The export is UTF-8, `;`-separated, with a French header row. Columns are
//! located by name; any optional column may be missing and then reads as an
//! empty string. Only `Mail` is required.
//!
//! Rows whose `Mail` is the `inconnu` placeholder (any case, surrounding
//! whitespace ignored) are skipped. Everything else is upserted by e-mail in a
//! single transaction: the first bad row aborts the import and nothing from
//! the file is kept.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use csv::{ReaderBuilder, StringRecord};
use serde::Serialize;

use crate::storage::{ContactRecord, ContactStore, StorageError, UpsertOutcome};
use crate::synclog;

pub const DELIMITER: u8 = b';';
pub const UNKNOWN_EMAIL_SENTINEL: &str = "inconnu";

pub const COLUMN_STRUCTURE: &str = "Structure";
pub const COLUMN_GIVEN_NAME: &str = "Prénom";
pub const COLUMN_FAMILY_NAME: &str = "Nom";
pub const COLUMN_MAIL: &str = "Mail";
pub const COLUMN_ROLE_TITLE: &str = "Fonction_hiérarchique";
pub const COLUMN_ROLE_DETAIL: &str = "Complément_fonction";
pub const COLUMN_PHONE: &str = "Téléphone";
pub const COLUMN_MOBILE: &str = "Mobile";

const HEADER_LINE: u64 = 1;

#[derive(Debug)]
pub enum ImportError {
    Io(std::io::Error),
    Header { line: u64, message: String },
    Row { line: u64, message: String },
    Storage { line: Option<u64>, source: StorageError },
}

impl ImportError {
    /// 1-based CSV line the failure happened on, when known.
    pub fn line(&self) -> Option<u64> {
        match self {
            ImportError::Io(_) => None,
            ImportError::Header { line, .. } | ImportError::Row { line, .. } => Some(*line),
            ImportError::Storage { line, .. } => *line,
        }
    }
}

impl fmt::Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportError::Io(e) => write!(f, "cannot read export: {e}"),
            ImportError::Header { line, message } => write!(f, "line {line}: {message}"),
            ImportError::Row { line, message } => write!(f, "line {line}: {message}"),
            ImportError::Storage {
                line: Some(line),
                source,
            } => write!(f, "line {line}: {source}"),
            ImportError::Storage { line: None, source } => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImportError::Io(e) => Some(e),
            ImportError::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ImportError {
    fn from(e: std::io::Error) -> Self {
        ImportError::Io(e)
    }
}

/// Counts for one committed import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContactUpsertResult {
    /// Rows written: `created + updated`.
    pub imported: usize,
    pub created: usize,
    pub updated: usize,
    /// Rows skipped for carrying the unknown-email placeholder.
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Whether `email` is the placeholder the partner uses for "no address".
pub fn is_unknown_email(email: &str) -> bool {
    email.trim().to_lowercase() == UNKNOWN_EMAIL_SENTINEL
}

fn normalize_header(name: &str) -> String {
    name.trim().trim_start_matches('\u{feff}').to_lowercase()
}

/// Position of each known column in the header row.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnMap {
    structure: Option<usize>,
    given_name: Option<usize>,
    family_name: Option<usize>,
    mail: usize,
    role_title: Option<usize>,
    role_detail: Option<usize>,
    phone: Option<usize>,
    mobile: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord) -> Result<Self, String> {
        let names: Vec<String> = headers.iter().map(normalize_header).collect();
        let find = |column: &str| {
            let wanted = normalize_header(column);
            names.iter().position(|name| *name == wanted)
        };
        let mail = find(COLUMN_MAIL)
            .ok_or_else(|| format!("header row has no {COLUMN_MAIL:?} column"))?;
        Ok(Self {
            structure: find(COLUMN_STRUCTURE),
            given_name: find(COLUMN_GIVEN_NAME),
            family_name: find(COLUMN_FAMILY_NAME),
            mail,
            role_title: find(COLUMN_ROLE_TITLE),
            role_detail: find(COLUMN_ROLE_DETAIL),
            phone: find(COLUMN_PHONE),
            mobile: find(COLUMN_MOBILE),
        })
    }

    fn contact(&self, row: &StringRecord) -> ContactRecord {
        let field = |index: Option<usize>| {
            index
                .and_then(|i| row.get(i))
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };
        ContactRecord {
            email: field(Some(self.mail)),
            structure_path: field(self.structure),
            given_name: field(self.given_name),
            family_name: field(self.family_name),
            role_title: field(self.role_title),
            role_detail: field(self.role_detail),
            phone: field(self.phone),
            mobile: field(self.mobile),
        }
    }
}

fn csv_error(e: csv::Error, fallback_line: u64) -> ImportError {
    let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
    ImportError::Row {
        line,
        message: e.to_string(),
    }
}

/// Upserts contacts from the export into a [`ContactStore`].
pub struct ContactImporter<'a> {
    store: &'a mut ContactStore,
}

impl<'a> ContactImporter<'a> {
    pub fn new(store: &'a mut ContactStore) -> Self {
        Self { store }
    }

    pub fn import(&mut self, csv_path: &Path) -> Result<ContactUpsertResult, ImportError> {
        let file = File::open(csv_path)?;
        self.import_reader(file)
    }

    pub fn import_reader<R: Read>(&mut self, reader: R) -> Result<ContactUpsertResult, ImportError> {
        let started = Instant::now();
        let mut csv = ReaderBuilder::new()
            .delimiter(DELIMITER)
            .flexible(true)
            .from_reader(reader);

        let headers = csv
            .headers()
            .map_err(|e| csv_error(e, HEADER_LINE))?
            .clone();
        let columns = ColumnMap::from_headers(&headers).map_err(|message| ImportError::Header {
            line: HEADER_LINE,
            message,
        })?;

        let batch = self
            .store
            .begin_import()
            .map_err(|source| ImportError::Storage { line: None, source })?;
        let mut result = ContactUpsertResult::default();
        let mut last_line = HEADER_LINE;

        for record in csv.records() {
            let row = record.map_err(|e| csv_error(e, last_line + 1))?;
            let line = row.position().map(|p| p.line()).unwrap_or(last_line + 1);
            last_line = line;

            let contact = columns.contact(&row);
            if is_unknown_email(&contact.email) {
                result.skipped += 1;
                continue;
            }
            if contact.email.is_empty() {
                return Err(ImportError::Row {
                    line,
                    message: format!("empty {COLUMN_MAIL} field"),
                });
            }

            let outcome = batch.upsert(&contact).map_err(|source| ImportError::Storage {
                line: Some(line),
                source,
            })?;
            match outcome {
                UpsertOutcome::Created => result.created += 1,
                UpsertOutcome::Updated => result.updated += 1,
            }
        }

        batch
            .commit()
            .map_err(|source| ImportError::Storage { line: None, source })?;

        result.imported = result.created + result.updated;
        result.elapsed = started.elapsed();
        synclog!(
            "importer: {} contact(s) imported ({} new, {} updated, {} skipped) in {:.2?}",
            result.imported,
            result.created,
            result.updated,
            result.skipped,
            result.elapsed
        );
        Ok(result)
    }
}
