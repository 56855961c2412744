//! Picks the newest export of each kind from a remote listing and downloads it.
//!
//! Key files use a longer suffix that also ends with the data suffix
//! (`.key.encrypted` vs `.encrypted`), so data selection always excludes the
//! key suffix explicitly.
//!
//! Ties on the newest modification time go to the lexicographically greatest
//! file name, so a rerun over the same listing picks the same file.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::channel::{ChannelError, RemoteDirectory, RemoteFile};
use crate::logging;
use crate::synclog;

pub const DEFAULT_DATA_SUFFIX: &str = ".encrypted";
pub const DEFAULT_KEY_SUFFIX: &str = ".key.encrypted";

#[derive(Debug)]
pub enum SelectError {
    NotFound { dir: String, suffix: String },
    Channel(ChannelError),
    Io(std::io::Error),
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectError::NotFound { dir, suffix } => {
                write!(f, "no file ending in {suffix:?} in remote directory {dir:?}")
            }
            SelectError::Channel(e) => write!(f, "{e}"),
            SelectError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for SelectError {}

impl From<ChannelError> for SelectError {
    fn from(e: ChannelError) -> Self {
        SelectError::Channel(e)
    }
}

impl From<std::io::Error> for SelectError {
    fn from(e: std::io::Error) -> Self {
        SelectError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Data,
    Key,
}

/// The naming contract between the partner and us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSuffixes {
    pub data: String,
    pub key: String,
}

impl Default for ExportSuffixes {
    fn default() -> Self {
        Self {
            data: DEFAULT_DATA_SUFFIX.to_string(),
            key: DEFAULT_KEY_SUFFIX.to_string(),
        }
    }
}

impl ExportSuffixes {
    /// `(suffix, exclusions)` to select files of `category`.
    pub fn selection(&self, category: FileCategory) -> (&str, Vec<&str>) {
        match category {
            FileCategory::Data => (self.data.as_str(), vec![self.key.as_str()]),
            FileCategory::Key => (self.key.as_str(), Vec::new()),
        }
    }
}

/// Whether `filename` ends in `suffix` and in none of `exclude_suffixes`.
pub fn matches_suffix(filename: &str, suffix: &str, exclude_suffixes: &[&str]) -> bool {
    filename.ends_with(suffix) && !exclude_suffixes.iter().any(|ex| filename.ends_with(ex))
}

/// Newest matching file; ties go to the greatest file name.
pub fn pick_latest<'a>(
    files: &'a [RemoteFile],
    suffix: &str,
    exclude_suffixes: &[&str],
) -> Option<&'a RemoteFile> {
    files
        .iter()
        .filter(|f| matches_suffix(&f.filename, suffix, exclude_suffixes))
        .max_by(|a, b| {
            a.modified_time
                .cmp(&b.modified_time)
                .then_with(|| a.filename.cmp(&b.filename))
        })
}

/// Path of `filename` inside the remote `dir`.
pub fn remote_path(dir: &str, filename: &str) -> String {
    if dir.is_empty() {
        return filename.to_string();
    }
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        // the listing was of "/"
        format!("/{filename}")
    } else if dir == "." {
        filename.to_string()
    } else {
        format!("{dir}/{filename}")
    }
}

/// A downloaded export.
#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub remote: RemoteFile,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub bytes: u64,
}

/// List `dir`, pick the newest file ending in `suffix` (and in none of
/// `exclude_suffixes`), and download it to `local_path`.
///
/// A partial download is removed before the error is returned.
pub fn select_latest(
    channel: &mut dyn RemoteDirectory,
    dir: &str,
    suffix: &str,
    exclude_suffixes: &[&str],
    local_path: &Path,
) -> Result<SelectedFile, SelectError> {
    let listing = channel.list(dir)?;
    let candidates = listing
        .iter()
        .filter(|f| matches_suffix(&f.filename, suffix, exclude_suffixes))
        .count();
    synclog!(
        "selector: {} of {} file(s) in {} end in {}",
        candidates,
        listing.len(),
        dir,
        suffix
    );

    let chosen = pick_latest(&listing, suffix, exclude_suffixes)
        .cloned()
        .ok_or_else(|| SelectError::NotFound {
            dir: dir.to_string(),
            suffix: suffix.to_string(),
        })?;
    let path = remote_path(dir, &chosen.filename);

    let bytes = match download(channel, &path, local_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(local_path);
            return Err(e);
        }
    };
    synclog!(
        "selector: fetched {} ({} bytes, mtime {})",
        logging::file_name(&chosen.filename),
        bytes,
        chosen.modified_time
    );

    Ok(SelectedFile {
        remote: chosen,
        remote_path: path,
        local_path: local_path.to_path_buf(),
        bytes,
    })
}

fn download(
    channel: &mut dyn RemoteDirectory,
    remote_path: &str,
    local_path: &Path,
) -> Result<u64, SelectError> {
    let mut sink = BufWriter::new(File::create(local_path)?);
    let bytes = channel.fetch(remote_path, &mut sink)?;
    sink.flush()?;
    Ok(bytes)
}
