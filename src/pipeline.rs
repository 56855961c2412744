//! One sync run: connect, select, unwrap, decrypt, import, clean up.
//!
//! Stages run strictly in order on the calling thread. The first failure
//! skips the remaining stages, cleanup always runs, and a cleanup failure is
//! logged without replacing the original error.
//!
//! Transient files live in a per-run `agricoll-run-*` directory under the
//! work directory. Only resources that were actually acquired are released,
//! so a failed connect never tries to close a channel that does not exist.
//! The symmetric key never touches the disk.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tempfile::TempDir;

use crate::channel::{ChannelError, Connector, RemoteDirectory, RemoteFile};
use crate::config::SyncConfig;
use crate::crypto::{CryptoError, CryptoProvider, PrivateKeySource};
use crate::importer::{ContactImporter, ContactUpsertResult, ImportError};
use crate::logging;
use crate::selector::{select_latest, ExportSuffixes, FileCategory, SelectError};
use crate::storage::{ContactStore, StorageError};
use crate::synclog;

pub const RUN_DIR_PREFIX: &str = "agricoll-run-";
pub const LOCK_FILE: &str = "agricoll-sync.lock";
/// A lock older than this is assumed to belong to a killed run.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(12 * 3600);

const DATA_FILE: &str = "export.encrypted";
const KEY_FILE: &str = "export.key.encrypted";
const PLAINTEXT_FILE: &str = "export.csv";

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Connecting,
    Selecting,
    Unwrapping,
    Decrypting,
    Importing,
    CleaningUp,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Connecting => "connecting",
            RunState::Selecting => "selecting",
            RunState::Unwrapping => "unwrapping",
            RunState::Decrypting => "decrypting",
            RunState::Importing => "importing",
            RunState::CleaningUp => "cleaning_up",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    /// Forward-only transitions. Every working stage may jump straight to
    /// cleanup; only cleanup reaches a terminal state.
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Connecting, Selecting)
                | (Selecting, Unwrapping)
                | (Unwrapping, Decrypting)
                | (Decrypting, Importing)
                | (Connecting | Selecting | Unwrapping | Decrypting | Importing, CleaningUp)
                | (CleaningUp, Succeeded | Failed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one run, with the states it went through.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    state: RunState,
    history: Vec<RunState>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            state: RunState::Connecting,
            history: vec![RunState::Connecting],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// Move to `next`. Returns false and stays put on a backward or skipping move.
    pub fn advance(&mut self, next: RunState) -> bool {
        if !self.state.can_advance_to(next) {
            synclog!(
                "pipeline: refused transition {} -> {}",
                self.state,
                next
            );
            return false;
        }
        synclog!(
            "pipeline: {} -> {}",
            logging::stage(self.state.as_str()),
            logging::stage(next.as_str())
        );
        self.state = next;
        self.history.push(next);
        true
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    HostVerification,
    Network,
    NotFound,
    Decryption,
    Import,
    Io,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration error",
            FailureKind::HostVerification => "host verification error",
            FailureKind::Network => "network error",
            FailureKind::NotFound => "not found",
            FailureKind::Decryption => "decryption error",
            FailureKind::Import => "import error",
            FailureKind::Io => "io error",
        }
    }

    /// Process exit status for the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Configuration => 2,
            FailureKind::HostVerification => 3,
            FailureKind::Network => 4,
            FailureKind::NotFound => 5,
            FailureKind::Decryption => 6,
            FailureKind::Import => 7,
            FailureKind::Io => 1,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first fatal error of a run, tagged with the stage it came from.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub stage: RunState,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.kind, self.message)
    }
}

impl std::error::Error for PipelineError {}

/// Maps a component error onto the run's failure taxonomy.
pub trait Classify: fmt::Display {
    fn kind(&self) -> FailureKind;
}

impl Classify for ChannelError {
    fn kind(&self) -> FailureKind {
        match self {
            ChannelError::Configuration(_) | ChannelError::Authentication(_) => {
                FailureKind::Configuration
            }
            ChannelError::HostVerification(_) => FailureKind::HostVerification,
            ChannelError::Network(_) => FailureKind::Network,
        }
    }
}

impl Classify for SelectError {
    fn kind(&self) -> FailureKind {
        match self {
            SelectError::NotFound { .. } => FailureKind::NotFound,
            SelectError::Channel(e) => e.kind(),
            SelectError::Io(_) => FailureKind::Io,
        }
    }
}

impl Classify for CryptoError {
    fn kind(&self) -> FailureKind {
        if self.is_configuration() {
            FailureKind::Configuration
        } else if matches!(self, CryptoError::Io(_)) {
            FailureKind::Io
        } else {
            FailureKind::Decryption
        }
    }
}

impl Classify for ImportError {
    fn kind(&self) -> FailureKind {
        FailureKind::Import
    }
}

/// Outside an import (where it is wrapped in [`ImportError`]) a storage
/// error means the database file itself is unusable.
impl Classify for StorageError {
    fn kind(&self) -> FailureKind {
        FailureKind::Io
    }
}

impl Classify for io::Error {
    fn kind(&self) -> FailureKind {
        FailureKind::Io
    }
}

impl Classify for LockError {
    fn kind(&self) -> FailureKind {
        match self {
            LockError::Held(_) => FailureKind::Configuration,
            LockError::Io(_) => FailureKind::Io,
        }
    }
}

fn at<E: Classify>(stage: RunState) -> impl FnOnce(E) -> PipelineError {
    move |e| PipelineError {
        stage,
        kind: e.kind(),
        message: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Run-scoped resources
// ---------------------------------------------------------------------------

/// A release step that failed. Logged and reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub artifact: String,
    pub message: String,
}

impl CleanupFailure {
    fn new(artifact: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            artifact: artifact.into(),
            message: error.to_string(),
        }
    }
}

/// Per-run scratch directory. Every file handed out by [`Workspace::track`]
/// is deleted by [`Workspace::cleanup`]; if cleanup is never reached the
/// directory is still removed when the workspace is dropped.
pub struct Workspace {
    dir: TempDir,
    artifacts: Vec<PathBuf>,
}

impl Workspace {
    pub fn create(work_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(work_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(RUN_DIR_PREFIX)
            .tempdir_in(work_dir)?;
        Ok(Self {
            dir,
            artifacts: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a transient file, registered for deletion.
    pub fn track(&mut self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path.clone());
        }
        path
    }

    pub fn cleanup(self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for artifact in &self.artifacts {
            match fs::remove_file(artifact) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => failures.push(CleanupFailure::new(artifact.display().to_string(), e)),
            }
        }
        let dir_name = self.dir.path().display().to_string();
        if let Err(e) = self.dir.close() {
            failures.push(CleanupFailure::new(dir_name, e));
        }
        failures
    }
}

#[derive(Debug)]
pub enum LockError {
    Held(PathBuf),
    Io(io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Held(path) => write!(
                f,
                "another run holds {} (remove it if no run is active)",
                path.display()
            ),
            LockError::Io(e) => write!(f, "cannot take run lock: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Advisory lock keeping two runs from sharing a work directory.
#[derive(Debug)]
pub struct RunLock {
    path: Option<PathBuf>,
}

impl RunLock {
    pub fn acquire(work_dir: &Path) -> Result<Self, LockError> {
        fs::create_dir_all(work_dir).map_err(LockError::Io)?;
        let path = work_dir.join(LOCK_FILE);
        match Self::create(&path) {
            Ok(lock) => Ok(lock),
            Err(LockError::Held(_)) if lock_is_stale(&path) => {
                synclog!("pipeline: replacing stale lock {}", path.display());
                fs::remove_file(&path).map_err(LockError::Io)?;
                Self::create(&path)
            }
            Err(e) => Err(e),
        }
    }

    fn create(path: &Path) -> Result<Self, LockError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held(path.to_path_buf()))
            }
            Err(e) => return Err(LockError::Io(e)),
        };
        let lock = Self {
            path: Some(path.to_path_buf()),
        };
        writeln!(file, "{}", std::process::id()).map_err(LockError::Io)?;
        Ok(lock)
    }

    pub fn release(mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => fs::remove_file(path),
            None => Ok(()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(path);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Remove run directories left behind by killed runs. Errors are logged and
/// otherwise ignored. Only call while holding the [`RunLock`].
pub fn sweep_stale_runs(work_dir: &Path) -> usize {
    let entries = match fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_run_dir = name.to_string_lossy().starts_with(RUN_DIR_PREFIX)
            && entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_run_dir {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => synclog!(
                "pipeline: ignoring leftover {}: {}",
                entry.path().display(),
                e
            ),
        }
    }
    if removed > 0 {
        synclog!("pipeline: swept {} leftover run dir(s)", removed);
    }
    removed
}

/// The two downloaded files of one run. Never outlives the run.
#[derive(Debug, Clone)]
pub struct EncryptedBundle {
    pub encrypted_data_path: PathBuf,
    pub encrypted_key_path: PathBuf,
    pub data_file: RemoteFile,
    pub key_file: RemoteFile,
    pub fetched_at: SystemTime,
}

/// What the run acquired, so cleanup releases exactly that.
#[derive(Default)]
struct RunResources {
    lock: Option<RunLock>,
    workspace: Option<Workspace>,
    channel: Option<Box<dyn RemoteDirectory>>,
}

impl RunResources {
    fn release(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                failures.push(CleanupFailure::new("channel", e));
            }
        }
        if let Some(workspace) = self.workspace.take() {
            failures.extend(workspace.cleanup());
        }
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                failures.push(CleanupFailure::new(LOCK_FILE, e));
            }
        }
        for failure in &failures {
            synclog!("cleanup: {}: {}", failure.artifact, failure.message);
        }
        failures
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub data_file: String,
    pub key_file: String,
    /// When both exports finished downloading.
    pub fetched_at: SystemTime,
    pub import: ContactUpsertResult,
    pub elapsed: Duration,
    pub states: Vec<RunState>,
    pub cleanup_failures: Vec<CleanupFailure>,
}

/// Run settings that are not owned by the transport.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub remote_dir: String,
    pub suffixes: ExportSuffixes,
    pub work_dir: PathBuf,
    pub private_key: PrivateKeySource,
}

impl From<&SyncConfig> for PipelineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            remote_dir: config.remote_dir.clone(),
            suffixes: config.suffixes.clone(),
            work_dir: config.work_dir.clone(),
            private_key: config.private_key.clone(),
        }
    }
}

pub struct Pipeline<'a> {
    connector: &'a dyn Connector,
    crypto: &'a dyn CryptoProvider,
    settings: PipelineSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        connector: &'a dyn Connector,
        crypto: &'a dyn CryptoProvider,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            connector,
            crypto,
            settings,
        }
    }

    /// Execute one full run against `store`.
    pub fn run(&self, store: &mut ContactStore) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut run = PipelineRun::new();
        let mut resources = RunResources::default();
        synclog!(
            "pipeline: run started, remote dir {}, work dir {}",
            self.settings.remote_dir,
            self.settings.work_dir.display()
        );

        let outcome = self.execute(&mut run, &mut resources, store);

        run.advance(RunState::CleaningUp);
        let cleanup_failures = resources.release();

        match outcome {
            Ok((bundle, import)) => {
                run.advance(RunState::Succeeded);
                let report = RunReport {
                    data_file: bundle.data_file.filename,
                    key_file: bundle.key_file.filename,
                    fetched_at: bundle.fetched_at,
                    import,
                    elapsed: started.elapsed(),
                    states: run.history().to_vec(),
                    cleanup_failures,
                };
                synclog!(
                    "pipeline: run succeeded with {} + {}: {} imported, {} skipped in {:.2?}",
                    logging::file_name(&report.data_file),
                    logging::file_name(&report.key_file),
                    report.import.imported,
                    report.import.skipped,
                    report.elapsed
                );
                Ok(report)
            }
            Err(error) => {
                run.advance(RunState::Failed);
                synclog!("pipeline: run failed: {}", error);
                Err(error)
            }
        }
    }

    fn execute(
        &self,
        run: &mut PipelineRun,
        resources: &mut RunResources,
        store: &mut ContactStore,
    ) -> Result<(EncryptedBundle, ContactUpsertResult), PipelineError> {
        let settings = &self.settings;

        // Connecting: everything that can fail without the network goes first.
        settings
            .private_key
            .preflight()
            .map_err(at(run.state()))?;
        let lock = RunLock::acquire(&settings.work_dir).map_err(at(run.state()))?;
        resources.lock = Some(lock);
        sweep_stale_runs(&settings.work_dir);
        let workspace = Workspace::create(&settings.work_dir).map_err(at(run.state()))?;
        let workspace = resources.workspace.insert(workspace);
        let channel = self.connector.connect().map_err(at(run.state()))?;
        let channel = resources.channel.insert(channel);

        run.advance(RunState::Selecting);
        let data_path = workspace.track(DATA_FILE);
        let (suffix, excludes) = settings.suffixes.selection(FileCategory::Data);
        let data = select_latest(
            channel.as_mut(),
            &settings.remote_dir,
            suffix,
            &excludes,
            &data_path,
        )
        .map_err(at(run.state()))?;
        let key_path = workspace.track(KEY_FILE);
        let (suffix, excludes) = settings.suffixes.selection(FileCategory::Key);
        let key = select_latest(
            channel.as_mut(),
            &settings.remote_dir,
            suffix,
            &excludes,
            &key_path,
        )
        .map_err(at(run.state()))?;
        let bundle = EncryptedBundle {
            encrypted_data_path: data.local_path,
            encrypted_key_path: key.local_path,
            data_file: data.remote,
            key_file: key.remote,
            fetched_at: SystemTime::now(),
        };

        run.advance(RunState::Unwrapping);
        let wrapped = fs::read(&bundle.encrypted_key_path).map_err(at(run.state()))?;
        let symmetric_key = self
            .crypto
            .unwrap(&settings.private_key, &wrapped)
            .map_err(at(run.state()))?;

        run.advance(RunState::Decrypting);
        let plaintext_path = workspace.track(PLAINTEXT_FILE);
        let decrypted = self
            .crypto
            .decrypt(&bundle.encrypted_data_path, &symmetric_key, &plaintext_path);
        drop(symmetric_key);
        let plaintext = decrypted.map_err(at(run.state()))?;

        run.advance(RunState::Importing);
        let import = ContactImporter::new(store)
            .import(&plaintext)
            .map_err(at(run.state()))?;

        Ok((bundle, import))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_forward_only() {
        let mut run = PipelineRun::new();
        for next in [
            RunState::Selecting,
            RunState::Unwrapping,
            RunState::Decrypting,
            RunState::Importing,
            RunState::CleaningUp,
            RunState::Succeeded,
        ] {
            assert!(run.advance(next));
        }
        assert!(run.state().is_terminal());
        assert!(!run.advance(RunState::Connecting));
        assert_eq!(run.history().len(), 7);
    }

    #[test]
    fn failure_jumps_to_cleanup_then_failed() {
        let mut run = PipelineRun::new();
        assert!(run.advance(RunState::Selecting));
        assert!(!run.advance(RunState::Failed));
        assert!(!run.advance(RunState::Decrypting));
        assert!(run.advance(RunState::CleaningUp));
        assert!(!run.advance(RunState::Importing));
        assert!(run.advance(RunState::Failed));
        assert_eq!(run.state(), RunState::Failed);
    }

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let kinds = [
            FailureKind::Configuration,
            FailureKind::HostVerification,
            FailureKind::Network,
            FailureKind::NotFound,
            FailureKind::Decryption,
            FailureKind::Import,
            FailureKind::Io,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn classifies_component_errors() {
        assert_eq!(
            ChannelError::HostVerification("x".into()).kind(),
            FailureKind::HostVerification
        );
        assert_eq!(
            ChannelError::Authentication("x".into()).kind(),
            FailureKind::Configuration
        );
        assert_eq!(CryptoError::BadDecrypt.kind(), FailureKind::Decryption);
        assert_eq!(
            CryptoError::MissingPrivateKey("K".into()).kind(),
            FailureKind::Configuration
        );
        let not_found = SelectError::NotFound {
            dir: ".".into(),
            suffix: ".encrypted".into(),
        };
        assert_eq!(not_found.kind(), FailureKind::NotFound);
    }

    #[test]
    fn unopenable_database_is_an_io_failure() {
        let root = TempDir::new().unwrap();
        let blocker = root.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let err = match ContactStore::open(&blocker.join("agricoll.db")) {
            Ok(_) => panic!("database under a regular file must not open"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), FailureKind::Io);
        assert_eq!(err.kind().exit_code(), 1);
    }

    #[test]
    fn workspace_cleanup_removes_everything() {
        let root = TempDir::new().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        let tracked = workspace.track("a.bin");
        fs::write(&tracked, b"secret").unwrap();
        let untracked = workspace.path().join("stray");
        fs::write(&untracked, b"x").unwrap();
        let _ = workspace.track("never-written");
        let dir = workspace.path().to_path_buf();

        assert!(workspace.cleanup().is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn second_lock_is_refused_until_released() {
        let root = TempDir::new().unwrap();
        let lock = RunLock::acquire(root.path()).unwrap();
        assert!(matches!(
            RunLock::acquire(root.path()),
            Err(LockError::Held(_))
        ));
        lock.release().unwrap();
        let again = RunLock::acquire(root.path()).unwrap();
        drop(again);
        assert!(!root.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn sweeps_only_run_directories() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join(format!("{RUN_DIR_PREFIX}old"))).unwrap();
        fs::write(
            root.path().join(format!("{RUN_DIR_PREFIX}old")).join("export.csv"),
            b"stale",
        )
        .unwrap();
        fs::create_dir(root.path().join("keep-me")).unwrap();
        fs::write(root.path().join(format!("{RUN_DIR_PREFIX}file")), b"").unwrap();

        assert_eq!(sweep_stale_runs(root.path()), 1);
        assert!(root.path().join("keep-me").exists());
        assert!(root.path().join(format!("{RUN_DIR_PREFIX}file")).exists());
    }
}
