#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use agricoll_sync::channel::{ChannelError, Connector, RemoteDirectory, RemoteFile};
use agricoll_sync::crypto::PrivateKeySource;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture(name)).expect("read fixture")
}

/// The recipient key as the pipeline receives it: base64 of the PEM.
pub fn key_source(pem_fixture: &str) -> PrivateKeySource {
    PrivateKeySource::inline(STANDARD.encode(fixture_bytes(pem_fixture)))
}

/// A remote directory held in memory. Counts how often it was closed.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    pub files: Vec<(RemoteFile, Vec<u8>)>,
    pub closes: Arc<AtomicUsize>,
    pub fail_fetch: bool,
    pub fail_close: bool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, mtime: u64, contents: Vec<u8>) -> Self {
        let remote = RemoteFile {
            filename: name.to_string(),
            modified_time: mtime,
            size: Some(contents.len() as u64),
        };
        self.files.push((remote, contents));
        self
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl RemoteDirectory for MemoryDirectory {
    fn list(&mut self, _dir: &str) -> Result<Vec<RemoteFile>, ChannelError> {
        Ok(self.files.iter().map(|(f, _)| f.clone()).collect())
    }

    fn fetch(&mut self, remote_path: &str, sink: &mut dyn Write) -> Result<u64, ChannelError> {
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        let (_, contents) = self
            .files
            .iter()
            .find(|(f, _)| f.filename == name)
            .ok_or_else(|| ChannelError::Network(format!("no such file {remote_path}")))?;
        if self.fail_fetch {
            sink.write_all(&contents[..contents.len() / 2])
                .map_err(|e| ChannelError::Network(e.to_string()))?;
            return Err(ChannelError::Network("connection reset".into()));
        }
        sink.write_all(contents)
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        Ok(contents.len() as u64)
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(ChannelError::Network("disconnect timed out".into()));
        }
        Ok(())
    }
}

/// Hands out clones of one [`MemoryDirectory`], sharing its close counter.
pub struct MemoryConnector {
    pub dir: MemoryDirectory,
    pub connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(dir: MemoryDirectory) -> Self {
        Self {
            dir,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<Box<dyn RemoteDirectory>, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.dir.clone()))
    }
}

/// Fails the connection the way a pin mismatch does.
pub struct RejectingConnector;

impl Connector for RejectingConnector {
    fn connect(&self) -> Result<Box<dyn RemoteDirectory>, ChannelError> {
        Err(ChannelError::HostVerification(
            "host key SHA256:AAAA is not pinned".into(),
        ))
    }
}

/// The fixture export as the partner publishes it.
pub fn partner_directory() -> MemoryDirectory {
    MemoryDirectory::new()
        .with_file("export-old.csv.encrypted", 100, b"stale".to_vec())
        .with_file("export-old.csv.key.encrypted", 100, b"stale".to_vec())
        .with_file("export.csv.encrypted", 200, fixture_bytes("export.csv.encrypted"))
        .with_file("export.csv.key.encrypted", 200, fixture_bytes("export.key.encrypted"))
        .with_file("readme.txt", 300, b"hello".to_vec())
}
