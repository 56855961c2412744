//! Authenticated SFTP transport with strict host pinning.
//!
//! A connection is trusted only when both hold:
//!
//! 1. the host we dialled is the single configured expected hostname;
//! 2. the SHA-256 fingerprint of the host key the server presents is in the
//!    pinned allow-list.
//!
//! There is no known_hosts lookup, no trust-on-first-use and no fallback.
//! The pipeline only talks to the server through [`RemoteDirectory`], which
//! keeps the transport swappable for tests.

use std::fmt;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use ssh2::{Session, Sftp};
use zeroize::Zeroizing;

use crate::synclog;

pub const FINGERPRINT_PREFIX: &str = "SHA256:";
const SHA256_LEN: usize = 32;

#[derive(Debug)]
pub enum ChannelError {
    Configuration(String),
    /// The server rejected our credentials.
    Authentication(String),
    HostVerification(String),
    Network(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Configuration(msg) => write!(f, "channel configuration: {msg}"),
            ChannelError::Authentication(msg) => write!(f, "authentication failed: {msg}"),
            ChannelError::HostVerification(msg) => write!(f, "host verification failed: {msg}"),
            ChannelError::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ssh2::Error> for ChannelError {
    fn from(e: ssh2::Error) -> Self {
        ChannelError::Network(e.to_string())
    }
}

/// A regular file in a remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub filename: String,
    /// Seconds since the Unix epoch, as reported by the server.
    pub modified_time: u64,
    pub size: Option<u64>,
}

/// Directory operations the pipeline needs from a remote server.
pub trait RemoteDirectory {
    /// Regular files directly inside `dir`. Subdirectories are left out.
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFile>, ChannelError>;

    /// Stream the file at `remote_path` into `sink`, returning the byte count.
    fn fetch(&mut self, remote_path: &str, sink: &mut dyn Write) -> Result<u64, ChannelError>;

    /// Release the session. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), ChannelError>;
}

/// Opens a [`RemoteDirectory`]. The orchestrator only ever sees this seam.
pub trait Connector {
    fn connect(&self) -> Result<Box<dyn RemoteDirectory>, ChannelError>;
}

/// `SHA256:<base64 without padding>` of a raw SSH host key blob, the form
/// `ssh-keygen -l` prints.
pub fn fingerprint_sha256(host_key: &[u8]) -> String {
    let digest = Sha256::digest(host_key);
    format!("{FINGERPRINT_PREFIX}{}", STANDARD_NO_PAD.encode(digest))
}

/// Canonical form of a pinned fingerprint, or `None` if it is not one.
///
/// Trailing `=` padding is tolerated since some tools print it.
pub fn normalize_fingerprint(raw: &str) -> Option<String> {
    let body = raw.trim().strip_prefix(FINGERPRINT_PREFIX)?;
    let body = body.trim_end_matches('=');
    let decoded = STANDARD_NO_PAD.decode(body).ok()?;
    if decoded.len() != SHA256_LEN {
        return None;
    }
    Some(format!("{FINGERPRINT_PREFIX}{body}"))
}

/// Fingerprint of an OpenSSH public key line (`ssh-ed25519 AAAA... comment`).
pub fn fingerprint_openssh_line(line: &str) -> Result<String, ChannelError> {
    let blob = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ChannelError::Configuration("public key line has no key field".into()))?;
    let bytes = STANDARD
        .decode(blob)
        .map_err(|e| ChannelError::Configuration(format!("public key is not base64: {e}")))?;
    Ok(fingerprint_sha256(&bytes))
}

/// Expected hostname plus the pinned host-key fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPins {
    expected_host: String,
    fingerprints: Vec<String>,
}

impl HostPins {
    pub fn new<I, S>(expected_host: impl Into<String>, fingerprints: I) -> Result<Self, ChannelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let expected_host = expected_host.into().trim().to_string();
        if expected_host.is_empty() {
            return Err(ChannelError::Configuration("expected hostname is empty".into()));
        }
        let mut pins = Vec::new();
        for raw in fingerprints {
            let raw = raw.as_ref();
            let pin = normalize_fingerprint(raw).ok_or_else(|| {
                ChannelError::Configuration(format!("not a SHA256 fingerprint: {raw:?}"))
            })?;
            if !pins.contains(&pin) {
                pins.push(pin);
            }
        }
        if pins.is_empty() {
            return Err(ChannelError::Configuration(
                "no pinned host fingerprints configured".into(),
            ));
        }
        Ok(Self {
            expected_host,
            fingerprints: pins,
        })
    }

    pub fn expected_host(&self) -> &str {
        &self.expected_host
    }

    pub fn fingerprints(&self) -> &[String] {
        &self.fingerprints
    }

    /// DNS names compare case-insensitively; a trailing root dot is ignored.
    pub fn check_hostname(&self, hostname: &str) -> Result<(), ChannelError> {
        let wanted = self.expected_host.trim_end_matches('.');
        let got = hostname.trim().trim_end_matches('.');
        if got.eq_ignore_ascii_case(wanted) {
            Ok(())
        } else {
            Err(ChannelError::HostVerification(format!(
                "host {got:?} is not the expected host {wanted:?}"
            )))
        }
    }

    /// Returns the accepted fingerprint.
    pub fn check_host_key(&self, host_key: &[u8]) -> Result<String, ChannelError> {
        let fingerprint = fingerprint_sha256(host_key);
        if self.fingerprints.iter().any(|pin| *pin == fingerprint) {
            Ok(fingerprint)
        } else {
            Err(ChannelError::HostVerification(format!(
                "host key {fingerprint} is not pinned"
            )))
        }
    }

    /// Both checks; either failure rejects the host.
    pub fn verify(&self, hostname: &str, host_key: &[u8]) -> Result<String, ChannelError> {
        self.check_hostname(hostname)?;
        self.check_host_key(host_key)
    }
}

/// Everything needed to open the partner SFTP session.
#[derive(Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Zeroizing<String>,
    pub timeout: Duration,
    pub pins: HostPins,
}

impl fmt::Debug for SftpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("pins", &self.pins)
            .finish()
    }
}

/// An open, verified and authenticated SFTP session.
pub struct SftpChannel {
    sftp: Option<Sftp>,
    session: Option<Session>,
}

impl SftpChannel {
    pub fn connect(settings: &SftpSettings) -> Result<Self, ChannelError> {
        if settings.username.trim().is_empty() {
            return Err(ChannelError::Configuration("SFTP username is missing".into()));
        }
        if settings.password.is_empty() {
            return Err(ChannelError::Configuration("SFTP password is missing".into()));
        }
        settings.pins.check_hostname(&settings.host)?;

        let tcp = open_tcp(&settings.host, settings.port, settings.timeout)?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(settings.timeout));
        session.handshake()?;

        let verified = match session.host_key() {
            Some((key, _kind)) => settings.pins.check_host_key(key),
            None => Err(ChannelError::HostVerification(
                "server presented no host key".into(),
            )),
        };
        let fingerprint = match verified {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                let _ = session.disconnect(None, "host key not trusted", None);
                return Err(e);
            }
        };
        synclog!(
            "channel: {}:{} presented pinned key {}",
            settings.host,
            settings.port,
            fingerprint
        );

        if let Err(e) = session.userauth_password(&settings.username, &settings.password) {
            let _ = session.disconnect(None, "authentication failed", None);
            return Err(ChannelError::Authentication(e.message().to_string()));
        }
        if !session.authenticated() {
            let _ = session.disconnect(None, "authentication failed", None);
            return Err(ChannelError::Authentication(format!(
                "server did not accept user {}",
                settings.username
            )));
        }

        let sftp = match session.sftp() {
            Ok(sftp) => sftp,
            Err(e) => {
                let _ = session.disconnect(None, "sftp subsystem unavailable", None);
                return Err(e.into());
            }
        };
        Ok(Self {
            sftp: Some(sftp),
            session: Some(session),
        })
    }

    fn sftp(&self) -> Result<&Sftp, ChannelError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| ChannelError::Network("channel already closed".into()))
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ChannelError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| ChannelError::Network(format!("cannot resolve {host}:{port}: {e}")))?;

    let mut last_error: Option<io::Error> = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(timeout))
                    .and_then(|_| stream.set_write_timeout(Some(timeout)))
                    .map_err(|e| ChannelError::Network(e.to_string()))?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(ChannelError::Network(match last_error {
        Some(e) => format!("cannot connect to {host}:{port}: {e}"),
        None => format!("{host}:{port} resolved to no address"),
    }))
}

impl RemoteDirectory for SftpChannel {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFile>, ChannelError> {
        let entries = self
            .sftp()?
            .readdir(Path::new(dir))
            .map_err(|e| ChannelError::Network(format!("cannot list {dir}: {e}")))?;
        Ok(entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, stat)| {
                let filename = path.file_name()?.to_string_lossy().into_owned();
                Some(RemoteFile {
                    filename,
                    modified_time: stat.mtime.unwrap_or(0),
                    size: stat.size,
                })
            })
            .collect())
    }

    fn fetch(&mut self, remote_path: &str, sink: &mut dyn Write) -> Result<u64, ChannelError> {
        let mut remote = self
            .sftp()?
            .open(Path::new(remote_path))
            .map_err(|e| ChannelError::Network(format!("cannot open {remote_path}: {e}")))?;
        io::copy(&mut remote, sink)
            .map_err(|e| ChannelError::Network(format!("cannot download {remote_path}: {e}")))
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        drop(self.sftp.take());
        if let Some(session) = self.session.take() {
            session.disconnect(None, "sync complete", None)?;
        }
        Ok(())
    }
}

impl Drop for SftpChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens [`SftpChannel`]s from fixed settings.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    settings: SftpSettings,
}

impl SftpConnector {
    pub fn new(settings: SftpSettings) -> Self {
        Self { settings }
    }
}

impl Connector for SftpConnector {
    fn connect(&self) -> Result<Box<dyn RemoteDirectory>, ChannelError> {
        let channel = SftpChannel::connect(&self.settings)?;
        Ok(Box::new(channel))
    }
}
