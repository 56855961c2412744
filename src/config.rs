//! Configuration for the sync run.
//!
//! Every setting is resolved once at startup, in this order of precedence:
//! CLI flag, environment variable, TOML config file, built-in default.
//! The SFTP password and the private key are only ever read from the
//! environment. The private key variable is not read here at all; the
//! pipeline loads it at unwrap time.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::channel::{HostPins, SftpSettings};
use crate::crypto::PrivateKeySource;
use crate::selector::{ExportSuffixes, DEFAULT_DATA_SUFFIX, DEFAULT_KEY_SUFFIX};

pub const ENV_CONFIG: &str = "AGRICOLL_CONFIG";
pub const ENV_HOST: &str = "AGRICOLL_SFTP_HOST";
pub const ENV_PORT: &str = "AGRICOLL_SFTP_PORT";
pub const ENV_USERNAME: &str = "AGRICOLL_SFTP_USERNAME";
pub const ENV_PASSWORD: &str = "AGRICOLL_SFTP_PASSWORD";
pub const ENV_EXPECTED_HOST: &str = "AGRICOLL_EXPECTED_HOST";
pub const ENV_PINNED_FINGERPRINTS: &str = "AGRICOLL_PINNED_FINGERPRINTS";
pub const ENV_REMOTE_DIR: &str = "AGRICOLL_REMOTE_DIR";
pub const ENV_DATA_SUFFIX: &str = "AGRICOLL_DATA_SUFFIX";
pub const ENV_KEY_SUFFIX: &str = "AGRICOLL_KEY_SUFFIX";
pub const ENV_TIMEOUT_SECS: &str = "AGRICOLL_TIMEOUT_SECS";
pub const ENV_WORK_DIR: &str = "AGRICOLL_WORK_DIR";
pub const ENV_DB: &str = "AGRICOLL_DB";
/// Base64-encoded PEM of the RSA key the partner encrypts to.
pub const ENV_PRIVATE_KEY: &str = "AGRICOLL_PRIVATE_KEY";

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REMOTE_DIR: &str = ".";
pub const DEFAULT_DB: &str = "agricoll.db";

/// Synchronize the Agricoll contact directory into the local contact store.
///
/// With no subcommand, runs the full fetch, decrypt and import pipeline.
/// Every flag can also be set through its environment variable or the
/// TOML config file.
#[derive(Parser, Debug, Default)]
#[command(name = "agricoll-sync", version, about)]
pub struct Cli {
    /// TOML config file [env: AGRICOLL_CONFIG]
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// SFTP server host [env: AGRICOLL_SFTP_HOST]
    #[arg(long)]
    pub host: Option<String>,

    /// SFTP server port [env: AGRICOLL_SFTP_PORT] [default: 22]
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// SFTP user [env: AGRICOLL_SFTP_USERNAME]
    #[arg(long, short = 'u')]
    pub username: Option<String>,

    /// Hostname the server must be reached as [env: AGRICOLL_EXPECTED_HOST] [default: --host]
    #[arg(long)]
    pub expected_host: Option<String>,

    /// Pinned host key fingerprint, `SHA256:<base64>`; repeatable
    /// [env: AGRICOLL_PINNED_FINGERPRINTS, comma separated]
    #[arg(long = "pin")]
    pub pins: Vec<String>,

    /// Remote directory holding the exports [env: AGRICOLL_REMOTE_DIR] [default: .]
    #[arg(long)]
    pub remote_dir: Option<String>,

    /// Connect and read timeout in seconds [env: AGRICOLL_TIMEOUT_SECS] [default: 30]
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory for transient run files [env: AGRICOLL_WORK_DIR] [default: system temp dir]
    #[arg(long, short = 'w')]
    pub work_dir: Option<PathBuf>,

    /// Contact database [env: AGRICOLL_DB] [default: agricoll.db]
    #[arg(long, short = 'd', global = true)]
    pub db: Option<PathBuf>,

    /// Print the run report as JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import an already decrypted export into the contact store
    Import {
        /// `;`-separated UTF-8 CSV with the partner's header row
        csv: PathBuf,
    },
}

#[derive(Debug)]
pub enum ConfigError {
    Missing {
        setting: &'static str,
        env: &'static str,
    },
    Invalid {
        setting: &'static str,
        message: String,
    },
    File {
        path: PathBuf,
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing { setting, env } => {
                write!(f, "{setting} is not configured (set {env})")
            }
            ConfigError::Invalid { setting, message } => write!(f, "invalid {setting}: {message}"),
            ConfigError::File { path, message } => {
                write!(f, "config file {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Contents of the optional TOML config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub expected_host: Option<String>,
    #[serde(default)]
    pub pinned_fingerprints: Vec<String>,
    pub remote_dir: Option<String>,
    pub data_suffix: Option<String>,
    pub key_suffix: Option<String>,
    pub timeout_secs: Option<u64>,
    pub work_dir: Option<PathBuf>,
    pub db: Option<PathBuf>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Environment lookup, injectable for tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Build a lookup over a fixed map.
pub fn map_env(vars: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key| vars.get(key).cloned().filter(|v| !v.trim().is_empty())
}

struct Layers<'a> {
    file: FileConfig,
    env: EnvLookup<'a>,
}

impl<'a> Layers<'a> {
    fn load(cli: &Cli, env: EnvLookup<'a>) -> Result<Self, ConfigError> {
        let path = cli
            .config
            .clone()
            .or_else(|| env(ENV_CONFIG).map(PathBuf::from));
        let file = match path {
            Some(path) => load_file_config(&path)?,
            None => FileConfig::default(),
        };
        Ok(Self { file, env })
    }

    fn string(&self, cli: Option<&String>, env_key: &str, file: Option<&String>) -> Option<String> {
        cli.cloned()
            .or_else(|| (self.env)(env_key))
            .or_else(|| file.cloned())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, cli: Option<&PathBuf>, env_key: &str, file: Option<&PathBuf>) -> Option<PathBuf> {
        cli.cloned()
            .or_else(|| (self.env)(env_key).map(PathBuf::from))
            .or_else(|| file.cloned())
    }

    fn number<T: std::str::FromStr>(
        &self,
        setting: &'static str,
        cli: Option<T>,
        env_key: &str,
        file: Option<T>,
    ) -> Result<Option<T>, ConfigError>
    where
        T::Err: fmt::Display,
    {
        if cli.is_some() {
            return Ok(cli);
        }
        if let Some(raw) = (self.env)(env_key) {
            return raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    setting,
                    message: format!("{raw:?}: {e}"),
                });
        }
        Ok(file)
    }

    fn db_path(&self, cli: &Cli) -> PathBuf {
        self.path(cli.db.as_ref(), ENV_DB, self.file.db.as_ref())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB))
    }
}

/// Split a pin list given as one string (commas and/or whitespace).
pub fn split_pins(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Database location alone, for commands that never touch the network.
pub fn resolve_db_path(cli: &Cli, env: EnvLookup<'_>) -> Result<PathBuf, ConfigError> {
    Ok(Layers::load(cli, env)?.db_path(cli))
}

/// Immutable settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sftp: SftpSettings,
    pub remote_dir: String,
    pub suffixes: ExportSuffixes,
    pub work_dir: PathBuf,
    pub db_path: PathBuf,
    pub private_key: PrivateKeySource,
}

impl SyncConfig {
    pub fn from_cli_and_env(cli: &Cli) -> Result<Self, ConfigError> {
        Self::resolve(cli, &process_env)
    }

    pub fn resolve(cli: &Cli, env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let layers = Layers::load(cli, env)?;
        let file = &layers.file;

        let host = layers
            .string(cli.host.as_ref(), ENV_HOST, file.host.as_ref())
            .ok_or(ConfigError::Missing {
                setting: "SFTP host",
                env: ENV_HOST,
            })?;
        let port = layers
            .number("SFTP port", cli.port, ENV_PORT, file.port)?
            .unwrap_or(DEFAULT_PORT);
        let username = layers
            .string(cli.username.as_ref(), ENV_USERNAME, file.username.as_ref())
            .ok_or(ConfigError::Missing {
                setting: "SFTP username",
                env: ENV_USERNAME,
            })?;
        let password = env(ENV_PASSWORD).map(Zeroizing::new).ok_or(ConfigError::Missing {
            setting: "SFTP password",
            env: ENV_PASSWORD,
        })?;
        let expected_host = layers
            .string(
                cli.expected_host.as_ref(),
                ENV_EXPECTED_HOST,
                file.expected_host.as_ref(),
            )
            .unwrap_or_else(|| host.clone());

        let pins = if !cli.pins.is_empty() {
            cli.pins.clone()
        } else if let Some(raw) = env(ENV_PINNED_FINGERPRINTS) {
            split_pins(&raw)
        } else {
            file.pinned_fingerprints.clone()
        };
        if pins.is_empty() {
            return Err(ConfigError::Missing {
                setting: "pinned host fingerprints",
                env: ENV_PINNED_FINGERPRINTS,
            });
        }
        let pins = HostPins::new(expected_host, &pins).map_err(|e| ConfigError::Invalid {
            setting: "pinned host fingerprints",
            message: e.to_string(),
        })?;

        let timeout_secs = layers
            .number("timeout", cli.timeout, ENV_TIMEOUT_SECS, file.timeout_secs)?
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                setting: "timeout",
                message: "must be at least one second".to_string(),
            });
        }

        let remote_dir = layers
            .string(cli.remote_dir.as_ref(), ENV_REMOTE_DIR, file.remote_dir.as_ref())
            .unwrap_or_else(|| DEFAULT_REMOTE_DIR.to_string());

        let suffixes = ExportSuffixes {
            data: layers
                .string(None, ENV_DATA_SUFFIX, file.data_suffix.as_ref())
                .unwrap_or_else(|| DEFAULT_DATA_SUFFIX.to_string()),
            key: layers
                .string(None, ENV_KEY_SUFFIX, file.key_suffix.as_ref())
                .unwrap_or_else(|| DEFAULT_KEY_SUFFIX.to_string()),
        };
        if suffixes.data == suffixes.key {
            return Err(ConfigError::Invalid {
                setting: "export suffixes",
                message: format!("data and key suffix are both {:?}", suffixes.data),
            });
        }

        let work_dir = layers
            .path(cli.work_dir.as_ref(), ENV_WORK_DIR, file.work_dir.as_ref())
            .unwrap_or_else(std::env::temp_dir);
        let db_path = layers.db_path(cli);

        Ok(Self {
            sftp: SftpSettings {
                host,
                port,
                username,
                password,
                timeout: Duration::from_secs(timeout_secs),
                pins,
            },
            remote_dir,
            suffixes,
            work_dir,
            db_path,
            private_key: PrivateKeySource::Env(ENV_PRIVATE_KEY.to_string()),
        })
    }
}
