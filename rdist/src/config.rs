//! TOML configuration file and its merge with command line values
//!
//! Precedence, highest first: command line, the selected `[tasks.<name>]` table, top level keys
//! of the file, built-in defaults.

use remote::{AuthMethod, CredentialConfig, PasswordMethod, TargetDefaults, TransferSpec};
use secrecy::SecretString;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_CONNECT_TIMEOUT_SEC: u64 = 10;
pub const DEFAULT_TRANSFER_TIMEOUT_SEC: u64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SEC: u64 = 5;
pub const DEFAULT_CANCEL_GRACE_SEC: u64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the user configuration directory")]
    NoConfigDir,
    #[error("configuration file {path} does not exist")]
    NotFound { path: String },
    #[error("failed reading configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("{path} already exists, use --force to overwrite it")]
    Exists { path: String },
    #[error("failed writing configuration file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown task {name:?}, known tasks: {known}")]
    UnknownTask { name: String, known: String },
    #[error("both a source and a destination path are required (positionally or via --task)")]
    MissingTransferPaths,
    #[error("no targets given, use --host, --hosts-file, a task or `targets` in the config file")]
    NoTargets,
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A named transfer, `[tasks.<name>]`
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub targets: Vec<String>,
    pub delete_extraneous: Option<bool>,
    pub compress: Option<bool>,
}

/// Every setting is optional so that file and command line layers can be merged.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub auth_method: Option<AuthMethod>,
    pub key_file: Option<std::path::PathBuf>,
    pub password_method: Option<PasswordMethod>,
    pub password_source: Option<SecretString>,
    pub default_user: Option<String>,
    pub default_port: Option<u16>,
    pub concurrency: Option<usize>,
    pub connect_timeout_sec: Option<u64>,
    pub transfer_timeout_sec: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_delay_sec: Option<u64>,
    pub delete_extraneous: Option<bool>,
    pub compress: Option<bool>,
    pub cancel_grace_sec: Option<u64>,
    pub source: Option<String>,
    pub destination: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub tasks: std::collections::BTreeMap<String, TaskConfig>,
}

pub fn default_path() -> Result<std::path::PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("rdist").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

impl FileConfig {
    pub fn parse(contents: &str, path: &std::path::Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Loads `explicit`, or the default path if none was given.
    ///
    /// A missing file at the default path is not an error, a missing explicit file is.
    pub fn load(explicit: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Ok(path) => path,
                Err(_) => return Ok(Self::default()),
            },
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                if explicit.is_some() {
                    return Err(ConfigError::NotFound {
                        path: path.display().to_string(),
                    });
                }
                tracing::debug!("No configuration file at {}", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        tracing::debug!("Loaded configuration from {}", path.display());
        Self::parse(&contents, &path)
    }

    /// Applies `[tasks.<name>]` on top of the top level keys.
    pub fn with_task(mut self, name: &str) -> Result<Self, ConfigError> {
        let Some(task) = self.tasks.get(name).cloned() else {
            return Err(ConfigError::UnknownTask {
                name: name.to_string(),
                known: if self.tasks.is_empty() {
                    "none".to_string()
                } else {
                    self.tasks.keys().cloned().collect::<Vec<_>>().join(", ")
                },
            });
        };
        self.source = Some(task.source);
        self.destination = Some(task.destination);
        if !task.targets.is_empty() {
            self.targets = task.targets;
        }
        self.delete_extraneous = task.delete_extraneous.or(self.delete_extraneous);
        self.compress = task.compress.or(self.compress);
        Ok(self)
    }

    /// Values present in `overrides` win.
    pub fn merge(self, overrides: FileConfig) -> FileConfig {
        let mut tasks = self.tasks;
        tasks.extend(overrides.tasks);
        FileConfig {
            auth_method: overrides.auth_method.or(self.auth_method),
            key_file: overrides.key_file.or(self.key_file),
            password_method: overrides.password_method.or(self.password_method),
            password_source: overrides.password_source.or(self.password_source),
            default_user: overrides.default_user.or(self.default_user),
            default_port: overrides.default_port.or(self.default_port),
            concurrency: overrides.concurrency.or(self.concurrency),
            connect_timeout_sec: overrides.connect_timeout_sec.or(self.connect_timeout_sec),
            transfer_timeout_sec: overrides.transfer_timeout_sec.or(self.transfer_timeout_sec),
            max_attempts: overrides.max_attempts.or(self.max_attempts),
            retry_delay_sec: overrides.retry_delay_sec.or(self.retry_delay_sec),
            delete_extraneous: overrides.delete_extraneous.or(self.delete_extraneous),
            compress: overrides.compress.or(self.compress),
            cancel_grace_sec: overrides.cancel_grace_sec.or(self.cancel_grace_sec),
            source: overrides.source.or(self.source),
            destination: overrides.destination.or(self.destination),
            targets: if overrides.targets.is_empty() {
                self.targets
            } else {
                overrides.targets
            },
            tasks,
        }
    }
}

/// Fully resolved settings for one run
#[derive(Debug)]
pub struct Settings {
    pub credentials: CredentialConfig,
    pub defaults: TargetDefaults,
    pub target_descriptors: Vec<String>,
    /// `None` only when paths weren't required (`--test-auth`)
    pub transfer: Option<TransferSpec>,
    pub concurrency: usize,
    pub connect_timeout: std::time::Duration,
    pub transfer_timeout: std::time::Duration,
    pub max_attempts: u32,
    pub retry_delay: std::time::Duration,
    pub cancel_grace: std::time::Duration,
}

impl Settings {
    pub fn resolve(config: FileConfig, require_paths: bool) -> Result<Self, ConfigError> {
        let concurrency = config.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        let max_attempts = config.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, value) in [
            ("connect_timeout_sec", config.connect_timeout_sec),
            ("transfer_timeout_sec", config.transfer_timeout_sec),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be at least 1 second".to_string(),
                });
            }
        }
        let mut defaults = TargetDefaults::default();
        if let Some(user) = config.default_user.filter(|user| !user.is_empty()) {
            defaults.user = user;
        }
        match config.default_port {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: "default_port",
                    reason: "must be in 1-65535".to_string(),
                });
            }
            Some(port) => defaults.port = port,
            None => {}
        }
        let transfer = match (config.source, config.destination) {
            (Some(source_path), Some(destination_path)) => Some(TransferSpec {
                source_path,
                destination_path,
                delete_extraneous: config.delete_extraneous.unwrap_or(false),
                compress: config.compress.unwrap_or(false),
            }),
            (None, None) if !require_paths => None,
            _ => return Err(ConfigError::MissingTransferPaths),
        };
        if config.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let seconds = std::time::Duration::from_secs;
        Ok(Self {
            credentials: CredentialConfig {
                auth_method: config.auth_method.unwrap_or(AuthMethod::Key),
                key_file: config.key_file,
                password_method: config
                    .password_method
                    .unwrap_or(PasswordMethod::Interactive),
                password_source: config.password_source,
            },
            defaults,
            target_descriptors: config.targets,
            transfer,
            concurrency,
            connect_timeout: seconds(
                config
                    .connect_timeout_sec
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SEC),
            ),
            transfer_timeout: seconds(
                config
                    .transfer_timeout_sec
                    .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_SEC),
            ),
            max_attempts,
            retry_delay: seconds(config.retry_delay_sec.unwrap_or(DEFAULT_RETRY_DELAY_SEC)),
            cancel_grace: seconds(config.cancel_grace_sec.unwrap_or(DEFAULT_CANCEL_GRACE_SEC)),
        })
    }
}

pub const TEMPLATE: &str = r#"# rdist configuration
#
# Command line options override the values below; a selected task overrides the
# top level keys.

# Authentication: "key" or "password"
auth_method = "key"
# key_file = "~/.ssh/id_ed25519"

# Password acquisition: "file", "env", "interactive" or "inline"
# password_method = "env"
# Path for "file", variable name for "env", the password itself for "inline"
# password_source = "RDIST_PASSWORD"

# Used when a target omits user@ or :port
# default_user = "root"
default_port = 22

# Transfers running at the same time
concurrency = 4
connect_timeout_sec = 10
transfer_timeout_sec = 300
max_attempts = 3
retry_delay_sec = 5
# Time given to running transfers between SIGTERM and SIGKILL on interrupt
cancel_grace_sec = 3

# Remove files at the destination that are not in the source
delete_extraneous = false
compress = false

# Targets, [user@]host[:port]
targets = [
  # "deploy@web1.example.com",
  # "web2.example.com:2222",
]

# Named transfers, selected with --task NAME
# [tasks.app]
# source = "/srv/release/app/"
# destination = "/opt/app"
# targets = ["web1", "web2"]
# delete_extraneous = true
"#;

/// Writes [`TEMPLATE`] to `path`, refusing to overwrite an existing file unless `force` is set.
pub fn write_template(path: &std::path::Path, force: bool) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    if path.exists() && !force {
        return Err(ConfigError::Exists {
            path: path.display().to_string(),
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }
    std::fs::write(path, TEMPLATE).map_err(write_error)?;
    Ok(())
}
