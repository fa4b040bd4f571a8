//! Authentication material for transfers
//!
//! [`CredentialProvider::resolve`] turns a [`CredentialConfig`] into [`Credentials`] once, before
//! any transfer starts. The result is shared with every unit of work as an `Arc<Credentials>`;
//! the password itself lives in a [`secrecy::SecretString`], so it is zeroized on drop and
//! redacted from `Debug` output.

use secrecy::{ExposeSecret, SecretString};
use std::os::unix::fs::PermissionsExt;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AuthMethod {
    Key,
    Password,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PasswordMethod {
    /// First line of a file
    File,
    /// Named environment variable
    Env,
    /// Prompt on the terminal with echo disabled
    Interactive,
    /// Value given directly in the configuration
    Inline,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("key-based authentication selected but no key file was configured")]
    MissingKeyFile,
    #[error("key file {path} is not usable: {reason}")]
    KeyFileUnreadable { path: String, reason: String },
    #[error("password method {method} requires a password source")]
    MissingPasswordSource { method: PasswordMethod },
    #[error("failed reading password file {path}: {source}")]
    PasswordFileUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("environment variable {name} is not set")]
    EnvVarMissing { name: String },
    #[error("password obtained via {method} is empty")]
    EmptySecret { method: PasswordMethod },
    #[error("failed to prompt for password: {0}")]
    Prompt(String),
}

pub struct CredentialConfig {
    pub auth_method: AuthMethod,
    pub key_file: Option<std::path::PathBuf>,
    pub password_method: PasswordMethod,
    /// Path, env var name or inline value depending on `password_method`
    pub password_source: Option<SecretString>,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the source is only secret for the inline method, but never print it either way
        f.debug_struct("CredentialConfig")
            .field("auth_method", &self.auth_method)
            .field("key_file", &self.key_file)
            .field("password_method", &self.password_method)
            .field("password_source", &self.password_source.as_ref().map(|_| "***"))
            .finish()
    }
}

pub enum Credentials {
    Key { key_file: std::path::PathBuf },
    Password { secret: SecretString },
}

impl Credentials {
    /// Replaces any occurrence of the password in `text`
    pub fn redact(&self, text: &str) -> String {
        match self {
            Credentials::Password { secret } if !secret.expose_secret().is_empty() => {
                text.replace(secret.expose_secret().as_str(), "***")
            }
            _ => text.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Key { key_file } => f
                .debug_struct("Credentials::Key")
                .field("key_file", key_file)
                .finish(),
            Credentials::Password { .. } => f.write_str("Credentials::Password(***)"),
        }
    }
}

/// Reads one line from the terminal without echoing it
pub fn prompt_password(prompt: &str) -> Result<SecretString, CredentialError> {
    use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};
    use std::io::{BufRead, Write};
    let stdin = std::io::stdin();
    let original = tcgetattr(&stdin).map_err(|err| {
        CredentialError::Prompt(format!("stdin is not a terminal ({err})"))
    })?;
    let mut silent = original.clone();
    silent.local_flags.remove(LocalFlags::ECHO);
    silent.local_flags.insert(LocalFlags::ECHONL);
    eprint!("{prompt}");
    std::io::stderr()
        .flush()
        .map_err(|err| CredentialError::Prompt(err.to_string()))?;
    tcsetattr(&stdin, SetArg::TCSANOW, &silent)
        .map_err(|err| CredentialError::Prompt(err.to_string()))?;
    let mut line = String::new();
    let read = stdin.lock().read_line(&mut line);
    // restore echo before looking at the result
    let restored = tcsetattr(&stdin, SetArg::TCSANOW, &original);
    let secret = SecretString::new(line.trim_end_matches(['\r', '\n']).to_string());
    // `line` still holds the password, wipe it before it is freed
    secrecy::zeroize::Zeroize::zeroize(&mut line);
    read.map_err(|err| CredentialError::Prompt(err.to_string()))?;
    restored.map_err(|err| CredentialError::Prompt(err.to_string()))?;
    Ok(secret)
}

#[derive(Debug)]
pub struct CredentialProvider {
    config: CredentialConfig,
}

/// Replaces a leading `~` component with the home directory; `~user` forms are left alone.
pub fn expand_home(path: &std::path::Path) -> std::path::PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) if rest.as_os_str().is_empty() => home,
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

impl CredentialProvider {
    pub fn new(config: CredentialConfig) -> Self {
        Self { config }
    }

    #[tracing::instrument(skip(self), fields(auth_method = %self.config.auth_method))]
    pub fn resolve(&self) -> Result<Credentials, CredentialError> {
        match self.config.auth_method {
            AuthMethod::Key => self.resolve_key(),
            AuthMethod::Password => self.resolve_password(),
        }
    }

    fn resolve_key(&self) -> Result<Credentials, CredentialError> {
        let key_file = self
            .config
            .key_file
            .as_deref()
            .map(expand_home)
            .ok_or(CredentialError::MissingKeyFile)?;
        let unusable = |reason: String| CredentialError::KeyFileUnreadable {
            path: key_file.display().to_string(),
            reason,
        };
        let metadata = std::fs::metadata(&key_file).map_err(|err| unusable(err.to_string()))?;
        if !metadata.is_file() {
            return Err(unusable("not a regular file".to_string()));
        }
        std::fs::File::open(&key_file).map_err(|err| unusable(err.to_string()))?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            tracing::warn!(
                "Key file {} has permissions {:o}, broader than owner-only; ssh may refuse it (chmod 600 recommended)",
                key_file.display(),
                mode
            );
        }
        tracing::debug!("Using key file {}", key_file.display());
        Ok(Credentials::Key { key_file })
    }

    fn resolve_password(&self) -> Result<Credentials, CredentialError> {
        let method = self.config.password_method;
        let source = || {
            self.config
                .password_source
                .as_ref()
                .map(|source| source.expose_secret().as_str())
                .ok_or(CredentialError::MissingPasswordSource { method })
        };
        let secret = match method {
            PasswordMethod::File => {
                let path = source()?;
                let contents = std::fs::read_to_string(expand_home(std::path::Path::new(path)))
                    .map_err(|err| CredentialError::PasswordFileUnreadable {
                        path: path.to_string(),
                        source: err,
                    })?;
                let contents = SecretString::new(contents);
                let first_line = contents
                    .expose_secret()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim_end_matches('\r')
                    .to_string();
                SecretString::new(first_line)
            }
            PasswordMethod::Env => {
                let name = source()?;
                let value = std::env::var(name).map_err(|_| CredentialError::EnvVarMissing {
                    name: name.to_string(),
                })?;
                SecretString::new(value)
            }
            PasswordMethod::Interactive => prompt_password("SSH password: ")?,
            PasswordMethod::Inline => SecretString::new(source()?.to_string()),
        };
        if secret.expose_secret().is_empty() {
            return Err(CredentialError::EmptySecret { method });
        }
        tracing::debug!("Password obtained via {}", method);
        Ok(Credentials::Password { secret })
    }
}
