use serde::Serialize;
use std::sync::LazyLock;

pub const DEFAULT_SSH_PORT: u16 = 22;

static HOST_PORT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^(?:\[(?P<v6>[^\[\]]*)\]|(?P<host>[^:\[\]]*))(?::(?P<port>[^:]*))?$")
        .expect("host/port regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedTargetError {
    #[error("empty target descriptor")]
    Empty,
    #[error("target {descriptor:?}: empty user before '@'")]
    EmptyUser { descriptor: String },
    #[error("target {descriptor:?}: empty host")]
    EmptyHost { descriptor: String },
    #[error("target {descriptor:?}: invalid host")]
    InvalidHost { descriptor: String },
    #[error("target {descriptor:?}: invalid port {port:?}, expected a number in 1-65535")]
    InvalidPort { descriptor: String, port: String },
}

/// Values used when a descriptor omits `user@` or `:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDefaults {
    pub user: String,
    pub port: u16,
}

impl Default for TargetDefaults {
    fn default() -> Self {
        Self {
            user: std::env::var("USER")
                .ok()
                .filter(|user| !user.is_empty())
                .unwrap_or_else(|| "root".to_string()),
            port: DEFAULT_SSH_PORT,
        }
    }
}

/// One remote destination. Identity is `(user, host, port)`; `raw` only records what the
/// operator typed.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub raw: String,
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user && self.host == other.host && self.port == other.port
    }
}

impl Eq for Target {}

impl std::hash::Hash for Target {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.user.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl Target {
    fn bracketed_host(&self) -> std::borrow::Cow<'_, str> {
        if self.host.contains(':') {
            format!("[{}]", self.host).into()
        } else {
            self.host.as_str().into()
        }
    }

    /// `user@host:path` as understood by rsync/scp (port is passed separately)
    pub fn remote_spec(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.bracketed_host(), path)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.bracketed_host(), self.port)
    }
}

/// Parses `[user@]host[:port]`.
///
/// IPv6 literals need brackets when combined with a port (`[::1]:2222`); an unbracketed literal
/// such as `fe80::1` is taken as a host without port.
pub fn parse_target(
    descriptor: &str,
    defaults: &TargetDefaults,
) -> Result<Target, MalformedTargetError> {
    let trimmed = descriptor.trim();
    if trimmed.is_empty() {
        return Err(MalformedTargetError::Empty);
    }
    let malformed_descriptor = || trimmed.to_string();
    let (user, rest) = match trimmed.split_once('@') {
        Some(("", _)) => {
            return Err(MalformedTargetError::EmptyUser {
                descriptor: malformed_descriptor(),
            });
        }
        Some((user, rest)) => (user.to_string(), rest),
        None => (defaults.user.clone(), trimmed),
    };
    if rest.contains('@') {
        return Err(MalformedTargetError::InvalidHost {
            descriptor: malformed_descriptor(),
        });
    }
    let (host, port) = match HOST_PORT_RE.captures(rest) {
        Some(captures) => {
            let host = captures
                .name("v6")
                .or_else(|| captures.name("host"))
                .map_or("", |m| m.as_str());
            (host, captures.name("port").map(|m| m.as_str()))
        }
        None if rest.parse::<std::net::Ipv6Addr>().is_ok() => (rest, None),
        None => {
            return Err(MalformedTargetError::InvalidHost {
                descriptor: malformed_descriptor(),
            });
        }
    };
    if host.is_empty() {
        return Err(MalformedTargetError::EmptyHost {
            descriptor: malformed_descriptor(),
        });
    }
    let port = match port {
        None => defaults.port,
        Some(port_str) => match port_str.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                return Err(MalformedTargetError::InvalidPort {
                    descriptor: malformed_descriptor(),
                    port: port_str.to_string(),
                });
            }
        },
    };
    Ok(Target {
        user,
        host: host.to_string(),
        port,
        raw: trimmed.to_string(),
    })
}

/// Parses an ordered list of descriptors.
///
/// Blank lines and `#` comments are skipped, later duplicates of an already listed target are
/// dropped, malformed entries are returned separately so the batch can continue without them.
pub fn parse_targets<I, S>(
    descriptors: I,
    defaults: &TargetDefaults,
) -> (Vec<Target>, Vec<MalformedTargetError>)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut targets: Vec<Target> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut errors = Vec::new();
    for descriptor in descriptors {
        let descriptor = descriptor.as_ref().trim();
        if descriptor.is_empty() || descriptor.starts_with('#') {
            continue;
        }
        match parse_target(descriptor, defaults) {
            Ok(target) => {
                if seen.insert(target.clone()) {
                    targets.push(target);
                } else {
                    tracing::warn!(
                        "Skipping duplicate target {:?} (same as {})",
                        descriptor,
                        target
                    );
                }
            }
            Err(error) => errors.push(error),
        }
    }
    (targets, errors)
}

/// Reads one descriptor per line
pub fn read_targets_file(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
    use anyhow::Context;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading hosts file {}", path.display()))?;
    Ok(contents.lines().map(str::to_string).collect())
}
