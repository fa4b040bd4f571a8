//! Remote side of rdist: who to talk to, how to authenticate and how one transfer runs
//!
//! - [`target`]: `[user@]host[:port]` descriptors
//! - [`credentials`]: key or password material, resolved once per run
//! - [`transfer`]: the [`Executor`] trait and the rsync over ssh implementation
//! - [`probe`]: an executor that only checks that authentication works

pub mod credentials;
pub mod probe;
pub mod target;
pub mod transfer;

pub use credentials::{
    AuthMethod, CredentialConfig, CredentialError, CredentialProvider, Credentials, PasswordMethod,
};
pub use probe::ProbeExecutor;
pub use target::{MalformedTargetError, Target, TargetDefaults, parse_target, parse_targets};
pub use transfer::{
    AttemptOutcome, Executor, ExecutorSettings, ExitReason, RsyncExecutor, TransferSpec,
};
