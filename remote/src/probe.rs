//! Authentication-only check used by `rdist --test-auth`

use crate::credentials::Credentials;
use crate::target::Target;
use crate::transfer::{
    AttemptOutcome, ExecutorSettings, ExitReason, TransferSpec, classify, outcome_from_child,
    run_child,
};

/// Logs in and runs `true` on the remote host. Never touches the filesystem.
#[derive(Debug, Clone, Default)]
pub struct ProbeExecutor {
    settings: ExecutorSettings,
}

impl ProbeExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    async fn probe_with_session(
        &self,
        target: &Target,
        key_file: &std::path::Path,
    ) -> (ExitReason, String) {
        let mut builder = openssh::SessionBuilder::default();
        builder
            .user(target.user.clone())
            .port(target.port)
            .keyfile(key_file)
            .connect_timeout(self.settings.connect_timeout)
            .known_hosts_check(openssh::KnownHosts::Add);
        tracing::debug!("Connecting to SSH destination: {}", target);
        let session = match builder.connect(&target.host).await {
            Ok(session) => session,
            Err(error) => {
                let message = format!("{error:#}");
                return (classify(Some(255), &message, false), message);
            }
        };
        let result = session.command("true").status().await;
        if let Err(error) = session.close().await {
            tracing::debug!("Failed to close SSH session to {}: {}", target, error);
        }
        match result {
            Ok(status) if status.success() => (ExitReason::Success, "authenticated".to_string()),
            Ok(status) => (
                ExitReason::TransportError,
                format!("remote `true` exited with {:?}", status.code()),
            ),
            Err(error) => (ExitReason::TransportError, format!("{error:#}")),
        }
    }
}

#[async_trait::async_trait]
impl crate::transfer::Executor for ProbeExecutor {
    #[tracing::instrument(skip(self, _spec, credentials, cancel), fields(target = %target))]
    async fn execute(
        &self,
        target: &Target,
        _spec: &TransferSpec,
        credentials: &Credentials,
        timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
        attempt_number: u32,
    ) -> AttemptOutcome {
        let start = std::time::Instant::now();
        match credentials {
            Credentials::Key { key_file } => {
                let (reason, message) = tokio::select! {
                    res = tokio::time::timeout(timeout, self.probe_with_session(target, key_file)) => match res {
                        Ok(res) => res,
                        Err(_) => (ExitReason::Timeout, "timed out waiting for ssh".to_string()),
                    },
                    _ = cancel.cancelled() => (ExitReason::Cancelled, "cancelled".to_string()),
                };
                AttemptOutcome::new(target, attempt_number, reason, message, start.elapsed())
            }
            Credentials::Password { .. } => {
                let mut cmd = self
                    .settings
                    .authenticated_command(&self.settings.ssh_program, credentials);
                cmd.args(self.settings.ssh_options(target, credentials))
                    .arg(format!("{}@{}", target.user, target.host))
                    .arg("true");
                let end = run_child(cmd, timeout, self.settings.grace_period, cancel).await;
                outcome_from_child(
                    end,
                    target,
                    credentials,
                    timeout,
                    attempt_number,
                    start.elapsed(),
                )
            }
        }
    }
}
