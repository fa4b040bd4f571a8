use crate::credentials::Credentials;
use crate::target::Target;
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::io::AsyncReadExt;

/// Longest failure message kept from a child's stderr
const MAX_MESSAGE_LEN: usize = 512;

/// rsync exit codes for its own I/O timeouts
const RSYNC_TIMEOUT_CODES: [i32; 2] = [30, 35];

/// sshpass exit code for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// ssh's wording for rejected credentials (lowercased); a bare "permission denied" is also what
/// rsync reports for remote file permission errors
const AUTH_FAILURE_SIGNATURES: [&str; 8] = [
    "permission denied (publickey",
    "permission denied (password",
    "permission denied (keyboard-interactive",
    "permission denied, please try again",
    "authentication failed",
    "too many authentication failures",
    "incorrect password",
    "no supported authentication methods",
];

/// What to push and how. Shared read-only by all units of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSpec {
    pub source_path: String,
    pub destination_path: String,
    /// Remove files at the destination that don't exist in the source (`rsync --delete`)
    pub delete_extraneous: bool,
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum ExitReason {
    Success,
    Timeout,
    AuthFailure,
    TransportError,
    Cancelled,
}

/// Result of one attempt against one target
#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub target: Target,
    pub attempt_number: u32,
    pub succeeded: bool,
    pub exit_reason: ExitReason,
    pub message: String,
    pub duration_ms: u64,
}

impl AttemptOutcome {
    pub fn new(
        target: &Target,
        attempt_number: u32,
        exit_reason: ExitReason,
        message: impl Into<String>,
        duration: std::time::Duration,
    ) -> Self {
        Self {
            target: target.clone(),
            attempt_number,
            succeeded: exit_reason == ExitReason::Success,
            exit_reason,
            message: message.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Outcome for a unit interrupted before (or between) attempts
    pub fn cancelled(target: &Target, attempt_number: u32) -> Self {
        Self::new(
            target,
            attempt_number,
            ExitReason::Cancelled,
            "cancelled",
            std::time::Duration::ZERO,
        )
    }
}

/// Performs exactly one attempt; never retries.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        target: &Target,
        spec: &TransferSpec,
        credentials: &Credentials,
        timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
        attempt_number: u32,
    ) -> AttemptOutcome;
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub rsync_program: std::path::PathBuf,
    pub ssh_program: std::path::PathBuf,
    pub sshpass_program: std::path::PathBuf,
    /// Passed to ssh as `ConnectTimeout`
    pub connect_timeout: std::time::Duration,
    /// Time between SIGTERM and SIGKILL when a transfer has to be stopped
    pub grace_period: std::time::Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            rsync_program: "rsync".into(),
            ssh_program: "ssh".into(),
            sshpass_program: "sshpass".into(),
            connect_timeout: std::time::Duration::from_secs(10),
            grace_period: std::time::Duration::from_secs(3),
        }
    }
}

impl ExecutorSettings {
    /// ssh options shared by transfers and auth probes
    pub(crate) fn ssh_options(&self, target: &Target, credentials: &Credentials) -> Vec<String> {
        let mut options = vec![
            "-p".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        match credentials {
            Credentials::Key { key_file } => {
                options.extend([
                    "-i".to_string(),
                    key_file.display().to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "IdentitiesOnly=yes".to_string(),
                ]);
            }
            Credentials::Password { .. } => {
                options.extend(["-o".to_string(), "PubkeyAuthentication=no".to_string()]);
            }
        }
        options
    }

    /// Starts `program` directly, or through `sshpass -e` with the password placed in the child's
    /// environment only.
    pub(crate) fn authenticated_command(
        &self,
        program: &std::path::Path,
        credentials: &Credentials,
    ) -> tokio::process::Command {
        match credentials {
            Credentials::Key { .. } => tokio::process::Command::new(program),
            Credentials::Password { secret } => {
                let mut cmd = tokio::process::Command::new(&self.sshpass_program);
                cmd.arg("-e")
                    .arg(program)
                    .env("SSHPASS", secret.expose_secret());
                cmd
            }
        }
    }
}

/// Quotes an argument for rsync's `-e` command splitting (spaces separate arguments, single or
/// double quotes group them, backslashes are not special).
pub fn shell_escape(arg: &str) -> String {
    let is_plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if is_plain {
        arg.to_string()
    } else if arg.contains('\'') {
        format!("\"{arg}\"")
    } else {
        format!("'{arg}'")
    }
}

pub(crate) enum ChildEnd {
    Exited { code: Option<i32>, stderr: String },
    TimedOut { stderr: String },
    Cancelled,
    SpawnFailed(std::io::Error),
}

async fn terminate(child: &mut tokio::process::Child, grace: std::time::Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    // the child leads its own process group, so ssh spawned by rsync is signalled too
    let pgid = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .map(Pid::from_raw);
    if let Some(pgid) = pgid {
        if let Err(error) = killpg(pgid, Signal::SIGTERM) {
            tracing::debug!("SIGTERM to process group {} failed: {}", pgid, error);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::warn!(
                "Process group {} still running {:?} after SIGTERM, killing",
                pgid,
                grace
            );
        }
        // reap anything left in the group even if the leader already exited
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    if let Err(error) = child.kill().await {
        tracing::debug!("Failed to kill child: {}", error);
    }
}

/// Runs `cmd` bounded by `timeout`, terminating it on expiry or cancellation.
pub(crate) async fn run_child(
    mut cmd: tokio::process::Command,
    timeout: std::time::Duration,
    grace: std::time::Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> ChildEnd {
    if cancel.is_cancelled() {
        return ChildEnd::Cancelled;
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => return ChildEnd::SpawnFailed(error),
    };
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        })
    });
    enum Ending {
        Exited(std::io::Result<std::process::ExitStatus>),
        TimedOut,
        Cancelled,
    }
    let ending = tokio::select! {
        status = child.wait() => Ending::Exited(status),
        _ = tokio::time::sleep(timeout) => Ending::TimedOut,
        _ = cancel.cancelled() => Ending::Cancelled,
    };
    if !matches!(ending, Ending::Exited(_)) {
        terminate(&mut child, grace).await;
    }
    let stderr = match stderr_task {
        // a stray grandchild could keep the pipe open, don't wait on it forever
        Some(mut task) => match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
            Ok(Err(_)) => String::new(),
            Err(_) => {
                task.abort();
                String::new()
            }
        },
        None => String::new(),
    };
    match ending {
        Ending::Exited(Ok(status)) => ChildEnd::Exited {
            code: status.code(),
            stderr,
        },
        Ending::Exited(Err(error)) => ChildEnd::SpawnFailed(error),
        Ending::TimedOut => ChildEnd::TimedOut { stderr },
        Ending::Cancelled => ChildEnd::Cancelled,
    }
}

/// Maps a finished child to an exit reason.
pub fn classify(code: Option<i32>, stderr: &str, password_mode: bool) -> ExitReason {
    if code == Some(0) {
        return ExitReason::Success;
    }
    if password_mode && code == Some(SSHPASS_BAD_PASSWORD) {
        return ExitReason::AuthFailure;
    }
    let lowered = stderr.to_lowercase();
    if AUTH_FAILURE_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
    {
        return ExitReason::AuthFailure;
    }
    match code {
        Some(code) if RSYNC_TIMEOUT_CODES.contains(&code) => ExitReason::Timeout,
        _ => ExitReason::TransportError,
    }
}

/// Last non-empty stderr line, bounded in length
pub(crate) fn summarize_stderr(stderr: &str) -> Option<String> {
    let line = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    if line.len() <= MAX_MESSAGE_LEN {
        return Some(line.to_string());
    }
    let mut end = MAX_MESSAGE_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}...", &line[..end]))
}

/// Turns a finished child into an attempt outcome
pub(crate) fn outcome_from_child(
    end: ChildEnd,
    target: &Target,
    credentials: &Credentials,
    timeout: std::time::Duration,
    attempt_number: u32,
    elapsed: std::time::Duration,
) -> AttemptOutcome {
    let password_mode = matches!(credentials, Credentials::Password { .. });
    let (reason, message) = match end {
        ChildEnd::Exited { code, stderr } => {
            let reason = classify(code, &stderr, password_mode);
            let message = match (reason, summarize_stderr(&stderr)) {
                (ExitReason::Success, _) => "transfer complete".to_string(),
                (_, Some(line)) => line,
                (_, None) => match code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                },
            };
            (reason, message)
        }
        ChildEnd::TimedOut { stderr } => {
            let mut message = format!(
                "timed out after {}",
                humantime::format_duration(timeout)
            );
            if let Some(line) = summarize_stderr(&stderr) {
                message.push_str(": ");
                message.push_str(&line);
            }
            (ExitReason::Timeout, message)
        }
        ChildEnd::Cancelled => (ExitReason::Cancelled, "cancelled".to_string()),
        ChildEnd::SpawnFailed(error) => (
            ExitReason::TransportError,
            format!("failed to run transfer command: {error}"),
        ),
    };
    AttemptOutcome::new(
        target,
        attempt_number,
        reason,
        credentials.redact(&message),
        elapsed,
    )
}

/// Pushes with `rsync -a` over ssh
#[derive(Debug, Clone, Default)]
pub struct RsyncExecutor {
    settings: ExecutorSettings,
}

impl RsyncExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self { settings }
    }

    /// Value of rsync's `-e` option
    pub fn remote_shell(&self, target: &Target, credentials: &Credentials) -> String {
        std::iter::once(self.settings.ssh_program.display().to_string())
            .chain(self.settings.ssh_options(target, credentials))
            .map(|arg| shell_escape(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn rsync_args(
        &self,
        target: &Target,
        spec: &TransferSpec,
        credentials: &Credentials,
    ) -> Vec<String> {
        let mut args = vec!["-a".to_string()];
        if spec.delete_extraneous {
            args.push("--delete".to_string());
        }
        if spec.compress {
            args.push("-z".to_string());
        }
        args.push("-e".to_string());
        args.push(self.remote_shell(target, credentials));
        args.push(spec.source_path.clone());
        args.push(target.remote_spec(&spec.destination_path));
        args
    }
}

#[async_trait::async_trait]
impl Executor for RsyncExecutor {
    #[tracing::instrument(skip(self, spec, credentials, cancel), fields(target = %target))]
    async fn execute(
        &self,
        target: &Target,
        spec: &TransferSpec,
        credentials: &Credentials,
        timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
        attempt_number: u32,
    ) -> AttemptOutcome {
        let mut cmd = self
            .settings
            .authenticated_command(&self.settings.rsync_program, credentials);
        let args = self.rsync_args(target, spec, credentials);
        tracing::debug!("rsync arguments: {:?}", args);
        cmd.args(&args);
        let start = std::time::Instant::now();
        let end = run_child(cmd, timeout, self.settings.grace_period, cancel).await;
        let outcome = outcome_from_child(
            end,
            target,
            credentials,
            timeout,
            attempt_number,
            start.elapsed(),
        );
        tracing::debug!(
            "Attempt {} finished: {} ({})",
            attempt_number,
            outcome.exit_reason,
            outcome.message
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::os::unix::fs::PermissionsExt;

    fn target() -> Target {
        Target {
            user: "deploy".to_string(),
            host: "web1".to_string(),
            port: 2222,
            raw: "web1:2222".to_string(),
        }
    }

    fn spec() -> TransferSpec {
        TransferSpec {
            source_path: "/srv/release/".to_string(),
            destination_path: "/opt/app".to_string(),
            delete_extraneous: false,
            compress: false,
        }
    }

    fn key() -> Credentials {
        Credentials::Key {
            key_file: "/home/deploy/.ssh/id ed25519".into(),
        }
    }

    fn password() -> Credentials {
        Credentials::Password {
            secret: SecretString::new("hunter2".to_string()),
        }
    }

    /// Writes an executable shell script standing in for rsync/sshpass
    fn fake_program(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor_with(rsync: std::path::PathBuf) -> RsyncExecutor {
        RsyncExecutor::new(ExecutorSettings {
            rsync_program: rsync,
            grace_period: std::time::Duration::from_millis(200),
            ..Default::default()
        })
    }

    async fn run(executor: &RsyncExecutor, credentials: &Credentials) -> AttemptOutcome {
        executor
            .execute(
                &target(),
                &spec(),
                credentials,
                std::time::Duration::from_secs(5),
                &tokio_util::sync::CancellationToken::new(),
                1,
            )
            .await
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(Some(0), "", false), ExitReason::Success);
        assert_eq!(
            classify(Some(255), "deploy@web1: Permission denied (publickey).", false),
            ExitReason::AuthFailure
        );
        assert_eq!(classify(Some(5), "", true), ExitReason::AuthFailure);
        assert_eq!(classify(Some(5), "", false), ExitReason::TransportError);
        assert_eq!(classify(Some(30), "", false), ExitReason::Timeout);
        assert_eq!(
            classify(Some(255), "ssh: connect to host web1 port 22: Connection refused", false),
            ExitReason::TransportError
        );
        assert_eq!(classify(None, "", false), ExitReason::TransportError);
        assert_eq!(
            classify(Some(255), "Permission denied, please try again.", false),
            ExitReason::AuthFailure
        );
    }

    #[test]
    fn remote_file_permission_error_is_not_an_auth_failure() {
        let stderr = "rsync: [receiver] mkstemp \"/opt/app/.index.html.XyZ\" failed: Permission denied (13)\n\
                      rsync error: some files/attrs were not transferred (see previous errors) (code 23)";
        assert_eq!(classify(Some(23), stderr, false), ExitReason::TransportError);
        assert_eq!(classify(Some(23), stderr, true), ExitReason::TransportError);
    }

    #[test]
    fn test_rsync_args_key_mode() {
        let executor = RsyncExecutor::default();
        let mut spec = spec();
        spec.delete_extraneous = true;
        spec.compress = true;
        let args = executor.rsync_args(&target(), &spec, &key());
        assert_eq!(
            args,
            vec![
                "-a",
                "--delete",
                "-z",
                "-e",
                "ssh -p 2222 -o ConnectTimeout=10 -o StrictHostKeyChecking=accept-new \
                 -i '/home/deploy/.ssh/id ed25519' -o BatchMode=yes -o IdentitiesOnly=yes",
                "/srv/release/",
                "deploy@web1:/opt/app",
            ]
        );
    }

    #[test]
    fn test_delete_is_never_implicit() {
        let executor = RsyncExecutor::default();
        let args = executor.rsync_args(&target(), &spec(), &password());
        assert!(!args.iter().any(|arg| arg == "--delete"));
        assert!(args.iter().any(|arg| arg.contains("PubkeyAuthentication=no")));
        assert!(!args.iter().any(|arg| arg.contains("hunter2")));
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("ConnectTimeout=10"), "ConnectTimeout=10");
        assert_eq!(shell_escape("/a b/key"), "'/a b/key'");
        assert_eq!(shell_escape("it's"), "\"it's\"");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_summarize_stderr() {
        assert_eq!(summarize_stderr("  \n"), None);
        assert_eq!(
            summarize_stderr("warning\nrsync error: code 12\n\n").as_deref(),
            Some("rsync error: code 12")
        );
        let long = "x".repeat(2 * MAX_MESSAGE_LEN);
        assert_eq!(
            summarize_stderr(&long).map(|s| s.len()),
            Some(MAX_MESSAGE_LEN + 3)
        );
    }

    #[tokio::test]
    async fn successful_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let rsync = fake_program(dir.path(), "rsync", "exit 0");
        let outcome = run(&executor_with(rsync), &key()).await;
        assert!(outcome.succeeded);
        assert_eq!(outcome.exit_reason, ExitReason::Success);
        assert_eq!(outcome.attempt_number, 1);
    }

    #[tokio::test]
    async fn auth_rejection_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let rsync = fake_program(
            dir.path(),
            "rsync",
            "echo 'deploy@web1: Permission denied (publickey).' >&2\nexit 255",
        );
        let outcome = run(&executor_with(rsync), &key()).await;
        assert_eq!(outcome.exit_reason, ExitReason::AuthFailure);
        assert_eq!(outcome.message, "deploy@web1: Permission denied (publickey).");
    }

    #[tokio::test]
    async fn transport_error_and_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let rsync = fake_program(
            dir.path(),
            "rsync",
            "echo 'rsync: connection unexpectedly closed' >&2\nexit 12",
        );
        let outcome = run(&executor_with(rsync), &key()).await;
        assert_eq!(outcome.exit_reason, ExitReason::TransportError);
        assert!(!outcome.succeeded);
        let outcome = run(&executor_with(dir.path().join("no-such-rsync")), &key()).await;
        assert_eq!(outcome.exit_reason, ExitReason::TransportError);
        assert!(outcome.message.starts_with("failed to run transfer command"));
    }

    #[tokio::test]
    async fn password_reaches_child_environment_only() {
        let dir = tempfile::tempdir().unwrap();
        // fake sshpass leaks the password on stderr and fails; the message must be redacted
        let sshpass = fake_program(
            dir.path(),
            "sshpass",
            "echo \"bad password $SSHPASS\" >&2\nexit 5",
        );
        let executor = RsyncExecutor::new(ExecutorSettings {
            sshpass_program: sshpass,
            ..Default::default()
        });
        let outcome = run(&executor, &password()).await;
        assert_eq!(outcome.exit_reason, ExitReason::AuthFailure);
        assert_eq!(outcome.message, "bad password ***");
        assert!(std::env::var("SSHPASS").is_err());
    }

    #[tokio::test]
    async fn timeout_terminates_the_child() {
        let dir = tempfile::tempdir().unwrap();
        // ignores SIGTERM so the forced kill path is exercised
        let rsync = fake_program(dir.path(), "rsync", "trap '' TERM\nsleep 30");
        let executor = executor_with(rsync);
        let start = std::time::Instant::now();
        let outcome = executor
            .execute(
                &target(),
                &spec(),
                &key(),
                std::time::Duration::from_millis(200),
                &tokio_util::sync::CancellationToken::new(),
                2,
            )
            .await;
        assert_eq!(outcome.exit_reason, ExitReason::Timeout);
        assert_eq!(outcome.attempt_number, 2);
        assert!(outcome.message.starts_with("timed out after 200ms"));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_stops_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let rsync = fake_program(dir.path(), "rsync", "sleep 30");
        let executor = executor_with(rsync);
        let cancel = tokio_util::sync::CancellationToken::new();
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let start = std::time::Instant::now();
        let outcome = executor
            .execute(
                &target(),
                &spec(),
                &key(),
                std::time::Duration::from_secs(30),
                &cancel,
                1,
            )
            .await;
        trigger.await.unwrap();
        assert_eq!(outcome.exit_reason, ExitReason::Cancelled);
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
        // already cancelled: nothing is spawned
        let outcome = executor
            .execute(
                &target(),
                &spec(),
                &key(),
                std::time::Duration::from_secs(30),
                &cancel,
                2,
            )
            .await;
        assert_eq!(outcome.exit_reason, ExitReason::Cancelled);
        assert_eq!(outcome.duration_ms, 0);
    }
}
