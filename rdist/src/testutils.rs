use remote::{AttemptOutcome, Credentials, ExitReason, Target, TransferSpec};

pub fn target(host: &str) -> Target {
    Target {
        user: "root".to_string(),
        host: host.to_string(),
        port: 22,
        raw: host.to_string(),
    }
}

pub fn outcome(target: &Target, attempt: u32, reason: ExitReason) -> AttemptOutcome {
    AttemptOutcome::new(
        target,
        attempt,
        reason,
        reason.to_string(),
        std::time::Duration::ZERO,
    )
}

pub fn spec() -> TransferSpec {
    TransferSpec {
        source_path: "/srv/release/".to_string(),
        destination_path: "/opt/app".to_string(),
        delete_extraneous: false,
        compress: false,
    }
}

pub fn credentials() -> Credentials {
    Credentials::Key {
        key_file: "/nonexistent/id_ed25519".into(),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Fail with the given reason this many times (counted across passes), then succeed
    SucceedAfter(u32, ExitReason),
    AlwaysFail(ExitReason),
    /// Block until cancelled
    Hang,
}

/// Executor whose outcome per host is scripted; records every call
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    behaviors: std::collections::HashMap<String, Behavior>,
    pub delay: std::time::Duration,
    calls: std::sync::Mutex<std::collections::HashMap<String, u32>>,
    active: std::sync::atomic::AtomicUsize,
    peak: std::sync::atomic::AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Self {
        Self {
            behaviors: behaviors
                .iter()
                .map(|(host, behavior)| (host.to_string(), *behavior))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self, host: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or_default()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl remote::Executor for ScriptedExecutor {
    async fn execute(
        &self,
        target: &Target,
        _spec: &TransferSpec,
        _credentials: &Credentials,
        _timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
        attempt_number: u32,
    ) -> AttemptOutcome {
        use std::sync::atomic::Ordering;
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(target.host.clone()).or_default();
            *count += 1;
            *count
        };
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .get(&target.host)
            .copied()
            .unwrap_or(Behavior::SucceedAfter(0, ExitReason::TransportError));
        let reason = tokio::select! {
            reason = async {
                tokio::time::sleep(self.delay).await;
                match behavior {
                    Behavior::SucceedAfter(failures, _) if call > failures => ExitReason::Success,
                    Behavior::SucceedAfter(_, reason) | Behavior::AlwaysFail(reason) => reason,
                    Behavior::Hang => std::future::pending().await,
                }
            } => reason,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome(target, attempt_number, reason)
    }
}
