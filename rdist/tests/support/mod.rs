//! Scripted executor shared by the dispatch tests.
//!
//! Every call is recorded and the number of concurrently running calls is tracked, so tests can
//! check attempt counts and the in-flight bound without any network access.

#![allow(dead_code)]

use remote::{AttemptOutcome, Credentials, ExitReason, Target, TransferSpec};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub enum Script {
    /// Outcome per attempt number; the last entry repeats
    Attempts(Vec<ExitReason>),
    /// Fails with `TransportError` until the host's n-th call overall (across passes)
    SucceedOnCall(usize),
    /// Runs until cancelled
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: String,
    pub attempt: u32,
}

#[derive(Debug, Default)]
pub struct InstrumentedExecutor {
    scripts: std::collections::HashMap<String, Script>,
    /// Upper bound for a random per-call duration
    max_delay: std::time::Duration,
    calls: std::sync::Mutex<Vec<Call>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: tokio::sync::Notify,
}

impl InstrumentedExecutor {
    pub fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(host, script)| (host.to_string(), script))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: std::time::Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, host: &str) -> usize {
        self.calls().iter().filter(|call| call.host == host).count()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` calls are running
    pub async fn wait_for_active(&self, count: usize) {
        loop {
            let notified = self.started.notified();
            if self.active() >= count {
                return;
            }
            notified.await;
        }
    }

    fn random_delay(&self) -> std::time::Duration {
        use rand::Rng;
        if self.max_delay.is_zero() {
            return std::time::Duration::ZERO;
        }
        let max_micros = u64::try_from(self.max_delay.as_micros()).unwrap();
        std::time::Duration::from_micros(rand::thread_rng().gen_range(0..=max_micros))
    }
}

#[async_trait::async_trait]
impl remote::Executor for InstrumentedExecutor {
    async fn execute(
        &self,
        target: &Target,
        _spec: &TransferSpec,
        _credentials: &Credentials,
        _timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
        attempt_number: u32,
    ) -> AttemptOutcome {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                host: target.host.clone(),
                attempt: attempt_number,
            });
            calls.iter().filter(|call| call.host == target.host).count()
        };
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.notify_waiters();
        let script = self
            .scripts
            .get(&target.host)
            .cloned()
            .unwrap_or(Script::Attempts(vec![ExitReason::Success]));
        let delay = self.random_delay();
        let reason = tokio::select! {
            reason = async {
                tokio::time::sleep(delay).await;
                match script {
                    Script::Attempts(reasons) => {
                        let index = usize::try_from(attempt_number - 1)
                            .unwrap()
                            .min(reasons.len() - 1);
                        reasons[index]
                    }
                    Script::SucceedOnCall(n) if call_number >= n => ExitReason::Success,
                    Script::SucceedOnCall(_) => ExitReason::TransportError,
                    Script::Hang => std::future::pending().await,
                }
            } => reason,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        AttemptOutcome::new(
            target,
            attempt_number,
            reason,
            format!("scripted {reason}"),
            delay,
        )
    }
}

pub fn target(host: &str) -> Target {
    remote::parse_target(
        host,
        &remote::TargetDefaults {
            user: "deploy".to_string(),
            port: 22,
        },
    )
    .unwrap()
}

pub fn targets(hosts: &[&str]) -> Vec<Target> {
    hosts.iter().map(|host| target(host)).collect()
}

pub fn hosts(targets: &[Target]) -> Vec<String> {
    let mut hosts: Vec<String> = targets.iter().map(|target| target.host.clone()).collect();
    hosts.sort();
    hosts
}

pub fn plan(
    executor: Arc<InstrumentedExecutor>,
    concurrency: usize,
    max_attempts: u32,
    retry_delay: std::time::Duration,
) -> rdist_tools_rdist::BatchPlan {
    rdist_tools_rdist::BatchPlan::new(
        executor,
        Arc::new(TransferSpec {
            source_path: "/srv/release/".to_string(),
            destination_path: "/opt/app".to_string(),
            delete_extraneous: false,
            compress: false,
        }),
        Arc::new(Credentials::Key {
            key_file: "/nonexistent/id_ed25519".into(),
        }),
        rdist_tools_rdist::RetryPolicy::new(max_attempts, retry_delay).unwrap(),
        concurrency,
        std::time::Duration::from_secs(60),
    )
    .unwrap()
}
