//! Interrupt handling for a dispatch run
//!
//! The manager owns the run's [`CancellationToken`](tokio_util::sync::CancellationToken). The
//! scheduler stops admitting work once it fires, and executors terminate their child processes
//! (SIGTERM, then SIGKILL after [`CancellationManager::grace_period`]). Transient resources such
//! as the credential handle are handed to the manager and dropped by
//! [`CancellationManager::shutdown`].

type Resource = Box<dyn std::any::Any + Send>;

#[derive(Debug)]
pub struct CancellationManager {
    token: tokio_util::sync::CancellationToken,
    grace_period: std::time::Duration,
    watcher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    resources: std::sync::Mutex<Vec<(String, Resource)>>,
}

impl CancellationManager {
    pub fn new(grace_period: std::time::Duration) -> Self {
        Self {
            token: tokio_util::sync::CancellationToken::new(),
            grace_period,
            watcher: std::sync::Mutex::new(None),
            resources: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> tokio_util::sync::CancellationToken {
        self.token.clone()
    }

    pub fn grace_period(&self) -> std::time::Duration {
        self.grace_period
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Idempotent; safe before, during and after a batch.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::warn!(
                "Cancelling: no new transfers will start, running ones get {} to stop",
                humantime::format_duration(self.grace_period)
            );
        }
        self.token.cancel();
    }

    /// Starts watching for SIGINT and SIGTERM. Calling it again replaces the previous watcher.
    pub fn listen(&self) -> anyhow::Result<()> {
        use anyhow::Context;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        let token = self.token.clone();
        let grace = self.grace_period;
        let handle = tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => "SIGINT",
                        Err(error) => {
                            tracing::error!("Failed to listen for SIGINT: {}", error);
                            return;
                        }
                    },
                    _ = sigterm.recv() => "SIGTERM",
                };
                if token.is_cancelled() {
                    tracing::warn!("Received {}, already cancelling", signal);
                } else {
                    tracing::warn!(
                        "Received {}, cancelling (running transfers get {} to stop)",
                        signal,
                        humantime::format_duration(grace)
                    );
                    token.cancel();
                }
            }
        });
        if let Some(previous) = self.lock_watcher().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Takes ownership of `resource` until [`shutdown`](Self::shutdown).
    pub fn register<R: Send + 'static>(&self, name: impl Into<String>, resource: R) {
        let name = name.into();
        tracing::debug!("Registered transient resource: {}", name);
        self.lock_resources().push((name, Box::new(resource)));
    }

    pub fn registered(&self) -> usize {
        self.lock_resources().len()
    }

    /// Stops the signal watcher and drops every registered resource, most recent first.
    pub fn shutdown(self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
        let mut resources = std::mem::take(&mut *self.lock_resources());
        while let Some((name, resource)) = resources.pop() {
            drop(resource);
            tracing::debug!("Released transient resource: {}", name);
        }
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
        self.watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_resources(&self) -> std::sync::MutexGuard<'_, Vec<(String, Resource)>> {
        self.resources
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for CancellationManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.abort();
        }
    }
}
