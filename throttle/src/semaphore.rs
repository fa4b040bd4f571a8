use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket that is a no-op until `setup` is called with a non-zero value.
pub struct Semaphore {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn consume(&self) {
        if !self.is_enabled() {
            return;
        }
        match self.sem.acquire().await {
            Ok(permit) => permit.forget(),
            Err(error) => tracing::error!("throttle semaphore closed: {error}"),
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
