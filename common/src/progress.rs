use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event, instrument};

#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: Counter,
    finished: Counter,
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub const fn new() -> Self {
        Self {
            started: Counter::new(),
            finished: Counter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        // read `finished` first so a concurrent finish can't make it overtake `started`
        let finished = self.finished.get();
        let mut status = Status {
            started: self.started.get(),
            finished,
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Display-only counters for a dispatch run. Correctness never depends on these.
#[derive(Debug)]
pub struct Progress {
    /// Targets handed to the scheduler (across all passes)
    pub submitted: Counter,
    /// Units running a transfer (started/finished)
    pub units: ProgressCounter,
    pub attempts: Counter,
    pub retries: Counter,
    pub succeeded: Counter,
    pub failed: Counter,
    pub cancelled: Counter,
    start_time: std::sync::OnceLock<std::time::Instant>,
}

impl Progress {
    pub const fn new() -> Self {
        Self {
            submitted: Counter::new(),
            units: ProgressCounter::new(),
            attempts: Counter::new(),
            retries: Counter::new(),
            succeeded: Counter::new(),
            failed: Counter::new(),
            cancelled: Counter::new(),
            start_time: std::sync::OnceLock::new(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time
            .get_or_init(std::time::Instant::now)
            .elapsed()
    }

    pub fn resolved(&self) -> u64 {
        self.succeeded.get() + self.failed.get() + self.cancelled.get()
    }

    /// One line status, used as the progress bar message
    pub fn short_status(&self) -> String {
        let units = self.units.get();
        format!(
            "ok: {} | failed: {} | cancelled: {} | active: {} | retries: {}",
            self.succeeded.get(),
            self.failed.get(),
            self.cancelled.get(),
            units.started - units.finished,
            self.retries.get(),
        )
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_attempts: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_attempts: progress.attempts.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let units = self.progress.units.get();
        let attempts = self.progress.attempts.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_rate = attempts as f64 / total_duration_secs.max(f64::EPSILON);
        let current_rate =
            (attempts - self.last_attempts) as f64 / curr_duration_secs.max(f64::EPSILON);
        self.last_attempts = attempts;
        self.last_update = time_now;
        let submitted = self.progress.submitted.get();
        let resolved = self.progress.resolved();
        format!(
            "-----------------------\n\
            TARGETS:\n\
            submitted: {:>10}\n\
            queued:    {:>10}\n\
            active:    {:>10}\n\
            -----------------------\n\
            ATTEMPTS:\n\
            total:     {:>10}\n\
            retries:   {:>10}\n\
            average:   {:>10.2} attempts/s\n\
            current:   {:>10.2} attempts/s\n\
            -----------------------\n\
            RESULTS:\n\
            succeeded: {:>10}\n\
            failed:    {:>10}\n\
            cancelled: {:>10}",
            submitted,
            submitted.saturating_sub(resolved + units.started - units.finished),
            units.started - units.finished,
            attempts,
            self.progress.retries.get(),
            average_rate,
            current_rate,
            self.progress.succeeded.get(),
            self.progress.failed.get(),
            self.progress.cancelled.get(),
        )
    }
}
