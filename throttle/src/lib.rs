//! Admission control for remote transfers
//!
//! Two independent mechanisms are provided:
//!
//! 1. **In-flight limit** - [`InFlightLimit`] caps the number of transfers that run at the same
//!    time. A unit of work must hold an [`InFlightPermit`] for its whole lifetime; the permit is
//!    returned when it is dropped, which admits the next queued unit.
//! 2. **Launch throttle** - a process wide token bucket limiting how many transfers may be
//!    *started* per second. Useful when many hosts sit behind the same bastion or firewall that
//!    rate limits new SSH connections.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::{InFlightLimit, init_launch_tokens, run_launch_replenish_thread, get_launch_token};
//! use std::time::Duration;
//!
//! # async fn example() {
//! // at most 8 transfers at any instant
//! let limit = InFlightLimit::new(8);
//!
//! // at most 10 new transfers per second
//! init_launch_tokens(10);
//! tokio::spawn(run_launch_replenish_thread(10, Duration::from_secs(1)));
//!
//! get_launch_token().await;
//! let permit = limit.acquire().await;
//! // run transfer while holding `permit`
//! drop(permit);
//! # }
//! ```
//!
//! The launch throttle is disabled (never blocks) until [`init_launch_tokens`] is called with a
//! non-zero value.

mod semaphore;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

static LAUNCH_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();

pub fn init_launch_tokens(launch_tokens: usize) {
    LAUNCH_THROTTLE.setup(launch_tokens);
}

pub async fn get_launch_token() {
    LAUNCH_THROTTLE.consume().await;
}

pub async fn run_launch_replenish_thread(replenish: usize, interval: std::time::Duration) {
    LAUNCH_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

/// Caps the number of concurrently running units of work.
#[derive(Debug, Clone)]
pub struct InFlightLimit {
    sem: Arc<tokio::sync::Semaphore>,
    active: Arc<AtomicUsize>,
}

/// Held by a running unit; dropping it frees the slot.
#[derive(Debug)]
pub struct InFlightPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl InFlightLimit {
    /// # Panics
    ///
    /// Panics if `limit` is zero; callers validate user input before getting here.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "in-flight limit must be positive");
        Self {
            sem: Arc::new(tokio::sync::Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of permits currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> InFlightPermit {
        // the semaphore is owned by `self` and never closed
        let permit = match self.sem.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("in-flight semaphore is never closed"),
        };
        self.active.fetch_add(1, Ordering::AcqRel);
        InFlightPermit {
            _permit: permit,
            active: self.active.clone(),
        }
    }
}
