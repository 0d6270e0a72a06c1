//! Time source and interruptible pauses for the polling loops.
//!
//! Every wait loop pauses through a [`Clock`] so that tests can simulate
//! elapsed time. The real clock races each pause against an [`Interrupt`]
//! handle; once triggered, pending and future pauses fail with
//! [`Interrupted`] and the loops abandon their wait.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;

/// Raised when a pause is cut short by an [`Interrupt`].
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("wait interrupted")]
pub struct Interrupted;

/// Future returned by [`Clock::pause`].
pub type PauseFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Interrupted>> + Send + 'a>>;

/// Source of the current time and of pauses between polls.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Pauses for `duration`, failing early when interrupted.
    fn pause(&self, duration: Duration) -> PauseFuture<'_>;
}

/// Shared flag used to abandon in-flight waits.
#[derive(Debug, Default)]
pub struct Interrupt {
    triggered: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    /// Creates an untriggered interrupt handle.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Interrupts every pending and future pause.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns `true` once [`Interrupt::trigger`] has been called.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// Wall clock backed by the tokio timer.
#[derive(Clone, Debug, Default)]
pub struct TokioClock {
    interrupt: Arc<Interrupt>,
}

impl TokioClock {
    /// Creates a clock with its own interrupt handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock observing an existing interrupt handle.
    #[must_use]
    pub const fn with_interrupt(interrupt: Arc<Interrupt>) -> Self {
        Self { interrupt }
    }

    /// Returns the interrupt handle observed by this clock.
    #[must_use]
    pub fn interrupt(&self) -> Arc<Interrupt> {
        Arc::clone(&self.interrupt)
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn pause(&self, duration: Duration) -> PauseFuture<'_> {
        Box::pin(async move {
            let notified = self.interrupt.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.interrupt.is_triggered() {
                return Err(Interrupted);
            }

            tokio::select! {
                () = tokio::time::sleep(duration) => Ok(()),
                () = notified => Err(Interrupted),
            }
        })
    }
}
