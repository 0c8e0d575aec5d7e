//! A one-shot timer whose deadline can be moved while tasks wait on it.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct ResettableTimer {
    deadline: Mutex<Instant>,
    moved: Notify,
}

impl ResettableTimer {
    pub fn new(after: Duration) -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + after),
            moved: Notify::new(),
        }
    }

    /// Re-arms the timer to fire `after` from now. `Duration::ZERO` fires it
    /// immediately.
    pub fn reset(&self, after: Duration) {
        *self.deadline.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now() + after;
        self.moved.notify_waiters();
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_expired(&self) -> bool {
        self.deadline() <= Instant::now()
    }

    /// Resolves once the current deadline passes. Resets while waiting push
    /// the wake-up out.
    pub async fn expired(&self) {
        loop {
            let moved = self.moved.notified();
            tokio::pin!(moved);
            moved.as_mut().enable();

            let deadline = self.deadline();
            if deadline <= Instant::now() {
                return;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = &mut moved => {}
            }
        }
    }
}

/// `base` plus a random extra of up to a third of `base`.
pub fn jittered(base: Duration) -> Duration {
    let bound = base.as_millis() as u64 / 3;
    if bound == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..bound))
}
