//! Shutdown coordination
//!
//! Two small primitives built on a mutex/condvar pair: the process-wide halt
//! condition the main thread blocks on, and a shutdown token that worker
//! threads use as an interruptible sleep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// The process-wide halt condition.
///
/// Any component may signal it to unblock the main thread and let the
/// process exit cleanly; the replay source does so when its samples run out.
#[derive(Clone, Default)]
pub struct Halt {
    inner: Arc<HaltInner>,
}

#[derive(Default)]
struct HaltInner {
    halted: Mutex<bool>,
    cond: Condvar,
}

impl Halt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the halt condition. Idempotent.
    pub fn signal(&self) {
        let mut halted = self.inner.halted.lock();
        *halted = true;
        self.inner.cond.notify_all();
    }

    /// Blocks the calling thread until the halt condition is signalled.
    pub fn wait(&self) {
        let mut halted = self.inner.halted.lock();
        while !*halted {
            self.inner.cond.wait(&mut halted);
        }
    }

    /// Like `wait`, but gives up after `dur`. Returns whether the halt
    /// condition was signalled.
    pub fn wait_timeout(&self, dur: Duration) -> bool {
        let deadline = std::time::Instant::now() + dur;
        let mut halted = self.inner.halted.lock();
        while !*halted {
            if self.inner.cond.wait_until(&mut halted, deadline).timed_out() {
                break;
            }
        }
        *halted
    }

    pub fn is_halted(&self) -> bool {
        *self.inner.halted.lock()
    }
}

/// Cooperative cancellation for worker threads.
///
/// `sleep` doubles as the cancellation point that thread cancellation served
/// in the original design: it returns early, with `false`, when the token is
/// triggered.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleeps for `dur`, waking early if the token is triggered.
    ///
    /// Returns `true` if the full duration elapsed, `false` on cancellation.
    pub fn sleep(&self, dur: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if *stopped {
            return false;
        }
        let _ = self.inner.cond.wait_for(&mut stopped, dur);
        !*stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_halt_wakes_waiter() {
        let halt = Halt::new();
        let halt2 = halt.clone();
        let handle = thread::spawn(move || halt2.wait());
        thread::sleep(Duration::from_millis(20));
        assert!(!halt.is_halted());
        halt.signal();
        handle.join().unwrap();
        assert!(halt.is_halted());
    }

    #[test]
    fn test_token_interrupts_sleep() {
        let token = ShutdownToken::new();
        let token2 = token.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let completed = token2.sleep(Duration::from_secs(30));
            (completed, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        token.trigger();
        let (completed, elapsed) = handle.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
        // Once triggered, sleeps return immediately
        assert!(!token.sleep(Duration::from_secs(1)));
    }

    #[test]
    fn test_token_sleep_completes() {
        let token = ShutdownToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
    }
}
