//! Park/unpark capability used to emulate user-mode handoff.
//!
//! Every worker and scheduler thread owns one [`Parker`]. Unlike permit-based
//! parkers, [`Parker::unpark`] never stores a token: it succeeds only when the
//! owner is parked right now, and is a no-op otherwise. Senders that must not
//! lose a wakeup use [`deliver_wakeup`], which retries with backoff until the
//! target is observed parked and woken.

use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::config::UmsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParkState {
    Running,
    Parked,
    Notified,
}

/// Parking slot for one thread.
#[derive(Debug)]
pub struct Parker {
    state: Mutex<ParkState>,
    cvar: Condvar,
}

impl Parker {
    /// Creates a parker for a running thread.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ParkState::Running),
            cvar: Condvar::new(),
        }
    }

    /// Blocks the calling thread until an [`unpark`](Self::unpark) observes it
    /// parked.
    ///
    /// Must only be called by the thread owning this parker.
    pub fn park(&self) {
        let mut state = self.state.lock();
        *state = ParkState::Parked;
        while *state == ParkState::Parked {
            self.cvar.wait(&mut state);
        }
        *state = ParkState::Running;
    }

    /// Wakes the owner if it is parked.
    ///
    /// Returns `false` without side effects when the owner is running or a
    /// wakeup is already in flight.
    pub fn unpark(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ParkState::Parked {
            return false;
        }
        *state = ParkState::Notified;
        self.cvar.notify_one();
        true
    }

    /// Returns true while the owner is blocked in [`park`](Self::park) and no
    /// wakeup has been delivered yet.
    pub fn is_parked(&self) -> bool {
        *self.state.lock() == ParkState::Parked
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spin, then yield, then sleep.
#[derive(Debug)]
pub(crate) struct Backoff<'a> {
    config: &'a UmsConfig,
    step: u32,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(config: &'a UmsConfig) -> Self {
        Self { config, step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < self.config.spin_limit {
            std::hint::spin_loop();
        } else if self.step < self.config.spin_limit + self.config.yield_limit {
            thread::yield_now();
        } else {
            thread::sleep(self.config.backoff_sleep);
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Retries [`Parker::unpark`] until it succeeds.
///
/// The target may not have reached [`Parker::park`] yet when the sender
/// decides to wake it; delivery is at-least-once and never dropped. Returns
/// the number of attempts.
///
/// Blocks forever if the target never parks; callers only target threads
/// that are on their way into `park`.
pub fn deliver_wakeup(parker: &Parker, config: &UmsConfig) -> u32 {
    let mut backoff = Backoff::new(config);
    let mut attempts = 1;
    while !parker.unpark() {
        backoff.snooze();
        attempts += 1;
    }
    if attempts > 1 {
        log::trace!("wakeup delivered after {attempts} attempts");
    }
    attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn unpark_on_running_thread_is_a_no_op() {
        let parker = Parker::new();
        assert!(!parker.is_parked());
        assert!(!parker.unpark());
        assert!(!parker.unpark());
    }

    #[test]
    fn delivered_wakeup_releases_parked_thread() {
        let parker = Arc::new(Parker::new());
        let config = UmsConfig::default();

        let waiter = {
            let parker = Arc::clone(&parker);
            thread::spawn(move || parker.park())
        };

        let attempts = deliver_wakeup(&parker, &config);
        assert!(attempts >= 1);
        waiter.join().unwrap();
        assert!(!parker.is_parked());
    }

    #[test]
    fn early_unpark_does_not_leave_a_permit() {
        let parker = Arc::new(Parker::new());
        let config = UmsConfig::default();

        // Sent before the owner parks: must be dropped, not stored.
        assert!(!parker.unpark());

        let waiter = {
            let parker = Arc::clone(&parker);
            thread::spawn(move || parker.park())
        };

        while !parker.is_parked() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!waiter.is_finished());

        deliver_wakeup(&parker, &config);
        waiter.join().unwrap();
    }

    #[test]
    fn backoff_walks_through_phases() {
        let config = UmsConfig::builder()
            .spin_limit(1)
            .yield_limit(1)
            .backoff_sleep(Duration::from_micros(1))
            .build();
        let mut backoff = Backoff::new(&config);
        for _ in 0..4 {
            backoff.snooze();
        }
        assert_eq!(backoff.step, 4);
    }
}
