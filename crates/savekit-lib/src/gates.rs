//! Cooperative run control and the cross-job gates.
//!
//! Every primitive here is a plain `Mutex` + `Condvar` pair so workers are
//! ordinary OS threads. Instances are created per manager (or per test) and
//! shared by `Arc`; nothing is global.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// How often a priority waiter re-checks its own cancellation.
const PRIORITY_RECHECK: Duration = Duration::from_millis(100);

/// Returned by waits that were interrupted by a stop request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("job was cancelled")]
pub struct Cancelled;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ControlState {
    paused: bool,
    cancelled: bool,
}

/// Pause-gate and cancellation token of one running job.
#[derive(Debug, Default)]
pub struct RunControl {
    state: Mutex<ControlState>,
    changed: Condvar,
}

impl RunControl {
    /// A control in the running (gate open) state.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        let mut state = lock(&self.state);
        if !state.cancelled {
            state.paused = true;
        }
    }

    pub fn resume(&self) {
        lock(&self.state).paused = false;
        self.changed.notify_all();
    }

    /// Requests cancellation and forces the pause-gate open so a paused
    /// worker can observe it.
    pub fn cancel(&self) {
        {
            let mut state = lock(&self.state);
            state.cancelled = true;
            state.paused = false;
        }
        self.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Fails fast when a stop was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Blocks while the gate is closed. No timeout: a paused job waits until
    /// resumed or stopped.
    pub fn wait_while_paused(&self) -> Result<(), Cancelled> {
        let state = lock(&self.state);
        let state = self
            .changed
            .wait_while(state, |s| s.paused && !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early when cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let state = lock(&self.state);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, duration, |s| !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Process-wide count of outstanding priority files.
///
/// The gate is closed while the count is positive; non-priority work waits
/// on it.
#[derive(Debug, Default)]
pub struct PriorityGate {
    outstanding: Mutex<u64>,
    cleared: Condvar,
}

impl PriorityGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_priority(&self, n: u64) {
        if n == 0 {
            return;
        }
        *lock(&self.outstanding) += n;
    }

    /// Releases `n` units. The count never goes below zero.
    pub fn remove_priority(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(n);
        drop(outstanding);
        self.cleared.notify_all();
    }

    pub fn outstanding(&self) -> u64 {
        *lock(&self.outstanding)
    }

    pub fn is_open(&self) -> bool {
        self.outstanding() == 0
    }

    /// Blocks until no priority work is outstanding or `control` is
    /// cancelled. Cancellation is not an error here; callers check it next.
    pub fn wait_for_priority_clear(&self, control: &RunControl) {
        self.wait_for_others(control, 0);
    }

    /// Blocks until at most `own` units are outstanding, i.e. only the
    /// caller's own priority files remain.
    pub fn wait_for_others(&self, control: &RunControl, own: u64) {
        let mut outstanding = lock(&self.outstanding);
        while *outstanding > own {
            if control.is_cancelled() {
                return;
            }
            let (guard, _) = self
                .cleared
                .wait_timeout(outstanding, PRIORITY_RECHECK)
                .unwrap_or_else(PoisonError::into_inner);
            outstanding = guard;
        }
    }
}

/// Single slot serialising large-file transfers across all jobs.
#[derive(Debug, Default)]
pub struct TransferThrottle {
    busy: Mutex<bool>,
    released: Condvar,
}

impl TransferThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the slot; it is released when the permit drops.
    pub fn acquire(&self) -> ThrottlePermit<'_> {
        let busy = lock(&self.busy);
        let mut busy = self
            .released
            .wait_while(busy, |b| *b)
            .unwrap_or_else(PoisonError::into_inner);
        *busy = true;
        ThrottlePermit { throttle: self }
    }

    pub fn is_busy(&self) -> bool {
        *lock(&self.busy)
    }
}

#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ThrottlePermit<'a> {
    throttle: &'a TransferThrottle,
}

impl Drop for ThrottlePermit<'_> {
    fn drop(&mut self) {
        *lock(&self.throttle.busy) = false;
        self.throttle.released.notify_one();
    }
}

/// Gates shared by every worker of one manager.
#[derive(Debug, Default)]
pub struct SharedGates {
    pub priority: PriorityGate,
    pub throttle: TransferThrottle,
}

impl SharedGates {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_pause_blocks_until_resume() {
        let control = Arc::new(RunControl::new());
        control.pause();
        assert!(control.is_paused());

        let passed = Arc::new(AtomicBool::new(false));
        let handle = {
            let control = control.clone();
            let passed = passed.clone();
            thread::spawn(move || {
                let res = control.wait_while_paused();
                passed.store(true, Ordering::SeqCst);
                res
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!passed.load(Ordering::SeqCst));

        control.resume();
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert!(!control.is_paused());
    }

    #[test]
    fn test_cancel_opens_paused_gate() {
        let control = Arc::new(RunControl::new());
        control.pause();

        let handle = {
            let control = control.clone();
            thread::spawn(move || control.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(50));
        control.cancel();

        assert_eq!(handle.join().unwrap(), Err(Cancelled));
        assert!(!control.is_paused());
        // Pausing a cancelled job must not close the gate again.
        control.pause();
        assert!(!control.is_paused());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let control = Arc::new(RunControl::new());
        let handle = {
            let control = control.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let res = control.sleep(Duration::from_secs(10));
                (res, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        control.cancel();
        let (res, elapsed) = handle.join().unwrap();
        assert_eq!(res, Err(Cancelled));
        assert!(elapsed < Duration::from_secs(5));

        let idle = RunControl::new();
        assert_eq!(idle.sleep(Duration::from_millis(10)), Ok(()));
    }

    #[test]
    fn test_priority_counter_clamps_at_zero() {
        let gate = PriorityGate::new();
        assert!(gate.is_open());
        gate.add_priority(3);
        assert!(!gate.is_open());
        gate.remove_priority(1);
        assert_eq!(gate.outstanding(), 2);
        gate.remove_priority(10);
        assert_eq!(gate.outstanding(), 0);
        assert!(gate.is_open());
    }

    #[test]
    fn test_priority_wait_releases_when_cleared() {
        let gate = Arc::new(PriorityGate::new());
        let control = Arc::new(RunControl::new());
        gate.add_priority(2);

        let handle = {
            let gate = gate.clone();
            let control = control.clone();
            thread::spawn(move || gate.wait_for_priority_clear(&control))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        gate.remove_priority(2);
        handle.join().unwrap();
    }

    #[test]
    fn test_priority_wait_returns_on_cancel() {
        let gate = Arc::new(PriorityGate::new());
        let control = Arc::new(RunControl::new());
        gate.add_priority(1);

        let handle = {
            let gate = gate.clone();
            let control = control.clone();
            thread::spawn(move || gate.wait_for_priority_clear(&control))
        };
        control.cancel();
        handle.join().unwrap();
        assert_eq!(gate.outstanding(), 1);
    }

    #[test]
    fn test_wait_for_others_ignores_own_units() {
        let gate = PriorityGate::new();
        let control = RunControl::new();
        gate.add_priority(2);
        // Returns immediately: both units belong to the caller.
        gate.wait_for_others(&control, 2);
    }

    #[test]
    fn test_throttle_serialises_holders() {
        let throttle = Arc::new(TransferThrottle::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let throttle = throttle.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    let _permit = throttle.acquire();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!throttle.is_busy());
    }
}
