//! Countdown and grace-period scheduling.
//!
//! The core never sleeps or spawns threads. Anything time-driven is
//! expressed as a [`TimerTask`] handed to a [`Scheduler`], and the driver
//! feeds due tasks back into the core when they fire. Tests (and any
//! single-threaded driver) use [`VirtualScheduler`] so nothing ever waits
//! on a wall clock.

use std::time::Duration;

/// Opaque handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// A task the core wants delivered back to it after a delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTask {
    /// One second of the active phase countdown has elapsed.
    RoundTick,

    /// A disconnected participant's grace period ran out.
    GraceExpiry { persistent_id: String },
}

/// Scheduling capability injected into the core.
///
/// Implementations must deliver each scheduled task at most once, and
/// must treat cancellation of an unknown, already-fired, or
/// already-cancelled handle as a no-op.
pub trait Scheduler {
    /// Schedule `task` for delivery after `delay`.
    fn schedule_after(&mut self, delay: Duration, task: TimerTask) -> TimerHandle;

    /// Cancel a pending task. Returns `false` if the handle is not
    /// pending (already fired or already cancelled).
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

/// Deterministic scheduler driven by explicit time advancement.
#[derive(Debug, Default)]
pub struct VirtualScheduler {
    now: Duration,
    next_handle: u64,
    pending: Vec<Pending>,
}

#[derive(Debug)]
struct Pending {
    handle: TimerHandle,
    due_at: Duration,
    task: TimerTask,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Number of tasks still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Advance virtual time, returning due tasks in firing order.
    pub fn advance(&mut self, by: Duration) -> Vec<TimerTask> {
        self.now += by;
        let now = self.now;

        let mut due = Vec::new();
        let mut rest = Vec::new();
        for pending in self.pending.drain(..) {
            if pending.due_at <= now {
                due.push(pending);
            } else {
                rest.push(pending);
            }
        }
        self.pending = rest;

        due.sort_by_key(|p| (p.due_at, p.handle.0));
        due.into_iter().map(|p| p.task).collect()
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule_after(&mut self, delay: Duration, task: TimerTask) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.pending.push(Pending {
            handle,
            due_at: self.now + delay,
            task,
        });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.handle != handle);
        self.pending.len() < before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_delivers_due_tasks() {
        let mut sched = VirtualScheduler::new();

        sched.schedule_after(Duration::from_secs(5), TimerTask::RoundTick);
        sched.schedule_after(
            Duration::from_secs(2),
            TimerTask::GraceExpiry {
                persistent_id: "p-1".to_string(),
            },
        );

        // Nothing due yet
        assert!(sched.advance(Duration::from_secs(1)).is_empty());
        assert_eq!(sched.pending_count(), 2);

        // Grace expiry fires first
        let fired = sched.advance(Duration::from_secs(1));
        assert_eq!(
            fired,
            vec![TimerTask::GraceExpiry {
                persistent_id: "p-1".to_string()
            }]
        );

        // Then the tick
        let fired = sched.advance(Duration::from_secs(3));
        assert_eq!(fired, vec![TimerTask::RoundTick]);
        assert_eq!(sched.pending_count(), 0);
    }

    #[test]
    fn test_firing_order() {
        let mut sched = VirtualScheduler::new();

        sched.schedule_after(Duration::from_secs(3), TimerTask::RoundTick);
        sched.schedule_after(
            Duration::from_secs(1),
            TimerTask::GraceExpiry {
                persistent_id: "p-1".to_string(),
            },
        );
        sched.schedule_after(
            Duration::from_secs(2),
            TimerTask::GraceExpiry {
                persistent_id: "p-2".to_string(),
            },
        );

        let fired = sched.advance(Duration::from_secs(10));
        assert_eq!(
            fired,
            vec![
                TimerTask::GraceExpiry {
                    persistent_id: "p-1".to_string()
                },
                TimerTask::GraceExpiry {
                    persistent_id: "p-2".to_string()
                },
                TimerTask::RoundTick,
            ]
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut sched = VirtualScheduler::new();

        let handle = sched.schedule_after(Duration::from_secs(5), TimerTask::RoundTick);

        assert!(sched.cancel(handle));
        assert!(!sched.cancel(handle));
        assert!(sched.advance(Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut sched = VirtualScheduler::new();

        let handle = sched.schedule_after(Duration::from_secs(1), TimerTask::RoundTick);
        assert_eq!(sched.advance(Duration::from_secs(1)).len(), 1);

        assert!(!sched.cancel(handle));
    }

    #[test]
    fn test_clock_accumulates() {
        let mut sched = VirtualScheduler::new();

        sched.advance(Duration::from_secs(2));
        sched.advance(Duration::from_secs(3));
        assert_eq!(sched.now(), Duration::from_secs(5));

        // Delays are relative to the current virtual time
        sched.schedule_after(Duration::from_secs(1), TimerTask::RoundTick);
        assert!(sched.advance(Duration::from_millis(500)).is_empty());
        assert_eq!(sched.advance(Duration::from_millis(500)).len(), 1);
    }
}
