//! What a worker does when a poll comes back empty
//!
//! Workers never block: an empty receive or dequeue is followed by a backoff step and an
//! immediate retry. The policy only decides how hard the core spins in between.

use crossbeam_utils::Backoff;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Issue a single pause hint and retry, forever
    #[default]
    Spin,
    /// Spin with exponentially more pause hints, then start yielding the thread to the scheduler
    SpinThenYield,
}

pub struct IdleBackoff {
    policy: BackoffPolicy,
    backoff: Backoff,
    idle_rounds: u64,
}

impl IdleBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            backoff: Backoff::new(),
            idle_rounds: 0,
        }
    }

    /// Called after a poll that found no work
    pub fn idle(&mut self) {
        self.idle_rounds += 1;
        match self.policy {
            BackoffPolicy::Spin => std::hint::spin_loop(),
            BackoffPolicy::SpinThenYield => self.backoff.snooze(),
        }
    }

    /// Called after a poll that found work
    pub fn reset(&mut self) {
        self.idle_rounds = 0;
        self.backoff.reset();
    }

    /// Consecutive empty polls since the last one that found work
    pub fn idle_rounds(&self) -> u64 {
        self.idle_rounds
    }

    /// Whether the worker has stopped spinning and is now handing its core back to the OS
    pub fn is_yielding(&self) -> bool {
        match self.policy {
            BackoffPolicy::Spin => false,
            BackoffPolicy::SpinThenYield => self.backoff.is_completed(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_spin_never_yields() {
        let mut backoff = IdleBackoff::new(BackoffPolicy::Spin);
        for _ in 0..1_000 {
            backoff.idle();
        }
        assert_eq!(backoff.idle_rounds(), 1_000);
        assert!(!backoff.is_yielding());
    }

    #[test]
    fn test_spin_then_yield_escalates_and_resets() {
        let mut backoff = IdleBackoff::new(BackoffPolicy::SpinThenYield);
        assert!(!backoff.is_yielding());
        for _ in 0..64 {
            backoff.idle();
        }
        assert!(backoff.is_yielding());

        backoff.reset();
        assert_eq!(backoff.idle_rounds(), 0);
        assert!(!backoff.is_yielding());
    }
}
