//! Bounded flag waits
//!
//! Every wait in the trigger protocol polls a condition with a short sleep
//! quantum (a futex wait when parked on a shared flag), warns once at half its
//! budget and gives up at the full budget by raising the group kill flag.

use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::error::{Result, SyncError};
use crate::shm::SharedFlagBlock;

/// Camera-side waits inside a trigger cycle.
pub const TRIGGER_QUANTUM: Duration = Duration::from_micros(100);
/// Orchestrator and relay waits.
pub const ORCHESTRATOR_QUANTUM: Duration = Duration::from_millis(1);
/// Readiness and pause waits.
pub const READINESS_QUANTUM: Duration = Duration::from_millis(10);

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Something that can cut a wait short, and be told when one ran out of time.
pub trait KillSwitch {
    fn should_stop(&self) -> bool;
    fn escalate(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    pub quantum: Duration,
    /// `None` waits until the condition holds or a kill flag is seen.
    pub timeout: Option<Duration>,
}

impl WaitBudget {
    pub fn trigger(timeout: Duration) -> Self {
        Self {
            quantum: TRIGGER_QUANTUM,
            timeout: Some(timeout),
        }
    }

    pub fn orchestrator(timeout: Duration) -> Self {
        Self {
            quantum: ORCHESTRATOR_QUANTUM,
            timeout: Some(timeout),
        }
    }

    pub fn readiness(timeout: Duration) -> Self {
        Self {
            quantum: READINESS_QUANTUM,
            timeout: Some(timeout),
        }
    }

    pub fn unbounded(quantum: Duration) -> Self {
        Self {
            quantum,
            timeout: None,
        }
    }
}

/// One logical wait. Several conditions awaited through the same `Waiter` share
/// its budget.
pub struct Waiter<'a, K: KillSwitch + ?Sized> {
    what: String,
    budget: WaitBudget,
    started: Instant,
    warned: bool,
    kill: &'a K,
}

impl<'a, K: KillSwitch + ?Sized> Waiter<'a, K> {
    pub fn new(what: impl Into<String>, budget: WaitBudget, kill: &'a K) -> Self {
        Self {
            what: what.into(),
            budget,
            started: Instant::now(),
            warned: false,
            kill,
        }
    }

    /// Poll `condition` until it holds, sleeping one quantum in between.
    pub fn until(&mut self, mut condition: impl FnMut() -> Result<bool>) -> Result<()> {
        loop {
            if condition()? {
                return Ok(());
            }
            self.tick()?;
            std::thread::sleep(self.budget.quantum);
        }
    }

    /// Wait for a shared flag to read `want`, parked on its futex.
    pub fn until_flag(&mut self, block: &SharedFlagBlock, flag: usize, want: bool) -> Result<()> {
        loop {
            if block.is_set(flag) == want {
                return Ok(());
            }
            self.tick()?;
            block.park(flag, !want, self.budget.quantum);
        }
    }

    fn tick(&mut self) -> Result<()> {
        if self.kill.should_stop() {
            return Err(SyncError::Cancelled {
                what: self.what.clone(),
            });
        }

        let Some(timeout) = self.budget.timeout else {
            return Ok(());
        };
        let waited = self.started.elapsed();
        if !self.warned && waited > timeout / 2 {
            self.warned = true;
            warn!(what = %self.what, ?waited, ?timeout, "wait is past half its budget");
        }
        if waited > timeout {
            error!(what = %self.what, ?waited, "wait timed out, shutting down the camera group");
            self.kill.escalate();
            return Err(SyncError::Timeout {
                what: self.what.clone(),
                waited,
            });
        }
        Ok(())
    }
}

/// Shorthand for a single-condition wait.
pub fn wait_until<K: KillSwitch + ?Sized>(
    what: &str,
    budget: WaitBudget,
    kill: &K,
    condition: impl FnMut() -> Result<bool>,
) -> Result<()> {
    Waiter::new(what, budget, kill).until(condition)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    struct TestKill {
        stop: AtomicBool,
        escalated: AtomicBool,
    }

    impl KillSwitch for TestKill {
        fn should_stop(&self) -> bool {
            self.stop.load(Ordering::Acquire)
        }

        fn escalate(&self) {
            self.escalated.store(true, Ordering::Release);
            self.stop.store(true, Ordering::Release);
        }
    }

    fn budget(ms: u64) -> WaitBudget {
        WaitBudget {
            quantum: Duration::from_millis(1),
            timeout: Some(Duration::from_millis(ms)),
        }
    }

    #[test]
    fn test_returns_once_condition_holds() {
        let kill = TestKill::default();
        let mut polls = 0;
        wait_until("three polls", budget(1_000), &kill, || {
            polls += 1;
            Ok(polls == 3)
        })
        .unwrap();
        assert_eq!(polls, 3);
    }

    #[test]
    fn test_timeout_escalates() {
        let kill = TestKill::default();
        let start = Instant::now();
        let err = wait_until("never", budget(30), &kill, || Ok(false)).unwrap_err();
        assert!(matches!(err, SyncError::Timeout { .. }));
        assert!(kill.escalated.load(Ordering::Acquire));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_kill_cancels() {
        let kill = TestKill::default();
        kill.stop.store(true, Ordering::Release);
        let err = wait_until("killed", budget(1_000), &kill, || Ok(false)).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!kill.escalated.load(Ordering::Acquire));
    }

    #[test]
    fn test_condition_errors_propagate() {
        let kill = TestKill::default();
        let err = wait_until("failing", budget(1_000), &kill, || {
            Err(SyncError::Desync("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::Desync(_)));
    }
}
