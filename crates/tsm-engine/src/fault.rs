//! Fault handling for shared-virtual-memory mode.
//!
//! A handler thread asks its [`FaultResolver`] to resolve one pending
//! translation fault at a time until the orchestrator raises the
//! [`CompletionFlag`]. There is no timeout here: a caller that never sets the
//! flag keeps the handler spinning.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::EngineError;

/// Outcome of one resolution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Resolved,
    NonePending,
    /// Negative errno-style code from the memory-management side.
    Error(i32),
}

/// Memory-management collaborator that services translation faults.
pub trait FaultResolver: Send + Sync {
    fn resolve_one_fault(&self) -> FaultStatus;
}

impl<R: FaultResolver + ?Sized> FaultResolver for Arc<R> {
    fn resolve_one_fault(&self) -> FaultStatus {
        (**self).resolve_one_fault()
    }
}

/// One-way `false -> true` flag shared by the orchestrator and the handler.
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag(Arc<AtomicBool>);

impl CompletionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counters collected by a handler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub resolved: u64,
    pub idle: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    resolved: AtomicU64,
    idle: AtomicU64,
    errors: AtomicU64,
}

/// Polls a [`FaultResolver`] until the completion flag is set.
#[derive(Debug)]
pub struct FaultHandler {
    flag: CompletionFlag,
    idle_backoff: Duration,
    counters: Counters,
}

impl FaultHandler {
    pub fn new(flag: CompletionFlag, idle_backoff: Duration) -> Self {
        Self {
            flag,
            idle_backoff,
            counters: Counters::default(),
        }
    }

    /// Serve faults until the flag is observed set.
    ///
    /// Always makes at least one request, then checks the flag after each
    /// one, so the loop exits within one iteration of the flag being set.
    /// Errors are logged and counted; they never stop the loop.
    pub fn run<R: FaultResolver + ?Sized>(&self, resolver: &R) -> FaultStats {
        debug!("fault handler started");
        loop {
            match resolver.resolve_one_fault() {
                FaultStatus::Resolved => {
                    self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                }
                FaultStatus::NonePending => {
                    self.counters.idle.fetch_add(1, Ordering::Relaxed);
                    self.idle();
                }
                FaultStatus::Error(code) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    let err = EngineError::FaultResolution(code);
                    warn!(code, error = %err, "continuing after fault resolution error");
                }
            }
            if self.flag.is_set() {
                break;
            }
        }
        let stats = self.stats();
        debug!(
            resolved = stats.resolved,
            idle = stats.idle,
            errors = stats.errors,
            "fault handler stopped"
        );
        stats
    }

    pub fn stats(&self) -> FaultStats {
        FaultStats {
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            idle: self.counters.idle.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    fn idle(&self) {
        if self.idle_backoff.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.idle_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::thread;

    /// Replays a fixed script, then reports nothing pending.
    struct Scripted(Mutex<VecDeque<FaultStatus>>);

    impl Scripted {
        fn new(script: &[FaultStatus]) -> Self {
            Self(Mutex::new(script.iter().copied().collect()))
        }
    }

    impl FaultResolver for Scripted {
        fn resolve_one_fault(&self) -> FaultStatus {
            self.0.lock().pop_front().unwrap_or(FaultStatus::NonePending)
        }
    }

    #[test]
    fn test_flag_is_one_way() {
        let flag = CompletionFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        flag.set();
        assert!(other.is_set());
    }

    #[test]
    fn test_handler_polls_at_least_once() {
        let flag = CompletionFlag::new();
        flag.set();
        let handler = FaultHandler::new(flag, Duration::ZERO);
        let stats = handler.run(&Scripted::new(&[FaultStatus::Resolved]));
        assert_eq!(
            stats,
            FaultStats {
                resolved: 1,
                idle: 0,
                errors: 0
            }
        );
    }

    #[test]
    fn test_errors_do_not_stop_the_loop() {
        let flag = CompletionFlag::new();
        let handler = Arc::new(FaultHandler::new(flag.clone(), Duration::ZERO));
        let resolver = Scripted::new(&[
            FaultStatus::Error(-14),
            FaultStatus::Resolved,
            FaultStatus::Error(-5),
            FaultStatus::Resolved,
        ]);

        let worker = {
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler.run(&resolver))
        };
        while handler.stats().resolved < 2 {
            thread::yield_now();
        }
        flag.set();
        let stats = worker.join().unwrap();
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.errors, 2);
    }

    #[test]
    fn test_handler_exits_after_flag_within_bound() {
        let flag = CompletionFlag::new();
        let handler = FaultHandler::new(flag.clone(), Duration::from_micros(50));
        let (done_tx, done_rx) = channel::bounded(1);

        thread::spawn(move || {
            let stats = handler.run(&Scripted::new(&[]));
            let _ = done_tx.send(stats);
        });
        thread::sleep(Duration::from_millis(5));
        assert!(done_rx.try_recv().is_err(), "handler exited before the flag was set");
        flag.set();
        let stats = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("handler did not observe the completion flag");
        assert!(stats.idle > 0);
    }
}
