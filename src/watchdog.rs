use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rhai::Dynamic;

pub(crate) const TIMEOUT_TOKEN: &str = "timeout";
pub(crate) const HALT_TOKEN: &str = "halt";

const POLL_STRIDE: u64 = 1024;

struct WatchdogState {
    deadline: Mutex<Option<Instant>>,
    halted: AtomicBool,
}

/// Forced interruption for one window's evaluations, injected as a periodic
/// clock poll into the interpreter's progress hook.
#[derive(Clone)]
pub(crate) struct Watchdog {
    state: Arc<WatchdogState>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self { state: Arc::new(WatchdogState { deadline: Mutex::new(None), halted: AtomicBool::new(false) }) }
    }

    pub(crate) fn install(&self, engine: &mut rhai::Engine) {
        let state = Arc::clone(&self.state);
        engine.on_progress(move |ops| {
            if ops % POLL_STRIDE != 0 {
                return None;
            }
            if state.halted.load(Ordering::Relaxed) {
                return Some(Dynamic::from(HALT_TOKEN.to_string()));
            }
            let deadline = state.deadline.lock().unwrap_or_else(PoisonError::into_inner);
            match *deadline {
                Some(at) if Instant::now() >= at => Some(Dynamic::from(TIMEOUT_TOKEN.to_string())),
                _ => None,
            }
        });
    }

    /// Nested arms keep the outermost deadline; the inner guard releases nothing.
    pub(crate) fn arm(&self, timeout: Option<Duration>) -> DeadlineGuard<'_> {
        let Some(timeout) = timeout else {
            return DeadlineGuard { watchdog: self, armed: false };
        };
        let mut deadline = self.state.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        if deadline.is_some() {
            return DeadlineGuard { watchdog: self, armed: false };
        }
        *deadline = Some(Instant::now() + timeout);
        DeadlineGuard { watchdog: self, armed: true }
    }

    pub(crate) fn halt(&self) {
        self.state.halted.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn is_halted(&self) -> bool {
        self.state.halted.load(Ordering::Relaxed)
    }
}

pub(crate) struct DeadlineGuard<'a> {
    watchdog: &'a Watchdog,
    armed: bool,
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut deadline =
                self.watchdog.state.deadline.lock().unwrap_or_else(PoisonError::into_inner);
            *deadline = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline_set(watchdog: &Watchdog) -> bool {
        watchdog.state.deadline.lock().expect("deadline lock").is_some()
    }

    #[test]
    fn nested_arms_keep_the_outer_deadline() {
        let watchdog = Watchdog::new();
        let outer = watchdog.arm(Some(Duration::from_millis(50)));
        {
            let _inner = watchdog.arm(Some(Duration::from_secs(999)));
        }
        assert!(deadline_set(&watchdog), "outer deadline survives the nested call");
        drop(outer);
        assert!(!deadline_set(&watchdog), "outer guard disarms on drop");
    }

    #[test]
    fn arm_without_timeout_is_inert() {
        let watchdog = Watchdog::new();
        let _guard = watchdog.arm(None);
        assert!(!deadline_set(&watchdog));
    }

    #[test]
    fn halt_is_sticky() {
        let watchdog = Watchdog::new();
        assert!(!watchdog.is_halted());
        watchdog.halt();
        assert!(watchdog.is_halted());
    }
}
