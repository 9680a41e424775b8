use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
    None,
    /// Stop at the next tick and shut down in order.
    Orderly,
    /// Also abandon long waits and retry backoffs.
    Immediate,
}

/// Operator abort flag shared between the signal handler and the control
/// loop. The loop polls it once per tick.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the abort level by one step and return the new level.
    pub fn request(&self) -> CancelLevel {
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v < 2).then_some(v + 1)
            });
        self.level()
    }

    pub fn level(&self) -> CancelLevel {
        match self.0.load(Ordering::SeqCst) {
            0 => CancelLevel::None,
            1 => CancelLevel::Orderly,
            _ => CancelLevel::Immediate,
        }
    }

    pub fn is_requested(&self) -> bool {
        self.level() != CancelLevel::None
    }

    pub fn is_immediate(&self) -> bool {
        self.level() == CancelLevel::Immediate
    }
}
