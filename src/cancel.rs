//! Guards that let delayed work notice it has been superseded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Generation counter for stop/start sequences.
///
/// A fade-out captures [`StopToken::current`] when it begins and finalizes only
/// if the value is unchanged when its deadline arrives. Every Play and every
/// Stop calls [`StopToken::bump`].
#[derive(Debug, Default)]
pub struct StopToken {
    generation: u64,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.generation
    }

    pub fn bump(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub fn is_current(&self, captured: u64) -> bool {
        self.generation == captured
    }
}

/// Shared cancel flag handed to every sleep, timer and observer.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True when both handles refer to the same underlying flag.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}
