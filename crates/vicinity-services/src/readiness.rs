//! Latched readiness flag.
//!
//! Set true once the initial neighborhood fetch commits, never cleared
//! for the lifetime of the process — readiness does not regress across
//! LBN reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Write-once boolean shared with the rest of the profile server.
#[derive(Clone, Default)]
pub struct Readiness {
    initialized: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the flag. Idempotent.
    pub fn latch(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }
}
