//! Process-wide kill switch for outbound sends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Whether outbound sending is enabled. Last write wins.
///
/// Flipped either in-band (STOP/START chat commands) or out-of-band
/// (`/system-control`). Inbound command processing is never gated by it.
#[derive(Debug, Clone)]
pub struct SystemSwitch {
    enabled: Arc<AtomicBool>,
}

impl Default for SystemSwitch {
    fn default() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl SystemSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Set the flag; `source` is recorded in the log only.
    pub fn set(&self, enabled: bool, source: &str) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            info!(source, "System START");
        } else {
            info!(source, "System STOP");
        }
    }
}
