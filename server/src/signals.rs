//! Graceful-shutdown signal handling.
//!
//! `xitca-server`'s `signals.rs` builds a `Future` over `tokio::signal::unix`
//! streams; this worker loop is synchronous and level-triggered (driven by
//! `mio::Poll`, not an async runtime), so the same job is done the way
//! `flux-network`'s `spine::scoped` module does it: `signal_hook::flag`
//! registers a shared `AtomicBool` that each worker's poll loop checks once
//! per tick, with no intermediate thread or channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;

/// Shared flags every worker polls once per scheduler tick.
#[derive(Clone)]
pub struct ShutdownSignal {
    term: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Registers handlers for `SIGINT`/`SIGTERM`/`SIGQUIT`/`SIGHUP`, all
    /// treated as "begin graceful shutdown" (the core distinguishes neither
    /// a fast vs. graceful stop nor per-signal behavior; that policy lives
    /// above this crate).
    pub fn install() -> std::io::Result<Self> {
        let term = Arc::new(AtomicBool::new(false));
        for sig in [SIGINT, SIGTERM, SIGQUIT, SIGHUP] {
            flag::register(sig, Arc::clone(&term))?;
        }
        Ok(Self { term })
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.term.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn trigger(&self) {
        self.term.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_is_observed() {
        let sig = ShutdownSignal { term: Arc::new(AtomicBool::new(false)) };
        assert!(!sig.should_stop());
        sig.trigger();
        assert!(sig.should_stop());
    }
}
