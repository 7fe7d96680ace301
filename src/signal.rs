//! Interrupt handling for long-running apply jobs.
//!
//! A [`CancelToken`] is a cheap, clonable flag shared by the dispatcher and
//! every worker.  [`install_handlers`] starts a listener thread that trips
//! the token on SIGINT, SIGTERM or SIGHUP; the engine then stops
//! dispatching, gives in-flight transformations their grace period, and
//! fails without writing anything.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::warn;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    /// Signal that tripped the token, 0 when cancelled programmatically.
    signal:    AtomicI32,
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    fn cancel_by_signal(&self, signal: i32) {
        self.state.signal.store(signal, Ordering::Release);
        self.cancel();
    }

    /// Name of the signal that cancelled the token, if any.
    pub fn signal_name(&self) -> Option<&'static str> {
        match self.state.signal.load(Ordering::Acquire) {
            0       => None,
            SIGINT  => Some("SIGINT"),
            SIGTERM => Some("SIGTERM"),
            SIGHUP  => Some("SIGHUP"),
            _       => Some("unknown"),
        }
    }
}

/// Keeps the signal listener alive; dropping it unregisters the handlers.
pub struct SignalGuard {
    handle:   Handle,
    listener: Option<thread::JoinHandle<()>>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

/// Trip `token` when the process receives SIGINT, SIGTERM or SIGHUP.
pub fn install_handlers(token: &CancelToken) -> io::Result<SignalGuard> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let handle = signals.handle();
    let token = token.clone();
    let listener = thread::Builder::new()
        .name("ffindex-signal-listener".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                warn!(signal, "interrupt received; finishing in-flight records");
                token.cancel_by_signal(signal);
            }
        })?;
    Ok(SignalGuard { handle, listener: Some(listener) })
}
