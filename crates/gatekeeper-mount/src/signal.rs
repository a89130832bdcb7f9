//! Shutdown signal handling.
//!
//! The first SIGINT, SIGTERM or SIGHUP requests a graceful shutdown: the
//! mount is released, the reconciler stopped and queued catalog updates
//! drained. A second signal exits the process immediately.

use parking_lot::{Condvar, Mutex};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::consts::signal::SIGHUP;
use signal_hook::flag;
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Set once shutdown has been requested, guarded for condvar waits.
static SHUTDOWN: OnceLock<(Mutex<bool>, Condvar)> = OnceLock::new();

fn shutdown_state() -> &'static (Mutex<bool>, Condvar) {
    SHUTDOWN.get_or_init(|| (Mutex::new(false), Condvar::new()))
}

/// Installs handlers for SIGINT, SIGTERM and SIGHUP.
///
/// Calling this more than once is a no-op.
pub fn install_signal_handler() -> std::io::Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let armed = Arc::new(AtomicBool::new(false));
    let mut signals: Vec<i32> = TERM_SIGNALS.to_vec();
    signals.push(SIGHUP);

    for &sig in &signals {
        // Exits only once `armed` is set, i.e. on the second signal.
        flag::register_conditional_shutdown(sig, 1, Arc::clone(&armed))?;
        flag::register(sig, Arc::clone(&armed))?;
    }

    let mut iter = Signals::new(&signals)?;
    std::thread::Builder::new()
        .name("gatekeeper-signals".into())
        .spawn(move || {
            if let Some(sig) = iter.forever().next() {
                tracing::info!(signal = sig, "Shutdown requested (signal again to force exit)");
                request_shutdown();
            }
        })?;

    Ok(())
}

/// Requests shutdown without a signal, e.g. when the session ends on its own.
pub fn request_shutdown() {
    let (lock, cvar) = shutdown_state();
    let mut requested = lock.lock();
    *requested = true;
    cvar.notify_all();
}

/// Returns true once shutdown has been requested.
pub fn shutdown_requested() -> bool {
    *shutdown_state().0.lock()
}

/// Blocks until shutdown is requested.
pub fn wait_for_shutdown() {
    let (lock, cvar) = shutdown_state();
    let mut requested = lock.lock();
    while !*requested {
        cvar.wait(&mut requested);
    }
}

/// Blocks until shutdown is requested or `timeout` elapses.
///
/// Returns true if shutdown was requested.
pub fn wait_for_shutdown_timeout(timeout: Duration) -> bool {
    let (lock, cvar) = shutdown_state();
    let mut requested = lock.lock();
    if !*requested {
        cvar.wait_for(&mut requested, timeout);
    }
    *requested
}
