use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::libc::c_int;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Installs SIGINT/SIGTERM handlers and returns the flag they raise.
///
/// Must run before worker threads are spawned.
pub fn install_shutdown_handler() -> Result<&'static AtomicBool> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to atomics.
        unsafe { signal::sigaction(sig, &action) }
            .with_context(|| format!("failed to install {sig} handler"))?;
    }

    debug!("shutdown signal handlers installed");
    Ok(&SHUTDOWN_REQUESTED)
}

extern "C" fn on_signal(signal: c_int) {
    SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Logs the received signal, if any, once the main loop has noticed it.
pub fn report_shutdown() -> bool {
    if !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        return false;
    }

    let received = SIGNAL_RECEIVED.load(Ordering::SeqCst);
    let name = Signal::try_from(received)
        .map(|sig| sig.as_str())
        .unwrap_or("unknown");
    warn!(signal = name, "shutdown requested, in-flight queries were abandoned");
    true
}
