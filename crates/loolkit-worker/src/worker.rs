//! Process-wide lifecycle state: the termination flag, the signal trap,
//! and the exit codes the supervisor keys on.
//!
//! These are the only process-globals in the worker; everything else is
//! owned by the explicit `build jail -> init engine -> serve` lifecycle in
//! `main`. The flag is polled at the top of the pump iteration, in every
//! callback trampoline, and in the control loop; a delivered termination
//! signal therefore stops each of them at the next safe point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::info;

/// Normal shutdown: discard, EOF, or signal.
pub const EXIT_OK: i32 = 0;

/// Jail construction, chroot, or engine initialization failure.
pub const EXIT_SOFTWARE: i32 = 70;

/// Capability manipulation failure.
pub const EXIT_CAPABILITY: i32 = 1;

fn termination_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Held across clean shutdown so a termination signal delivered while we
/// are already exiting cannot race the orderly path.
static SIG_TRAP: Mutex<()> = Mutex::new(());

/// Whether process termination has been requested.
pub fn termination_requested() -> bool {
    termination_flag().load(Ordering::SeqCst)
}

/// Requests process termination; every loop observes it at its next safe
/// point.
pub fn request_termination() {
    termination_flag().store(true, Ordering::SeqCst);
}

/// Installs the termination signal handlers.
///
/// All of them only set the flag; the loops that poll it do the actual
/// unwinding.
///
/// # Errors
///
/// Returns an error if a handler cannot be registered.
pub fn install_signal_handlers() -> std::io::Result<()> {
    let flag = termination_flag();
    for signal in [SIGTERM, SIGINT, SIGQUIT, SIGHUP] {
        signal_hook::flag::register(signal, Arc::clone(flag))?;
    }
    Ok(())
}

/// Builds the connect handshake line announcing this worker to the
/// supervisor. The engine version, when queried, rides along URL-encoded
/// so the supervisor can expose it without re-asking.
#[must_use]
pub fn handshake_line(pid: u32, version: Option<&str>) -> String {
    let mut line = format!("child pid={pid}");
    if let Some(version) = version {
        line.push_str(" version=");
        line.push_str(&loolkit_core::protocol::url_encode(version.as_bytes()));
    }
    line
}

/// Exits the process immediately, without running destructors.
///
/// Takes the signal trap first so a signal arriving mid-exit blocks
/// instead of re-entering shutdown. Used for the purge-to-zero exit and
/// for setup-fatal errors, where a partially constructed jail has weaker
/// security properties than a dead worker.
pub fn fast_exit(code: i32) -> ! {
    let _trap = SIG_TRAP.lock().unwrap_or_else(PoisonError::into_inner);
    info!(code, "process exiting");
    std::process::exit(code);
}
