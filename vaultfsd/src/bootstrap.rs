/// Process-level hardening applied at startup, before any token is read.
///
/// Both steps are best-effort: a failure is logged and the daemon carries on.
///
/// 1. **`PR_SET_DUMPABLE 0`** keeps tokens and secret content out of core
///    dumps and `/proc/<pid>/mem`.
/// 2. **`mlockall(MCL_CURRENT | MCL_FUTURE)`** keeps pages holding secret
///    content out of swap.  Needs `CAP_IPC_LOCK` or a large enough
///    `RLIMIT_MEMLOCK`.
#[cfg(unix)]
pub fn harden_process() {
    set_not_dumpable();
    lock_memory();
}

#[cfg(not(unix))]
pub fn harden_process() {}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("process marked non-dumpable");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_not_dumpable() {}

#[cfg(unix)]
fn lock_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("memory locked");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed, secrets may be swapped (non-fatal): {err}");
    }
}
