//! Terminal ownership and signal plumbing for job control.

use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::unistd::{tcsetpgrp, Pid};

/// Scoped signal-handler override restored on every exit path.
pub struct SignalGuard {
    sig: Signal,
    prev: SigHandler,
}

impl SignalGuard {
    /// Ignore `sig` until the guard drops.
    pub fn ignore(sig: Signal) -> nix::Result<SignalGuard> {
        let prev = unsafe { signal(sig, SigHandler::SigIgn)? };
        Ok(SignalGuard { sig, prev })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = signal(self.sig, self.prev);
        }
    }
}

/// Hand the controlling terminal to `pgid`. Returns whether the transfer
/// succeeded; failure downgrades gracefully to running without
/// job-control features rather than failing the pipeline.
///
/// SIGTTOU is ignored for the duration: a background shell calling
/// tcsetpgrp would otherwise be stopped by the kernel.
pub fn give_terminal_to(pgid: Pid) -> bool {
    let _guard = match SignalGuard::ignore(Signal::SIGTTOU) {
        Ok(g) => g,
        Err(e) => {
            log::debug!("cannot override SIGTTOU: {e}");
            return false;
        }
    };
    match tcsetpgrp(std::io::stdin(), pgid) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("terminal handoff to {pgid} failed: {e}");
            false
        }
    }
}

/// Stop a process, run `f`, then resume it. Used to keep a window-title
/// query subprocess from racing with the foreground command. Signal
/// failures (e.g. the process already exited) are ignored.
pub fn pause_call_resume<F: FnOnce()>(pid: u32, f: F) {
    let pid = Pid::from_raw(pid as i32);
    let _ = kill(pid, Signal::SIGSTOP);
    f();
    let _ = kill(pid, Signal::SIGCONT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_guard_restores_previous_handler() {
        // Install, drop, and verify the handler slot is back to its
        // previous value.
        let before = unsafe { signal(Signal::SIGTTOU, SigHandler::SigDfl).unwrap() };
        {
            let _g = SignalGuard::ignore(Signal::SIGTTOU).unwrap();
        }
        let after = unsafe { signal(Signal::SIGTTOU, SigHandler::SigDfl).unwrap() };
        assert_eq!(after, SigHandler::SigDfl);
        unsafe {
            let _ = signal(Signal::SIGTTOU, before);
        }
    }

    #[test]
    fn pause_call_resume_runs_callback_for_dead_pid() {
        // A reaped child is a safe ESRCH target.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let mut ran = false;
        pause_call_resume(pid, || ran = true);
        assert!(ran);
    }
}
