//! The running-pipeline object: per-stage handles, capture draining, and
//! the teardown sequence that settles exit codes and returns the terminal.

use std::fs::File;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::process::Child;
use std::thread::JoinHandle;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgrp, Pid};

use crate::jobs::give_terminal_to;
use crate::proxy::{ProcProxy, ProcProxyThread};
use crate::spec::CaptureMode;

/// One pipeline stage at runtime. External processes and in-process
/// callables share the same waiting surface.
pub enum ProcHandle {
    External(ExternalProc),
    Thread(ProcProxyThread),
    Sync(ProcProxy),
}

/// An OS child plus its settled exit code, so waiting is idempotent.
pub struct ExternalProc {
    child: Child,
    code: Option<i32>,
}

impl From<Child> for ExternalProc {
    fn from(child: Child) -> Self {
        ExternalProc { child, code: None }
    }
}

impl ProcHandle {
    /// OS pid, when the stage is a real process.
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcHandle::External(p) => Some(p.child.id()),
            _ => None,
        }
    }

    /// Block until the stage finishes and report its exit code. A child
    /// killed by a signal maps to `128 + signo`, shell-style.
    pub fn wait(&mut self) -> i32 {
        match self {
            ProcHandle::External(p) => {
                if let Some(code) = p.code {
                    return code;
                }
                let code = match p.child.wait() {
                    Ok(status) => status
                        .code()
                        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                    Err(e) => {
                        log::warn!("wait failed for pid {}: {e}", p.child.id());
                        1
                    }
                };
                p.code = Some(code);
                code
            }
            ProcHandle::Thread(p) => p.wait(),
            ProcHandle::Sync(p) => p.wait(),
        }
    }

    /// Non-blocking status check. `None` while the stage is running.
    pub fn poll(&mut self) -> Option<i32> {
        match self {
            ProcHandle::External(p) => {
                if let Some(code) = p.code {
                    return Some(code);
                }
                match p.child.try_wait() {
                    Ok(Some(status)) => {
                        let code = status
                            .code()
                            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
                        p.code = Some(code);
                        Some(code)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("status check failed for pid {}: {e}", p.child.id());
                        None
                    }
                }
            }
            ProcHandle::Thread(p) => p.poll(),
            ProcHandle::Sync(p) => Some(p.wait()),
        }
    }

    /// Best-effort SIGTERM; in-process stages cannot be interrupted.
    pub fn terminate(&mut self) {
        if let ProcHandle::External(p) = self {
            if p.code.is_none() {
                let _ = kill(Pid::from_raw(p.child.id() as i32), Signal::SIGTERM);
            }
        }
    }
}

/// Drains one capture pipe on a dedicated thread so no stage ever blocks
/// on a full pipe buffer while we wait on another stage.
struct DrainThread {
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl DrainThread {
    fn spawn(mut f: File) -> std::io::Result<DrainThread> {
        let handle = std::thread::Builder::new()
            .name("capture-drain".to_string())
            .spawn(move || {
                let mut buf = Vec::new();
                if let Err(e) = f.read_to_end(&mut buf) {
                    log::warn!("capture drain failed: {e}");
                }
                buf
            })?;
        Ok(DrainThread {
            handle: Some(handle),
        })
    }

    /// Invalid UTF-8 in captured output is replaced, not fatal.
    fn finish(&mut self) -> String {
        match self.handle.take() {
            Some(h) => String::from_utf8_lossy(&h.join().unwrap_or_default()).into_owned(),
            None => String::new(),
        }
    }
}

/// A launched pipeline. Lives through `end()`, which waits every stage in
/// order, joins the capture drains, and hands the terminal back. The
/// result accessors settle the pipeline first, so they are safe to call
/// in any order and any number of times; `poll_returncodes` is the
/// non-blocking view for a pipeline still running.
pub struct CommandPipeline {
    /// Original per-stage argument vectors, for display and job records.
    pub cmds: Vec<Vec<String>>,
    procs: Vec<ProcHandle>,
    capture: CaptureMode,
    stdout_drain: Option<DrainThread>,
    stderr_drain: Option<DrainThread>,
    /// Process group that was given the terminal, if any; `end()` owes a
    /// handoff back to our own group.
    term_pgid: Option<Pid>,
    returncodes: Vec<i32>,
    output: String,
    errors: String,
    ended: bool,
}

impl std::fmt::Debug for CommandPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("cmds", &self.cmds)
            .field("capture", &self.capture)
            .field("term_pgid", &self.term_pgid)
            .field("returncodes", &self.returncodes)
            .field("output", &self.output)
            .field("errors", &self.errors)
            .field("ended", &self.ended)
            .finish()
    }
}

impl CommandPipeline {
    pub(crate) fn new(
        cmds: Vec<Vec<String>>,
        procs: Vec<ProcHandle>,
        capture: CaptureMode,
        captured_stdout: Option<File>,
        captured_stderr: Option<File>,
        term_pgid: Option<Pid>,
    ) -> std::io::Result<CommandPipeline> {
        // Drains start before any wait; a capture pipe filling up must
        // never stall the pipeline.
        let stdout_drain = captured_stdout.map(DrainThread::spawn).transpose()?;
        let stderr_drain = captured_stderr.map(DrainThread::spawn).transpose()?;
        Ok(CommandPipeline {
            cmds,
            procs,
            capture,
            stdout_drain,
            stderr_drain,
            term_pgid,
            returncodes: Vec::new(),
            output: String::new(),
            errors: String::new(),
            ended: false,
        })
    }

    pub fn capture(&self) -> CaptureMode {
        self.capture
    }

    /// OS pids per stage, `None` for in-process stages.
    pub fn pids(&self) -> Vec<Option<u32>> {
        self.procs.iter().map(ProcHandle::pid).collect()
    }

    /// Wait every stage in pipeline order, collect exit codes, join the
    /// capture drains, and return the terminal to our own process group.
    /// Idempotent.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.returncodes = self.procs.iter_mut().map(ProcHandle::wait).collect();
        if let Some(d) = &mut self.stdout_drain {
            self.output = d.finish();
        }
        if let Some(d) = &mut self.stderr_drain {
            self.errors = d.finish();
        }
        if let Some(pgid) = self.term_pgid.take() {
            log::debug!("returning terminal from group {pgid}");
            give_terminal_to(getpgrp());
        }
        self.ended = true;
    }

    /// Non-blocking per-stage status snapshot, readable while stages are
    /// still running. A stage that has not exited reports `None`, never
    /// zero.
    pub fn poll_returncodes(&mut self) -> Vec<Option<i32>> {
        if self.ended {
            return self.returncodes.iter().copied().map(Some).collect();
        }
        self.procs.iter_mut().map(ProcHandle::poll).collect()
    }

    /// SIGTERM every still-running external stage, then settle.
    pub fn terminate(&mut self) {
        for p in &mut self.procs {
            p.terminate();
        }
        self.end();
    }

    /// Exit code of every stage, in pipeline order.
    pub fn returncodes(&mut self) -> &[i32] {
        self.end();
        &self.returncodes
    }

    /// Exit code of the final stage, the pipeline's overall result.
    pub fn returncode(&mut self) -> i32 {
        self.end();
        self.returncodes.last().copied().unwrap_or(1)
    }

    /// Captured stdout text; empty unless the capture mode piped stdout.
    pub fn output(&mut self) -> &str {
        self.end();
        &self.output
    }

    /// Captured stderr text; empty unless an object mode piped stderr.
    pub fn errors(&mut self) -> &str {
        self.end();
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::process::{Command, Stdio};

    fn spawn(cmd: &str, args: &[&str]) -> ProcHandle {
        ProcHandle::External(
            Command::new(cmd)
                .args(args)
                .stdin(Stdio::null())
                .spawn()
                .unwrap()
                .into(),
        )
    }

    #[test]
    fn external_wait_is_idempotent() {
        let mut h = spawn("true", &[]);
        assert_eq!(h.wait(), 0);
        assert_eq!(h.wait(), 0);
        let mut h = spawn("false", &[]);
        assert_eq!(h.wait(), 1);
    }

    #[test]
    fn poll_reports_unknown_while_running() {
        let mut h = spawn("sleep", &["2"]);
        assert_eq!(h.poll(), None);
        h.terminate();
        assert_eq!(h.wait(), 128 + libc::SIGTERM);
        assert_eq!(h.poll(), Some(128 + libc::SIGTERM));
    }

    #[test]
    fn poll_returncodes_never_reports_zero_for_running_stage() {
        let mut pl = CommandPipeline::new(
            vec![vec!["sleep".to_string(), "2".to_string()]],
            vec![spawn("sleep", &["2"]), spawn("sleep", &["2"])],
            CaptureMode::Object,
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(pl.poll_returncodes(), vec![None, None]);
        pl.terminate();
        let settled = 128 + libc::SIGTERM;
        assert_eq!(pl.poll_returncodes(), vec![Some(settled), Some(settled)]);
    }

    #[test]
    fn signaled_child_maps_to_128_plus_signo() {
        let mut h = spawn("sleep", &["30"]);
        h.terminate();
        assert_eq!(h.wait(), 128 + libc::SIGTERM);
    }

    #[test]
    fn end_settles_codes_and_output() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut child = Command::new("true");
        child.stdin(Stdio::null());
        let mut f = std::fs::File::from(w);
        f.write_all(b"captured\n").unwrap();
        drop(f);
        let mut pl = CommandPipeline::new(
            vec![vec!["true".to_string()]],
            vec![ProcHandle::External(child.spawn().unwrap().into())],
            CaptureMode::Stdout,
            Some(std::fs::File::from(r)),
            None,
            None,
        )
        .unwrap();
        pl.end();
        pl.end();
        assert_eq!(pl.returncodes(), &[0]);
        assert_eq!(pl.returncode(), 0);
        assert_eq!(pl.output(), "captured\n");
        assert_eq!(pl.errors(), "");
    }

    #[test]
    fn terminate_kills_running_stages() {
        let mut pl = CommandPipeline::new(
            vec![vec!["sleep".to_string(), "30".to_string()]],
            vec![spawn("sleep", &["30"])],
            CaptureMode::None,
            None,
            None,
            None,
        )
        .unwrap();
        pl.terminate();
        assert_eq!(pl.returncode(), 128 + libc::SIGTERM);
    }
}
