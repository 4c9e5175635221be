//! Pipeline launch: turns built specs into running processes and proxy
//! threads, wires merge redirects, applies job control, and decides what
//! the caller gets back for each capture mode.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::{Command, Stdio};

use nix::unistd::{setpgid, Pid};

use crate::builder;
use crate::error::ShellError;
use crate::jobs::{give_terminal_to, pause_call_resume};
use crate::pipeline::{CommandPipeline, ProcHandle};
use crate::redirect::Endpoint;
use crate::session::{AliasStreams, JobRecord, Segment, Session};
use crate::spec::{CaptureMode, ExecKind, SubprocSpec};

/// What a pipeline run hands back, by capture mode.
#[derive(Debug)]
pub enum RunOutcome {
    /// Uncaptured foreground run; output went to the terminal.
    None,
    /// Captured stdout text of the final stage.
    Stdout(String),
    /// The pipeline object itself: object modes, and any background run.
    Pipeline(CommandPipeline),
}

/// Build and run one pipeline, blocking until it finishes unless it was
/// sent to the background.
pub fn run(
    session: &mut Session,
    cmds: Vec<Segment>,
    capture: CaptureMode,
) -> Result<RunOutcome, ShellError> {
    let specs = builder::cmds_to_specs(session, cmds, capture)?;
    run_specs(session, specs)
}

/// Launch pre-built specs. Stages launch left to right; if a stage fails
/// to launch, every stage already running is terminated before the error
/// propagates.
pub fn run_specs(
    session: &mut Session,
    mut specs: Vec<SubprocSpec>,
) -> Result<RunOutcome, ShellError> {
    let last = specs.last_mut().ok_or(ShellError::EmptyCommand)?;
    let capture = last.capture;
    let background = last.background;
    let captured_stdout = last.captured_stdout.take();
    let captured_stderr = last.captured_stderr.take();

    let mut procs: Vec<ProcHandle> = Vec::with_capacity(specs.len());
    let mut cmds: Vec<Vec<String>> = Vec::with_capacity(specs.len());
    let mut pipeline_group: Option<Pid> = None;
    for spec in &mut specs {
        cmds.push(spec.args.clone());
        let handle = match spec.kind {
            ExecKind::ExternalProcess => launch_external(session, spec, &mut pipeline_group),
            ExecKind::InProcessCallable => launch_callable(spec),
        };
        match handle {
            Ok(h) => procs.push(h),
            Err(e) => {
                for p in &mut procs {
                    p.terminate();
                    p.wait();
                }
                return Err(e);
            }
        }
    }

    let pids: Vec<Option<u32>> = procs.iter().map(ProcHandle::pid).collect();
    if pids.iter().any(Option::is_some) {
        session.jobs.add_job(JobRecord {
            cmds: cmds.iter().map(|c| c.join(" ")).collect(),
            pids: pids.clone(),
            bg: background,
        });
    }

    // Foreground pipelines with real processes take the terminal so they
    // receive keyboard signals; end() hands it back.
    let mut term_pgid = None;
    if session.env.interactive && !background && capture != CaptureMode::Object {
        if let Some(pgid) = pipeline_group {
            if give_terminal_to(pgid) {
                term_pgid = Some(pgid);
            }
        }
    }

    if session.env.interactive
        && !background
        && matches!(capture, CaptureMode::None | CaptureMode::HiddenObject)
    {
        if let (Some(setter), Some(pid)) = (
            session.title_setter.as_ref(),
            pids.iter().rev().flatten().next().copied(),
        ) {
            // The title query must not race the foreground command for
            // the terminal.
            pause_call_resume(pid, || setter());
        }
    }

    if background {
        // The job registry is the tracking surface for background runs;
        // the caller gets nothing back. Dropped child handles leave the
        // processes running.
        return Ok(RunOutcome::None);
    }

    let mut pipeline = CommandPipeline::new(
        cmds,
        procs,
        capture,
        captured_stdout,
        captured_stderr,
        term_pgid,
    )?;

    Ok(match capture {
        CaptureMode::None => {
            pipeline.end();
            session.last_returncode = pipeline.returncode();
            RunOutcome::None
        }
        CaptureMode::Stdout => {
            pipeline.end();
            session.last_returncode = pipeline.returncode();
            RunOutcome::Stdout(pipeline.output().to_string())
        }
        // Object capture hands the pipeline back live; the caller decides
        // when to settle it.
        CaptureMode::Object => RunOutcome::Pipeline(pipeline),
        CaptureMode::HiddenObject => {
            pipeline.end();
            session.last_returncode = pipeline.returncode();
            RunOutcome::Pipeline(pipeline)
        }
    })
}

fn dup_raw(fd: RawFd) -> Result<OwnedFd, ShellError> {
    let new = nix::unistd::dup(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Resolve the stdout/stderr endpoint pair into concrete descriptors,
/// turning the merge markers into duplicates of the sibling stream.
/// `None` means inherit. Two markers at once swap the inherited streams.
fn resolve_outputs(
    stdout: Option<Endpoint>,
    stderr: Option<Endpoint>,
) -> Result<(Option<OwnedFd>, Option<OwnedFd>), ShellError> {
    let out_merges = matches!(stdout, Some(Endpoint::MergeErr));
    let err_merges = matches!(stderr, Some(Endpoint::MergeOut));
    if out_merges && err_merges {
        return Ok((Some(dup_raw(2)?), Some(dup_raw(1)?)));
    }
    let mut out = match stdout {
        Some(Endpoint::File(f)) => Some(OwnedFd::from(f)),
        Some(Endpoint::Fd(fd)) => Some(fd),
        Some(Endpoint::MergeErr) | Some(Endpoint::MergeOut) | None => None,
    };
    let mut err = match stderr {
        Some(Endpoint::File(f)) => Some(OwnedFd::from(f)),
        Some(Endpoint::Fd(fd)) => Some(fd),
        Some(Endpoint::MergeOut) | Some(Endpoint::MergeErr) | None => None,
    };
    if err_merges {
        err = Some(match &out {
            Some(fd) => dup_raw(fd.as_raw_fd())?,
            None => dup_raw(1)?,
        });
    }
    if out_merges {
        out = Some(match &err {
            Some(fd) => dup_raw(fd.as_raw_fd())?,
            None => dup_raw(2)?,
        });
    }
    Ok((out, err))
}

fn launch_external(
    session: &Session,
    spec: &mut SubprocSpec,
    pipeline_group: &mut Option<Pid>,
) -> Result<ProcHandle, ShellError> {
    let mut command = Command::new(&spec.cmd[0]);
    command.args(&spec.cmd[1..]);
    command.env_clear().envs(session.env.detype());

    let (stdin_ep, stdout_ep, stderr_ep) = spec.take_streams();
    match stdin_ep {
        Some(Endpoint::File(f)) => {
            command.stdin(Stdio::from(f));
        }
        Some(Endpoint::Fd(fd)) => {
            command.stdin(Stdio::from(fd));
        }
        _ => {}
    }
    let (out, err) = resolve_outputs(stdout_ep, stderr_ep)?;
    if let Some(fd) = out {
        command.stdout(Stdio::from(fd));
    }
    if let Some(fd) = err {
        command.stderr(Stdio::from(fd));
    }

    if session.env.interactive {
        use std::os::unix::process::CommandExt;
        let pgid = pipeline_group.map(Pid::as_raw).unwrap_or(0);
        unsafe {
            // Runs between fork and exec; only async-signal-safe calls.
            command.pre_exec(move || {
                libc::setpgid(0, pgid);
                libc::signal(libc::SIGTSTP, libc::SIG_DFL);
                Ok(())
            });
        }
    }

    let child = match command.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let cmd = spec.cmd[0].clone();
            let suggestion = session
                .cache
                .suggest(&cmd, &session.aliases)
                .map(|s| format!("\n{s}"))
                .unwrap_or_default();
            return Err(ShellError::CommandNotFound { cmd, suggestion });
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ShellError::PermissionDenied(spec.cmd[0].clone()));
        }
        Err(e) => return Err(e.into()),
    };

    if session.env.interactive {
        let pid = Pid::from_raw(child.id() as i32);
        let pgid = pipeline_group.unwrap_or(pid);
        // Parent-side setpgid closes the fork/exec race; EACCES after
        // exec just means the child already did it.
        let _ = setpgid(pid, pgid);
        if pipeline_group.is_none() {
            *pipeline_group = Some(pid);
        }
    }
    Ok(ProcHandle::External(child.into()))
}

fn launch_callable(spec: &mut SubprocSpec) -> Result<ProcHandle, ShellError> {
    let f = spec
        .callable()
        .ok_or_else(|| ShellError::CommandNotFound {
            cmd: spec.display(),
            suggestion: String::new(),
        })?;
    let (stdin_ep, stdout_ep, stderr_ep) = spec.take_streams();
    let stdin: Box<dyn std::io::Read + Send> = match stdin_ep {
        Some(Endpoint::File(f)) => Box::new(f),
        Some(Endpoint::Fd(fd)) => Box::new(File::from(fd)),
        // Unredirected stages inherit the real stdin, like a spawned
        // process would.
        _ => Box::new(std::io::stdin()),
    };
    let (out, err) = resolve_outputs(stdout_ep, stderr_ep)?;
    let stdout: Box<dyn std::io::Write + Send> = match out {
        Some(fd) => Box::new(File::from(fd)),
        None => Box::new(std::io::stdout()),
    };
    let stderr: Box<dyn std::io::Write + Send> = match err {
        Some(fd) => Box::new(File::from(fd)),
        None => Box::new(std::io::stderr()),
    };
    let streams = AliasStreams {
        stdin,
        stdout,
        stderr,
    };
    let args = spec.cmd.clone();
    if spec.threadable {
        Ok(ProcHandle::Thread(crate::proxy::ProcProxyThread::spawn(
            f, args, streams,
        )?))
    } else {
        Ok(ProcHandle::Sync(crate::proxy::ProcProxy::run(
            f, args, streams,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::Arc;

    fn seg(v: &[&str]) -> Segment {
        Segment::cmd(v.iter().copied())
    }

    #[test]
    fn stdout_capture_returns_text() {
        let mut session = Session::new();
        let out = run(
            &mut session,
            vec![seg(&["echo", "hi"])],
            CaptureMode::Stdout,
        )
        .unwrap();
        match out {
            RunOutcome::Stdout(s) => assert_eq!(s, "hi\n"),
            _ => panic!("expected captured stdout"),
        }
    }

    #[test]
    fn pipe_feeds_next_stage() {
        let mut session = Session::new();
        let out = run(
            &mut session,
            vec![
                seg(&["printf", "a\\nb\\n"]),
                Segment::pipe(),
                seg(&["grep", "b"]),
            ],
            CaptureMode::Stdout,
        )
        .unwrap();
        match out {
            RunOutcome::Stdout(s) => assert_eq!(s, "b\n"),
            _ => panic!("expected captured stdout"),
        }
    }

    #[test]
    fn object_capture_carries_codes_and_both_streams() {
        let mut session = Session::new();
        let out = run(
            &mut session,
            vec![seg(&["sh", "-c", "echo out; echo err >&2; exit 3"])],
            CaptureMode::Object,
        )
        .unwrap();
        match out {
            RunOutcome::Pipeline(mut pl) => {
                assert_eq!(pl.returncode(), 3);
                assert_eq!(pl.output(), "out\n");
                assert_eq!(pl.errors(), "err\n");
            }
            _ => panic!("expected pipeline object"),
        }
    }

    #[test]
    fn uncaptured_run_returns_nothing() {
        let mut session = Session::new();
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("out");
        session.stdout_uncaptured =
            Some(std::fs::File::create(&sink).unwrap());
        let out = run(&mut session, vec![seg(&["echo", "quiet"])], CaptureMode::None).unwrap();
        assert!(matches!(out, RunOutcome::None));
        assert_eq!(std::fs::read_to_string(&sink).unwrap(), "quiet\n");
    }

    #[test]
    fn merge_marker_duplicates_sibling_stream() {
        let mut session = Session::new();
        let out = run(
            &mut session,
            vec![seg(&["sh", "-c", "echo oops >&2", "2>&1"])],
            CaptureMode::Stdout,
        )
        .unwrap();
        match out {
            RunOutcome::Stdout(s) => assert_eq!(s, "oops\n"),
            _ => panic!("expected captured stdout"),
        }
    }

    #[test]
    fn missing_command_suggests_neighbors() {
        let mut session = Session::new();
        let err = run(
            &mut session,
            vec![seg(&["sleeep", "1"])],
            CaptureMode::Stdout,
        )
        .unwrap_err();
        match err {
            ShellError::CommandNotFound { cmd, suggestion } => {
                assert_eq!(cmd, "sleeep");
                assert!(suggestion.contains("sleep"), "got {suggestion:?}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn launch_failure_terminates_earlier_stages() {
        let mut session = Session::new();
        let err = run(
            &mut session,
            vec![
                seg(&["sleep", "30"]),
                Segment::pipe(),
                seg(&["definitely-not-a-command"]),
            ],
            CaptureMode::Stdout,
        )
        .unwrap_err();
        assert!(matches!(err, ShellError::CommandNotFound { .. }));
    }

    #[test]
    fn callable_alias_runs_in_pipeline() {
        let mut session = Session::new();
        session.aliases.register_fn(
            "shout",
            Arc::new(|args, io| {
                let _ = writeln!(io.stdout, "{}!", args.join(" "));
                0
            }),
            true,
        );
        let out = run(
            &mut session,
            vec![
                seg(&["shout", "hey"]),
                Segment::pipe(),
                seg(&["tr", "a-z", "A-Z"]),
            ],
            CaptureMode::Stdout,
        )
        .unwrap();
        match out {
            RunOutcome::Stdout(s) => assert_eq!(s, "HEY!\n"),
            _ => panic!("expected captured stdout"),
        }
    }

    #[test]
    fn background_run_returns_no_result_object() {
        let mut session = Session::new();
        let started = std::time::Instant::now();
        let out = run(
            &mut session,
            vec![seg(&["sleep", "2", "&"])],
            CaptureMode::None,
        )
        .unwrap();
        assert!(matches!(out, RunOutcome::None));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        // The job registry is still the tracking surface.
        assert!(session.jobs.jobs()[0].bg);
    }

    #[test]
    fn object_capture_returns_live_pollable_pipeline() {
        let mut session = Session::new();
        let started = std::time::Instant::now();
        let out = run(
            &mut session,
            vec![seg(&["sleep", "2"])],
            CaptureMode::Object,
        )
        .unwrap();
        match out {
            RunOutcome::Pipeline(mut pl) => {
                assert_eq!(pl.poll_returncodes(), vec![None]);
                assert!(started.elapsed() < std::time::Duration::from_secs(1));
                pl.terminate();
            }
            _ => panic!("expected pipeline object"),
        }
    }

    #[test]
    fn callable_without_redirect_reads_inherited_stdin() {
        use std::io::Read as _;
        use std::os::fd::AsRawFd;

        // Point the real stdin at a pipe for the duration of the run.
        let (r, w) = nix::unistd::pipe().unwrap();
        let saved = nix::unistd::dup(0).unwrap();
        nix::unistd::dup2(r.as_raw_fd(), 0).unwrap();
        drop(r);
        let mut feeder = std::fs::File::from(w);
        feeder.write_all(b"from stdin\n").unwrap();
        drop(feeder);

        let mut session = Session::new();
        session.aliases.register_fn(
            "slurp",
            Arc::new(|_args, io| {
                let mut s = String::new();
                let _ = io.stdin.read_to_string(&mut s);
                let _ = write!(io.stdout, "{s}");
                0
            }),
            true,
        );
        let out = run(&mut session, vec![seg(&["slurp"])], CaptureMode::Stdout);
        nix::unistd::dup2(saved, 0).unwrap();
        let _ = nix::unistd::close(saved);
        match out.unwrap() {
            RunOutcome::Stdout(s) => assert_eq!(s, "from stdin\n"),
            _ => panic!("expected captured stdout"),
        }
    }

    #[test]
    fn job_registry_records_external_runs() {
        let mut session = Session::new();
        run(&mut session, vec![seg(&["true"])], CaptureMode::None).unwrap();
        assert_eq!(session.jobs.jobs().len(), 1);
        assert!(!session.jobs.jobs()[0].bg);
    }
}
