//! Per-stage subprocess descriptor and its fixed build-step sequence.

use std::fs::File;
use std::path::PathBuf;

use crate::error::ShellError;
use crate::redirect::{self, Endpoint, RedirTriple};
use crate::resolve;
use crate::session::{Alias, AliasFn, Session, Token};

/// Capture policy for a pipeline's final stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Output streams to the terminal (or the session's override sink);
    /// the run returns nothing.
    None,
    /// Final-stage stdout is piped and returned as text.
    Stdout,
    /// Both stdout and stderr are piped; the result object is returned
    /// without implicitly printing anything.
    Object,
    /// Structurally identical to `Object`, but the caller layer should
    /// not echo output by default.
    HiddenObject,
}

impl CaptureMode {
    pub fn parse(s: &str) -> Option<CaptureMode> {
        match s {
            "none" | "false" => Some(CaptureMode::None),
            "stdout" => Some(CaptureMode::Stdout),
            "object" => Some(CaptureMode::Object),
            "hiddenobject" => Some(CaptureMode::HiddenObject),
            _ => None,
        }
    }
}

/// Whether a stage launches a real OS process or runs a callable alias
/// in-process behind a process-like handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    ExternalProcess,
    InProcessCallable,
}

/// A container specifying how one pipeline stage should be executed.
///
/// Built from one command token group by [`SubprocSpec::build`], which runs
/// the fixed step sequence: leading-redirect strip, trailing-redirect
/// strip, alias resolution, binary location, auto-cd rewrite,
/// script/shebang expansion, proxy-class selection. Once handed to the
/// executor the spec is no longer mutated.
pub struct SubprocSpec {
    /// Original tokens as supplied, for error messages and job records.
    pub args: Vec<String>,
    /// Working command, mutated through the build steps; after build this
    /// is the resolved command (for callable aliases, just the arguments).
    pub cmd: Vec<String>,
    /// Alias resolved for the command name, if any.
    pub alias: Option<Alias>,
    /// Path to the executable, when an external binary was located.
    pub binary_loc: Option<PathBuf>,
    pub kind: ExecKind,
    pub capture: CaptureMode,
    pub background: bool,
    pub last_in_pipeline: bool,
    pub threadable: bool,
    /// Read ends of the capture pipes opened by the last-stage policy.
    pub captured_stdout: Option<File>,
    pub captured_stderr: Option<File>,
    stdin: Option<Endpoint>,
    stdout: Option<Endpoint>,
    stderr: Option<Endpoint>,
    /// First token was itself a callable, bypassing the alias table.
    direct: Option<AliasFn>,
}

impl std::fmt::Debug for SubprocSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocSpec")
            .field("args", &self.args)
            .field("cmd", &self.cmd)
            .field("alias", &self.alias)
            .field("binary_loc", &self.binary_loc)
            .field("kind", &self.kind)
            .field("capture", &self.capture)
            .field("background", &self.background)
            .field("last_in_pipeline", &self.last_in_pipeline)
            .field("threadable", &self.threadable)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("direct", &self.direct.as_ref().map(|_| "..."))
            .finish()
    }
}

impl SubprocSpec {
    /// Build one stage from one token group, running the full step
    /// sequence against the session's alias table and command cache.
    pub fn build(
        session: &Session,
        tokens: Vec<Token>,
        capture: CaptureMode,
    ) -> Result<SubprocSpec, ShellError> {
        if tokens.is_empty() {
            return Err(ShellError::EmptyCommand);
        }
        let mut direct = None;
        let mut cmd = Vec::with_capacity(tokens.len());
        for (i, tok) in tokens.iter().enumerate() {
            match tok {
                Token::Str(s) => cmd.push(s.clone()),
                Token::Func(f) => {
                    // A callable is only meaningful as the command itself.
                    if i == 0 {
                        direct = Some(f.clone());
                    }
                    cmd.push(tok.display().to_string());
                }
            }
        }
        let mut spec = SubprocSpec {
            args: cmd.clone(),
            cmd,
            alias: None,
            binary_loc: None,
            kind: ExecKind::ExternalProcess,
            capture,
            background: false,
            last_in_pipeline: false,
            threadable: true,
            captured_stdout: None,
            captured_stderr: None,
            stdin: None,
            stdout: None,
            stderr: None,
            direct,
        };
        spec.redirect_leading()?;
        spec.redirect_trailing()?;
        spec.resolve_alias(session);
        spec.resolve_binary_loc(session);
        spec.resolve_auto_cd(session);
        spec.resolve_executable_commands()?;
        spec.resolve_proxy_class();
        Ok(spec)
    }

    /// Display form used in duplicate-redirect error messages.
    pub fn display(&self) -> String {
        self.args.join(" ")
    }

    pub fn stdin(&self) -> Option<&Endpoint> {
        self.stdin.as_ref()
    }

    pub fn stdout(&self) -> Option<&Endpoint> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&Endpoint> {
        self.stderr.as_ref()
    }

    /// Assign stdin exactly once. A second non-null assignment is a build
    /// error; the rejected endpoint is dropped, closing any file it opened.
    pub fn set_stdin(&mut self, v: Endpoint) -> Result<(), ShellError> {
        let cmd = self.display();
        set_once(&mut self.stdin, v, "stdin", cmd)
    }

    pub fn set_stdout(&mut self, v: Endpoint) -> Result<(), ShellError> {
        let cmd = self.display();
        set_once(&mut self.stdout, v, "stdout", cmd)
    }

    pub fn set_stderr(&mut self, v: Endpoint) -> Result<(), ShellError> {
        let cmd = self.display();
        set_once(&mut self.stderr, v, "stderr", cmd)
    }

    /// Hand the stream endpoints to the launcher, leaving the slots empty.
    pub fn take_streams(&mut self) -> (Option<Endpoint>, Option<Endpoint>, Option<Endpoint>) {
        (self.stdin.take(), self.stdout.take(), self.stderr.take())
    }

    /// The callable to run when `kind` is `InProcessCallable`.
    pub fn callable(&self) -> Option<AliasFn> {
        if let Some(f) = &self.direct {
            return Some(f.clone());
        }
        match &self.alias {
            Some(Alias::Func { f, .. }) => Some(f.clone()),
            _ => None,
        }
    }

    fn apply_triple(&mut self, triple: RedirTriple) -> Result<(), ShellError> {
        if let Some(e) = triple.stdin {
            self.set_stdin(e)?;
        }
        if let Some(e) = triple.stdout {
            self.set_stdout(e)?;
        }
        if let Some(e) = triple.stderr {
            self.set_stderr(e)?;
        }
        Ok(())
    }

    /// Consume leading `< file COMMAND` forms greedily.
    fn redirect_leading(&mut self) -> Result<(), ShellError> {
        while self.cmd.len() >= 3 && self.cmd[0] == "<" {
            let f = redirect::safe_open_read(&self.cmd[1])?;
            self.set_stdin(Endpoint::File(f))?;
            self.cmd.drain(0..2);
        }
        Ok(())
    }

    /// Consume trailing redirects greedily from the end of the token
    /// list: operator+destination pairs first, then combined one-token
    /// forms like `2>&1`.
    fn redirect_trailing(&mut self) -> Result<(), ShellError> {
        loop {
            let n = self.cmd.len();
            if n >= 3 && redirect::is_redirect(&self.cmd[n - 2]) {
                let triple =
                    redirect::redirect_streams(&self.cmd[n - 2], Some(&self.cmd[n - 1]))?;
                self.apply_triple(triple)?;
                self.cmd.truncate(n - 2);
            } else if n >= 2 && redirect::is_redirect(&self.cmd[n - 1]) {
                let triple = redirect::redirect_streams(&self.cmd[n - 1], None)?;
                self.apply_triple(triple)?;
                self.cmd.truncate(n - 1);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn resolve_alias(&mut self, session: &Session) {
        if let Some(f) = &self.direct {
            self.alias = Some(Alias::Func {
                f: f.clone(),
                threadable: true,
            });
            return;
        }
        self.alias = session.aliases.get(&self.cmd[0]).cloned();
    }

    fn resolve_binary_loc(&mut self, session: &Session) {
        self.binary_loc = match &self.alias {
            None => session.cache.locate_binary(&self.cmd[0]),
            Some(Alias::Func { .. }) => None,
            Some(Alias::Expansion(exp)) => {
                exp.first().and_then(|head| session.cache.locate_binary(head))
            }
        };
    }

    /// Rewrite a lone directory name to `cd <dir>` when auto-cd is on and
    /// nothing else matched.
    fn resolve_auto_cd(&mut self, session: &Session) {
        if self.alias.is_some()
            || self.binary_loc.is_some()
            || self.cmd.len() != 1
            || !session.env.auto_cd
            || !std::path::Path::new(&self.cmd[0]).is_dir()
        {
            return;
        }
        self.cmd.insert(0, "cd".to_string());
        self.alias = session.aliases.get("cd").cloned();
    }

    /// Splice alias expansions and expand scripts through their shebang
    /// interpreter. For a callable alias the command name is stripped,
    /// leaving only the arguments the callable will receive.
    fn resolve_executable_commands(&mut self) -> Result<(), ShellError> {
        match &self.alias {
            Some(Alias::Func { .. }) => {
                self.cmd.remove(0);
                return Ok(());
            }
            Some(Alias::Expansion(exp)) => {
                let mut new_cmd = exp.clone();
                new_cmd.extend(self.cmd.drain(1..));
                self.cmd = new_cmd;
            }
            None => {}
        }
        if let Some(loc) = &self.binary_loc {
            self.cmd = resolve::script_subproc_command(loc, &self.cmd[1..])?;
        }
        Ok(())
    }

    /// Select in-process execution for callable aliases, carrying the
    /// alias's own threadability declaration.
    fn resolve_proxy_class(&mut self) {
        if let Some(Alias::Func { threadable, .. }) = &self.alias {
            self.kind = ExecKind::InProcessCallable;
            self.threadable = *threadable;
        }
    }
}

fn set_once(
    slot: &mut Option<Endpoint>,
    value: Endpoint,
    stream: &'static str,
    cmd: String,
) -> Result<(), ShellError> {
    if slot.is_some() {
        // Dropping `value` here closes any file the redirect opened.
        return Err(ShellError::MultipleRedirect { stream, cmd });
    }
    *slot = Some(value);
    Ok(())
}
