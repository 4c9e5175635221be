//! Explicit session context replacing ambient global state: environment,
//! alias table, command cache and job registry, all owned by one
//! [`Session`] passed by reference into the builder and executor.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

/// Streams handed to an in-process alias in place of real stdio.
pub struct AliasStreams {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

/// An in-process callable that can stand in for an external executable.
/// Receives the argument list (command name already stripped) and returns
/// an exit code.
pub type AliasFn = Arc<dyn Fn(&[String], &mut AliasStreams) -> i32 + Send + Sync>;

/// Alias table entry: either a callable run in-process, or a token-list
/// expansion spliced in place of the command name before further resolution.
#[derive(Clone)]
pub enum Alias {
    Func { f: AliasFn, threadable: bool },
    Expansion(Vec<String>),
}

impl fmt::Debug for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alias::Func { threadable, .. } => {
                write!(f, "Func {{ threadable: {threadable} }}")
            }
            Alias::Expansion(toks) => write!(f, "Expansion({toks:?})"),
        }
    }
}

/// One element of a command stage's token list: a plain string, or a
/// callable standing in for the command itself.
#[derive(Clone)]
pub enum Token {
    Str(String),
    Func(AliasFn),
}

impl Token {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Token::Str(s) => Some(s),
            Token::Func(_) => None,
        }
    }

    /// Display form used in error messages and job records.
    pub fn display(&self) -> &str {
        match self {
            Token::Str(s) => s,
            Token::Func(_) => "<callable>",
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Func(_) => write!(f, "<callable>"),
        }
    }
}

impl From<&str> for Token {
    fn from(s: &str) -> Self {
        Token::Str(s.to_string())
    }
}

impl From<String> for Token {
    fn from(s: String) -> Self {
        Token::Str(s)
    }
}

/// One element of a pipeline description: a command stage's token list, or
/// a literal connector string (`|` or `&`) between stages.
#[derive(Clone, Debug)]
pub enum Segment {
    Command(Vec<Token>),
    Connector(String),
}

impl Segment {
    /// Convenience constructor for a command stage from string tokens.
    pub fn cmd<I, S>(toks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Token>,
    {
        Segment::Command(toks.into_iter().map(Into::into).collect())
    }

    pub fn pipe() -> Self {
        Segment::Connector("|".to_string())
    }

    pub fn background() -> Self {
        Segment::Connector("&".to_string())
    }
}

/// String-keyed environment mapping with an all-string export for
/// subprocess launch, plus the handful of shell flags the pipeline
/// machinery consults.
pub struct Env {
    vars: HashMap<String, String>,
    /// Whether the shell is running interactively. Gates process-group
    /// creation and terminal handoff.
    pub interactive: bool,
    /// When set, a lone token naming a directory rewrites to `cd <dir>`.
    pub auto_cd: bool,
}

impl Env {
    /// Minimal environment carrying only the process `PATH`, so launched
    /// commands still resolve. Non-interactive.
    pub fn new() -> Self {
        let mut vars = HashMap::new();
        if let Ok(path) = std::env::var("PATH") {
            vars.insert("PATH".to_string(), path);
        }
        Env {
            vars,
            interactive: false,
            auto_cd: false,
        }
    }

    /// Snapshot the real process environment; interactivity defaults from
    /// whether stdin and stdout are terminals.
    pub fn from_process() -> Self {
        Env {
            vars: std::env::vars().collect(),
            interactive: atty::is(atty::Stream::Stdin) && atty::is(atty::Stream::Stdout),
            auto_cd: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    /// Detyped (all-string) export copied into each launched stage.
    pub fn detype(&self) -> HashMap<String, String> {
        self.vars.clone()
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

/// Alias table: command name to callable or token-list expansion.
pub struct Aliases {
    table: HashMap<String, Alias>,
}

impl Aliases {
    pub fn new() -> Self {
        Aliases {
            table: HashMap::new(),
        }
    }

    /// Table preloaded with the default builtins the resolver relies on.
    /// `cd` must exist for auto-cd rewriting to resolve to something.
    pub fn with_defaults() -> Self {
        let mut a = Aliases::new();
        a.register_fn("cd", Arc::new(cd_alias), false);
        a
    }

    pub fn register_fn(&mut self, name: &str, f: AliasFn, threadable: bool) {
        self.table
            .insert(name.to_string(), Alias::Func { f, threadable });
    }

    pub fn register_expansion(&mut self, name: &str, expansion: Vec<String>) {
        self.table
            .insert(name.to_string(), Alias::Expansion(expansion));
    }

    pub fn get(&self, name: &str) -> Option<&Alias> {
        self.table.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

impl Default for Aliases {
    fn default() -> Self {
        Aliases::with_defaults()
    }
}

/// Default `cd` builtin. Runs on the invoking thread (not threadable) so
/// the working-directory change lands before the next prompt.
fn cd_alias(args: &[String], io: &mut AliasStreams) -> i32 {
    let target = match args.first() {
        Some(d) => d.clone(),
        None => match std::env::var("HOME") {
            Ok(h) => h,
            Err(_) => {
                let _ = writeln!(io.stderr, "cd: no directory given and HOME unset");
                return 1;
            }
        },
    };
    match std::env::set_current_dir(&target) {
        Ok(()) => 0,
        Err(e) => {
            let _ = writeln!(io.stderr, "cd: {target}: {e}");
            1
        }
    }
}

/// Binary search, threadability prediction and command suggestion.
pub struct CommandsCache {
    /// Commands believed to need the controlling terminal; never run on a
    /// background thread.
    unthreadable: Vec<String>,
}

impl CommandsCache {
    pub fn new() -> Self {
        CommandsCache {
            unthreadable: [
                "vi", "vim", "nvim", "nano", "emacs", "less", "more", "man", "top", "htop",
                "ssh", "sudo",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }

    pub fn mark_unthreadable(&mut self, name: &str) {
        self.unthreadable.push(name.to_string());
    }

    /// Locate an executable on `$PATH`, or directly when the name carries
    /// a path separator.
    pub fn locate_binary(&self, name: &str) -> Option<PathBuf> {
        if name.contains('/') {
            let p = PathBuf::from(name);
            return if is_executable(&p) { Some(p) } else { None };
        }
        let path_var = std::env::var_os("PATH")?;
        for dir in std::env::split_paths(&path_var) {
            let cand = dir.join(name);
            if is_executable(&cand) {
                return Some(cand);
            }
        }
        None
    }

    /// Whether a command is believed safe to run with its output drained
    /// on a background thread. Keyed by the resolved command name.
    pub fn predict_threadable(&self, cmd: &[String]) -> bool {
        let Some(first) = cmd.first() else {
            return true;
        };
        let base = first.rsplit('/').next().unwrap_or(first);
        !self.unthreadable.iter().any(|n| n == base)
    }

    /// Best-effort "did you mean" line for a command that resolved to
    /// nothing, drawn from the alias table and `$PATH`.
    pub fn suggest(&self, cmd: &str, aliases: &Aliases) -> Option<String> {
        let mut best: Option<(usize, String)> = None;
        let mut consider = |name: &str| {
            let d = levenshtein(cmd, name);
            if d <= 2 && best.as_ref().map_or(true, |(bd, _)| d < *bd) {
                best = Some((d, name.to_string()));
            }
        };
        for name in aliases.names() {
            consider(name);
        }
        if let Some(path_var) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    if let Some(name) = entry.file_name().to_str() {
                        consider(name);
                    }
                }
            }
        }
        best.map(|(_, name)| format!("Did you mean {name:?}?"))
    }
}

impl Default for CommandsCache {
    fn default() -> Self {
        CommandsCache::new()
    }
}

fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(p) {
        Ok(md) => md.is_file() && md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// One registered pipeline: the command tokens per stage, the process ids
/// that were launched (in-process stages report none), and whether the
/// pipeline was backgrounded.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub cmds: Vec<String>,
    pub pids: Vec<Option<u32>>,
    pub bg: bool,
}

/// Process-wide job table, appended to by the executor under the
/// single-writer assumption of the interactive main thread.
pub struct JobRegistry {
    jobs: Vec<JobRecord>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry { jobs: Vec::new() }
    }

    pub fn add_job(&mut self, record: JobRecord) {
        log::debug!(
            "job registered: {}",
            serde_json::to_string(&record).unwrap_or_default()
        );
        self.jobs.push(record);
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        JobRegistry::new()
    }
}

/// Top-level session owning the collaborator tables the pipeline
/// machinery consumes.
pub struct Session {
    pub env: Env,
    pub aliases: Aliases,
    pub cache: CommandsCache,
    pub jobs: JobRegistry,
    /// Process-wide override sinks for uncaptured output. When set, the
    /// final stage of an uncaptured pipeline writes here instead of the
    /// controlling terminal.
    pub stdout_uncaptured: Option<File>,
    pub stderr_uncaptured: Option<File>,
    /// Window-title hook, invoked while the last stage is paused so a
    /// title-query subprocess cannot race with the foreground command.
    pub title_setter: Option<Box<dyn Fn() + Send>>,
    /// Exit code of the most recent foreground pipeline.
    pub last_returncode: i32,
}

impl Session {
    /// Session with an empty environment, defaults-only aliases, and
    /// non-interactive behavior. The usual starting point for tests.
    pub fn new() -> Self {
        Session {
            env: Env::new(),
            aliases: Aliases::with_defaults(),
            cache: CommandsCache::new(),
            jobs: JobRegistry::new(),
            stdout_uncaptured: None,
            stderr_uncaptured: None,
            title_setter: None,
            last_returncode: 0,
        }
    }

    /// Session wired to the real process environment.
    pub fn from_process() -> Self {
        Session {
            env: Env::from_process(),
            ..Session::new()
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}
