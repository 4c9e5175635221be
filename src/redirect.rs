//! Redirect token parsing: turns tokens like `>`, `>>out.txt`, `2>&1` into
//! concrete stream endpoints for one pipeline stage.

use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ShellError;

/// A concrete source or sink for one of a stage's standard streams.
///
/// `MergeOut`/`MergeErr` are duplicate markers, not open files: they are
/// resolved against the sibling stream at launch time.
#[derive(Debug)]
pub enum Endpoint {
    /// An open file handle from an explicit redirect.
    File(File),
    /// A raw pipe end connecting OS processes directly.
    Fd(OwnedFd),
    /// `2>&1` family: stderr duplicates whatever stdout resolves to.
    MergeOut,
    /// `1>&2` family: stdout duplicates whatever stderr resolves to.
    MergeErr,
}

/// The stdin/stdout/stderr triple produced from a single redirect token.
/// Each slot is `None` when the token does not touch that stream.
#[derive(Debug, Default)]
pub struct RedirTriple {
    pub stdin: Option<Endpoint>,
    pub stdout: Option<Endpoint>,
    pub stderr: Option<Endpoint>,
}

fn redir_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(o(?:ut)?|e(?:rr)?|a(?:ll)?|&?\d?)(>>?|<)(o(?:ut)?|e(?:rr)?|a(?:ll)?|&?\d?)$")
            .expect("redirect regex")
    })
}

/// Whether a token matches the redirect grammar at all.
pub fn is_redirect(tok: &str) -> bool {
    redir_regex().is_match(tok)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
    Append,
}

fn origin_is_out(s: &str) -> bool {
    matches!(s, "" | "1" | "o" | "out")
}

fn origin_is_err(s: &str) -> bool {
    matches!(s, "2" | "e" | "err")
}

fn origin_is_all(s: &str) -> bool {
    matches!(s, "&" | "a" | "all")
}

/// Parse a redirect token plus its optional destination-location argument
/// into a stream triple. `2>&1`-family tokens never open a file; they
/// yield duplicate markers resolved at launch time.
pub fn redirect_streams(tok: &str, loc: Option<&str>) -> Result<RedirTriple, ShellError> {
    let mut triple = RedirTriple::default();

    // Combined duplicate forms collapse before the generic grammar: the
    // ampersand is cosmetic (`2>&1` and `2>1` mean the same thing).
    let no_amp = tok.replace('&', "");
    if let Some((orig, dest)) = no_amp.split_once('>') {
        if origin_is_err(orig) && origin_is_out(dest) && !dest.is_empty() {
            triple.stderr = Some(Endpoint::MergeOut);
            return Ok(triple);
        }
        if origin_is_out(orig) && !orig.is_empty() && origin_is_err(dest) {
            triple.stdout = Some(Endpoint::MergeErr);
            return Ok(triple);
        }
    }

    let caps = redir_regex()
        .captures(tok)
        .ok_or_else(|| ShellError::RedirectSyntax(tok.to_string()))?;
    let orig = caps.get(1).map_or("", |m| m.as_str());
    let op = caps.get(2).map_or("", |m| m.as_str());
    let dest = caps.get(3).map_or("", |m| m.as_str());

    let mode = match op {
        "<" => Mode::Read,
        ">" => Mode::Write,
        ">>" => Mode::Append,
        _ => return Err(ShellError::RedirectSyntax(tok.to_string())),
    };

    match mode {
        Mode::Read => {
            // Input redirection carries no origin or destination text.
            if !orig.is_empty() || !dest.is_empty() {
                return Err(ShellError::RedirectSyntax(tok.to_string()));
            }
            let path = loc.ok_or_else(|| ShellError::RedirectSyntax(tok.to_string()))?;
            triple.stdin = Some(Endpoint::File(safe_open_read(path)?));
        }
        Mode::Write | Mode::Append => {
            // The destination belongs in the location argument, nowhere else.
            if !dest.is_empty() {
                return Err(ShellError::RedirectSyntax(tok.to_string()));
            }
            let path = loc.ok_or_else(|| ShellError::RedirectSyntax(tok.to_string()))?;
            let append = mode == Mode::Append;
            if origin_is_all(orig) {
                let f = safe_open_write(path, append)?;
                let dup = f.try_clone().map_err(|e| ShellError::RedirectOpen {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
                triple.stdout = Some(Endpoint::File(f));
                triple.stderr = Some(Endpoint::File(dup));
            } else if origin_is_out(orig) {
                triple.stdout = Some(Endpoint::File(safe_open_write(path, append)?));
            } else if origin_is_err(orig) {
                triple.stderr = Some(Endpoint::File(safe_open_write(path, append)?));
            } else {
                return Err(ShellError::RedirectSyntax(tok.to_string()));
            }
        }
    }
    Ok(triple)
}

/// Open a redirect source, mapping OS failures to a user-facing message
/// naming the file and reason.
pub fn safe_open_read(path: &str) -> Result<File, ShellError> {
    File::open(path).map_err(|e| open_error(path, e))
}

fn safe_open_write(path: &str, append: bool) -> Result<File, ShellError> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    opts.open(path).map_err(|e| open_error(path, e))
}

fn open_error(path: &str, e: std::io::Error) -> ShellError {
    let reason = match e.kind() {
        std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        std::io::ErrorKind::NotFound => "no such file or directory".to_string(),
        _ => format!("unable to open file: {e}"),
    };
    ShellError::RedirectOpen {
        path: path.to_string(),
        reason,
    }
}
