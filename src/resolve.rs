//! Script and interpreter discovery for resolved binaries: execute-bit
//! checks, binary sniffing, and shebang expansion.

use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use nix::unistd::{access, AccessFlags};
use regex::Regex;

use crate::error::ShellError;

/// Name the shell answers to; bare shebang references to it map to a
/// plain re-invocation, and it is the default interpreter for scripts
/// with no recognizable shebang line.
pub const SHELL_NAME: &str = "subshell";

fn shebang_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#![ \t]*(.+?)\s*$").expect("shebang regex"))
}

/// Given a located binary, return the full command to execute it: either
/// the file itself, or its shebang interpreter tokens followed by the
/// file and arguments.
///
/// Fails with `PermissionDenied` when the file lacks execute permission.
/// Executable-but-unreadable files (setuid-style programs) and true
/// binaries are invoked directly.
pub fn script_subproc_command(fname: &Path, args: &[String]) -> Result<Vec<String>, ShellError> {
    let fname_str = fname.to_string_lossy().to_string();
    if access(fname, AccessFlags::X_OK).is_err() {
        return Err(ShellError::PermissionDenied(fname_str));
    }
    let direct = |fname_str: String| {
        let mut cmd = vec![fname_str];
        cmd.extend(args.iter().cloned());
        cmd
    };
    // Execute permission without read permission: invoke directly. This
    // check must precede the binary sniff, which reads the file.
    if access(fname, AccessFlags::R_OK).is_err() {
        return Ok(direct(fname_str));
    }
    if is_binary(fname)? {
        return Ok(direct(fname_str));
    }
    let first_line = read_first_line(fname)?;
    let interp = match shebang_regex()
        .captures(&first_line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
    {
        Some(line) => {
            let raw = shlex::split(line)
                .unwrap_or_else(|| line.split_whitespace().map(str::to_string).collect());
            let mut interp = Vec::new();
            for tok in raw {
                interp.extend(un_shebang(&tok));
            }
            if interp.is_empty() {
                vec![SHELL_NAME.to_string()]
            } else {
                interp
            }
        }
        None => vec![SHELL_NAME.to_string()],
    };
    let mut cmd = interp;
    cmd.push(fname_str);
    cmd.extend(args.iter().cloned());
    Ok(cmd)
}

/// Normalize one shebang interpreter token: `/usr/bin/env` vanishes,
/// known system-bin prefixes are stripped, any `python*` collapses to a
/// generic `python`, and a bare reference to this shell maps to its own
/// invocation.
fn un_shebang(x: &str) -> Vec<String> {
    if x == "/usr/bin/env" {
        return Vec::new();
    }
    let mut x = x.to_string();
    for prefix in ["/usr/local/bin", "/usr/bin", "/bin"] {
        if x.starts_with(prefix) {
            x = Path::new(&x)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or(x);
            break;
        }
    }
    if Path::new(&x)
        .file_name()
        .map(|n| n.to_string_lossy().starts_with("python"))
        .unwrap_or(false)
    {
        x = "python".to_string();
    }
    if x == SHELL_NAME {
        return vec![SHELL_NAME.to_string()];
    }
    vec![x]
}

/// Sniff whether a file is a binary: a NUL byte within the first 80
/// bytes, or 80 bytes with no newline, means binary. EOF or a newline
/// first means text.
fn is_binary(fname: &Path) -> Result<bool, ShellError> {
    let mut f = std::fs::File::open(fname)?;
    let mut buf = [0u8; 80];
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    for &b in &buf[..filled] {
        if b == 0 {
            return Ok(true);
        }
        if b == b'\n' {
            return Ok(false);
        }
    }
    Ok(filled == buf.len())
}

fn read_first_line(fname: &Path) -> Result<String, ShellError> {
    let mut f = std::fs::File::open(fname)?;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = f.read(&mut byte)?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).trim().to_string())
}
