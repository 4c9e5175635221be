use thiserror::Error;

/// Shell-level error type. Everything that can go wrong while building or
/// launching a pipeline surfaces as one of these, each carrying a message
/// the interactive front end can print verbatim.
#[derive(Debug, Error)]
pub enum ShellError {
    /// A token looked like a redirect but did not match the redirect grammar.
    #[error("unrecognized redirection command: {0}")]
    RedirectSyntax(String),

    /// A second non-null value was assigned to the same stream slot.
    #[error("multiple redirections for {stream} for {cmd:?}")]
    MultipleRedirect {
        stream: &'static str,
        cmd: String,
    },

    /// A top-level connector token other than `|` or `&`.
    #[error("unrecognized redirect {0:?}")]
    UnrecognizedConnector(String),

    /// A redirect target could not be opened. The message names the file
    /// and the reason.
    #[error("subshell: {path}: {reason}")]
    RedirectOpen { path: String, reason: String },

    /// No executable or alias matched the command, optionally carrying a
    /// "did you mean" suggestion line.
    #[error("subshell: subprocess mode: command not found: {cmd}{suggestion}")]
    CommandNotFound { cmd: String, suggestion: String },

    #[error("subshell: subprocess mode: permission denied: {0}")]
    PermissionDenied(String),

    #[error("empty subprocess command")]
    EmptyCommand,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),
}
