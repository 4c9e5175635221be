//! Subprocess pipeline construction and execution.
//!
//! A pipeline description (command token groups joined by `|`, optionally
//! backgrounded with `&`) is compiled into per-stage [`spec::SubprocSpec`]
//! descriptors, with redirects parsed into set-once stream endpoints,
//! aliases resolved (including in-process callable aliases that run behind
//! process-like handles), scripts expanded through their shebang
//! interpreters, and inter-stage OS pipes wired. The executor launches the
//! stages with POSIX job control when interactive and hands back either
//! captured text or a live [`pipeline::CommandPipeline`], depending on the
//! capture mode.
//!
//! ```no_run
//! use subshell::{run, CaptureMode, RunOutcome, Segment, Session};
//!
//! let mut session = Session::from_process();
//! let out = run(
//!     &mut session,
//!     vec![
//!         Segment::cmd(["echo", "hello"]),
//!         Segment::pipe(),
//!         Segment::cmd(["tr", "a-z", "A-Z"]),
//!     ],
//!     CaptureMode::Stdout,
//! )?;
//! if let RunOutcome::Stdout(text) = out {
//!     assert_eq!(text, "HELLO\n");
//! }
//! # Ok::<(), subshell::ShellError>(())
//! ```

pub mod builder;
pub mod error;
pub mod exec;
pub mod jobs;
pub mod pipeline;
pub mod proxy;
pub mod redirect;
pub mod resolve;
pub mod session;
pub mod spec;

pub use error::ShellError;
pub use exec::{run, RunOutcome};
pub use pipeline::CommandPipeline;
pub use session::{Segment, Session, Token};
pub use spec::{CaptureMode, SubprocSpec};
