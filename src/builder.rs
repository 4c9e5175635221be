//! Pipeline assembly: command token groups and connector tokens become an
//! ordered list of launch-ready [`SubprocSpec`]s, with inter-stage pipes
//! wired and the last stage's capture policy applied.

use std::fs::File;

use crate::error::ShellError;
use crate::redirect::Endpoint;
use crate::session::{Alias, Segment, Session};
use crate::spec::{CaptureMode, SubprocSpec};

/// Convert a pipeline description into specs ready for the executor.
///
/// Connector handling: each `|` opens one OS pipe whose write end becomes
/// stdout of stage *i* and read end stdin of stage *i+1*, as raw
/// descriptors since they connect OS processes directly. A trailing `&`
/// (either a top-level connector or the last token of the final command
/// group) marks the final spec as background. Anything else is a build
/// error.
pub fn cmds_to_specs(
    session: &Session,
    cmds: Vec<Segment>,
    capture: CaptureMode,
) -> Result<Vec<SubprocSpec>, ShellError> {
    let mut specs: Vec<SubprocSpec> = Vec::new();
    let mut connectors: Vec<String> = Vec::new();
    for seg in cmds {
        match seg {
            Segment::Connector(c) => connectors.push(c),
            Segment::Command(mut toks) => {
                if toks
                    .last()
                    .and_then(|t| t.as_str())
                    .map(|s| s == "&")
                    .unwrap_or(false)
                {
                    toks.pop();
                    connectors.push("&".to_string());
                }
                specs.push(SubprocSpec::build(session, toks, capture)?);
            }
        }
    }
    if specs.is_empty() {
        return Err(ShellError::EmptyCommand);
    }
    let n_connectors = connectors.len();
    for (i, connector) in connectors.into_iter().enumerate() {
        match connector.as_str() {
            "|" => {
                if i + 1 >= specs.len() {
                    return Err(ShellError::UnrecognizedConnector(connector));
                }
                let (r, w) = nix::unistd::pipe()?;
                specs[i].set_stdout(Endpoint::Fd(w))?;
                specs[i + 1].set_stdin(Endpoint::Fd(r))?;
            }
            "&" if i == n_connectors - 1 => {
                specs.last_mut().expect("non-empty specs").background = true;
            }
            _ => return Err(ShellError::UnrecognizedConnector(connector)),
        }
    }
    update_last_spec(session, specs.last_mut().expect("non-empty specs"))?;
    Ok(specs)
}

/// Apply the last-stage capture policy: what "captured" means for the
/// pipeline as a whole is decided by its final stage.
fn update_last_spec(session: &Session, last: &mut SubprocSpec) -> Result<(), ShellError> {
    last.last_in_pipeline = true;
    // Background runs produce no result object, so capture pipes would
    // have no reader; treat them as uncaptured.
    if last.capture == CaptureMode::None || last.background {
        // Uncaptured: stream to the terminal, or to the session's
        // process-wide override sinks when present.
        if last.stdout().is_none() {
            if let Some(sink) = &session.stdout_uncaptured {
                last.set_stdout(Endpoint::File(sink.try_clone()?))?;
            }
        }
        if last.stderr().is_none() {
            if let Some(sink) = &session.stderr_uncaptured {
                last.set_stderr(Endpoint::File(sink.try_clone()?))?;
            }
        }
        return Ok(());
    }
    let callable_alias = matches!(last.alias, Some(Alias::Func { .. }));
    if !callable_alias {
        let threadable = session.cache.predict_threadable(&last.cmd);
        if !threadable {
            // Foreground-only commands keep the terminal; only the
            // object modes still insist on capture pipes.
            last.threadable = false;
            if !matches!(last.capture, CaptureMode::Object | CaptureMode::HiddenObject) {
                return Ok(());
            }
        }
    }
    if last.stdout().is_none() {
        let (r, w) = nix::unistd::pipe()?;
        last.set_stdout(Endpoint::Fd(w))?;
        last.captured_stdout = Some(File::from(r));
    }
    if matches!(last.capture, CaptureMode::Object | CaptureMode::HiddenObject)
        && last.stderr().is_none()
    {
        let (r, w) = nix::unistd::pipe()?;
        last.set_stderr(Endpoint::Fd(w))?;
        last.captured_stderr = Some(File::from(r));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Token;

    fn seg(v: &[&str]) -> Segment {
        Segment::Command(v.iter().map(|s| Token::from(*s)).collect())
    }

    #[test]
    fn single_command_is_one_last_spec() {
        let session = Session::new();
        let specs =
            cmds_to_specs(&session, vec![seg(&["true"])], CaptureMode::None).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].last_in_pipeline);
        assert!(!specs[0].background);
    }

    #[test]
    fn pipes_connect_adjacent_stages() {
        let session = Session::new();
        let specs = cmds_to_specs(
            &session,
            vec![
                seg(&["echo", "hi"]),
                Segment::pipe(),
                seg(&["cat"]),
                Segment::pipe(),
                seg(&["cat"]),
            ],
            CaptureMode::None,
        )
        .unwrap();
        assert_eq!(specs.len(), 3);
        // N-1 pipes: write end on stage k stdout, read end on stage k+1 stdin.
        assert!(matches!(specs[0].stdout(), Some(Endpoint::Fd(_))));
        assert!(matches!(specs[1].stdin(), Some(Endpoint::Fd(_))));
        assert!(matches!(specs[1].stdout(), Some(Endpoint::Fd(_))));
        assert!(matches!(specs[2].stdin(), Some(Endpoint::Fd(_))));
        assert!(specs[0].stdin().is_none());
        assert!(specs[2].stdout().is_none());
        assert!(specs[2].last_in_pipeline);
        assert!(!specs[0].last_in_pipeline);
    }

    #[test]
    fn trailing_ampersand_token_marks_background() {
        let session = Session::new();
        let specs = cmds_to_specs(
            &session,
            vec![seg(&["sleep", "5", "&"])],
            CaptureMode::None,
        )
        .unwrap();
        assert!(specs[0].background);
    }

    #[test]
    fn toplevel_ampersand_connector_marks_background() {
        let session = Session::new();
        let specs = cmds_to_specs(
            &session,
            vec![seg(&["sleep", "5"]), Segment::background()],
            CaptureMode::None,
        )
        .unwrap();
        assert!(specs[0].background);
    }

    #[test]
    fn background_spec_gets_no_capture_pipes() {
        let session = Session::new();
        let specs = cmds_to_specs(
            &session,
            vec![seg(&["sleep", "5", "&"])],
            CaptureMode::Stdout,
        )
        .unwrap();
        assert!(specs[0].background);
        assert!(specs[0].captured_stdout.is_none());
        assert!(specs[0].stdout().is_none());
    }

    #[test]
    fn unknown_connector_is_an_error() {
        let session = Session::new();
        let err = cmds_to_specs(
            &session,
            vec![seg(&["true"]), Segment::Connector(";".to_string()), seg(&["true"])],
            CaptureMode::None,
        )
        .unwrap_err();
        assert!(matches!(err, ShellError::UnrecognizedConnector(_)));
    }

    #[test]
    fn stdout_capture_opens_pipe_on_last_stage_only() {
        let session = Session::new();
        let specs = cmds_to_specs(
            &session,
            vec![seg(&["echo", "hi"]), Segment::pipe(), seg(&["cat"])],
            CaptureMode::Stdout,
        )
        .unwrap();
        assert!(specs[0].captured_stdout.is_none());
        assert!(specs[1].captured_stdout.is_some());
        assert!(specs[1].captured_stderr.is_none());
    }

    #[test]
    fn object_capture_pipes_both_streams() {
        let session = Session::new();
        let specs =
            cmds_to_specs(&session, vec![seg(&["true"])], CaptureMode::Object).unwrap();
        assert!(specs[0].captured_stdout.is_some());
        assert!(specs[0].captured_stderr.is_some());
    }

    #[test]
    fn unthreadable_command_inherits_terminal_for_stdout_capture() {
        let mut session = Session::new();
        session.cache.mark_unthreadable("true");
        let specs =
            cmds_to_specs(&session, vec![seg(&["true"])], CaptureMode::Stdout).unwrap();
        assert!(!specs[0].threadable);
        assert!(specs[0].captured_stdout.is_none());

        // Object capture still pipes.
        let specs =
            cmds_to_specs(&session, vec![seg(&["true"])], CaptureMode::Object).unwrap();
        assert!(specs[0].captured_stdout.is_some());
    }
}
