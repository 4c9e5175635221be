use anyhow::Result;
use std::env;

use subshell::{run, CaptureMode, RunOutcome, Segment, Session, Token};

/// Tokenize one command line into pipeline segments: shell-style word
/// splitting via shlex, then grouping on `|` connectors.
fn parse_segments(line: &str) -> Result<Vec<Segment>> {
    let toks =
        shlex::split(line).ok_or_else(|| anyhow::anyhow!("unbalanced quoting in: {line}"))?;
    let mut segments = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    for tok in toks {
        if tok == "|" {
            if current.is_empty() {
                anyhow::bail!("empty pipeline stage");
            }
            segments.push(Segment::Command(std::mem::take(&mut current)));
            segments.push(Segment::pipe());
        } else {
            current.push(Token::from(tok));
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Command(current));
    }
    Ok(segments)
}

fn main() -> Result<()> {
    let mut args = env::args().skip(1);
    let mut script: Option<String> = None;
    let mut capture = CaptureMode::None;
    let mut auto_cd = false;
    let mut verbose = false;
    while let Some(a) = args.next() {
        match a.as_str() {
            "-c" => {
                script = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("missing script after -c"))?,
                );
            }
            "--capture" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing value after --capture"))?;
                capture = CaptureMode::parse(&v)
                    .ok_or_else(|| anyhow::anyhow!("unknown capture mode: {v}"))?;
            }
            "--auto-cd" => auto_cd = true,
            "-v" | "--verbose" => verbose = true,
            other => {
                // First positional is the script file, run through the
                // same pipeline machinery as -c, line by line.
                if script.is_none() && !other.starts_with('-') {
                    script = Some(std::fs::read_to_string(other)?);
                } else {
                    eprintln!("unknown arg: {other}");
                }
            }
        }
    }

    simplelog::TermLogger::init(
        if verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Warn
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let mut session = Session::from_process();
    session.env.auto_cd = auto_cd;

    let script = script.ok_or_else(|| anyhow::anyhow!("no script given (use -c or a file)"))?;
    for line in script.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let segments = parse_segments(line)?;
        if segments.is_empty() {
            continue;
        }
        match run(&mut session, segments, capture) {
            Ok(RunOutcome::None) => {}
            Ok(RunOutcome::Stdout(s)) => print!("{s}"),
            Ok(RunOutcome::Pipeline(mut pl)) => {
                session.last_returncode = pl.returncode();
            }
            Err(e) => {
                eprintln!("{e}");
                session.last_returncode = 1;
            }
        }
    }
    std::process::exit(session.last_returncode);
}
