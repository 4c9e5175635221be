//! Process-like wrappers for in-process callable aliases: a threaded
//! variant that keeps the main thread free, and a synchronous variant for
//! aliases declared non-threadable.

use std::thread::JoinHandle;

use crate::session::{AliasFn, AliasStreams};

/// Runs a callable alias on a dedicated worker thread. The thread starts
/// immediately on construction, mirroring a spawned process.
pub struct ProcProxyThread {
    handle: Option<JoinHandle<i32>>,
    code: Option<i32>,
}

impl ProcProxyThread {
    pub fn spawn(
        f: AliasFn,
        args: Vec<String>,
        mut streams: AliasStreams,
    ) -> std::io::Result<ProcProxyThread> {
        let handle = std::thread::Builder::new()
            .name("alias-proxy".to_string())
            .spawn(move || f(&args, &mut streams))?;
        Ok(ProcProxyThread {
            handle: Some(handle),
            code: None,
        })
    }

    /// Non-blocking status check; joins only once the worker has
    /// finished. `None` while the alias is still running.
    pub fn poll(&mut self) -> Option<i32> {
        if self.code.is_some() {
            return self.code;
        }
        let finished = self
            .handle
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(false);
        if finished {
            return Some(self.wait());
        }
        None
    }

    /// Join the worker and report its exit code. A panicking alias is
    /// tagged with exit code 1 rather than poisoning the pipeline.
    pub fn wait(&mut self) -> i32 {
        if let Some(handle) = self.handle.take() {
            let code = match handle.join() {
                Ok(code) => code,
                Err(_) => {
                    log::warn!("alias callable panicked; recording exit code 1");
                    1
                }
            };
            self.code = Some(code);
        }
        self.code.unwrap_or(1)
    }
}

/// Runs a callable alias synchronously on the invoking thread. By the
/// time the constructor returns, the alias has already finished.
pub struct ProcProxy {
    code: i32,
}

impl ProcProxy {
    pub fn run(f: AliasFn, args: Vec<String>, mut streams: AliasStreams) -> ProcProxy {
        ProcProxy {
            code: f(&args, &mut streams),
        }
    }

    pub fn wait(&self) -> i32 {
        self.code
    }
}
