//! Per-run standard streams applying the configured stream policy.

use crate::config::types::{InputMode, OutputMode};
use crate::unit::value::lock;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug)]
pub struct OutputSink {
    mode: OutputMode,
    target: Target,
    buffer: Arc<Mutex<String>>,
}

impl OutputSink {
    fn new(mode: OutputMode, target: Target) -> Self {
        Self {
            mode,
            target,
            buffer: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn write(&self, text: &str) {
        if self.mode.captures() {
            lock(&self.buffer).push_str(text);
        }
        if self.mode.forwards() {
            // errors on the grader's own streams are ignored
            let _ = match self.target {
                Target::Stdout => {
                    let mut out = std::io::stdout().lock();
                    out.write_all(text.as_bytes()).and_then(|_| out.flush())
                }
                Target::Stderr => std::io::stderr().lock().write_all(text.as_bytes()),
            };
        }
    }

    /// Buffered text, or `None` when this sink does not capture
    pub fn captured(&self) -> Option<String> {
        self.mode.captures().then(|| lock(&self.buffer).clone())
    }
}

/// Standard streams of one sandboxed run
#[derive(Clone, Debug)]
pub struct RunIo {
    stdin: InputMode,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl RunIo {
    pub fn new(stdin: InputMode, stdout: OutputMode, stderr: OutputMode) -> Self {
        Self {
            stdin,
            stdout: OutputSink::new(stdout, Target::Stdout),
            stderr: OutputSink::new(stderr, Target::Stderr),
        }
    }

    /// Next input line without its terminator; `Ok(None)` at end of input
    pub fn read_line(&self) -> std::io::Result<Option<String>> {
        match self.stdin {
            InputMode::Empty => Ok(None),
            InputMode::Closed => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "Stream closed",
            )),
            InputMode::Inherit => {
                let mut line = String::new();
                let read = std::io::stdin().lock().read_line(&mut line)?;
                if read == 0 {
                    return Ok(None);
                }
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
        }
    }
}
