use crate::backup::cancel::{CancelToken, POLL_INTERVAL};
use crate::backup::finish::{FileSink, Transform, WriterStack};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lower-cased stderr fragments that mean the artifact is unusable.
pub const FATAL_STDERR_MARKERS: [&str; 14] = [
    "access denied",
    "unknown database",
    "can't connect",
    "lost connection",
    "got error",
    "couldn't execute",
    "couldn't find table",
    "unknown variable",
    "unknown option",
    "unknown server host",
    "no such file or directory",
    "out of memory",
    "errcode",
    "killed",
];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DumpInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, RedactedString)>,
}

impl DumpInvocation {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
        }
    }

    pub fn with_env<K: Into<String>>(mut self, key: K, value: RedactedString) -> Self {
        self.envs.push((key.into(), value));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.inner().as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StderrClass {
    Clean,
    Warning,
    Fatal,
}

/// A failed exit is fatal only when stderr names a known failure, or says nothing.
/// Any stderr output next to a successful exit is a warning.
pub fn classify_stderr(exit_success: bool, stderr: &str) -> StderrClass {
    let stderr = stderr.trim();
    if exit_success {
        return if stderr.is_empty() {
            StderrClass::Clean
        } else {
            StderrClass::Warning
        };
    }
    if stderr.is_empty() {
        return StderrClass::Fatal;
    }
    let folded = stderr.to_lowercase();
    if FATAL_STDERR_MARKERS
        .iter()
        .any(|marker| folded.contains(marker))
    {
        StderrClass::Fatal
    } else {
        StderrClass::Warning
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitReport {
    pub stderr: String,
    /// Non-fatal dump tool output, kept for the run summary
    pub warnings: Option<String>,
    /// Raw dump bytes pushed into the writer stack
    pub bytes_streamed: u64,
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ProcessOutcome {
    copied: io::Result<u64>,
    status: io::Result<ExitStatus>,
    stderr: String,
}

/// Streams the dump into `output_path` through `transforms`. An existing file
/// at `output_path` is never overwritten.
///
/// `transforms[0]` sits next to the file. The writer stack is closed after the
/// process ends whatever the outcome, outermost layer first.
pub fn run_unit(
    cancel: &CancelToken,
    invocation: &DumpInvocation,
    output_path: &Path,
    transforms: &[&dyn Transform],
) -> Result<UnitReport> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let started = Instant::now();

    let file = File::create_new(output_path)
        .map_err(Error::from)
        .with_msg(format!("Create artifact failed: {output_path:?}"))?;
    let mut stack = WriterStack::build(Box::new(FileSink::new(file)), transforms)
        .with_msg(format!("Build writer stack failed: {output_path:?}"))?;
    debug!("Writer stack for {:?} has {} layers", output_path, stack.depth());

    let mut child = match invocation.command().spawn() {
        Ok(child) => child,
        Err(source) => {
            if let Err(e) = stack.close() {
                warn!("Closing {:?} after launch failure failed: {e}", output_path);
            }
            return Err(Error::DumpLaunch {
                program: invocation.program.clone(),
                source,
            });
        }
    };
    info!("Started {} (pid {}) into {:?}", invocation.program, child.id(), output_path);

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let child = Mutex::new(child);
    let done = AtomicBool::new(false);

    let outcome = thread::scope(|scope| {
        let stderr_reader = scope.spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_end(&mut buf) {
                    warn!("Reading dump stderr failed: {e}");
                }
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                if cancel.is_cancelled() {
                    warn!("Cancellation requested, killing {}", invocation.program);
                    if let Err(e) = lock(&child).kill() {
                        debug!("Kill failed: {e}");
                    }
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
        });

        let copied = match stdout {
            Some(mut stdout) => io::copy(&mut stdout, &mut stack),
            None => Ok(0),
        };
        if copied.is_err() {
            // Nobody drains stdout any more; stop the producer.
            if let Err(e) = lock(&child).kill() {
                debug!("Kill failed: {e}");
            }
        }

        let status = loop {
            match lock(&child).try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => break Err(e),
            }
        };
        done.store(true, Ordering::SeqCst);

        ProcessOutcome {
            copied,
            status,
            stderr: stderr_reader.join().unwrap_or_default(),
        }
    });

    let closed = stack.close();

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let bytes_streamed = outcome
        .copied
        .map_err(Error::from)
        .with_msg(format!("Stream dump output into {output_path:?} failed"))?;
    let status = outcome
        .status
        .map_err(Error::from)
        .with_msg(format!("Wait for {} failed", invocation.program))?;

    let stderr = outcome.stderr;
    let class = classify_stderr(status.success(), &stderr);
    let closed = closed
        .map_err(Error::from)
        .with_msg(format!("Close artifact writers failed: {output_path:?}"));
    if class == StderrClass::Fatal {
        let fatal = Error::DumpFatal { status, stderr };
        return Err(match closed {
            Ok(()) => fatal,
            Err(e) => fatal.chain(e),
        });
    }
    closed?;

    let warnings = (class == StderrClass::Warning).then(|| stderr.trim().to_string());
    if let Some(warnings) = &warnings {
        warn!("{} reported warnings ({status}): {warnings}", invocation.program);
    }
    info!(
        "Finished {:?}: {} bytes streamed in {:?}",
        output_path,
        bytes_streamed,
        started.elapsed()
    );

    Ok(UnitReport {
        stderr,
        warnings,
        bytes_streamed,
    })
}
