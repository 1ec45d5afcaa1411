//! Bounded external command execution
//!
//! Every partitioning or formatting tool is run as a child process with a
//! deadline; a tool that hangs must not hang the whole run.

use std::{
    io::{self, Read, Write as _},
    process::{Command, Output, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drains one child pipe to completion on its own thread. The child
/// blocks writing once the pipe buffer fills, so draining must run
/// concurrently with waiting for it to exit.
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();

        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!("Couldn't drain child pipe: {e}");
            }
        }

        buf
    })
}

/// Runs `cmd` to completion with captured output, feeding it `input` on
/// stdin when given, and killing it once `timeout` elapses.
///
/// # Errors
///
/// [`io::ErrorKind::TimedOut`] when the deadline passes, or whatever
/// spawning / collecting the child returns.
pub(crate) fn run_with_timeout(
    cmd: &mut Command,
    input: Option<&str>,
    timeout: Duration,
) -> Result<Output, io::Error> {
    debug!("Running {cmd:?} with a {}s timeout", timeout.as_secs());

    let stdin = if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };

    let mut child = cmd
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(script) = input {
        trace!("Child stdin:\n{script}");

        let mut handle = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "child stdin not captured")
        })?;
        handle.write_all(script.as_bytes())?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let stdout = drain_pipe(child.stdout.take());
    let stderr = drain_pipe(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }

        if Instant::now() >= deadline {
            warn!("{cmd:?} exceeded its {}s timeout, killing it", timeout.as_secs());

            child.kill()?;
            child.wait()?;

            // The reader threads see EOF once the child is dead and
            // finish on their own.
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("command timed out after {}s", timeout.as_secs()),
            ));
        }

        thread::sleep(POLL_INTERVAL);
    };

    let output = Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    };

    trace!(
        "Command exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(output)
}
