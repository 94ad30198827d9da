//! Helpers for running child processes with timeouts and bounded output.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

type SharedWriter = Arc<Option<Mutex<BufWriter<File>>>>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Bytes produced on both streams, including bytes dropped by the output limit.
    pub fn total_bytes(&self) -> u64 {
        (self.stdout.len() + self.stdout_truncated + self.stderr.len() + self.stderr_truncated)
            as u64
    }

    /// Stdout followed by stderr as lossy UTF-8.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }

    /// Exit code, mapping signal termination to `128 + signal` on unix.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.status.code() {
            return code;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return 128 + signal;
            }
        }
        1
    }
}

/// Run a command with an optional timeout, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// If `stream_path` is `Some`, every stdout and stderr line is also appended to that file as it
/// arrives. With `timeout = None` the call waits for the child indefinitely.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes, streaming = stream_path.is_some()))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    stream_path: Option<&Path>,
) -> io::Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let stream_file: SharedWriter = Arc::new(match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Some(Mutex::new(BufWriter::new(File::create(path)?)))
        }
        None => None,
    });

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e);
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("stdin was not piped"))?;
        child_stdin.write_all(input)?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not piped"))?;

    let stdout_tee = stream_file.clone();
    let stderr_tee = stream_file.clone();
    let stdout_handle =
        thread::spawn(move || read_stream_limited(stdout, output_limit_bytes, stdout_tee));
    let stderr_handle =
        thread::spawn(move || read_stream_limited(stderr, output_limit_bytes, stderr_tee));

    let mut timed_out = false;
    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit)? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill()?;
                child.wait()?
            }
        },
        None => child.wait()?,
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle)?;
    let (stderr, stderr_truncated) = join_output(stderr_handle)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<io::Result<(Vec<u8>, usize)>>) -> io::Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, optionally tee-ing to a file.
fn read_stream_limited<R: Read>(
    reader: R,
    limit: usize,
    stream_file: SharedWriter,
) -> io::Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            // Flush per line so the log can be followed while the child runs.
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams() {
        let out = run_command_with_timeout(
            sh("echo out; echo err 1>&2; exit 3"),
            None,
            Some(Duration::from_secs(10)),
            1000,
            None,
        )
        .expect("run");
        assert_eq!(out.exit_code(), 3);
        assert!(!out.timed_out);
        assert_eq!(out.combined_text(), "out\nerr\n");
        assert_eq!(out.total_bytes(), 8);
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Some(Duration::from_millis(100)),
            1000,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn truncates_but_counts_all_bytes() {
        let out = run_command_with_timeout(sh("printf 'abcdefghij'"), None, None, 4, None)
            .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert_eq!(out.total_bytes(), 10);
    }

    #[test]
    fn streams_lines_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/run.log");
        run_command_with_timeout(
            sh("echo one; echo two"),
            None,
            None,
            1000,
            Some(&log),
        )
        .expect("run");
        let contents = std::fs::read_to_string(&log).expect("read log");
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), None, 1000, None)
            .expect("run");
        assert_eq!(out.stdout, b"hello");
    }
}
