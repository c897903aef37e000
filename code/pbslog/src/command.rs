// Execute a command with a timeout and safe handling of the communication.
//
// The program is run directly, not through a shell: the scheduler commands are fixed and take no
// user input.

use std::io;
use std::time::Duration;
use subprocess::{Exec, ExitStatus, Popen, Redirection};

#[derive(Debug)]
pub enum CommandFailure {
    // The program could not be started at all (not found, not executable).
    Spawn(String),
    TimedOut,
    // Exit status and whatever the program wrote to stderr.
    Failed(String, String),
    Internal(String),
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::Spawn(msg) => write!(f, "could not be started: {msg}"),
            CommandFailure::TimedOut => write!(f, "timed out"),
            CommandFailure::Failed(status, stderr) => {
                if stderr.trim().is_empty() {
                    write!(f, "{status}")
                } else {
                    write!(f, "{status}: {}", stderr.trim())
                }
            }
            CommandFailure::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout_seconds: u64,
) -> Result<String, CommandFailure> {
    let mut p = match Exec::cmd(program)
        .args(args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .popen()
    {
        Ok(p) => p,
        Err(e) => {
            return Err(CommandFailure::Spawn(e.to_string()));
        }
    };

    // There is a limited capacity in the pipe.  When the pipe fills up the child stops, which
    // means that we'll time out if we use a timeout or will hang indefinitely if not; the job
    // listing for a busy cluster is easily large enough for this to happen.  So drain the pipes
    // while waiting for the child to terminate, see
    //
    //   https://github.com/rust-lang/rust/issues/45572
    //
    // and bound the amount of time we're willing to wait for output to become available.

    let mut comm = p
        .communicate_start(None)
        .limit_time(Duration::new(timeout_seconds, 0));
    let mut stdout_result = "".to_string();
    let mut stderr_result = "".to_string();
    let failure = loop {
        match comm.read_string() {
            Ok((Some(stdout), Some(stderr))) => {
                if stdout.is_empty() && stderr.is_empty() {
                    // EOF on both, timeouts are signaled as Err()
                    break None;
                }
                stdout_result += &stdout;
                stderr_result += &stderr;
            }
            Ok((_, _)) => {
                break Some(CommandFailure::Internal("missing output stream".to_string()));
            }
            Err(e) => {
                if e.error.kind() == io::ErrorKind::TimedOut {
                    // Hung, or just too slow.
                    break Some(CommandFailure::TimedOut);
                }
                break Some(CommandFailure::Internal(e.error.to_string()));
            }
        }
    };

    match reap(&mut p, failure)? {
        ExitStatus::Exited(0) => Ok(stdout_result),
        ExitStatus::Exited(n) => Err(CommandFailure::Failed(
            format!("exit status {n}"),
            stderr_result,
        )),
        other => Err(CommandFailure::Failed(format!("{other:?}"), stderr_result)),
    }
}

// Wait for the child to exit.  After any failure to read its output the child may still be
// running, possibly with its pipes closed, so it is killed first: it must not hold up the cycle.

fn reap(p: &mut Popen, failure: Option<CommandFailure>) -> Result<ExitStatus, CommandFailure> {
    if let Some(failure) = failure {
        let _ = p.terminate();
        let _ = p.wait();
        return Err(failure);
    }
    p.wait().map_err(|e| CommandFailure::Internal(e.to_string()))
}

#[test]
fn test_run_with_timeout_ok() {
    let out = run_with_timeout("sh", &["-c", "echo '{\"a\": 1}'; echo warning >&2"], 10).unwrap();
    assert!(out.trim() == "{\"a\": 1}");
}

#[test]
fn test_run_with_timeout_large_output() {
    // More than fits in a pipe buffer
    let out = run_with_timeout("sh", &["-c", "seq 1 100000"], 30).unwrap();
    assert!(out.lines().count() == 100000);
}

#[test]
fn test_run_with_timeout_failures() {
    match run_with_timeout("sh", &["-c", "echo oops >&2; exit 3"], 10) {
        Err(CommandFailure::Failed(status, stderr)) => {
            assert!(status == "exit status 3");
            assert!(stderr.trim() == "oops");
        }
        _ => assert!(false),
    }
    match run_with_timeout("/no/such/pbs/binary", &[], 10) {
        Err(CommandFailure::Spawn(_)) => {}
        _ => assert!(false),
    }
    match run_with_timeout("sleep", &["10"], 1) {
        Err(CommandFailure::TimedOut) => {}
        _ => assert!(false),
    }
}

#[test]
fn test_read_failure_terminates_child() {
    let mut p = Exec::cmd("sleep").arg("30").popen().unwrap();
    let started = std::time::Instant::now();
    match reap(&mut p, Some(CommandFailure::Internal("read error".to_string()))) {
        Err(CommandFailure::Internal(msg)) => assert!(msg == "read error"),
        _ => assert!(false),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(p.poll().is_some());
}
