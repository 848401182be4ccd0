use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::Instant;

/// Result of running one assignment's command sequence.
#[derive(Debug)]
pub struct TestOutcome {
    /// Captured stdout/stderr of every command run, with an
    /// `\nEND <command>\n` separator after each.
    pub transcript: Vec<u8>,
    pub passed: bool,
    /// The shared wall-clock budget expired and the process tree was
    /// killed.
    pub timed_out: bool,
}

impl TestOutcome {
    fn failed(transcript: Vec<u8>) -> Self {
        Self {
            transcript,
            passed: false,
            timed_out: false,
        }
    }
}

/// Runs an assignment's commands sequentially inside its working
/// directory, under one shared wall-clock deadline.
///
/// Each command is whitespace-split into program and arguments and spawned
/// in a fresh process group, so an expired deadline can take down the whole
/// descendant tree with one SIGKILL. The sequence aborts at the first
/// command that exits non-zero, dies to a signal, or is killed by the
/// timer.
#[derive(Debug, Clone, Default)]
pub struct TestExecutor;

impl TestExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn run_sequence(
        &self,
        dir: &Path,
        commands: &[String],
        timeout_secs: u32,
    ) -> TestOutcome {
        let deadline = Instant::now() + Duration::from_secs(u64::from(timeout_secs));
        let mut transcript = Vec::new();

        for command in commands {
            let mut parts = command.split_whitespace();
            let Some(program) = parts.next() else {
                continue;
            };

            tracing::debug!(command = %command, dir = %dir.display(), "Running command");

            let spawned = Command::new(program)
                .args(parts)
                .current_dir(dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true)
                .spawn();

            let child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!(command = %command, error = %e, "Spawn failed");
                    transcript.extend_from_slice(
                        format!("failed to spawn {program}: {e}\nEND {command}\n").as_bytes(),
                    );
                    return TestOutcome::failed(transcript);
                }
            };

            // The child leads its own process group, so its pid doubles as
            // the pgid to kill on expiry.
            let pgid = child.id();

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, child.wait_with_output()).await {
                Ok(Ok(output)) => {
                    transcript.extend_from_slice(&output.stdout);
                    transcript.extend_from_slice(&output.stderr);
                    // One newline always precedes the marker: the command's
                    // own trailing newline, or an inserted one (also when
                    // the command produced no output at all).
                    if !transcript.ends_with(b"\n") {
                        transcript.push(b'\n');
                    }
                    transcript.extend_from_slice(format!("END {command}\n").as_bytes());
                    if !output.status.success() {
                        tracing::info!(
                            command = %command,
                            code = ?output.status.code(),
                            "Command failed, aborting sequence"
                        );
                        return TestOutcome::failed(transcript);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(command = %command, error = %e, "Wait failed");
                    transcript
                        .extend_from_slice(format!("wait failed: {e}\nEND {command}\n").as_bytes());
                    return TestOutcome::failed(transcript);
                }
                Err(_elapsed) => {
                    tracing::info!(command = %command, "Deadline expired, killing process tree");
                    if let Some(pgid) = pgid {
                        kill_group(pgid);
                    }
                    return TestOutcome {
                        transcript,
                        passed: false,
                        timed_out: true,
                    };
                }
            }
        }

        TestOutcome {
            transcript,
            passed: true,
            timed_out: false,
        }
    }
}

/// SIGKILL the whole process group rooted at `pgid`. Races with normal
/// exit are benign (ESRCH is ignored).
fn kill_group(pgid: u32) {
    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        tracing::debug!(pgid, error = %e, "killpg failed");
    }
}
