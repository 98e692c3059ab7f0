use std::process::ExitStatus;
use std::time::Duration;

use sandbox::CapturedOutput;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::process::{kill_group, kill_process_group};

const READ_CHUNK: usize = 8192;

/// How supervision of the guest ended.
#[derive(Debug)]
pub(crate) enum Ending {
    Exited(ExitStatus),
    OutputLimit,
    WallClock,
    Cancelled,
}

pub(crate) struct Supervised {
    pub ending: Ending,
    pub output: CapturedOutput,
}

/// Drain the guest's stdout/stderr while enforcing the output cap, the
/// wall-clock deadline, and cancellation.
///
/// On any forced ending the whole process group is killed and the child is
/// reaped before returning. Captured output never exceeds `max_output_bytes`.
pub(crate) async fn supervise(
    child: &mut Child,
    wall_clock: Duration,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> std::io::Result<Supervised> {
    let deadline = Instant::now() + wall_clock;
    let leader = child.id();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("guest stdout not piped"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("guest stderr not piped"))?;

    let mut output = CapturedOutput::default();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut stdout_open = true;
    let mut stderr_open = true;

    let forced = loop {
        if !stdout_open && !stderr_open {
            break None;
        }
        tokio::select! {
            read = stdout.read(&mut out_buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => output.stdout.extend_from_slice(out_buf.get(..n).unwrap_or_default()),
                Err(e) => {
                    trace!(error = %e, "guest stdout read failed");
                    stdout_open = false;
                }
            },
            read = stderr.read(&mut err_buf), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => output.stderr.extend_from_slice(err_buf.get(..n).unwrap_or_default()),
                Err(e) => {
                    trace!(error = %e, "guest stderr read failed");
                    stderr_open = false;
                }
            },
            () = tokio::time::sleep_until(deadline) => break Some(Ending::WallClock),
            () = cancel.cancelled() => break Some(Ending::Cancelled),
        }
        if output.total_len() > max_output_bytes {
            break Some(Ending::OutputLimit);
        }
    };

    let ending = match forced {
        Some(ending) => ending,
        // Both streams closed; the guest is exiting or has detached them.
        None => tokio::select! {
            status = child.wait() => Ending::Exited(status?),
            () = tokio::time::sleep_until(deadline) => Ending::WallClock,
            () = cancel.cancelled() => Ending::Cancelled,
        },
    };

    if matches!(ending, Ending::Exited(_)) {
        // Stragglers that outlived the leader share its process group.
        if let Some(pid) = leader {
            kill_group(pid);
        }
    } else {
        kill_process_group(child);
        child.wait().await?;
    }

    cap_output(&mut output, max_output_bytes);
    Ok(Supervised { ending, output })
}

/// Trim captured output to at most `max` bytes, stdout first.
fn cap_output(output: &mut CapturedOutput, max: usize) {
    output.stdout.truncate(max);
    let room = max.saturating_sub(output.stdout.len());
    output.stderr.truncate(room);
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    fn spawn(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn collects_output_of_normal_exit() {
        let mut child = spawn("echo out; echo err >&2; exit 3");
        let token = CancellationToken::new();
        let sup = supervise(&mut child, Duration::from_secs(5), 1024, &token)
            .await
            .unwrap();
        match sup.ending {
            Ending::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected ending: {other:?}"),
        }
        assert_eq!(sup.output.stdout, b"out\n");
        assert_eq!(sup.output.stderr, b"err\n");
    }

    #[tokio::test]
    async fn wall_clock_kills_sleeping_guest() {
        let mut child = spawn("sleep 30");
        let token = CancellationToken::new();
        let started = std::time::Instant::now();
        let sup = supervise(&mut child, Duration::from_millis(200), 1024, &token)
            .await
            .unwrap();
        assert!(matches!(sup.ending, Ending::WallClock));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn output_cap_kills_chatty_guest() {
        let mut child = spawn("yes");
        let token = CancellationToken::new();
        let sup = supervise(&mut child, Duration::from_secs(10), 4096, &token)
            .await
            .unwrap();
        assert!(matches!(sup.ending, Ending::OutputLimit));
        assert!(sup.output.total_len() <= 4096);
    }

    #[tokio::test]
    async fn cancellation_kills_guest() {
        let mut child = spawn("sleep 30");
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let sup = supervise(&mut child, Duration::from_secs(10), 1024, &token)
            .await
            .unwrap();
        assert!(matches!(sup.ending, Ending::Cancelled));
    }

    #[test]
    fn cap_prefers_stdout() {
        let mut output = CapturedOutput {
            stdout: vec![b'a'; 6],
            stderr: vec![b'b'; 6],
        };
        cap_output(&mut output, 8);
        assert_eq!(output.stdout.len(), 6);
        assert_eq!(output.stderr.len(), 2);
    }
}
