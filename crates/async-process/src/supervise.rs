//! Supervised execution of long-running child processes.
//!
//! [`supervise`] spawns a Command, feeds it an optional stdin payload (then
//! closes stdin), and captures stdout and stderr incrementally while the
//! process runs. A heartbeat callback is invoked periodically with progress.
//! If the process outlives `timeout` it's sent SIGTERM, and then SIGKILL if
//! it's still alive after `grace`. Output captured up to that point is
//! returned within the timeout error.

use super::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct SuperviseOptions {
    /// Maximum wall-clock duration of the process.
    pub timeout: Duration,
    /// Delay between SIGTERM and SIGKILL once `timeout` has elapsed.
    pub grace: Duration,
    /// Interval of heartbeat callbacks, or None to disable them.
    pub heartbeat: Option<Duration>,
}

impl Default for SuperviseOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            grace: Duration::from_secs(10),
            heartbeat: Some(Duration::from_secs(30)),
        }
    }
}

/// Progress of a supervised process, passed to heartbeat callbacks.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub pid: u32,
    pub elapsed: Duration,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

/// Supervised is the result of a supervised process which exited on its own.
#[derive(Debug)]
pub struct Supervised {
    pub status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn")]
    Spawn(#[source] std::io::Error),
    #[error("failed to write stdin")]
    Stdin(#[source] std::io::Error),
    #[error("error while waiting for the process")]
    Wait(#[source] std::io::Error),
    #[error("process timed out after {:?}{}", .timeout, render_tail(.stderr))]
    TimedOut {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut { .. })
    }
}

fn render_tail(stderr: &str) -> String {
    let tail = tail_chars(stderr.trim_end(), 2000);
    if tail.is_empty() {
        String::new()
    } else {
        format!("; last stderr: {tail}")
    }
}

/// Returns at most the last `limit` characters of `s`.
pub fn tail_chars(s: &str, limit: usize) -> &str {
    let count = s.chars().count();
    if count <= limit {
        return s;
    }
    match s.char_indices().nth(count - limit) {
        Some((offset, _)) => &s[offset..],
        None => s,
    }
}

/// Shared buffer into which a pipe is incrementally read.
type Capture = Arc<Mutex<Vec<u8>>>;

/// Spawn and supervise `cmd`. See the module documentation.
#[tracing::instrument(level = "debug", skip_all, fields(program = ?cmd.get_program()))]
pub async fn supervise<H>(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    options: &SuperviseOptions,
    mut on_heartbeat: H,
) -> Result<Supervised, Error>
where
    H: FnMut(Progress),
{
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    tracing::debug!(args = ?cmd.get_args().collect::<Vec<_>>(), "invoking");

    let started = Instant::now();
    let mut child = Child::spawn(cmd).map_err(Error::Spawn)?;
    let pid = child.id();

    let stdout = Capture::default();
    let stderr = Capture::default();
    let stdout_reader = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(capture(pipe, stdout.clone())));
    let stderr_reader = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(capture(pipe, stderr.clone())));

    // Stdin is fed concurrently with the wait, so that the deadline applies
    // to a process which never reads it. The writer is dropped once the
    // payload is written, and the process then sees EOF.
    let writer = stdin.and(child.stdin.take());
    let feed = async move {
        if let (Some(payload), Some(mut writer)) = (stdin, writer) {
            writer.write_all(payload).await?;
            writer.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    tokio::pin!(feed);
    let mut fed = false;

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    let wait = child.wait();
    tokio::pin!(wait);

    let mut heartbeat = options.heartbeat.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    let status = loop {
        tokio::select! {
            status = &mut wait => break status.map_err(Error::Wait)?,
            result = &mut feed, if !fed => {
                fed = true;
                match result {
                    // A process which exits without reading its input produces
                    // a broken pipe, which isn't itself a failure.
                    Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => {
                        return Err(Error::Stdin(err));
                    }
                    _ => (),
                }
            }
            _ = tick(&mut heartbeat) => {
                on_heartbeat(Progress {
                    pid,
                    elapsed: started.elapsed(),
                    stdout_bytes: captured_len(&stdout),
                    stderr_bytes: captured_len(&stderr),
                });
            }
            () = &mut deadline => {
                tracing::warn!(%pid, timeout = ?options.timeout, "supervised process timed out; sending SIGTERM");
                if let Err(error) = child.terminate() {
                    tracing::error!(%pid, ?error, "failed to deliver SIGTERM");
                }
                tokio::select! {
                    _ = &mut wait => (),
                    () = tokio::time::sleep(options.grace) => {
                        tracing::warn!(%pid, grace = ?options.grace, "supervised process ignored SIGTERM; killing");
                        if let Err(error) = child.kill() {
                            tracing::error!(%pid, ?error, "failed to kill timed-out process");
                        }
                        let _ = wait.await;
                    }
                }
                // Readers may still be blocked on pipes held open by
                // orphaned grandchildren, so they're not awaited here.
                return Err(Error::TimedOut {
                    timeout: options.timeout,
                    stdout: snapshot(&stdout),
                    stderr: snapshot(&stderr),
                });
            }
        }
    };

    // Drain readers, bounded in case a grandchild holds a pipe open.
    for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
        match tokio::time::timeout(options.grace, reader).await {
            Ok(Ok(Ok(()))) => (),
            Ok(Ok(Err(error))) => tracing::warn!(%pid, ?error, "failed to read process output"),
            Ok(Err(error)) => tracing::warn!(%pid, ?error, "process output reader panicked"),
            Err(_) => tracing::warn!(%pid, "process output pipe remained open after exit"),
        }
    }

    Ok(Supervised {
        status,
        stdout: snapshot(&stdout),
        stderr: snapshot(&stderr),
        elapsed: started.elapsed(),
    })
}

async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn capture(mut pipe: super::ChildStdio, into: Capture) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        lock(&into).extend_from_slice(&chunk[..n]);
    }
}

fn lock(capture: &Capture) -> std::sync::MutexGuard<'_, Vec<u8>> {
    capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn captured_len(capture: &Capture) -> usize {
    lock(capture).len()
}

fn snapshot(capture: &Capture) -> String {
    String::from_utf8_lossy(&lock(capture)).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    fn options(timeout_ms: u64) -> SuperviseOptions {
        SuperviseOptions {
            timeout: Duration::from_millis(timeout_ms),
            grace: Duration::from_millis(500),
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_stdin_is_fed_and_closed() {
        let out = supervise(
            &mut Command::new("cat"),
            Some(b"hello supervisor"),
            &options(10_000),
            |_| (),
        )
        .await
        .unwrap();

        assert!(out.status.success());
        assert_eq!(out.stdout, "hello supervisor");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn test_timeout_applies_to_unread_stdin() {
        // The payload is far larger than a pipe buffer, and is never read.
        let payload = vec![b'x'; 1 << 20];
        let started = Instant::now();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(
                Command::new("sleep").arg("30"),
                Some(payload.as_slice()),
                &options(300),
                |_| (),
            ),
        )
        .await
        .expect("supervise must return within its timeout and grace");

        assert!(result.unwrap_err().is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr() {
        let out = supervise(
            Command::new("sh").args(["-c", "echo partial; echo boom >&2; exit 3"]),
            None,
            &options(10_000),
            |_| (),
        )
        .await
        .unwrap();

        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout, "partial\n");
        assert_eq!(out.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_timeout_terminates_within_grace() {
        let started = Instant::now();
        let err = supervise(
            Command::new("sh").args(["-c", "echo started >&2; exec sleep 60"]),
            None,
            &options(300),
            |_| (),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));

        let Error::TimedOut { stderr, .. } = &err else {
            unreachable!()
        };
        assert_eq!(stderr, "started\n");
        assert_eq!(
            err.to_string(),
            "process timed out after 300ms; last stderr: started"
        );
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_kill() {
        let started = Instant::now();
        // The shell ignores SIGTERM, so only SIGKILL stops it.
        let err = supervise(
            Command::new("sh").args(["-c", "trap '' TERM; while true; do sleep 0.05; done"]),
            None,
            &options(200),
            |_| (),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_heartbeats_fire_while_running() {
        let mut beats = Vec::new();
        let out = supervise(
            Command::new("sh").args(["-c", "echo tick; sleep 0.5; echo tock"]),
            None,
            &SuperviseOptions {
                timeout: Duration::from_secs(10),
                grace: Duration::from_millis(500),
                heartbeat: Some(Duration::from_millis(100)),
            },
            |progress| beats.push(progress),
        )
        .await
        .unwrap();

        assert!(out.status.success());
        assert_eq!(out.stdout, "tick\ntock\n");
        assert!(beats.len() >= 2, "expected heartbeats, got {beats:?}");
        assert!(beats.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = supervise(
            &mut Command::new("definitely-not-an-installed-tool"),
            None,
            &options(1_000),
            |_| (),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Spawn(_)));
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 10), "abcdef");
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
    }
}
