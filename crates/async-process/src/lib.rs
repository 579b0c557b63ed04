pub use std::process::{Command, ExitStatus, Output, Stdio};
use tokio::io::AsyncReadExt;

use shared_child::SharedChild;
#[cfg(unix)]
use std::os::fd::OwnedFd as OwnedImpl;
#[cfg(windows)]
use std::os::fd::OwnedHandle as OwnedImpl;
use std::sync::Arc;

pub mod supervise;

pub use supervise::{supervise, Progress, Supervised, SuperviseOptions};

/// Child is a spawned process whose exit can be awaited from async code,
/// and which may be signaled while a wait is outstanding.
/// A Child that's dropped before it exits is sent SIGTERM.
pub struct Child {
    inner: Arc<SharedChild>,

    pub stdin: Option<ChildStdio>,
    pub stdout: Option<ChildStdio>,
    pub stderr: Option<ChildStdio>,
}

pub type ChildStdio = tokio::fs::File;

impl TryFrom<std::process::Child> for Child {
    type Error = std::io::Error;

    fn try_from(mut inner: std::process::Child) -> std::io::Result<Self> {
        let stdin = map_stdio(inner.stdin.take());
        let stdout = map_stdio(inner.stdout.take());
        let stderr = map_stdio(inner.stderr.take());

        Ok(Self {
            inner: Arc::new(SharedChild::new(inner)?),
            stdin,
            stdout,
            stderr,
        })
    }
}

impl Child {
    /// Spawn `cmd` as a Child.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        cmd.spawn()?.try_into()
    }

    pub fn id(&self) -> u32 {
        self.inner.id()
    }

    /// Wait for the process to exit. The returned future doesn't borrow
    /// `self`, so the child may be signaled while it's pending.
    pub fn wait(
        &self,
    ) -> impl std::future::Future<Output = std::io::Result<std::process::ExitStatus>> {
        let cloned_inner = self.inner.clone();
        let handle = tokio::runtime::Handle::current().spawn_blocking(move || cloned_inner.wait());
        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(std::io::Error::new(std::io::ErrorKind::Other, join_err)),
            }
        }
    }

    /// Returns the exit status if the process has already exited.
    pub fn try_wait(&self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.inner.try_wait()
    }

    /// Ask the process to exit with SIGTERM.
    /// This is a no-op if the child has already been waited on.
    #[cfg(unix)]
    pub fn terminate(&self) -> std::io::Result<()> {
        use shared_child::unix::SharedChildExt;
        self.inner.send_signal(libc::SIGTERM)
    }

    #[cfg(not(unix))]
    pub fn terminate(&self) -> std::io::Result<()> {
        self.inner.kill()
    }

    /// Forcibly kill the process (SIGKILL on unix).
    pub fn kill(&self) -> std::io::Result<()> {
        self.inner.kill()
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Ok(Some(_status)) = self.inner.try_wait() {
            return; // Already exited.
        }
        let pid = self.inner.id();

        // Note that terminate() returns Ok() if the child has been waited on.
        if let Err(error) = self.terminate() {
            tracing::error!(%pid, ?error, "failed to deliver SIGTERM to child process");
        }

        // Reaping requires a runtime. Without one there's nothing more to do.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let wait = self.wait();

        _ = runtime.spawn(async move {
            let timeout = tokio::time::sleep(std::time::Duration::from_secs(15));

            tokio::select! {
                exit_code = wait => match exit_code {
                    Err(error) => {
                        tracing::error!(%pid, ?error, "failed to wait for dropped child process");
                    },
                    Ok(exit_code) if !exit_code.success() => {
                        tracing::warn!(%pid, ?exit_code, "dropped child process exited with an error");
                    }
                    Ok(_) => {
                        tracing::debug!(%pid, "dropped child process exited cleanly");
                    }
                },
                _ = timeout => {
                    tracing::error!(%pid, "dropped child process is not exiting");
                }
            };
        });
    }
}

/// Spawn the command and wait for it to exit, buffering its stdout and stderr.
/// Upon its exit return an Output having its stdout, stderr, and ExitStatus.
pub async fn output(cmd: &mut Command) -> std::io::Result<Output> {
    cmd.stdin(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.stdout(Stdio::piped());

    let mut child = Child::spawn(cmd)?;

    let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
    let (stdout_pipe, stderr_pipe) = (child.stdout.take(), child.stderr.take());

    let read_stdout = async {
        match stdout_pipe {
            Some(mut pipe) => pipe.read_to_end(&mut stdout).await.map(|_| ()),
            None => Ok(()),
        }
    };
    let read_stderr = async {
        match stderr_pipe {
            Some(mut pipe) => pipe.read_to_end(&mut stderr).await.map(|_| ()),
            None => Ok(()),
        }
    };

    let (out, err, wait) = tokio::join!(read_stdout, read_stderr, child.wait());
    let status = wait?;
    out?;
    err?;

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

/// Returns true if `program` names an executable file, either directly
/// or by searching the directories of $PATH.
pub fn is_available(program: &str) -> bool {
    let path = std::path::Path::new(program);
    if path.components().count() > 1 {
        return is_executable(path);
    }
    let Some(search) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&search).any(|dir| is_executable(&dir.join(program)))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

fn map_stdio<F>(f: Option<F>) -> Option<ChildStdio>
where
    F: Into<OwnedImpl>,
{
    let f: Option<OwnedImpl> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}
