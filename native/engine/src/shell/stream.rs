use std::{
    future::Future,
    io,
    pin::Pin,
    process::{ExitStatus, Stdio},
    sync::{Mutex, PoisonError},
    task::{Context, Poll, ready},
};

use derive_more::Debug;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    process::{ChildStdin, ChildStdout, Command},
};

/// Wait future of a spawned child. Kept behind a mutex so the owning stream is `Sync`.
type ExitFuture = Pin<Box<dyn Future<Output = io::Result<ExitStatus>> + Send>>;

fn exit_error(command: &str, status: ExitStatus) -> io::Error {
    io::Error::other(format!("`{command}` exited with {status}"))
}

/// Reads the stdout of a privileged command (e.g. `cat "<path>"`).
///
/// Reaching EOF also reaps the child; a non-zero exit turns into a read error so
/// a failed read is never mistaken for an empty file.
#[derive(Debug)]
pub struct ShellReader {
    #[debug(skip)]
    stdout: ChildStdout,
    #[debug(skip)]
    exit: Mutex<ExitFuture>,
    command: String,
    finished: bool,
}

impl ShellReader {
    pub(crate) fn spawn(mut cmd: Command, command: String) -> io::Result<Self> {
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null()).kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
        let exit: ExitFuture = Box::pin(async move { child.wait().await });
        Ok(Self { stdout, exit: Mutex::new(exit), command, finished: false })
    }
}

impl AsyncRead for ShellReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // EOF
        let exit = this.exit.get_mut().unwrap_or_else(PoisonError::into_inner);
        let status = ready!(exit.as_mut().poll(cx))?;
        this.finished = true;
        if status.success() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(exit_error(&this.command, status)))
        }
    }
}

/// Feeds the stdin of a privileged command (e.g. `cat > "<path>"`).
///
/// `shutdown` closes the pipe and waits for the child, failing if it exited non-zero.
#[derive(Debug)]
pub struct ShellWriter {
    #[debug(skip)]
    stdin: Option<ChildStdin>,
    #[debug(skip)]
    exit: Mutex<ExitFuture>,
    command: String,
    finished: bool,
}

impl ShellWriter {
    pub(crate) fn spawn(mut cmd: Command, command: String) -> io::Result<Self> {
        cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::null()).kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let stdin =
            child.stdin.take().ok_or_else(|| io::Error::other("child stdin was not captured"))?;
        let exit: ExitFuture = Box::pin(async move { child.wait().await });
        Ok(Self { stdin: Some(stdin), exit: Mutex::new(exit), command, finished: false })
    }
}

impl AsyncWrite for ShellWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_write(cx, buf),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stdin.as_mut() {
            Some(stdin) => Pin::new(stdin).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }
        if let Some(stdin) = this.stdin.as_mut() {
            ready!(Pin::new(stdin).poll_shutdown(cx))?;
            // Dropping the handle closes the pipe so the child sees EOF
            this.stdin = None;
        }
        let exit = this.exit.get_mut().unwrap_or_else(PoisonError::into_inner);
        let status = ready!(exit.as_mut().poll(cx))?;
        this.finished = true;
        if status.success() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(exit_error(&this.command, status)))
        }
    }
}
