// A low-level module for starting bootstrap helpers from the same binary and for a helper to pick
// up the channel its parent handed down.
//
// The parent re-executes the resolved executable with a `-c <snippet>` argument pair and, when a
// control channel is needed, passes one end of a socket pair at a predefined file descriptor.
//
// Everything that touches raw descriptors lives here.

use anyhow::{Context as _, Result};
use cfg_if::cfg_if;
use nix::{
    fcntl::{fcntl, FcntlArg},
    sys::socket::{getsockopt, sockopt, SockType},
};
use std::{
    os::{
        fd::{AsRawFd as _, BorrowedFd, FromRawFd as _, RawFd},
        unix::{net::UnixStream, process::CommandExt},
    },
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::trace;

use crate::message::ExitStatus;

/// Where a fork server finds its control socket. High enough to stay clear of the descriptors a
/// test or the runtime opens on its own.
const CHANNEL_FD: RawFd = 1000;

/// Claims the control socket the harness passed down.
///
/// `None` in a process started without one, and on every call after the first.
pub fn take_channel() -> Option<UnixStream> {
    static CLAIMED: AtomicBool = AtomicBool::new(false);
    if CLAIMED.swap(true, Ordering::SeqCst) || !is_stream_socket(CHANNEL_FD) {
        return None;
    }
    // SAFETY: the descriptor is an open stream socket and `CLAIMED` makes this its only owner.
    Some(unsafe { UnixStream::from_raw_fd(CHANNEL_FD) })
}

/// Whether `fd` is open and refers to a stream socket.
fn is_stream_socket(fd: RawFd) -> bool {
    if fcntl(fd, FcntlArg::F_GETFD).is_err() {
        return false;
    }
    // SAFETY: `fd` is open and the borrow ends with this function.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    matches!(getsockopt(&fd, sockopt::SockType), Ok(SockType::Stream))
}

/// The executable of the current process, used when resolution had nothing to say.
pub fn current_exe() -> Result<PathBuf> {
    cfg_if! {
        if #[cfg(target_os = "linux")] {
            // Nothing beats the simplicity of /proc/self/exe on Linux.
            Ok(std::fs::read_link("/proc/self/exe")?)
        } else {
            Ok(std::env::current_exe()?)
        }
    }
}

/// Starts `executable -c <snippet>` with one end of a fresh socket pair installed at
/// [`CHANNEL_FD`]. Returns the child and the parent's end.
pub fn spawn_with_channel(executable: &Path, snippet: &str) -> Result<(Child, UnixStream)> {
    let (parent_end, child_end) = UnixStream::pair()?;
    let socket_fd = child_end.as_raw_fd();

    let mut cmd = bootstrap_command(executable, snippet);
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(socket_fd, CHANNEL_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::close(socket_fd);
            Ok(())
        });
    }
    let child = spawn(cmd)?;
    // Close our copy of the child's end so EOF propagates once the child is gone.
    drop(child_end);
    Ok((child, parent_end))
}

/// Starts `executable -c <snippet>` with a piped stdin.
pub fn spawn_with_stdin(executable: &Path, snippet: &str) -> Result<Child> {
    let mut cmd = bootstrap_command(executable, snippet);
    cmd.stdin(Stdio::piped());
    spawn(cmd)
}

fn bootstrap_command(executable: &Path, snippet: &str) -> Command {
    let mut cmd = Command::new(executable);
    cmd.arg("-c").arg(snippet);
    cmd
}

fn spawn(mut cmd: Command) -> Result<Child> {
    trace!(?cmd, "spawning bootstrap helper");
    let inner = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", cmd.get_program()))?;
    trace!("spawned bootstrap helper, pid={}", inner.id());
    Ok(Child { inner })
}

/// A bootstrap helper started by this process.
pub struct Child {
    inner: std::process::Child,
}

impl Child {
    pub fn pid(&self) -> u32 {
        self.inner.id()
    }

    pub fn stdin(&mut self) -> Option<&mut std::process::ChildStdin> {
        self.inner.stdin.as_mut()
    }

    /// Closes our end of the child's stdin, if it was piped.
    pub fn close_stdin(&mut self) {
        drop(self.inner.stdin.take());
    }

    /// Wait for the child to exit.
    ///
    /// Blocking.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        use std::os::unix::process::ExitStatusExt as _;
        let status = self.inner.wait()?;
        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Exited(code),
            (None, Some(signal)) => ExitStatus::Signaled(signal),
            (None, None) => ExitStatus::Exited(-1),
        })
    }

    /// Sends a SIGKILL signal to the child process.
    pub fn kill(&mut self) {
        trace!("sending SIGKILL to the helper, pid={}", self.inner.id());
        let _ = self.inner.kill();
    }
}
