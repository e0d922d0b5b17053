//! The fork server: a helper re-executed from the test binary that forks children on request.
//!
//! Forking from the helper instead of from the test process keeps children free of whatever
//! state (threads, locks, open files) the test accumulated. The helper only ever has a single
//! thread, which is what makes `fork` sound here.

use std::{
    os::{fd::AsRawFd as _, unix::net::UnixStream},
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
};

use anyhow::{bail, Result};
use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
    unistd::{close, fork, ForkResult, Pid},
};
use tracing::{error, info, trace, warn};

use crate::{
    dispatch::BootstrapTask,
    launcher::{self, Entries, Runnable},
    logging,
    message::{Channel, Envelope, ExitStatus, FromForkServer, ToForkServer},
    panic::panic_to_string,
    spawn,
};

/// Exit code of a child whose entry returned an error.
pub const EXIT_ERROR: i32 = 1;
/// Exit code of a child whose entry panicked.
pub const EXIT_PANIC: i32 = 2;

/// The server side. Serves requests until the harness hangs up or asks to shut down.
pub fn serve(stream: UnixStream, entries: &Entries) -> Result<()> {
    let mut chan: Channel<ToForkServer, FromForkServer> = Channel::new(stream);
    info!("fork server ready");

    while let Some(Envelope { reqno, message }) = chan.recv()? {
        let reply = match message {
            ToForkServer::Spawn(target) => match launcher::runnable(entries, target) {
                Ok(runnable) => match fork_child(&chan, &runnable) {
                    Ok(pid) => FromForkServer::Spawned(pid.as_raw()),
                    Err(err) => FromForkServer::Error(format!("fork failed: {}", err)),
                },
                Err(err) => FromForkServer::Error(err.to_string()),
            },
            ToForkServer::Wait(pid) => match poll_child(Pid::from_raw(pid)) {
                Ok(Some(status)) => FromForkServer::Exited(status),
                Ok(None) => FromForkServer::Running,
                Err(err) => FromForkServer::Error(err.to_string()),
            },
            ToForkServer::Shutdown => {
                chan.send(&Envelope {
                    reqno,
                    message: FromForkServer::Ack,
                })?;
                info!("fork server shutting down");
                return Ok(());
            }
        };
        chan.send(&Envelope {
            reqno,
            message: reply,
        })?;
    }

    info!("harness hung up, fork server exiting");
    Ok(())
}

fn fork_child<R>(chan: &Channel<ToForkServer, FromForkServer>, runnable: &R) -> Result<Pid>
where
    R: Runnable,
{
    // SAFETY: the fork server is single-threaded, so the child cannot inherit a lock held by a
    // thread that does not exist in it.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            trace!(pid = child.as_raw(), entry = runnable.name(), "forked child");
            Ok(child)
        }
        ForkResult::Child => {
            // The control socket belongs to the server. Without closing it the harness would not
            // see EOF if the server dies while children are still alive.
            let _ = close(chan.as_raw_fd());
            std::process::exit(run_child(runnable));
        }
    }
}

/// Runs the entry in a freshly forked child and returns the exit code.
fn run_child<R: Runnable>(runnable: &R) -> i32 {
    logging::enter_child_span(runnable.name());
    match catch_unwind(AssertUnwindSafe(|| runnable.run())) {
        Ok(Ok(())) => 0,
        Ok(Err(err)) => {
            error!("entry failed: {:?}", err);
            EXIT_ERROR
        }
        Err(panic_box) => {
            error!("{}", panic_to_string("entry panicked", panic_box));
            EXIT_PANIC
        }
    }
}

/// Reaps `pid` if it has exited. `None` while it is still running.
fn poll_child(pid: Pid) -> Result<Option<ExitStatus>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(ExitStatus::Exited(code))),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return Ok(Some(ExitStatus::Signaled(signal as i32)))
            }
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(errno) => bail!("waitpid({}): {}", pid, errno),
        }
    }
}

/// The harness side of a running fork server.
pub struct ForkServerClient {
    child: spawn::Child,
    chan: Channel<FromForkServer, ToForkServer>,
    next_reqno: u64,
    exit_status: Option<ExitStatus>,
}

impl ForkServerClient {
    /// Starts a fork server from `executable`.
    pub fn start(executable: &Path) -> Result<Self> {
        let (child, stream) =
            spawn::spawn_with_channel(executable, BootstrapTask::ForkServer.snippet())?;
        info!(pid = child.pid(), ?executable, "started fork server");
        Ok(Self {
            child,
            chan: Channel::new(stream),
            next_reqno: 0,
            exit_status: None,
        })
    }

    /// Sends a request and blocks until the matching response arrives.
    pub fn request(&mut self, message: ToForkServer) -> Result<FromForkServer> {
        let reqno = self.next_reqno;
        self.next_reqno += 1;
        self.chan.send(&Envelope { reqno, message })?;
        let Some(envelope) = self.chan.recv()? else {
            bail!("fork server hung up");
        };
        if envelope.reqno != reqno {
            bail!(
                "fork server answered request {} while {} was pending",
                envelope.reqno,
                reqno
            );
        }
        Ok(envelope.message)
    }

    /// Asks the server to stop and waits for the helper to exit.
    ///
    /// Returns the helper's exit status, which is `Exited(0)` for an orderly shutdown.
    pub fn shutdown(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        match self.request(ToForkServer::Shutdown)? {
            FromForkServer::Ack => {}
            other => bail!("unexpected reply to shutdown: {:?}", other),
        }
        let status = self.child.wait()?;
        self.exit_status = Some(status);
        Ok(status)
    }
}

impl Drop for ForkServerClient {
    fn drop(&mut self) {
        match self.shutdown() {
            Ok(status) if status.success() => trace!("fork server exited"),
            Ok(status) => warn!(?status, "fork server exited abnormally"),
            Err(err) => {
                warn!("fork server did not shut down: {}", err);
                self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}
