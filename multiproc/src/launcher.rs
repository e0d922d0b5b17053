//! Starting extra processes from a test.
//!
//! The launcher is selected once at startup. On platforms with `fork` every process is created by
//! a fork server, a helper re-executed from the same binary. Elsewhere asking for a process skips
//! the test.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context as _, Result};
use clap::Parser as _;
use tracing::{debug, trace};

use crate::{
    error::Error,
    forkserver::ForkServerClient,
    message::{ExitStatus, FromForkServer, Target, ToForkServer},
    platform,
    runner::Cli,
};

/// How long [`Process::join`] sleeps between polls of a running child.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The function a child process runs.
pub type EntryFn = fn() -> Result<()>;

/// The entry points a child can be asked to run, by name.
///
/// Every copy of the binary registers the same entries, which is what lets a name stand in for a
/// function across the process boundary.
#[derive(Clone, Default)]
pub struct Entries {
    map: BTreeMap<&'static str, EntryFn>,
}

impl Entries {
    pub fn insert(&mut self, name: &'static str, func: EntryFn) {
        self.map.insert(name, func);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Entry> {
        self.map.get(name).map(|&func| Entry {
            name: name.to_string(),
            func,
        })
    }
}

/// Something a child process can run.
pub trait Runnable {
    /// Used in logs.
    fn name(&self) -> &str;

    fn run(&self) -> Result<()>;
}

/// A registered entry point.
pub struct Entry {
    name: String,
    func: EntryFn,
}

impl Runnable for Entry {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        (self.func)()
    }
}

/// Parses the command line flags before running the inner runnable.
///
/// The parsed flags are thrown away; parsing only has to succeed. A child started with flags it
/// does not understand fails before running any user code.
pub struct WithFlags<R> {
    inner: R,
    args: Vec<String>,
}

impl<R: Runnable> WithFlags<R> {
    pub fn new(inner: R, args: Vec<String>) -> Self {
        Self { inner, args }
    }
}

impl<R: Runnable> Runnable for WithFlags<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn run(&self) -> Result<()> {
        let flags = Cli::try_parse_from(&self.args)
            .with_context(|| format!("parsing flags for {}", self.inner.name()))?;
        trace!(?flags, "flags parsed");
        self.inner.run()
    }
}

/// Rebuilds the runnable a parent described in `target`.
pub fn runnable(entries: &Entries, target: Target) -> Result<WithFlags<Entry>> {
    let entry = entries
        .get(&target.entry)
        .ok_or_else(|| anyhow!("unknown entry point: {}", target.entry))?;
    Ok(WithFlags::new(entry, target.args))
}

/// The process-creation strategy of this platform.
pub enum Launcher {
    ForkServer(ForkServerLauncher),
    /// No fork server on this platform. Every process request skips the test.
    Unsupported,
}

impl Launcher {
    /// Picks the strategy for `os`. `executable` is what the fork server is started from.
    pub fn select(os: &str, executable: PathBuf) -> Self {
        if platform::is_supported(os) {
            Launcher::ForkServer(ForkServerLauncher::new(executable))
        } else {
            Launcher::Unsupported
        }
    }

    /// Creates a process that will run `entry` after parsing `args` as flags.
    ///
    /// The process is not started yet.
    pub fn process(&self, entry: &str, args: Vec<String>) -> Result<Process<'_>, Error> {
        match self {
            Launcher::ForkServer(launcher) => Ok(Process {
                launcher,
                target: Target {
                    entry: entry.to_string(),
                    args,
                },
                pid: None,
                status: None,
            }),
            Launcher::Unsupported => Err(Error::Skipped(
                "multi-process tests are not supported on this platform".to_string(),
            )),
        }
    }
}

/// Creates processes through a fork server that is started on first use.
pub struct ForkServerLauncher {
    executable: PathBuf,
    server: Mutex<Option<ForkServerClient>>,
}

impl ForkServerLauncher {
    fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            server: Mutex::new(None),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Sends one request to the fork server, starting the server if needed.
    ///
    /// Requests from different processes are serialized. None of them blocks on a child, so the
    /// lock is only held for a round trip.
    fn request(&self, message: ToForkServer) -> Result<FromForkServer> {
        let mut server = self
            .server
            .lock()
            .map_err(|_| anyhow!("fork server lock poisoned"))?;
        if server.is_none() {
            *server = Some(ForkServerClient::start(&self.executable)?);
        }
        // UNWRAP: populated right above.
        let client = server.as_mut().unwrap();
        match client.request(message) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                // The connection is unusable now. The next request starts a new server.
                *server = None;
                Err(err)
            }
        }
    }
}

/// A child process running a registered entry point.
pub struct Process<'a> {
    launcher: &'a ForkServerLauncher,
    target: Target,
    pid: Option<i32>,
    status: Option<ExitStatus>,
}

impl<'a> Process<'a> {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The pid of the child, once started.
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    /// Forks the child.
    pub fn start(&mut self) -> Result<()> {
        if self.pid.is_some() {
            bail!("process {} already started", self.target.entry);
        }
        match self.launcher.request(ToForkServer::Spawn(self.target.clone()))? {
            FromForkServer::Spawned(pid) => {
                debug!(pid, entry = %self.target.entry, "process started");
                self.pid = Some(pid);
                Ok(())
            }
            FromForkServer::Error(msg) => bail!("fork server refused to spawn: {}", msg),
            other => bail!("unexpected reply to spawn: {:?}", other),
        }
    }

    /// Returns the exit status if the child has exited, `None` if it is still running.
    pub fn try_join(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let Some(pid) = self.pid else {
            bail!("process {} was never started", self.target.entry);
        };
        match self.launcher.request(ToForkServer::Wait(pid))? {
            FromForkServer::Exited(status) => {
                debug!(pid, ?status, "process exited");
                self.status = Some(status);
                Ok(Some(status))
            }
            FromForkServer::Running => Ok(None),
            FromForkServer::Error(msg) => bail!("waiting for pid {}: {}", pid, msg),
            other => bail!("unexpected reply to wait: {:?}", other),
        }
    }

    /// Blocks until the child exits. Calling it again returns the same status.
    ///
    /// Other processes can be started and joined from other threads in the meantime.
    pub fn join(&mut self) -> Result<ExitStatus> {
        loop {
            if let Some(status) = self.try_join()? {
                return Ok(status);
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }
    }
}
