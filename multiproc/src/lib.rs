//! Multi-process tests from a single binary.
//!
//! A test binary built with `harness = false` hands its `main` to a [`Harness`]. The harness
//! registers entry points that child processes can run and the tests themselves. Tests start
//! children through [`Harness::process`]; children are forked by a fork server, a copy of the same
//! binary re-executed as a bootstrap helper.
//!
//! ```no_run
//! use multiproc::Harness;
//!
//! fn worker() -> anyhow::Result<()> {
//!     Ok(())
//! }
//!
//! fn two_workers(harness: &Harness) -> anyhow::Result<()> {
//!     let mut a = harness.process("worker")?;
//!     let mut b = harness.process("worker")?;
//!     a.start()?;
//!     b.start()?;
//!     assert!(a.join()?.success());
//!     assert!(b.join()?.success());
//!     Ok(())
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     Harness::new()
//!         .entry("worker", worker)
//!         .test("two_workers", two_workers)
//!         .run()
//! }
//! ```

use std::{
    io,
    path::{Path, PathBuf, MAIN_SEPARATOR},
    process::ExitCode,
    sync::Mutex,
};

use anyhow::{anyhow, bail, Result};
use clap::Parser as _;
use tracing::{error, info};

pub mod config;
pub mod dispatch;
mod error;
pub mod forkserver;
pub mod launcher;
pub mod locate;
mod logging;
pub mod message;
mod panic;
pub mod platform;
pub mod resource_tracker;
pub mod runner;
mod spawn;

pub use config::Config;
pub use error::Error;
pub use launcher::{EntryFn, Launcher, Process};
pub use locate::{DirectoryReduction, ExeLocator};
pub use message::ExitStatus;
pub use runner::{Cli, Conclusion};

use launcher::Entries;
use logging::Kind;
use resource_tracker::ResourceTracker;
use runner::Test;

/// A test function. It gets the harness to start processes through.
pub type TestFn = fn(&Harness) -> Result<()>;

/// Startup coordination for one process: what was registered, how the process was invoked and
/// how children are launched.
pub struct Harness {
    argv: Vec<String>,
    os: &'static str,
    config: Config,
    locator: Box<dyn ExeLocator>,
    entries: Entries,
    tests: Vec<Test<Harness>>,
    initialized: bool,
    launcher: Option<Launcher>,
    tracker: Mutex<Option<ResourceTracker>>,
}

impl Harness {
    /// A harness for this process: its real arguments and configuration from the environment.
    pub fn new() -> Self {
        let argv = std::env::args_os()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        Self::with_config(argv, Config::from_env())
    }

    /// A harness for the given argument vector, `argv[0]` included.
    pub fn with_args(argv: Vec<String>) -> Self {
        Self::with_config(argv, Config::default())
    }

    pub fn with_config(argv: Vec<String>, config: Config) -> Self {
        Self {
            argv,
            os: platform::current(),
            locator: Box::new(DirectoryReduction::from_config(&config)),
            config,
            entries: Entries::default(),
            tests: Vec::new(),
            initialized: false,
            launcher: None,
            tracker: Mutex::new(None),
        }
    }

    /// Pretend to run on `os`.
    pub fn os(mut self, os: &'static str) -> Self {
        self.os = os;
        self
    }

    /// Replaces the strategy used to find the executable children are started from.
    pub fn locator(mut self, locator: impl ExeLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    /// Registers an entry point children can run.
    pub fn entry(mut self, name: &'static str, func: EntryFn) -> Self {
        self.entries.insert(name, func);
        self
    }

    /// Registers a test.
    pub fn test(mut self, name: &'static str, func: TestFn) -> Self {
        self.tests.push(Test { name, func });
        self
    }

    /// Whether [`Self::test_main`] has run.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// The argument vector, as rewritten during startup.
    pub fn args(&self) -> &[String] {
        &self.argv
    }

    /// The executable children are started from, once resolved.
    pub fn executable(&self) -> Option<&Path> {
        match self.launcher.as_ref()? {
            Launcher::ForkServer(launcher) => Some(launcher.executable()),
            Launcher::Unsupported => None,
        }
    }

    /// Creates a process running the entry point `entry`. Start it with [`Process::start`].
    ///
    /// On platforms without fork support this fails with [`Error::Skipped`], which the runner
    /// reports as an ignored test.
    pub fn process(&self, entry: &str) -> Result<Process<'_>> {
        let launcher = self.launcher.as_ref().ok_or(Error::NotInitialized)?;
        let process = launcher.process(entry, self.argv.clone())?;
        if !self.entries.contains(entry) {
            bail!("unknown entry point: {}", entry);
        }
        Ok(process)
    }

    /// Makes sure `path` is removed when the run ends, even if the test process dies.
    ///
    /// Call [`Self::untrack`] once the path was cleaned up normally.
    pub fn track(&self, path: impl AsRef<Path>) -> Result<()> {
        self.with_tracker(|tracker| tracker.register(path.as_ref()))
    }

    pub fn untrack(&self, path: impl AsRef<Path>) -> Result<()> {
        self.with_tracker(|tracker| tracker.unregister(path.as_ref()))
    }

    fn with_tracker(&self, f: impl FnOnce(&mut ResourceTracker) -> Result<()>) -> Result<()> {
        let executable = match self.launcher.as_ref().ok_or(Error::NotInitialized)? {
            Launcher::ForkServer(launcher) => launcher.executable(),
            Launcher::Unsupported => {
                return Err(Error::Skipped("no resource tracker on this platform".into()).into())
            }
        };
        let mut tracker = self
            .tracker
            .lock()
            .map_err(|_| anyhow!("resource tracker lock poisoned"))?;
        if tracker.is_none() {
            *tracker = Some(ResourceTracker::start(executable)?);
        }
        // UNWRAP: populated right above.
        f(tracker.as_mut().unwrap())
    }

    /// The function to call from `main`.
    ///
    /// Sets up the environment for children, resolves the executable they are started from and,
    /// if this process is a bootstrap helper, performs the helper's task and exits. Otherwise runs
    /// the registered tests.
    pub fn test_main(&mut self) -> Result<Conclusion> {
        self.test_main_with(&mut io::stdout().lock())
    }

    /// [`Self::test_main`] with the runner's output going to `out`.
    pub fn test_main_with(&mut self, out: &mut dyn io::Write) -> Result<Conclusion> {
        self.initialized = true;
        let kind = match dispatch::helper_snippet(&self.argv) {
            Some(_) => Kind::Child,
            None => Kind::Parent,
        };
        logging::init(kind);

        std::env::set_var(config::GPU_ALLOW_GROWTH, "true");

        if platform::is_supported(self.os) {
            let executable = self.resolve_executable()?;
            dispatch::if_spawn_run_and_exit(&mut self.argv, &self.entries)?;
            self.launcher = Some(Launcher::select(self.os, executable));
        } else {
            info!(os = self.os, "multi-process tests are not supported, they will be skipped");
            self.launcher = Some(Launcher::Unsupported);
        }

        let cli = Cli::parse_from(&self.argv);
        let conclusion = runner::run(&cli, &self.tests, &*self, out)?;
        Ok(conclusion)
    }

    /// Runs [`Self::test_main`] and turns the outcome into an exit code.
    pub fn run(mut self) -> ExitCode {
        match self.test_main() {
            Ok(conclusion) => ExitCode::from(conclusion.exit_code()),
            Err(err) => {
                error!("{:?}", err);
                ExitCode::FAILURE
            }
        }
    }

    /// Determines the executable for children and rewrites `argv[0]` if it had to be guessed.
    fn resolve_executable(&mut self) -> Result<PathBuf> {
        if let Some(executable) = &self.config.executable {
            info!(?executable, "using the configured executable");
            return Ok(executable.clone());
        }
        let argv0 = self.argv.first().cloned().unwrap_or_default();
        match self.locator.locate(&argv0)? {
            Some(found) => {
                info!(?found, "invoked through {}, re-executing the binary", argv0);
                if let Some(first) = self.argv.first_mut() {
                    *first = found.to_string_lossy().into_owned();
                }
                Ok(found)
            }
            None => default_executable(&argv0),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// The executable to use when `argv[0]` needed no resolving.
fn default_executable(argv0: &str) -> Result<PathBuf> {
    if argv0.contains(MAIN_SEPARATOR) {
        return Ok(PathBuf::from(argv0));
    }
    if !argv0.is_empty() {
        if let Ok(found) = which::which(argv0) {
            return Ok(found);
        }
    }
    spawn::current_exe()
}
