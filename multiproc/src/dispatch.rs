//! Recognizing a process that was started as a bootstrap helper rather than as a test run.
//!
//! Helpers are started as `<binary> -c "from multiprocessing.<module> import ..."`. The snippet
//! is never executed as code. Its module tag selects one of a fixed set of tasks compiled into
//! this binary. The snippet is only ever read from our own argv, which the harness that spawned
//! us wrote.

use std::{fmt, io};

use anyhow::{Context as _, Result};
use tracing::info;

use crate::{error::Error, forkserver, launcher::Entries, resource_tracker, spawn};

/// Every helper snippet starts with this.
pub const HELPER_NAMESPACE: &str = "from multiprocessing.";

/// A task a bootstrap helper process performs instead of running tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapTask {
    /// Serve fork requests over the socket the parent passed down.
    ForkServer,
    /// Track resources announced on stdin and clean up the leaked ones.
    ResourceTracker,
}

impl BootstrapTask {
    /// The `-c` argument that starts a helper for this task.
    pub fn snippet(self) -> &'static str {
        match self {
            BootstrapTask::ForkServer => "from multiprocessing.forkserver import main; main()",
            BootstrapTask::ResourceTracker => {
                "from multiprocessing.resource_tracker import main; main()"
            }
        }
    }

    /// Selects the task named by a helper snippet.
    pub fn parse(snippet: &str) -> Result<Self, Error> {
        let module = snippet
            .strip_prefix(HELPER_NAMESPACE)
            .and_then(|rest| rest.split(|c: char| c.is_whitespace() || c == ';').next())
            .unwrap_or_default();
        match module {
            "forkserver" => Ok(BootstrapTask::ForkServer),
            // The tracker used to be called the semaphore tracker.
            "resource_tracker" | "semaphore_tracker" => Ok(BootstrapTask::ResourceTracker),
            _ => Err(Error::UnknownBootstrap(snippet.to_string())),
        }
    }

    /// Performs the task. Returns once the task is complete.
    pub fn run(self, entries: &Entries) -> Result<()> {
        match self {
            BootstrapTask::ForkServer => {
                let stream = spawn::take_channel()
                    .context("fork server started without a control socket")?;
                forkserver::serve(stream, entries)
            }
            BootstrapTask::ResourceTracker => resource_tracker::serve(io::stdin().lock()),
        }
    }
}

impl fmt::Display for BootstrapTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapTask::ForkServer => f.write_str("fork server"),
            BootstrapTask::ResourceTracker => f.write_str("resource tracker"),
        }
    }
}

/// Returns the helper snippet if `argv` is a bootstrap request.
///
/// A request is a `-c` after the program name whose next argument starts with
/// [`HELPER_NAMESPACE`]. Only the first `-c` counts.
pub fn helper_snippet(argv: &[String]) -> Option<&str> {
    let flag = argv.iter().skip(1).position(|arg| arg == "-c")? + 1;
    let snippet = argv.get(flag + 1)?;
    snippet
        .starts_with(HELPER_NAMESPACE)
        .then_some(snippet.as_str())
}

/// If `argv` is a bootstrap request, truncates it to the program name and returns the task.
///
/// Otherwise leaves `argv` untouched and returns `Ok(None)`.
pub fn take_bootstrap_request(argv: &mut Vec<String>) -> Result<Option<BootstrapTask>, Error> {
    let Some(snippet) = helper_snippet(argv) else {
        return Ok(None);
    };
    let task = BootstrapTask::parse(snippet)?;
    // Everything else on the command line was meant for the interpreter, not for us.
    argv.truncate(1);
    Ok(Some(task))
}

/// If this process is a bootstrap helper, performs its task and exits with status 0.
///
/// The task may return without exiting the process itself, hence the explicit exit. Failures are
/// returned and are fatal to the helper. Not a helper: no-op.
pub fn if_spawn_run_and_exit(argv: &mut Vec<String>, entries: &Entries) -> Result<()> {
    let Some(task) = take_bootstrap_request(argv)? else {
        return Ok(());
    };
    info!(pid = std::process::id(), "starting {}", task);
    task.run(entries)?;
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fork_server_request() {
        let mut args = argv(&[
            "prog",
            "-c",
            "from multiprocessing.forkserver import main; main()",
        ]);
        let task = take_bootstrap_request(&mut args).unwrap();
        assert_eq!(task, Some(BootstrapTask::ForkServer));
        assert_eq!(args, argv(&["prog"]));
    }

    #[test]
    fn interpreter_flags_are_discarded() {
        let mut args = argv(&[
            "prog",
            "-B",
            "-s",
            "-c",
            "from multiprocessing.semaphore_tracker import main;main(5)",
        ]);
        let task = take_bootstrap_request(&mut args).unwrap();
        assert_eq!(task, Some(BootstrapTask::ResourceTracker));
        assert_eq!(args, argv(&["prog"]));
    }

    #[test]
    fn snippets_round_trip_through_parse() {
        for task in [BootstrapTask::ForkServer, BootstrapTask::ResourceTracker] {
            assert_eq!(BootstrapTask::parse(task.snippet()).unwrap(), task);
        }
    }

    #[test]
    fn not_a_request() {
        for args in [
            argv(&["prog"]),
            argv(&["prog", "some_filter", "--exact"]),
            argv(&["prog", "-c", "print('hello')"]),
            argv(&["prog", "-c"]),
            argv(&["-c", "from multiprocessing.forkserver import main; main()"]),
            argv(&["prog", "from multiprocessing.forkserver import main; main()"]),
        ] {
            let mut copy = args.clone();
            assert_eq!(take_bootstrap_request(&mut copy).unwrap(), None, "{:?}", args);
            assert_eq!(copy, args);
        }
    }

    #[test]
    fn only_the_first_dash_c_counts() {
        let args = argv(&[
            "prog",
            "-c",
            "import os",
            "-c",
            "from multiprocessing.forkserver import main; main()",
        ]);
        assert_eq!(helper_snippet(&args), None);
    }

    #[test]
    fn unknown_helper_module() {
        let mut args = argv(&["prog", "-c", "from multiprocessing.spawn import spawn_main"]);
        let err = take_bootstrap_request(&mut args).unwrap_err();
        assert!(matches!(err, Error::UnknownBootstrap(_)));
    }

    #[test]
    fn fork_server_without_socket_fails() {
        // Unit tests never get a control socket.
        let err = BootstrapTask::ForkServer.run(&Entries::default()).unwrap_err();
        assert!(err.to_string().contains("without a control socket"));
    }
}
