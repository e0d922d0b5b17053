//! A helper that outlives misbehaving tests and removes what they left behind.
//!
//! The harness announces paths over the helper's stdin, one command per line:
//!
//! ```text
//! REGISTER:/tmp/worker-socket
//! UNREGISTER:/tmp/worker-socket
//! ```
//!
//! When stdin closes, because the harness finished or died, every path still registered is
//! removed.

use std::{
    collections::BTreeSet,
    fs,
    io::{self, BufRead, Write as _},
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use tracing::{info, trace, warn};

use crate::{dispatch::BootstrapTask, spawn};

const REGISTER: &str = "REGISTER:";
const UNREGISTER: &str = "UNREGISTER:";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Register(PathBuf),
    Unregister(PathBuf),
}

fn parse_line(line: &str) -> Option<Command> {
    if let Some(path) = line.strip_prefix(REGISTER) {
        return (!path.is_empty()).then(|| Command::Register(PathBuf::from(path)));
    }
    if let Some(path) = line.strip_prefix(UNREGISTER) {
        return (!path.is_empty()).then(|| Command::Unregister(PathBuf::from(path)));
    }
    None
}

/// The helper side. Reads commands until EOF, then cleans up.
pub fn serve(input: impl BufRead) -> Result<()> {
    let mut registered = BTreeSet::new();
    for line in input.lines() {
        let line = line.context("reading tracker commands")?;
        if line.is_empty() {
            continue;
        }
        match parse_line(&line) {
            Some(Command::Register(path)) => {
                trace!(?path, "register");
                registered.insert(path);
            }
            Some(Command::Unregister(path)) => {
                trace!(?path, "unregister");
                if !registered.remove(&path) {
                    warn!(?path, "unregistering a path that was never registered");
                }
            }
            None => warn!("malformed tracker command: {:?}", line),
        }
    }

    if !registered.is_empty() {
        warn!(
            "{} resources leaked by the test run, cleaning up",
            registered.len()
        );
    }
    for path in registered {
        cleanup(&path);
    }
    Ok(())
}

fn cleanup(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => info!(?path, "removed leaked resource"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(?path, "failed to remove leaked resource: {}", err),
    }
}

/// The harness side of a running resource tracker.
pub struct ResourceTracker {
    child: spawn::Child,
}

impl ResourceTracker {
    pub fn start(executable: &Path) -> Result<Self> {
        let child =
            spawn::spawn_with_stdin(executable, BootstrapTask::ResourceTracker.snippet())?;
        info!(pid = child.pid(), "started resource tracker");
        Ok(Self { child })
    }

    /// Asks the tracker to remove `path` at the end of the run unless it is unregistered first.
    pub fn register(&mut self, path: &Path) -> Result<()> {
        self.send(REGISTER, path)
    }

    pub fn unregister(&mut self, path: &Path) -> Result<()> {
        self.send(UNREGISTER, path)
    }

    fn send(&mut self, command: &str, path: &Path) -> Result<()> {
        let path = path
            .to_str()
            .with_context(|| format!("{:?} is not valid unicode", path))?;
        if path.contains('\n') {
            anyhow::bail!("{:?} contains a newline", path);
        }
        let stdin = self
            .child
            .stdin()
            .context("resource tracker stdin is closed")?;
        writeln!(stdin, "{}{}", command, path)?;
        stdin.flush()?;
        Ok(())
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        self.child.close_stdin();
        match self.child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(?status, "resource tracker failed"),
            Err(err) => warn!("waiting for the resource tracker: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse_line("REGISTER:/tmp/a b"),
            Some(Command::Register(PathBuf::from("/tmp/a b")))
        );
        assert_eq!(
            parse_line("UNREGISTER:/tmp/a"),
            Some(Command::Unregister(PathBuf::from("/tmp/a")))
        );
        assert_eq!(parse_line("REGISTER:"), None);
        assert_eq!(parse_line("PROBE:0:noop"), None);
    }

    #[test]
    fn removes_only_what_is_still_registered() {
        let dir = tempfile::tempdir().unwrap();
        let leaked_file = dir.path().join("leaked.sock");
        let leaked_dir = dir.path().join("leaked-dir");
        let released = dir.path().join("released");
        fs::write(&leaked_file, b"").unwrap();
        fs::create_dir_all(leaked_dir.join("nested")).unwrap();
        fs::write(&released, b"").unwrap();
        let vanished = dir.path().join("vanished");

        let input = format!(
            "REGISTER:{}\nREGISTER:{}\nREGISTER:{}\nREGISTER:{}\ngarbage\n\nUNREGISTER:{}\n",
            leaked_file.display(),
            leaked_dir.display(),
            released.display(),
            vanished.display(),
            released.display(),
        );
        serve(Cursor::new(input)).unwrap();

        assert!(!leaked_file.exists());
        assert!(!leaked_dir.exists());
        assert!(released.exists());
    }
}
