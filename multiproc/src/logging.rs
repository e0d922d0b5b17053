use std::io::{self, IsTerminal as _};

use tracing::level_filters::LevelFilter;
use tracing::{span, Level};
use tracing_subscriber::{fmt, EnvFilter};

const ENV_NAME_COMMON: &str = "MULTIPROC_ALL_LOG";
const ENV_NAME_CHILD: &str = "MULTIPROC_CHILD_LOG";
const ENV_NAME_PARENT: &str = "MULTIPROC_PARENT_LOG";

/// Which side of the process tree is logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// The test runner itself.
    Parent,
    /// A bootstrap helper or a process started through the fork server.
    Child,
}

fn istty() -> bool {
    io::stderr().is_terminal()
}

/// Creates env filter for the given kind of process.
///
/// This function tries to read the most specific environment variable first, then falls back to
/// the common one ([`ENV_NAME_COMMON`]).
fn env_filter(kind: Kind) -> EnvFilter {
    let specific_env_name = match kind {
        Kind::Child => ENV_NAME_CHILD,
        Kind::Parent => ENV_NAME_PARENT,
    };

    return try_parse_env(specific_env_name)
        .or_else(|| try_parse_env(ENV_NAME_COMMON))
        .unwrap_or_else(|| parse_directives(""));

    fn parse_directives(directives: &str) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(directives)
    }

    fn try_parse_env(var_name: &str) -> Option<EnvFilter> {
        match std::env::var(var_name) {
            Ok(env) => Some(parse_directives(&env)),
            Err(std::env::VarError::NotPresent) => None,
            Err(std::env::VarError::NotUnicode(_)) => {
                eprintln!("{} is not unicode, ignoring", var_name);
                None
            }
        }
    }
}

/// Installs the global subscriber for this process.
///
/// Returns `false` if a subscriber was already installed, which happens when the harness is
/// driven more than once in the same process, e.g. from unit tests.
pub fn init(kind: Kind) -> bool {
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_timer(fmt::time::SystemTime::default());
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter(kind))
        .with_writer(io::stderr)
        .with_ansi(istty())
        .event_format(format)
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Opens a span covering the rest of a child process's life.
///
/// Forked children inherit the fork server's subscriber, so only the span is new.
pub fn enter_child_span(entry: &str) {
    let pid = std::process::id();
    // The child exits without ever leaving the span.
    std::mem::forget(span!(Level::INFO, "child", entry, pid).entered());
}
