/// Errors with a meaning the caller is expected to act upon.
///
/// Everything else is reported through [`anyhow::Error`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// None of the candidates derived from the invocation path is an executable file.
    #[error("cannot determine binary path from {argv0:?}")]
    ExecutableNotFound { argv0: String },
    /// The test cannot run in this environment. The runner reports it as ignored.
    #[error("skipped: {0}")]
    Skipped(String),
    /// A `-c` snippet named a helper module we have no bootstrap task for.
    #[error("unknown bootstrap snippet: {0:?}")]
    UnknownBootstrap(String),
    /// Processes were requested before `Harness::test_main` ran.
    #[error("test_main has not been called")]
    NotInitialized,
}

impl Error {
    /// Returns the skip reason if `err` wraps an [`Error::Skipped`].
    pub fn skip_reason(err: &anyhow::Error) -> Option<&str> {
        match err.downcast_ref::<Error>() {
            Some(Error::Skipped(reason)) => Some(reason),
            _ => None,
        }
    }
}
