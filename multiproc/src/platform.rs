//! Whether the fork-server strategy can run on a given operating system.

/// The identifier `std::env::consts::OS` reports on Windows.
pub const WINDOWS: &str = "windows";

/// Returns the identifier of the operating system this binary was built for.
pub fn current() -> &'static str {
    std::env::consts::OS
}

/// Returns whether the fork-server launcher is available on `os`.
///
/// There is no fork on Windows, everything else is assumed to be POSIX.
pub fn is_supported(os: &str) -> bool {
    os != WINDOWS
}
