//! Finding the native binary to re-execute when the process was launched through a script.
//!
//! Build systems sometimes start a test through a wrapper script that lives next to (or a few
//! directories below) the real binary. Re-executing the script in a child does not work, so we
//! guess the binary's location from the script's path.

use std::path::{Path, PathBuf, MAIN_SEPARATOR, MAIN_SEPARATOR_STR};

use nix::unistd::{access, AccessFlags};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::Error;

/// A strategy for mapping the invocation path to the executable children should run.
pub trait ExeLocator: Send + Sync {
    /// Returns `Ok(None)` if `argv0` already names an executable and nothing needs resolving.
    fn locate(&self, argv0: &str) -> Result<Option<PathBuf>, Error>;
}

/// Guesses the binary path by dropping directories between the script and its leaf name.
///
/// For `tests/unit/sub/my_test.py` the candidates are tried in this order:
///
/// - `tests/unit/sub/my_test`, `tests/unit/sub/my_test_gpu`
/// - `tests/unit/my_test`, `tests/unit/my_test_gpu`
/// - `tests/my_test`, `tests/my_test_gpu`
///
/// The leaf name is always kept. The first candidate that is an executable file wins.
#[derive(Clone, Debug)]
pub struct DirectoryReduction {
    script_suffix: String,
    variant_suffixes: Vec<String>,
}

impl DirectoryReduction {
    pub fn new(script_suffix: impl Into<String>, variant_suffixes: Vec<String>) -> Self {
        Self {
            script_suffix: script_suffix.into(),
            variant_suffixes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.script_suffix.clone(), config.binary_variants.clone())
    }

    /// All candidates in the order they are probed.
    fn candidates(&self, stem: &str) -> Vec<String> {
        let components: Vec<&str> = stem.split(MAIN_SEPARATOR).collect();
        // UNWRAP: `split` always yields at least one item.
        let leaf = components.last().unwrap();
        let mut out = Vec::new();
        for keep in (1..components.len()).rev() {
            let mut base = components[..keep].join(MAIN_SEPARATOR_STR);
            base.push(MAIN_SEPARATOR);
            base.push_str(leaf);
            let variants: Vec<String> = self
                .variant_suffixes
                .iter()
                .map(|v| format!("{base}{v}"))
                .collect();
            out.push(base);
            out.extend(variants);
        }
        out
    }
}

impl Default for DirectoryReduction {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ExeLocator for DirectoryReduction {
    fn locate(&self, argv0: &str) -> Result<Option<PathBuf>, Error> {
        let Some(stem) = argv0.strip_suffix(self.script_suffix.as_str()) else {
            return Ok(None);
        };
        for candidate in self.candidates(stem) {
            trace!(%candidate, "probing executable candidate");
            if is_executable(Path::new(&candidate)) {
                debug!(argv0, %candidate, "resolved executable from script path");
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Err(Error::ExecutableNotFound {
            argv0: argv0.to_string(),
        })
    }
}

/// Whether `path` is a regular file the current user may execute.
pub fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt as _;

    fn touch(root: &Path, rel: &str, mode: u32) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn script(root: &Path) -> String {
        root.join("a/b/c/my_test.py").to_str().unwrap().to_string()
    }

    #[test]
    fn candidate_order() {
        let locator = DirectoryReduction::default();
        assert_eq!(
            locator.candidates("a/b/c/my_test"),
            vec![
                "a/b/c/my_test",
                "a/b/c/my_test_gpu",
                "a/b/my_test",
                "a/b/my_test_gpu",
                "a/my_test",
                "a/my_test_gpu",
            ]
        );
        assert_eq!(
            locator.candidates("/x/my_test"),
            vec!["/x/my_test", "/x/my_test_gpu", "/my_test", "/my_test_gpu"]
        );
        assert!(locator.candidates("my_test").is_empty());
    }

    #[test]
    fn most_specific_directory_first() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a/b/my_test", 0o755);
        touch(dir.path(), "a/my_test", 0o755);

        let found = DirectoryReduction::default()
            .locate(&script(dir.path()))
            .unwrap();
        assert_eq!(found, Some(dir.path().join("a/b/my_test")));
    }

    #[test]
    fn gpu_variant_at_any_level() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a/my_test_gpu", 0o755);

        let found = DirectoryReduction::default()
            .locate(&script(dir.path()))
            .unwrap();
        assert_eq!(found, Some(dir.path().join("a/my_test_gpu")));
    }

    #[test]
    fn plain_candidate_beats_variant_on_same_level() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a/b/my_test_gpu", 0o755);
        touch(dir.path(), "a/b/my_test", 0o755);

        let found = DirectoryReduction::default()
            .locate(&script(dir.path()))
            .unwrap();
        assert_eq!(found, Some(dir.path().join("a/b/my_test")));
    }

    #[test]
    fn non_executable_and_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a/b/c/my_test", 0o644);
        fs::create_dir_all(dir.path().join("a/b/my_test")).unwrap();
        touch(dir.path(), "a/my_test", 0o755);

        let found = DirectoryReduction::default()
            .locate(&script(dir.path()))
            .unwrap();
        assert_eq!(found, Some(dir.path().join("a/my_test")));
    }

    #[test]
    fn nothing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryReduction::default()
            .locate(&script(dir.path()))
            .unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound { .. }));
    }

    #[test]
    fn single_component_cannot_be_reduced() {
        let err = DirectoryReduction::default()
            .locate("my_test.py")
            .unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound { .. }));
    }

    #[test]
    fn binary_path_is_left_alone() {
        let locator = DirectoryReduction::default();
        assert_eq!(locator.locate("target/debug/deps/my_test-1a2b").unwrap(), None);
        assert_eq!(locator.locate("my_test").unwrap(), None);
    }

    #[test]
    fn custom_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a/b/my_test_tpu", 0o755);
        let locator = DirectoryReduction::new(".sh", vec!["_tpu".to_string()]);

        let argv0 = dir.path().join("a/b/c/my_test.sh");
        let found = locator.locate(argv0.to_str().unwrap()).unwrap();
        assert_eq!(found, Some(dir.path().join("a/b/my_test_tpu")));
        assert_eq!(locator.locate(&script(dir.path())).unwrap(), None);
    }
}
