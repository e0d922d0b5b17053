use std::path::PathBuf;

/// Overrides executable resolution entirely.
pub const ENV_EXECUTABLE: &str = "MULTIPROC_EXECUTABLE";
/// Suffix marking an invocation path as a launcher script rather than a binary.
pub const ENV_SCRIPT_SUFFIX: &str = "MULTIPROC_SCRIPT_SUFFIX";
/// Comma separated suffixes tried after each plain candidate, e.g. `_gpu,_tpu`.
pub const ENV_BINARY_VARIANTS: &str = "MULTIPROC_BINARY_VARIANTS";

/// The environment variable set for every process started through the harness.
pub const GPU_ALLOW_GROWTH: &str = "TF_FORCE_GPU_ALLOW_GROWTH";

const DEFAULT_SCRIPT_SUFFIX: &str = ".py";
const DEFAULT_BINARY_VARIANTS: &[&str] = &["_gpu"];

/// Process-level settings read once when the harness is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// If set, this executable is used for every child and no resolution takes place.
    pub executable: Option<PathBuf>,
    /// See [`ENV_SCRIPT_SUFFIX`].
    pub script_suffix: String,
    /// See [`ENV_BINARY_VARIANTS`].
    pub binary_variants: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executable: None,
            script_suffix: DEFAULT_SCRIPT_SUFFIX.to_string(),
            binary_variants: DEFAULT_BINARY_VARIANTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(exe) = lookup(ENV_EXECUTABLE).filter(|s| !s.is_empty()) {
            config.executable = Some(PathBuf::from(exe));
        }
        if let Some(suffix) = lookup(ENV_SCRIPT_SUFFIX).filter(|s| !s.is_empty()) {
            config.script_suffix = suffix;
        }
        if let Some(variants) = lookup(ENV_BINARY_VARIANTS) {
            config.binary_variants = variants
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.script_suffix, ".py");
        assert_eq!(config.binary_variants, vec!["_gpu".to_string()]);
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            (ENV_EXECUTABLE, "/opt/bin/my_test"),
            (ENV_SCRIPT_SUFFIX, ".sh"),
            (ENV_BINARY_VARIANTS, "_gpu, _tpu,,"),
        ]);
        assert_eq!(config.executable, Some(PathBuf::from("/opt/bin/my_test")));
        assert_eq!(config.script_suffix, ".sh");
        assert_eq!(config.binary_variants, vec!["_gpu", "_tpu"]);
    }

    #[test]
    fn empty_variants_disable_fallback() {
        let config = config_from(&[(ENV_BINARY_VARIANTS, "")]);
        assert!(config.binary_variants.is_empty());
    }
}
