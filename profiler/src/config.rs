use std::path::Path;

use serde::Deserialize;

/// Values loadable from `--config-path`'s TOML file. Every field is
/// optional: CLI flags take priority field-by-field, and a missing or
/// unreadable file falls back to defaults rather than erroring, per the
/// "degrade, don't throw, on non-critical persistence" policy.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub port: Option<u16>,
    pub verbose: Option<bool>,
    pub cache_path: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Config {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::debug!("no config file at {}: {e}", path.display());
                return Config::default();
            }
        };
        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring malformed config file at {}: {e}", path.display());
                Config::default()
            }
        }
    }

    /// Applies CLI overrides field-by-field; a `Some` on the right always
    /// wins.
    pub fn merge_port(&self, cli: Option<u16>) -> u16 {
        cli.or(self.port).unwrap_or(0)
    }

    pub fn merge_verbose(&self, cli: bool) -> bool {
        cli || self.verbose.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/to/profiler.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "this is not valid toml {{{{").unwrap();
        let config = Config::load(file.path());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn valid_file_parses_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = 4001\nverbose = true\n").unwrap();
        let config = Config::load(file.path());
        assert_eq!(config.port, Some(4001));
        assert_eq!(config.verbose, Some(true));
    }

    #[test]
    fn cli_flags_override_config_values() {
        let config = Config {
            port: Some(4001),
            verbose: Some(false),
            cache_path: None,
        };
        assert_eq!(config.merge_port(Some(5000)), 5000);
        assert_eq!(config.merge_port(None), 4001);
        assert!(config.merge_verbose(true));
        assert!(!config.merge_verbose(false));
    }
}
