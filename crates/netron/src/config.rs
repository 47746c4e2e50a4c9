//! Configuration loading from `~/.netron/config.toml` with defaults.

use netron_types::config::NetronConfig;
use netron_types::{NetronError, NetronResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load node configuration, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_config(path: Option<&Path>) -> NetronConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NetronConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), uid = %config.uid, "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            NetronConfig::default()
        }
    }
}

/// Read and parse a config file, reporting any failure.
pub fn read_config(path: &Path) -> NetronResult<NetronConfig> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str::<NetronConfig>(&contents)
        .map_err(|e| NetronError::NotValid(format!("{}: {e}", path.display())))
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    netron_home().join("config.toml")
}

/// Default Netron home directory.
pub fn netron_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".netron")
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron_types::config::IpPolicyKind;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/netron.toml")));
        assert_eq!(config.default_port, netron_types::config::DEFAULT_PORT);
        assert!(!config.uid.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            uid = "hub"
            is_super = true

            [[gates]]
            address = "127.0.0.1:0"
            ip_policy = "deny"
            ip_list = ["10.0.0.0/8"]
            "#
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.uid, "hub");
        assert!(config.is_super);
        assert_eq!(config.gates.len(), 1);
        assert_eq!(config.gates[0].ip_policy, IpPolicyKind::Deny);
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "is_super = \"yes please\"").unwrap();

        let err = read_config(file.path()).unwrap_err();
        assert!(matches!(err, NetronError::NotValid(_)));

        let config = load_config(Some(file.path()));
        assert!(!config.is_super);
    }

    #[test]
    fn test_default_path() {
        let path = default_config_path();
        assert!(path.ends_with(".netron/config.toml"));
    }
}
