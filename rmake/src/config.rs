//! Daemon configuration, loaded from JSON.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::{fs, io};

use rmake_proto::{DEFAULT_MAX_LENGTH, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::conn::ConnOptions;
use crate::recipe::RecipeConfig;

/// Default cap on a single uploaded file (256 MiB).
pub const DEFAULT_MAX_FILE_LEN: u64 = 256 * 1024 * 1024;

/// Daemon settings. Every field has a default, so `{}` is a valid file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct DaemonConfig {
    /// Address the daemon listens on.
    pub listen: SocketAddr,
    /// Parent directory for per-request working directories.
    /// Defaults to the OS temp directory.
    pub scratch_root: Option<PathBuf>,
    /// Maximum length of a string or byte field read from a client.
    pub max_length: usize,
    /// Maximum size of one uploaded file.
    pub max_file_len: u64,
    /// Salt appended to passwords before hashing.
    pub salt: String,
    /// User name → password.
    pub users: BTreeMap<String, String>,
    /// Recipes, in matching order.
    pub recipes: Vec<RecipeConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            scratch_root: None,
            max_length: DEFAULT_MAX_LENGTH,
            max_file_len: DEFAULT_MAX_FILE_LEN,
            salt: String::new(),
            users: BTreeMap::new(),
            recipes: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            io::Error::new(e.kind(), format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    /// Parses the configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Per-connection settings derived from this configuration.
    pub fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            max_length: self.max_length,
            max_file_len: self.max_file_len,
            scratch_root: self
                .scratch_root
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let c = DaemonConfig::from_json("{}").unwrap();
        assert_eq!(c.listen.port(), 25386);
        assert_eq!(c.max_length, 4096);
        assert!(c.recipes.is_empty());
        assert_eq!(c.conn_options().scratch_root, std::env::temp_dir());
    }

    #[test]
    fn full_file() {
        let c = DaemonConfig::from_json(
            r#"{
                "listen": "127.0.0.1:9000",
                "scratch_root": "/var/tmp/rmake",
                "max_length": 8192,
                "salt": "s",
                "users": { "alice": "pw" },
                "recipes": [{
                    "name": "echo",
                    "file_glob": "*.txt",
                    "command": ["cp {{.Filename}} out.txt"],
                    "output_glob": "out.*",
                    "max_time": 1000
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(c.listen.port(), 9000);
        assert_eq!(c.users["alice"], "pw");
        assert_eq!(c.recipes[0].name, "echo");
        let opts = c.conn_options();
        assert_eq!(opts.max_length, 8192);
        assert_eq!(opts.max_file_len, DEFAULT_MAX_FILE_LEN);
        assert_eq!(opts.scratch_root, PathBuf::from("/var/tmp/rmake"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(DaemonConfig::from_json(r#"{"listn": "0.0.0.0:1"}"#).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("nope.json"));
    }
}
