//! Daemon configuration: logging plus the brick tree to build.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// The file that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file extension names no supported format.
    #[error("unsupported config file extension: {0}")]
    UnsupportedExtension(String),

    /// TOML syntax or schema error.
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON syntax or schema error.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// A brick was configured without a name.
    #[error("a {0} brick has an empty name")]
    EmptyName(&'static str),

    /// A mirror was configured without subvolumes.
    #[error("mirror {0} needs at least one subvolume")]
    EmptyMirror(String),
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `brickfs_mirror=debug`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Text,
        }
    }
}

/// One node of the brick tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrickConfig {
    /// Forwards every operation to its child.
    Pass {
        /// Brick name.
        name: String,
        /// The wrapped brick.
        child: Box<BrickConfig>,
    },
    /// Serves a local directory.
    Posix {
        /// Brick name.
        name: String,
        /// Directory to serve; a leading `~` is the home directory.
        path: PathBuf,
    },
    /// Volatile in-memory tree.
    Memory {
        /// Brick name.
        name: String,
    },
    /// Replicates over its subvolumes in order.
    Mirror {
        /// Brick name.
        name: String,
        /// Replicas, first one preferred for reads.
        subvolumes: Vec<BrickConfig>,
    },
    /// Caches the metadata of `origin` in `cache`.
    Cache {
        /// Brick name.
        name: String,
        /// Authoritative brick.
        origin: Box<BrickConfig>,
        /// Brick holding the cached records.
        cache: Box<BrickConfig>,
    },
}

impl BrickConfig {
    /// Name of this brick.
    pub fn name(&self) -> &str {
        match self {
            BrickConfig::Pass { name, .. }
            | BrickConfig::Posix { name, .. }
            | BrickConfig::Memory { name }
            | BrickConfig::Mirror { name, .. }
            | BrickConfig::Cache { name, .. } => name,
        }
    }

    /// Type tag as written in the configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            BrickConfig::Pass { .. } => "pass",
            BrickConfig::Posix { .. } => "posix",
            BrickConfig::Memory { .. } => "memory",
            BrickConfig::Mirror { .. } => "mirror",
            BrickConfig::Cache { .. } => "cache",
        }
    }

    /// Check this node and everything below it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name().is_empty() {
            return Err(ConfigError::EmptyName(self.kind()));
        }
        match self {
            BrickConfig::Pass { child, .. } => child.validate(),
            BrickConfig::Posix { .. } | BrickConfig::Memory { .. } => Ok(()),
            BrickConfig::Mirror { name, subvolumes } => {
                if subvolumes.is_empty() {
                    return Err(ConfigError::EmptyMirror(name.clone()));
                }
                subvolumes.iter().try_for_each(BrickConfig::validate)
            }
            BrickConfig::Cache { origin, cache, .. } => {
                origin.validate()?;
                cache.validate()
            }
        }
    }

    /// Number of bricks in this subtree, this one included.
    pub fn count(&self) -> usize {
        1 + match self {
            BrickConfig::Pass { child, .. } => child.count(),
            BrickConfig::Posix { .. } | BrickConfig::Memory { .. } => 0,
            BrickConfig::Mirror { subvolumes, .. } => {
                subvolumes.iter().map(BrickConfig::count).sum()
            }
            BrickConfig::Cache { origin, cache, .. } => origin.count() + cache.count(),
        }
    }

    fn expand_paths(&mut self, home: Option<&Path>) {
        match self {
            BrickConfig::Posix { path, .. } => *path = expand_tilde(path, home),
            BrickConfig::Pass { child, .. } => child.expand_paths(home),
            BrickConfig::Memory { .. } => {}
            BrickConfig::Mirror { subvolumes, .. } => {
                for sub in subvolumes {
                    sub.expand_paths(home);
                }
            }
            BrickConfig::Cache { origin, cache, .. } => {
                origin.expand_paths(home);
                cache.expand_paths(home);
            }
        }
    }
}

/// Replace a leading `~` component with `home`. Other paths are returned as is.
pub fn expand_tilde(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
    /// The top of the brick tree.
    pub root: BrickConfig,
}

impl DaemonConfig {
    /// Load a configuration, picking the format from the file extension.
    ///
    /// The result is validated and has `~` expanded in every posix path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let mut config: DaemonConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        let home = std::env::var_os("HOME").map(PathBuf::from);
        config.root.expand_paths(home.as_deref());
        config.root.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn memory(name: &str) -> BrickConfig {
        BrickConfig::Memory {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_default_log_config() {
        let log = LogConfig::default();
        assert_eq!(log.level, "info");
        assert_eq!(log.format, LogFormat::Text);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[log]
level = "debug"
format = "json"

[root]
type = "mirror"
name = "m"

[[root.subvolumes]]
type = "posix"
name = "a"
path = "/srv/a"

[[root.subvolumes]]
type = "memory"
name = "b"
"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(
            config.root,
            BrickConfig::Mirror {
                name: "m".to_string(),
                subvolumes: vec![
                    BrickConfig::Posix {
                        name: "a".to_string(),
                        path: PathBuf::from("/srv/a"),
                    },
                    memory("b"),
                ],
            }
        );
    }

    #[test]
    fn test_from_file_json_nested() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "root": {{
                    "type": "cache",
                    "name": "c",
                    "origin": {{ "type": "pass", "name": "p", "child": {{ "type": "memory", "name": "o" }} }},
                    "cache": {{ "type": "memory", "name": "meta" }}
                }}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log, LogConfig::default());
        assert_eq!(config.root.kind(), "cache");
        assert_eq!(config.root.count(), 4);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = DaemonConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedExtension(ref e) if e == "yaml"));
    }

    #[test]
    fn test_missing_file() {
        let err = DaemonConfig::from_file(Path::new("/nonexistent/brickfs.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[root]\ntype = \"raid5\"\nname = \"r\"").unwrap();
        assert!(matches!(
            DaemonConfig::from_file(file.path()).unwrap_err(),
            ConfigError::Toml(_)
        ));
    }

    #[test]
    fn test_empty_mirror_is_invalid() {
        let config = BrickConfig::Mirror {
            name: "m".to_string(),
            subvolumes: vec![],
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::EmptyMirror(ref n) if n == "m"
        ));
    }

    #[test]
    fn test_empty_name_is_invalid_at_any_depth() {
        let config = BrickConfig::Pass {
            name: "p".to_string(),
            child: Box::new(memory("")),
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::EmptyName("memory")
        ));
    }

    #[test]
    fn test_expand_tilde() {
        let home = Path::new("/home/alice");
        assert_eq!(
            expand_tilde(Path::new("~/bricks/a"), Some(home)),
            PathBuf::from("/home/alice/bricks/a")
        );
        assert_eq!(expand_tilde(Path::new("~"), Some(home)), PathBuf::from("/home/alice"));
        assert_eq!(
            expand_tilde(Path::new("/srv/~x"), Some(home)),
            PathBuf::from("/srv/~x")
        );
        assert_eq!(expand_tilde(Path::new("~/a"), None), PathBuf::from("~/a"));
    }

    #[test]
    fn test_expand_paths_walks_the_tree() {
        let mut config = BrickConfig::Mirror {
            name: "m".to_string(),
            subvolumes: vec![BrickConfig::Posix {
                name: "a".to_string(),
                path: PathBuf::from("~/a"),
            }],
        };
        config.expand_paths(Some(Path::new("/h")));
        match config {
            BrickConfig::Mirror { subvolumes, .. } => assert_eq!(
                subvolumes[0],
                BrickConfig::Posix {
                    name: "a".to_string(),
                    path: PathBuf::from("/h/a"),
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
    }
}
