//! Daemon configuration
//!
//! Settings come from an optional TOML file; command-line flags (and their
//! `REPLICA_*` environment variables) override whatever the file says.

use anyhow::{Context, Result};
use clap::Parser;
use replica_core::{CrdtKind, StorageKey};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Default)]
#[command(name = "replicad")]
#[command(about = "Replica daemon - hosts replicated stores over TCP")]
#[command(version)]
pub struct Args {
    /// Configuration file
    #[arg(short, long, env = "REPLICA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = "REPLICA_BIND")]
    pub bind: Option<String>,

    /// TCP port
    #[arg(long, env = "REPLICA_PORT")]
    pub port: Option<u16>,

    /// SQLite database path (in-memory only when unset)
    #[arg(long, env = "REPLICA_DB")]
    pub db: Option<PathBuf>,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, env = "REPLICA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Seconds between cleanup passes
    #[arg(long, env = "REPLICA_CLEANUP_INTERVAL")]
    pub cleanup_interval: Option<u64>,

    /// Clear swept stores once the backend grows past this many bytes
    #[arg(long, env = "REPLICA_STORAGE_BUDGET")]
    pub storage_budget: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub db: Option<PathBuf>,
    pub log_level: String,
    pub cleanup: CleanupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7380,
            db: None,
            log_level: "info".to_string(),
            cleanup: CleanupConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub storage_budget_bytes: Option<usize>,
    pub stores: Vec<SweptStore>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            storage_budget_bytes: None,
            stores: Vec::new(),
        }
    }
}

/// A store the cleanup pass keeps a handle on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweptStore {
    pub key: String,
    #[serde(default = "default_kind")]
    pub kind: CrdtKind,
}

fn default_kind() -> CrdtKind {
    CrdtKind::Set
}

impl Config {
    /// Reads a TOML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// File settings (if any) with the command line layered on top.
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, args: &Args) {
        if let Some(bind) = &args.bind {
            self.bind = bind.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(db) = &args.db {
            self.db = Some(db.clone());
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        if let Some(interval) = args.cleanup_interval {
            self.cleanup.interval_secs = interval;
        }
        if let Some(budget) = args.storage_budget {
            self.cleanup.storage_budget_bytes = Some(budget);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.cleanup.interval_secs == 0 {
            anyhow::bail!("cleanup.interval_secs must be positive");
        }
        self.swept_stores()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.bind, self.port))
    }

    pub fn swept_stores(&self) -> Result<Vec<(StorageKey, CrdtKind)>> {
        self.cleanup
            .stores
            .iter()
            .map(|store| {
                let key = StorageKey::parse(&store.key)
                    .with_context(|| format!("Invalid storage key in cleanup.stores: {}", store.key))?;
                Ok((key, store.kind))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_no_file() {
        let config = Config::resolve(&Args::default()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.socket_addr().unwrap().port(), 7380);
    }

    #[test]
    fn test_file_with_flag_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 9000
db = "/tmp/replica.db"

[cleanup]
interval_secs = 5
storage_budget_bytes = 1024

[[cleanup.stores]]
key = "reference-mode://{{ramdisk://people}}{{ramdisk://team}}"

[[cleanup.stores]]
key = "ramdisk://flags"
kind = "singleton"
"#
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            port: Some(9100),
            cleanup_interval: Some(30),
            ..Args::default()
        };
        let config = Config::resolve(&args).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 9100);
        assert_eq!(config.db, Some(PathBuf::from("/tmp/replica.db")));
        assert_eq!(config.cleanup.interval_secs, 30);
        assert_eq!(config.cleanup.storage_budget_bytes, Some(1024));

        let stores = config.swept_stores().unwrap();
        assert_eq!(
            stores,
            vec![
                (
                    StorageKey::reference_mode(StorageKey::ramdisk("people"), StorageKey::ramdisk("team")),
                    CrdtKind::Set
                ),
                (StorageKey::ramdisk("flags"), CrdtKind::Singleton),
            ]
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[cleanup.stores]]\nkey = \"nowhere\"").unwrap();
        let args = Args {
            config: Some(file.path().to_path_buf()),
            ..Args::default()
        };
        assert!(Config::resolve(&args).is_err());

        let args = Args {
            cleanup_interval: Some(0),
            ..Args::default()
        };
        assert!(Config::resolve(&args).is_err());

        let args = Args {
            config: Some(PathBuf::from("/nonexistent/replicad.toml")),
            ..Args::default()
        };
        assert!(Config::resolve(&args).is_err());
    }
}
