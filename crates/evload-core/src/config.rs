//! Configuration loading
//!
//! Settings layer three sources, weakest first: `config.yaml` (optional),
//! an `EVLOAD_` environment overlay with nested-key delimiter `__`
//! (e.g. `EVLOAD_DATABASE__DSN`), and explicit CLI arguments applied by
//! the caller.

use std::path::Path;

use config::{Config, Environment, File};
use evload_common::EtlError;
use serde::{Deserialize, Serialize};

use crate::schema::SchemaType;

/// Configuration file looked up in the working directory by default
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "EVLOAD";

/// Resolved application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,

    /// Input URI: path, glob, or object-store location
    #[serde(default)]
    pub source_uri: Option<String>,

    /// Target representation (normalized or audit)
    #[serde(default)]
    pub schema_type: SchemaType,

    /// Destination for failed files (optional)
    #[serde(default)]
    pub quarantine_uri: Option<String>,

    /// XSD used by the optional validation pass
    #[serde(default)]
    pub xsd_schema_path: Option<String>,

    /// Worker pool size; defaults to host parallelism
    #[serde(default)]
    pub workers: Option<usize>,

    /// Per-file processing timeout (optional)
    #[serde(default)]
    pub file_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Target database URI; the scheme's base name selects the backend
    pub dsn: String,
}

impl Settings {
    /// Load settings from the configuration file and environment.
    ///
    /// An explicitly passed path must exist; the default `config.yaml` is
    /// optional. Environment variables win over the file.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, EtlError> {
        let mut builder = Config::builder();

        match explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(EtlError::config(
                        format!("configuration file '{}' does not exist", path.display()),
                        "check the --config path",
                    ));
                }
                builder = builder.add_source(File::from(path));
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    builder = builder.add_source(File::from(default));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| {
                EtlError::config(
                    e.to_string(),
                    "check config.yaml and EVLOAD_* environment variables",
                )
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<(), EtlError> {
        if self.database.dsn.is_empty() {
            return Err(EtlError::config(
                "database.dsn is empty",
                "set database.dsn in config.yaml or EVLOAD_DATABASE__DSN",
            ));
        }
        if self.workers == Some(0) {
            return Err(EtlError::config(
                "workers must be at least 1",
                "remove the setting to use the host CPU count",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Settings::load reads the process environment, so tests that touch
    // EVLOAD_* variables must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_load_from_yaml_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "database:\n  dsn: postgresql://localhost/evload\nsource_uri: /data/in\nschema_type: audit\nworkers: 2\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.database.dsn, "postgresql://localhost/evload");
        assert_eq!(settings.source_uri.as_deref(), Some("/data/in"));
        assert_eq!(settings.schema_type, SchemaType::Audit);
        assert_eq!(settings.workers, Some(2));
        assert!(settings.quarantine_uri.is_none());
    }

    #[test]
    fn test_environment_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "database:\n  dsn: postgresql://localhost/from_file\n",
        )
        .unwrap();

        std::env::set_var("EVLOAD_DATABASE__DSN", "postgresql://localhost/from_env");
        let settings = Settings::load(Some(&path)).unwrap();
        std::env::remove_var("EVLOAD_DATABASE__DSN");

        assert_eq!(settings.database.dsn, "postgresql://localhost/from_env");
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        let err = Settings::load(Some(Path::new("/no/such/config.yaml"))).unwrap_err();
        assert!(matches!(err, EtlError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_invalid_schema_type_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "database:\n  dsn: postgresql://localhost/evload\nschema_type: relational\n",
        )
        .unwrap();

        assert!(matches!(
            Settings::load(Some(&path)),
            Err(EtlError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "database:\n  dsn: postgresql://localhost/evload\nworkers: 0\n",
        )
        .unwrap();

        assert!(matches!(
            Settings::load(Some(&path)),
            Err(EtlError::ConfigInvalid { .. })
        ));
    }
}
