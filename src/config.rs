use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::XferoError;
use crate::fs_lock::LockStyle;

pub const CONFIG_ENV: &str = "XFERO_CONFIG";
pub const CONFIG_DIR_ENV: &str = "XFERO_CONFIG_DIR";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SettingsConfig {
    pub transient_directory: PathBuf,
    pub outbound_directory: PathBuf,
    pub error_directory: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    pub db_location: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    /// flexi_logger spec, e.g. `"info, xfero::route_engine=debug"`
    pub loggers: String,
    pub log_directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            loggers: Self::DEFAULT_SPEC.to_owned(),
            log_directory: None,
        }
    }
}

impl LoggingConfig {
    pub const DEFAULT_SPEC: &'static str = "info";
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProcConfig {
    pub pid_file: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub scan_interval_ms: u64,
    pub control_poll_ms: u64,
    pub scheduler_tick_ms: u64,
    pub queue_multiplier: usize,
    pub default_num_threads: usize,
    pub workflow_timeout_secs: Option<u64>,
    pub lock_style: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            scan_interval_ms: 2000,
            control_poll_ms: 1000,
            scheduler_tick_ms: 1000,
            queue_multiplier: 1,
            default_num_threads: 4,
            workflow_timeout_secs: None,
            lock_style: "file".to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn control_poll(&self) -> Duration {
        Duration::from_millis(self.control_poll_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn workflow_timeout(&self) -> Option<Duration> {
        self.workflow_timeout_secs.map(Duration::from_secs)
    }

    /// Falls back to the file style for anything unrecognised; `ensure_valid`
    /// has already rejected bad values by the time this is called.
    pub fn lock_style(&self) -> LockStyle {
        LockStyle::parse(&self.lock_style).unwrap_or(LockStyle::File)
    }

    fn ensure_valid(&self) -> Result<(), XferoError> {
        if self.scan_interval_ms == 0 || self.control_poll_ms == 0 || self.scheduler_tick_ms == 0 {
            return Err(XferoError::ConfigCorrupt(
                "engine intervals must be greater than zero".into(),
            ));
        }
        if self.queue_multiplier == 0 {
            return Err(XferoError::ConfigCorrupt(
                "engine.queue_multiplier must be at least 1".into(),
            ));
        }
        if self.default_num_threads == 0 {
            return Err(XferoError::ConfigCorrupt(
                "engine.default_num_threads must be at least 1".into(),
            ));
        }
        if LockStyle::parse(&self.lock_style).is_none() {
            return Err(XferoError::ConfigCorrupt(format!(
                "engine.lock_style '{}' is invalid (expected 'file' or 'directory')",
                self.lock_style
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub settings: SettingsConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(rename = "proc")]
    pub process: ProcConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Loads the configuration named by `explicit_path` or, failing that, by
    /// `XFERO_CONFIG`. Built-in defaults are merged with the TOML file and then
    /// with `XFERO_<SECTION>__<KEY>` environment overrides.
    ///
    /// Relative paths are resolved against `XFERO_CONFIG_DIR` when set, else
    /// against the directory holding the configuration file.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, XferoError> {
        let config_path = match explicit_path {
            Some(p) => p.to_owned(),
            None => env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .ok_or_else(|| XferoError::ConfigMissing(format!("{} is not set", CONFIG_ENV)))?,
        };

        if !config_path.is_file() {
            return Err(XferoError::ConfigMissing(format!(
                "configuration file '{}' does not exist",
                config_path.display()
            )));
        }

        let figment = Figment::new()
            .merge(Serialized::default("logging", LoggingConfig::default()))
            .merge(Serialized::default("engine", EngineConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(
                Env::prefixed("XFERO_")
                    .ignore(&["config", "config_dir"])
                    .split("__"),
            );

        let mut config: Config = figment.extract()?;

        let base_dir = match env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        config.ensure_valid()?;
        config.resolve_paths(&base_dir);

        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        resolve(&mut self.settings.transient_directory);
        resolve(&mut self.settings.outbound_directory);
        resolve(&mut self.settings.error_directory);
        resolve(&mut self.database.db_location);
        resolve(&mut self.process.pid_file);
        if let Some(dir) = self.logging.log_directory.as_mut() {
            resolve(dir);
        }
    }

    fn ensure_valid(&self) -> Result<(), XferoError> {
        let dirs = [
            ("settings.transient_directory", &self.settings.transient_directory),
            ("settings.outbound_directory", &self.settings.outbound_directory),
            ("settings.error_directory", &self.settings.error_directory),
        ];
        for (key, dir) in dirs {
            if dir.as_os_str().is_empty() {
                return Err(XferoError::ConfigCorrupt(format!("{} is empty", key)));
            }
        }
        if self.settings.transient_directory == self.settings.error_directory {
            warn!("Transient and error directories are the same path; quarantined files will share a directory with work in progress");
        }
        self.engine.ensure_valid()
    }

    /// Creates the working directories if they do not exist yet and
    /// canonicalizes them in place.
    pub fn prepare_directories(&mut self) -> Result<(), XferoError> {
        for dir in [
            &mut self.settings.transient_directory,
            &mut self.settings.outbound_directory,
            &mut self.settings.error_directory,
        ] {
            std::fs::create_dir_all(&*dir)?;
            *dir = dunce::canonicalize(&*dir)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serial_test::serial;

    const BASIC: &str = r#"
        [settings]
        transient_directory = "work/transient"
        outbound_directory = "/srv/out"
        error_directory = "work/error"

        [database]
        db_location = "xfero.db"

        [logging]
        loggers = "debug"

        [proc]
        pid_file = "run/xfero.pid"
    "#;

    #[test]
    #[serial]
    fn test_load_from_env_resolves_relative_paths() {
        Jail::expect_with(|jail| {
            jail.create_file("xfero.toml", BASIC)?;
            let path = jail.directory().join("xfero.toml");
            jail.set_env(CONFIG_ENV, path.display());

            let config = Config::load(None).map_err(|e| e.to_string())?;
            let dir = jail.directory();
            assert_eq!(config.settings.transient_directory, dir.join("work/transient"));
            assert_eq!(config.settings.outbound_directory, PathBuf::from("/srv/out"));
            assert_eq!(config.database.db_location, dir.join("xfero.db"));
            assert_eq!(config.process.pid_file, dir.join("run/xfero.pid"));
            assert_eq!(config.logging.loggers, "debug");
            // engine section falls back to defaults
            assert_eq!(config.engine.scan_interval_ms, 2000);
            assert_eq!(config.engine.lock_style(), LockStyle::File);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_config_dir_overrides_base() {
        Jail::expect_with(|jail| {
            jail.create_file("xfero.toml", BASIC)?;
            let path = jail.directory().join("xfero.toml");
            jail.set_env(CONFIG_ENV, path.display());
            jail.set_env(CONFIG_DIR_ENV, "/opt/xfero");

            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.database.db_location, PathBuf::from("/opt/xfero/xfero.db"));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("xfero.toml", BASIC)?;
            let path = jail.directory().join("xfero.toml");
            jail.set_env("XFERO_ENGINE__SCAN_INTERVAL_MS", "250");

            let config = Config::load(Some(&path)).map_err(|e| e.to_string())?;
            assert_eq!(config.engine.scan_interval_ms, 250);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_missing_env_is_config_missing() {
        Jail::expect_with(|_jail| {
            std::env::remove_var(CONFIG_ENV);
            let err = Config::load(None).unwrap_err();
            assert!(matches!(err, XferoError::ConfigMissing(_)));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_missing_file_is_config_missing() {
        Jail::expect_with(|jail| {
            let path = jail.directory().join("absent.toml");
            let err = Config::load(Some(&path)).unwrap_err();
            assert!(matches!(err, XferoError::ConfigMissing(_)));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_missing_section_is_config_corrupt() {
        Jail::expect_with(|jail| {
            jail.create_file("xfero.toml", "[database]\ndb_location = \"x.db\"\n")?;
            let path = jail.directory().join("xfero.toml");
            let err = Config::load(Some(&path)).unwrap_err();
            assert!(matches!(err, XferoError::ConfigCorrupt(_)));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_bad_lock_style_is_config_corrupt() {
        Jail::expect_with(|jail| {
            let contents = format!("{}\n[engine]\nlock_style = \"flock\"\n", BASIC);
            jail.create_file("xfero.toml", &contents)?;
            let path = jail.directory().join("xfero.toml");
            let err = Config::load(Some(&path)).unwrap_err();
            assert!(matches!(err, XferoError::ConfigCorrupt(_)));
            Ok(())
        });
    }
}
