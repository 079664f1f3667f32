use crate::error::ConfigurationError;
use crate::schema::Layout;
use crate::util;
use std::env;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_mongodb_uri() -> String {
    env::var("MONGODB_URI").unwrap_or("mongodb://localhost:27017".to_string())
}

fn default_mongodb_db() -> String {
    env::var("MONGODB_DB_NAME").unwrap_or("eduweb".to_string())
}

fn default_layout() -> Layout {
    env::var("EDUWEB_LAYOUT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_max_cascade_depth() -> usize {
    32
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    file_path: PathBuf,

    #[serde(default = "default_mongodb_uri")]
    pub mongodb_uri: String,
    #[serde(default = "default_mongodb_db")]
    pub mongodb_db: String,

    #[serde(default = "default_layout")]
    pub layout: Layout,

    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_max_cascade_depth")]
    pub max_cascade_depth: usize,

    /// Attempts of retryable operations, the first one included.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            file_path: config_dir().join("settings.yml"),
            mongodb_uri: default_mongodb_uri(),
            mongodb_db: default_mongodb_db(),
            layout: default_layout(),
            operation_timeout_secs: default_operation_timeout_secs(),
            max_cascade_depth: default_max_cascade_depth(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[inline]
fn config_dir() -> PathBuf {
    PathBuf::from(env::var("CONFIG_DIR").unwrap_or("./config".to_string()))
}

impl Config {
    pub fn load() -> Result<Config, ConfigurationError> {
        Config::load_from(config_dir())
    }

    /// Reads `settings.yml` or `settings.yaml` from `dir`.
    pub fn load_from(dir: impl AsRef<Path>) -> Result<Config, ConfigurationError> {
        let dir = dir.as_ref();
        let config_file =
            util::find_first_subpath(dir, &["settings.yml", "settings.yaml"], Path::exists)
                .ok_or_else(|| ConfigurationError::NotFound(dir.to_path_buf()))?;

        let file = File::open(&config_file)?;
        let mut config: Config = serde_yaml::from_reader(BufReader::new(file))?;
        config.file_path = config_file;
        config.check()?;

        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        if self.operation_timeout_secs == 0 {
            return Err(ConfigurationError::Invalid {
                field: "operation_timeout_secs",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.retry_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                field: "retry_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), ConfigurationError> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.file_path)?;
        let mut out = BufWriter::new(file);
        serde_yaml::to_writer(&mut out, self)?;
        out.flush()?;
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("settings.yaml"),
            "mongodb_db: school\nlayout: denormalized\n",
        )
        .unwrap();

        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.mongodb_db, "school");
        assert_eq!(config.layout, Layout::Denormalized);
        assert_eq!(config.max_cascade_depth, 32);
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.file_path(), dir.path().join("settings.yaml"));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            file_path: dir.path().join("settings.yml"),
            ..Config::default()
        };
        config.retry_attempts = 5;
        config.save().unwrap();

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.retry_attempts, 5);
        assert_eq!(loaded.mongodb_uri, config.mongodb_uri);
    }

    #[test]
    fn rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load_from(dir.path()),
            Err(ConfigurationError::NotFound(_))
        ));

        std::fs::write(dir.path().join("settings.yml"), "retry_attempts: 0\n").unwrap();
        assert!(matches!(
            Config::load_from(dir.path()),
            Err(ConfigurationError::Invalid {
                field: "retry_attempts",
                ..
            })
        ));

        std::fs::write(dir.path().join("settings.yml"), "layout: flat\n").unwrap();
        assert!(matches!(
            Config::load_from(dir.path()),
            Err(ConfigurationError::Yaml(_))
        ));
    }
}
