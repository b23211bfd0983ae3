use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use rapport_storage::SqliteOptions;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::allocator::{DEFAULT_CONFLICT_WARN_THRESHOLD, IdentityAllocator};

pub const SETTINGS_DIRECTORY_NAME: &str = "rapport";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "rapport.db";
pub const ENV_PREFIX: &str = "RAPPORT_";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RapportSettings {
    #[serde(default = "default_database_location")]
    pub database_location: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_enforce_request_pair_index")]
    pub enforce_request_pair_index: bool,
    #[serde(default = "default_conflict_warn_threshold")]
    pub conflict_warn_threshold: u32,
}

impl Default for RapportSettings {
    fn default() -> Self {
        Self {
            database_location: default_database_location(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enforce_request_pair_index: default_enforce_request_pair_index(),
            conflict_warn_threshold: default_conflict_warn_threshold(),
        }
    }
}

impl RapportSettings {
    pub fn normalized(mut self) -> Self {
        self.database_location = if self.database_location.trim().is_empty() {
            default_database_location()
        } else {
            self.database_location.trim().to_string()
        };
        if self.conflict_warn_threshold == 0 {
            self.conflict_warn_threshold = default_conflict_warn_threshold();
        }
        self
    }

    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }

    pub fn allocator(&self) -> IdentityAllocator {
        IdentityAllocator::default().with_conflict_warn_threshold(self.conflict_warn_threshold)
    }
}

/// Settings file plus `RAPPORT_*` overrides, swapped atomically on update.
pub struct SettingsStore {
    settings: Arc<ArcSwap<RapportSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".rapport"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<RapportSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: RapportSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> RapportSettings {
        let mut figment = Figment::from(Serialized::defaults(RapportSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<RapportSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                RapportSettings::default()
            }
        }
    }

    fn persist(&self, settings: &RapportSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_location() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_enforce_request_pair_index() -> bool {
    true
}

fn default_conflict_warn_threshold() -> u32 {
    DEFAULT_CONFLICT_WARN_THRESHOLD
}
