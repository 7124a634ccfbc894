use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use portpick_core::PortRange;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_PORT: u16 = 3000;
pub const DEFAULT_MAX_PORT: u16 = 65535;
pub const DEFAULT_COUNT: usize = 1;
pub const MAX_REMEMBERED_COUNT: usize = 1000;

/// Generation parameters remembered between runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub min: u16,
    pub max: u16,
    pub count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self { min: DEFAULT_MIN_PORT, max: DEFAULT_MAX_PORT, count: DEFAULT_COUNT }
    }
}

impl Settings {
    /// Build settings from user input, rejecting anything that would not load back unchanged.
    ///
    /// # Errors
    /// Returns an error when the range is invalid or `count` is outside `1..=1000`.
    pub fn checked(min: i64, max: i64, count: i64) -> Result<Self> {
        let range = PortRange::new(min, max).context("invalid port range")?;
        let count = usize::try_from(count)
            .ok()
            .filter(|count| (1..=MAX_REMEMBERED_COUNT).contains(count))
            .ok_or_else(|| anyhow!("count ({count}) MUST be within 1..={MAX_REMEMBERED_COUNT}"))?;
        Ok(Self { min: range.min(), max: range.max(), count })
    }

    /// # Errors
    /// Returns an error when `min > max` or `min` is zero.
    pub fn range(self) -> Result<PortRange> {
        PortRange::new(i64::from(self.min), i64::from(self.max)).context("invalid stored port range")
    }

    fn sanitize(raw: RawSettings) -> Self {
        let defaults = Self::default();
        let range = PortRange::new(
            raw.min.unwrap_or(i64::from(DEFAULT_MIN_PORT)),
            raw.max.unwrap_or(i64::from(DEFAULT_MAX_PORT)),
        );
        let (min, max) = match range {
            Ok(range) => (range.min(), range.max()),
            Err(err) => {
                tracing::warn!(error = %err, "stored port range invalid; using defaults");
                (defaults.min, defaults.max)
            }
        };

        let count = raw
            .count
            .and_then(|count| usize::try_from(count).ok())
            .filter(|count| (1..=MAX_REMEMBERED_COUNT).contains(count))
            .unwrap_or(DEFAULT_COUNT);

        Self { min, max, count }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    min: Option<i64>,
    max: Option<i64>,
    count: Option<i64>,
}

pub trait SettingsStore {
    /// # Errors
    /// Returns an error when persisted settings exist but cannot be read.
    fn load(&self) -> Result<Settings>;

    /// # Errors
    /// Returns an error when settings cannot be written.
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// YAML settings file.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the settings file so the next load yields defaults.
    ///
    /// # Errors
    /// Returns an error when an existing file cannot be removed.
    pub fn reset(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).with_context(|| {
                format!("failed to remove settings file {}", self.path.display())
            })?;
        }
        Ok(())
    }
}

impl SettingsStore for FileSettings {
    fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let body = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings file {}", self.path.display()))?;
        if body.trim().is_empty() {
            return Ok(Settings::default());
        }

        let raw: RawSettings = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse settings file {}", self.path.display()))?;
        Ok(Settings::sanitize(raw))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create settings directory {}", parent.display())
            })?;
        }

        let body = serde_yaml::to_string(settings).context("failed to serialize settings")?;
        fs::write(&self.path, body)
            .with_context(|| format!("failed to write settings file {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), "saved settings");
        Ok(())
    }
}
