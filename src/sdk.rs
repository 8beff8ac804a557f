//! Local SDK state: installed SDKs, the active SDK and the release channel.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SDKS_DIR: &str = "SDKs";
const CURRENT_FILE: &str = "current";
const SETTINGS_FILE: &str = "settings.json";

/// Source of the release channel used by update checks.
pub trait ChannelSource: Send + Sync {
    fn channel(&self) -> String;
}

/// Channel used when there is no persist directory to read settings from.
pub struct DefaultChannel;

impl ChannelSource for DefaultChannel {
    fn channel(&self) -> String {
        String::new()
    }
}

/// Persisted tool settings.
#[derive(Debug, Default, Deserialize, Serialize)]
struct Settings {
    #[serde(default)]
    channel: String,
}

/// Manager for SDKs installed under the persist directory
pub struct SdkManager {
    root: PathBuf,
}

impl SdkManager {
    /// Create a manager rooted at the default persist directory
    pub fn new() -> Result<Self> {
        let root = Self::default_persist_dir()?;
        fs::create_dir_all(&root).context("Failed to create persist directory")?;
        Ok(Self { root })
    }

    /// Create a manager rooted at a custom directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[cfg(target_os = "macos")]
    fn default_persist_dir() -> Result<PathBuf> {
        let base = dirs::data_dir().ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(base.join("Pebble SDK"))
    }

    #[cfg(not(target_os = "macos"))]
    fn default_persist_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine home directory"))?;
        Ok(home.join(".pebble-sdk"))
    }

    pub fn persist_dir(&self) -> &Path {
        &self.root
    }

    fn sdk_dir(&self) -> PathBuf {
        self.root.join(SDKS_DIR)
    }

    /// List all locally installed SDK versions, sorted
    pub fn list_local_sdk_versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        let sdk_dir = self.sdk_dir();

        if !sdk_dir.exists() {
            return Ok(versions);
        }

        for entry in fs::read_dir(&sdk_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(version) = entry.file_name().to_str() {
                    versions.push(version.to_string());
                }
            }
        }

        versions.sort();
        Ok(versions)
    }

    /// The currently selected SDK, if one is selected and still installed
    pub fn get_current_sdk(&self) -> Option<String> {
        let contents = fs::read_to_string(self.sdk_dir().join(CURRENT_FILE)).ok()?;
        let version = contents.trim();
        if version.is_empty() || !self.sdk_dir().join(version).is_dir() {
            return None;
        }
        Some(version.to_string())
    }

    /// Select an installed SDK
    pub fn set_current_sdk(&self, version: &str) -> Result<()> {
        if !self.list_local_sdk_versions()?.iter().any(|v| v == version) {
            bail!(
                "SDK {version} is not installed.\n\
                 Installed versions: {}",
                self.list_local_sdk_versions()?.join(", ")
            );
        }
        fs::write(self.sdk_dir().join(CURRENT_FILE), version)
            .context("Failed to record the active SDK")?;
        Ok(())
    }

    /// Release channel, read fresh from disk on every call
    pub fn get_channel(&self) -> String {
        match self.load_settings() {
            Ok(settings) => settings.channel,
            Err(e) => {
                debug!("Using default channel: {:#}", e);
                String::new()
            }
        }
    }

    pub fn set_channel(&self, channel: &str) -> Result<()> {
        let mut settings = self.load_settings().unwrap_or_default();
        settings.channel = channel.to_string();
        fs::create_dir_all(&self.root).context("Failed to create persist directory")?;
        let json = serde_json::to_string_pretty(&settings)?;
        fs::write(self.root.join(SETTINGS_FILE), json).context("Failed to write settings")?;
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings> {
        let path = self.root.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(&path).context("Failed to read settings")?;
        serde_json::from_str(&contents).context("Failed to parse settings")
    }
}

impl ChannelSource for SdkManager {
    fn channel(&self) -> String {
        self.get_channel()
    }
}
