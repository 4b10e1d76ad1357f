//! Inspector preferences.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-vars/settings.json
//! - Linux: ~/.config/runt-vars/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-vars\settings.json

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default row cap for matrix previews.
pub const DEFAULT_MAX_MATRIX_ROWS: usize = 100;

/// Preferences for inspection handlers and the session manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InspectorSettings {
    /// Row cap used when a matrix preview does not ask for one
    #[serde(default = "default_max_matrix_rows")]
    pub max_matrix_rows: usize,

    /// Title shown while a kernel restarts
    #[serde(default = "default_restarting_label")]
    pub restarting_label: String,

    /// Title shown for kernels without an inspection script
    #[serde(default = "default_unsupported_label")]
    pub unsupported_label: String,

    /// Request an inspection whenever a view attaches or the active session changes
    #[serde(default = "default_true")]
    pub query_on_attach: bool,
}

fn default_max_matrix_rows() -> usize {
    DEFAULT_MAX_MATRIX_ROWS
}

fn default_restarting_label() -> String {
    "Restarting kernel...".to_string()
}

fn default_unsupported_label() -> String {
    "Language currently not supported.".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for InspectorSettings {
    fn default() -> Self {
        Self {
            max_matrix_rows: default_max_matrix_rows(),
            restarting_label: default_restarting_label(),
            unsupported_label: default_unsupported_label(),
            query_on_attach: true,
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-vars")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> InspectorSettings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`, falling back to defaults on any failure.
pub fn load_settings_from(path: &Path) -> InspectorSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        InspectorSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings(settings: &InspectorSettings) -> Result<()> {
    save_settings_to(settings, &settings_path())
}

pub fn save_settings_to(settings: &InspectorSettings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
