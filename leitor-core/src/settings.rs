use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub detector: DetectorSettings,
    pub render: RenderSettings,
    pub library: LibrarySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset.
    pub api_key_env: String,
    /// Longest edge of the image sent for detection.
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    pub timeout_secs: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".into(),
            model: "gemini-2.5-flash".into(),
            api_key: None,
            api_key_env: "GEMINI_API_KEY".into(),
            max_dimension: 1024,
            jpeg_quality: 80,
            timeout_secs: 60,
        }
    }
}

impl DetectorSettings {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Rasterization scale for fixed-page documents.
    pub quality_scale: f32,
    pub thumbnail_size: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            quality_scale: 2.0,
            thumbnail_size: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LibrarySettings {
    pub path: Option<PathBuf>,
}

impl Settings {
    pub fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("net", "leitor", "leitor")
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse settings")
    }

    /// Loads settings from `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("invalid settings file {:?}", path))
    }
}
