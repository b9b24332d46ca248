//! Provider configuration: a small `key=value` settings file with
//! environment-variable overrides.

use std::path::PathBuf;

use mosaic_llm::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL, ProviderConfig};

/// Default provider ID when none is specified.
pub const DEFAULT_PROVIDER_ID: &str = "gemini";

/// Settings that persist across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Provider identifier (e.g., "gemini")
    pub provider_id: String,
    /// API key for the provider
    pub api_key: String,
    /// Base URL for the provider API
    pub base_url: String,
    /// Default model ID to use
    pub default_model: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            api_key: String::new(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            default_model: DEFAULT_GEMINI_MODEL.to_string(),
        }
    }
}

impl ProviderSettings {
    /// Creates provider config from these settings.
    /// Returns None if the API key is empty.
    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.base_url,
            Some(self.default_model.clone()),
        ))
    }

    /// Returns true if the settings are valid (have a non-empty API key).
    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Overlays environment values onto these settings.
    ///
    /// The lookup is injected so the overlay stays testable without touching
    /// process-global state; the binary passes `std::env::var`.
    pub fn overlaid_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |value: String| {
            let value = value.trim().to_string();
            if value.is_empty() { None } else { Some(value) }
        };

        if let Some(api_key) = lookup("GEMINI_API_KEY").and_then(non_empty) {
            self.api_key = api_key;
        }
        if let Some(model) = lookup("GEMINI_MODEL").and_then(non_empty) {
            self.default_model = model;
        }
        if let Some(base_url) = lookup("GEMINI_BASE_URL").and_then(non_empty) {
            self.base_url = base_url;
        }

        self
    }
}

/// Settings persistence layer using a simple line-based format.
pub struct SettingsStore {
    settings: ProviderSettings,
    config_path: PathBuf,
}

impl SettingsStore {
    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        PathBuf::from(".mosaic").join("settings.conf")
    }

    /// Creates a new settings store with the given config path.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings,
            config_path,
        }
    }

    /// Loads settings with the default path.
    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    /// Returns current settings.
    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Updates settings and persists to disk.
    pub fn update(&mut self, settings: ProviderSettings) -> Result<(), SettingsError> {
        self.persist(&settings)?;
        self.settings = settings;
        Ok(())
    }

    /// Loads settings from disk or returns defaults.
    fn load_from_disk(path: &PathBuf) -> ProviderSettings {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::info!("settings file not found at {:?}, using defaults", path);
                return ProviderSettings::default();
            }
        };

        Self::parse_settings(&content)
    }

    /// Parses settings from content using key=value format.
    fn parse_settings(content: &str) -> ProviderSettings {
        let mut settings = ProviderSettings::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();

                match key {
                    "provider_id" => settings.provider_id = value.to_string(),
                    "api_key" => settings.api_key = value.to_string(),
                    "base_url" => settings.base_url = value.to_string(),
                    "default_model" => settings.default_model = value.to_string(),
                    _ => {}
                }
            }
        }

        settings
    }

    /// Formats settings for persistence.
    fn format_settings(settings: &ProviderSettings) -> String {
        format!(
            "# Mosaic settings\n\
             provider_id={}\n\
             api_key={}\n\
             base_url={}\n\
             default_model={}\n",
            settings.provider_id, settings.api_key, settings.base_url, settings.default_model
        )
    }

    /// Persists settings to disk.
    fn persist(&self, settings: &ProviderSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::CreateDir {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let content = Self::format_settings(settings);

        std::fs::write(&self.config_path, content).map_err(|e| SettingsError::WriteFile {
            path: self.config_path.clone(),
            source: e,
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

/// Errors that can occur during settings operations.
#[derive(Debug)]
pub enum SettingsError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::CreateDir { path, source } => {
                write!(
                    f,
                    "failed to create config directory at {:?}: {}",
                    path, source
                )
            }
            SettingsError::WriteFile { path, source } => {
                write!(f, "failed to write settings file to {:?}: {}", path, source)
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::CreateDir { source, .. } => Some(source),
            SettingsError::WriteFile { source, .. } => Some(source),
        }
    }
}
