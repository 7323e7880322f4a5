//! Module host configuration.

use std::path::PathBuf;

/// Configuration for a hosted module.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Module namespace, used as the settings collection name
    pub namespace: String,

    /// Directory where settings collections are persisted
    pub settings_dir: PathBuf,

    /// Root directory for the module's registered directories
    pub data_dir: PathBuf,

    /// Directory names the module registered in its manifest
    pub directories: Vec<String>,
}

impl ModuleConfig {
    /// Create a new configuration with required paths.
    pub fn new(namespace: impl Into<String>, settings_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            namespace: namespace.into(),
            settings_dir,
            data_dir,
            directories: Vec::new(),
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Register a directory.
    pub fn with_directory(mut self, name: impl Into<String>) -> Self {
        self.directories.push(name.into());
        self
    }

    /// Register multiple directories.
    pub fn with_directories(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.directories.extend(names.into_iter().map(Into::into));
        self
    }

    /// Path of a registered directory.
    pub fn directory_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Ensure directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.settings_dir)?;
        for name in &self.directories {
            std::fs::create_dir_all(self.directory_path(name))?;
        }
        Ok(())
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        // Use platform-appropriate default directories
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            namespace: "module".to_string(),
            settings_dir: config_dir.join("modules").join("settings"),
            data_dir: data_dir.join("modules"),
            directories: Vec::new(),
        }
    }
}
