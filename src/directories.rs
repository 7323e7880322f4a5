//! Registered module directories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use walkdir::WalkDir;

use crate::config::ModuleConfig;
use crate::error::{ModuleError, Result};

/// Resolves the directories a module registered with the host.
pub trait DirectoryService: Send + Sync {
    /// Names of the registered directories.
    fn registered_directories(&self) -> Vec<String>;

    /// Absolute path of a registered directory.
    fn resolve_path(&self, name: &str) -> Option<PathBuf>;
}

/// Directories rooted under [`ModuleConfig::data_dir`].
#[derive(Debug, Clone)]
pub struct FsDirectories {
    directories: BTreeMap<String, PathBuf>,
}

impl FsDirectories {
    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            directories: config
                .directories
                .iter()
                .map(|name| (name.clone(), config.directory_path(name)))
                .collect(),
        }
    }

    /// Register a directory at an explicit path.
    pub fn with_directory(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.directories.insert(name.into(), path.into());
        self
    }
}

impl DirectoryService for FsDirectories {
    fn registered_directories(&self) -> Vec<String> {
        self.directories.keys().cloned().collect()
    }

    fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        self.directories.get(name).cloned()
    }
}

/// Result of scanning one registered directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryScan {
    pub name: String,
    pub path: PathBuf,
    /// Files found recursively
    pub file_count: usize,
}

fn count_files(path: &Path) -> usize {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

fn scan_all(directories: &dyn DirectoryService) -> Result<Vec<DirectoryScan>> {
    let mut scans = Vec::new();
    for name in directories.registered_directories() {
        let path = directories
            .resolve_path(&name)
            .ok_or_else(|| ModuleError::DirectoryNotFound(name.clone()))?;
        let file_count = count_files(&path);

        tracing::info!(
            "'{}' can be found at '{}' and has {} total files within it.",
            name,
            path.display(),
            file_count
        );
        scans.push(DirectoryScan {
            name,
            path,
            file_count,
        });
    }
    Ok(scans)
}

/// Scan every registered directory.
///
/// With a runtime the walk runs on its blocking pool. Without one it runs
/// inline on the polling thread, so the future works on any executor.
/// A directory that does not exist yet counts as empty.
pub async fn scan_directories(
    directories: Arc<dyn DirectoryService>,
    runtime: Option<&Handle>,
) -> Result<Vec<DirectoryScan>> {
    match runtime {
        Some(runtime) => runtime
            .spawn_blocking(move || scan_all(directories.as_ref()))
            .await
            .map_err(|e| ModuleError::Io(std::io::Error::other(e)))?,
        None => {
            tracing::debug!("No runtime available, scanning directories inline");
            scan_all(directories.as_ref())
        }
    }
}
