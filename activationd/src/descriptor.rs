use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use shared::types::ServiceDescriptor;

/// Supplies the current snapshot of service descriptors. Called once per
/// registry load.
pub trait DescriptorProvider: Send {
    fn list_service_descriptors(&self) -> Vec<ServiceDescriptor>;
}

impl DescriptorProvider for Vec<ServiceDescriptor> {
    fn list_service_descriptors(&self) -> Vec<ServiceDescriptor> {
        self.clone()
    }
}

/// Descriptors declared in the daemon config followed by one descriptor per
/// `*.toml` file in an optional directory, read in file-name order.
pub struct DescriptorSource {
    inline: Vec<ServiceDescriptor>,
    dir: Option<PathBuf>,
}

impl DescriptorSource {
    pub fn new(inline: Vec<ServiceDescriptor>, dir: Option<PathBuf>) -> Self {
        Self { inline, dir }
    }

    fn read_dir(dir: &Path) -> Result<Vec<ServiceDescriptor>> {
        let mut paths = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read services directory: {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut descriptors = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_file(&path) {
                Ok(desc) => descriptors.push(desc),
                Err(e) => tracing::warn!("Skipping service descriptor {}: {:#}", path.display(), e),
            }
        }
        Ok(descriptors)
    }

    fn read_file(path: &Path) -> Result<ServiceDescriptor> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

impl DescriptorProvider for DescriptorSource {
    fn list_service_descriptors(&self) -> Vec<ServiceDescriptor> {
        let mut descriptors = self.inline.clone();

        if let Some(dir) = &self.dir {
            match Self::read_dir(dir) {
                Ok(found) => descriptors.extend(found),
                Err(e) => tracing::warn!("{:#}", e),
            }
        }

        descriptors
    }
}
