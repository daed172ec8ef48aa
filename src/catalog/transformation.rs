//! Transformation Catalog
//!
//! Maps `(executable name, site)` to a physical path and a staging mode.
//! Layered like the replica catalog: a nested level may add executables
//! without touching the parent's view.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};

/// `(name, site, physical path, stageable)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transformation {
    pub name: String,
    pub site: String,
    pub pfn: String,
    #[serde(default)]
    pub stageable: bool,
}

impl Transformation {
    pub fn new(
        name: impl Into<String>,
        site: impl Into<String>,
        pfn: impl Into<String>,
        stageable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            site: site.into(),
            pfn: pfn.into(),
            stageable,
        }
    }
}

/// How a job gets its executable.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Staging {
    /// Installed on the job's site
    InPlace,
    /// Copied from another site before the job runs
    StageIn { from_site: String },
}

/// Result of binding a transformation to a site.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransformation {
    pub name: String,
    /// Site the job runs on
    pub site: String,
    /// Path of the source executable (on `site` for in-place, on the
    /// staging source otherwise)
    pub pfn: String,
    pub staging: Staging,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct TransformationDocument {
    #[serde(default)]
    transformations: Vec<Transformation>,
}

/// Layered transformation catalog view.
#[derive(Debug, Clone, Default)]
pub struct TransformationCatalog {
    parent: Option<Arc<TransformationCatalog>>,
    entries: Vec<Transformation>,
}

impl TransformationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = Transformation>) -> Result<Self> {
        let mut catalog = Self::new();
        for entry in entries {
            catalog.add(entry)?;
        }
        Ok(catalog)
    }

    pub fn overlay(parent: Arc<TransformationCatalog>) -> Self {
        Self {
            parent: Some(parent),
            entries: Vec::new(),
        }
    }

    /// Registers a transformation; `(name, site)` must be unique in a layer.
    pub fn add(&mut self, entry: Transformation) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| e.name == entry.name && e.site == entry.site)
        {
            return Err(PlanError::DuplicateCatalogEntry {
                catalog: "transformation catalog",
                name: entry.name,
                site: entry.site,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// All visible entries named `name`, oldest layer first.
    pub fn lookup(&self, name: &str) -> Vec<&Transformation> {
        let mut found = match &self.parent {
            Some(parent) => parent.lookup(name),
            None => Vec::new(),
        };

        for entry in self.entries.iter().filter(|e| e.name == name) {
            match found.iter_mut().find(|f| f.site == entry.site) {
                Some(slot) => *slot = entry,
                None => found.push(entry),
            }
        }

        found
    }

    /// Binds `name` to `site`.
    ///
    /// An entry on `site` is used in place. Otherwise the first-registered
    /// stageable entry elsewhere is staged in. Returns `None` when neither
    /// exists.
    pub fn resolve(&self, name: &str, site: &str) -> Option<ResolvedTransformation> {
        let candidates = self.lookup(name);

        if let Some(local) = candidates.iter().find(|t| t.site == site) {
            return Some(ResolvedTransformation {
                name: name.to_string(),
                site: site.to_string(),
                pfn: local.pfn.clone(),
                staging: Staging::InPlace,
            });
        }

        candidates.iter().find(|t| t.stageable).map(|remote| {
            debug!(
                "Transformation '{}' will be staged from '{}' to '{}'",
                name, remote.site, site
            );
            ResolvedTransformation {
                name: name.to_string(),
                site: site.to_string(),
                pfn: remote.pfn.clone(),
                staging: Staging::StageIn {
                    from_site: remote.site.clone(),
                },
            }
        })
    }

    pub fn layer_entries(&self) -> &[Transformation] {
        &self.entries
    }

    /// Loads a root catalog from a YAML document.
    ///
    /// ```yaml
    /// transformations:
    ///   - { name: keg, site: local, pfn: /usr/bin/pegasus-keg, stageable: true }
    ///   - { name: ls, site: condorpool, pfn: /bin/ls }
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to read transformation catalog '{}': {}",
                path.display(),
                e
            ))
        })?;
        let doc: TransformationDocument = serde_yaml::from_str(&content).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to parse transformation catalog '{}': {}",
                path.display(),
                e
            ))
        })?;

        let catalog = Self::from_entries(doc.transformations)?;
        info!(
            "Loaded {} transformations from {}",
            catalog.entries.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let doc = TransformationDocument {
            transformations: self.entries.clone(),
        };
        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| PlanError::InvalidDocument(e.to_string()))?;
        fs::write(path, yaml).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to write transformation catalog '{}': {}",
                path.display(),
                e
            ))
        })?;
        info!("Transformation catalog saved to: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> TransformationCatalog {
        TransformationCatalog::from_entries(vec![
            Transformation::new("keg", "local", "/opt/bin/pegasus-keg", true),
            Transformation::new("ls", "condorpool", "/bin/ls", false),
            Transformation::new("cat", "condorpool", "/bin/cat", false),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_in_place() {
        let resolved = catalog().resolve("ls", "condorpool").unwrap();
        assert_eq!(resolved.pfn, "/bin/ls");
        assert_eq!(resolved.staging, Staging::InPlace);
    }

    #[test]
    fn test_resolve_stageable_from_other_site() {
        let resolved = catalog().resolve("keg", "condorpool").unwrap();
        assert_eq!(resolved.site, "condorpool");
        assert_eq!(
            resolved.staging,
            Staging::StageIn {
                from_site: "local".to_string()
            }
        );
    }

    #[test]
    fn test_non_stageable_elsewhere_is_unresolved() {
        assert!(catalog().resolve("ls", "local").is_none());
        assert!(catalog().resolve("missing", "local").is_none());
    }

    #[test]
    fn test_duplicate_name_site_rejected() {
        let mut tc = catalog();
        let err = tc
            .add(Transformation::new("ls", "condorpool", "/usr/bin/ls", false))
            .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateCatalogEntry { .. }));
    }

    #[test]
    fn test_overlay_adds_site() {
        let parent = Arc::new(catalog());
        let mut child = TransformationCatalog::overlay(Arc::clone(&parent));
        child
            .add(Transformation::new("ls", "local", "/usr/bin/ls", false))
            .unwrap();

        assert_eq!(child.resolve("ls", "local").unwrap().staging, Staging::InPlace);
        assert!(parent.resolve("ls", "local").is_none());
    }

    #[test]
    fn test_load_and_save() {
        use tempfile::tempdir;

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("transformations.yml");
        catalog().save(&path).unwrap();

        let loaded = TransformationCatalog::load(&path).unwrap();
        assert_eq!(loaded.layer_entries().len(), 3);
        assert!(loaded.layer_entries()[0].stageable);
        assert!(!loaded.layer_entries()[1].stageable);
    }
}
