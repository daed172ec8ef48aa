//! Replica Catalog
//!
//! Maps a logical file name to one or more `(site, physical path)` entries.
//!
//! A catalog is a stack of immutable layers. A nested level never mutates its
//! parent's view: it wraps it with [`ReplicaCatalog::overlay`] and registers
//! its own entries in the new top layer.
//!
//! # Resolution order
//!
//! [`ReplicaCatalog::lookup`] lists entries oldest layer first, in
//! registration order. An entry in a newer layer for a site that an older
//! layer already covers replaces it in place; entries for new sites follow.
//! [`ReplicaCatalog::resolve`] prefers the entry on the requested site and
//! otherwise falls back to the first entry of that list.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};

/// `(logical name, site, physical path)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaEntry {
    pub lfn: String,
    pub site: String,
    pub pfn: String,
}

impl ReplicaEntry {
    pub fn new(lfn: impl Into<String>, site: impl Into<String>, pfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            site: site.into(),
            pfn: pfn.into(),
        }
    }
}

/// On-disk form of a catalog layer.
#[derive(Serialize, Deserialize, Debug, Default)]
struct ReplicaDocument {
    #[serde(default)]
    replicas: Vec<ReplicaEntry>,
}

/// Layered replica catalog view.
#[derive(Debug, Clone, Default)]
pub struct ReplicaCatalog {
    parent: Option<Arc<ReplicaCatalog>>,
    entries: Vec<ReplicaEntry>,
}

impl ReplicaCatalog {
    /// Creates an empty root catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a root catalog, rejecting duplicate `(lfn, site)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = ReplicaEntry>) -> Result<Self> {
        let mut catalog = Self::new();
        for entry in entries {
            catalog.add(entry)?;
        }
        Ok(catalog)
    }

    /// Creates an empty layer on top of `parent`.
    pub fn overlay(parent: Arc<ReplicaCatalog>) -> Self {
        Self {
            parent: Some(parent),
            entries: Vec::new(),
        }
    }

    /// Registers an entry in this layer.
    pub fn add(&mut self, entry: ReplicaEntry) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| e.lfn == entry.lfn && e.site == entry.site)
        {
            return Err(PlanError::DuplicateCatalogEntry {
                catalog: "replica catalog",
                name: entry.lfn,
                site: entry.site,
            });
        }
        debug!("Replica {} @ {} -> {}", entry.lfn, entry.site, entry.pfn);
        self.entries.push(entry);
        Ok(())
    }

    pub fn add_replica(
        &mut self,
        lfn: impl Into<String>,
        site: impl Into<String>,
        pfn: impl Into<String>,
    ) -> Result<()> {
        self.add(ReplicaEntry::new(lfn, site, pfn))
    }

    /// All visible entries for `lfn`, in resolution order.
    pub fn lookup(&self, lfn: &str) -> Vec<&ReplicaEntry> {
        let mut found = match &self.parent {
            Some(parent) => parent.lookup(lfn),
            None => Vec::new(),
        };

        for entry in self.entries.iter().filter(|e| e.lfn == lfn) {
            match found.iter_mut().find(|f| f.site == entry.site) {
                Some(slot) => *slot = entry,
                None => found.push(entry),
            }
        }

        found
    }

    /// Picks the replica of `lfn` to use for a job on `site`.
    pub fn resolve(&self, lfn: &str, site: &str) -> Option<&ReplicaEntry> {
        let candidates = self.lookup(lfn);
        candidates
            .iter()
            .find(|e| e.site == site)
            .or_else(|| candidates.first())
            .copied()
    }

    pub fn contains(&self, lfn: &str) -> bool {
        !self.lookup(lfn).is_empty()
    }

    /// Entries registered in this layer only.
    pub fn layer_entries(&self) -> &[ReplicaEntry] {
        &self.entries
    }

    /// Number of layers, including this one.
    pub fn depth(&self) -> usize {
        1 + self.parent.as_ref().map_or(0, |p| p.depth())
    }

    /// Returns true if no layer holds any entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.parent.as_ref().map_or(true, |p| p.is_empty())
    }

    /// Loads a root catalog from a YAML document.
    ///
    /// ```yaml
    /// replicas:
    ///   - { lfn: input.txt, site: local, pfn: /data/input.txt }
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to read replica catalog '{}': {}",
                path.display(),
                e
            ))
        })?;
        let doc: ReplicaDocument = serde_yaml::from_str(&content).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to parse replica catalog '{}': {}",
                path.display(),
                e
            ))
        })?;

        let catalog = Self::from_entries(doc.replicas)?;
        info!(
            "Loaded {} replicas from {}",
            catalog.entries.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Writes this layer as a YAML document.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let doc = ReplicaDocument {
            replicas: self.entries.clone(),
        };
        let yaml = serde_yaml::to_string(&doc)
            .map_err(|e| PlanError::InvalidDocument(e.to_string()))?;
        fs::write(path, yaml).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to write replica catalog '{}': {}",
                path.display(),
                e
            ))
        })?;
        info!("Replica catalog saved to: {}", path.display());
        Ok(())
    }
}
