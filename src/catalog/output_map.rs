//! Output Map
//!
//! Per-level mapping of logical file name to the `(physical path, site)`
//! where that level's final outputs must land.
//!
//! The file format is one record per line:
//!
//! ```text
//! # comment
//! k1.txt /data/newoutput/k1.txt pool="local"
//! ```
//!
//! Entries are kept ordered by logical name so that building the same map
//! twice yields byte-identical output.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};
use crate::workflow::File;

/// `(logical name, physical path, site)` record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputMapEntry {
    pub lfn: String,
    pub pfn: String,
    pub site: String,
}

impl OutputMapEntry {
    pub fn new(lfn: impl Into<String>, pfn: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            pfn: pfn.into(),
            site: site.into(),
        }
    }
}

/// Where one output lands.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub pfn: String,
    pub site: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputMap {
    entries: BTreeMap<String, OutputTarget>,
}

impl OutputMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from records; a name listed twice is a conflict.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a OutputMapEntry>) -> Result<Self> {
        let mut map = Self::new();
        for record in records {
            map.insert(record.clone())?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, entry: OutputMapEntry) -> Result<()> {
        if self.entries.contains_key(&entry.lfn) {
            return Err(PlanError::OutputMapConflict { lfn: entry.lfn });
        }
        self.entries.insert(
            entry.lfn,
            OutputTarget {
                pfn: entry.pfn,
                site: entry.site,
            },
        );
        Ok(())
    }

    /// Computes a level's map from its declared outputs.
    ///
    /// Every output gets the explicit entry when there is one, else
    /// `<storage_root>/<lfn>` on `storage_site`. Explicit entries for names
    /// the level does not produce are kept.
    pub fn build<'a>(
        outputs: impl IntoIterator<Item = &'a File>,
        explicit: &OutputMap,
        storage_root: &Path,
        storage_site: &str,
    ) -> OutputMap {
        let mut map = explicit.clone();
        for file in outputs {
            map.entries
                .entry(file.lfn().to_string())
                .or_insert_with(|| {
                    let pfn = storage_root.join(file.lfn()).to_string_lossy().into_owned();
                    debug!("Default output location {} -> {} ({})", file, pfn, storage_site);
                    OutputTarget {
                        pfn,
                        site: storage_site.to_string(),
                    }
                });
        }
        map
    }

    /// Returns `overrides` layered over `base`: names in `overrides` win,
    /// `base` covers the remainder.
    pub fn layered(overrides: &OutputMap, base: &OutputMap) -> OutputMap {
        let mut map = base.clone();
        for (lfn, target) in &overrides.entries {
            map.entries.insert(lfn.clone(), target.clone());
        }
        map
    }

    pub fn get(&self, lfn: &str) -> Option<&OutputTarget> {
        self.entries.get(lfn)
    }

    pub fn contains(&self, lfn: &str) -> bool {
        self.entries.contains_key(lfn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputTarget)> {
        self.entries.iter()
    }

    pub fn records(&self) -> Vec<OutputMapEntry> {
        self.entries
            .iter()
            .map(|(lfn, t)| OutputMapEntry::new(lfn.clone(), t.pfn.clone(), t.site.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the line format. Records without a `pool` attribute land on
    /// `default_site`.
    pub fn parse(content: &str, default_site: &str) -> Result<Self> {
        let mut map = Self::new();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(lfn), Some(pfn)) = (fields.next(), fields.next()) else {
                return Err(PlanError::InvalidDocument(format!(
                    "Output map line {}: expected '<lfn> <pfn> [pool=\"site\"]'",
                    number + 1
                )));
            };

            let mut site = default_site.to_string();
            for attribute in fields {
                let Some((key, value)) = attribute.split_once('=') else {
                    return Err(PlanError::InvalidDocument(format!(
                        "Output map line {}: malformed attribute '{}'",
                        number + 1,
                        attribute
                    )));
                };
                if key == "pool" || key == "site" {
                    site = value.trim_matches('"').to_string();
                }
            }

            map.insert(OutputMapEntry::new(lfn, pfn, site))?;
        }

        Ok(map)
    }

    pub fn load(path: impl AsRef<Path>, default_site: &str) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to read output map '{}': {}",
                path.display(),
                e
            ))
        })?;
        let map = Self::parse(&content, default_site)?;
        info!("Loaded {} output mappings from {}", map.len(), path.display());
        Ok(map)
    }

    /// Renders the line format.
    pub fn to_file_format(&self) -> String {
        self.entries
            .iter()
            .map(|(lfn, t)| format!("{} {} pool=\"{}\"\n", lfn, t.pfn, t.site))
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_file_format()).map_err(|e| {
            PlanError::InvalidDocument(format!(
                "Failed to write output map '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
