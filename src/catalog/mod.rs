//! Catalogs
//!
//! The three lookup tables a level is planned against.
//!
//! - [`replica`]: logical file name -> `(site, physical path)` entries
//! - [`transformation`]: `(executable, site)` -> path and staging mode
//! - [`output_map`]: logical file name -> where this level's outputs land

pub mod output_map;
pub mod replica;
pub mod transformation;

pub use output_map::{OutputMap, OutputMapEntry, OutputTarget};
pub use replica::{ReplicaCatalog, ReplicaEntry};
pub use transformation::{ResolvedTransformation, Staging, Transformation, TransformationCatalog};
