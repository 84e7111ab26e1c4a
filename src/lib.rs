//! Indexes massive point clouds into a hierarchical, spatially partitioned
//! on-disk quad/octree. Coarse levels hold overview samples, deeper levels
//! hold progressive detail. Builds are incremental and resumable.

pub mod config;
pub mod drivers;
pub mod error;
pub mod reader;
pub mod tree;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use tree::builder::Builder;
pub use tree::clip::Clipper;
pub use types::bounds::Bounds;
pub use types::key::{ChunkKey, Dxyz, Key, Xyz};
pub use types::point::Point;
pub use types::schema::{DimType, Schema};
pub use types::structure::Structure;
