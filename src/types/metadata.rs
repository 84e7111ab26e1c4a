use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::bounds::Bounds;
use crate::types::reproject::Reprojection;
use crate::types::schema::{DimType, Schema};
use crate::types::structure::Structure;

/// The immutable core of a build: everything that must not change between
/// a save and a resume.
#[derive(Clone, Debug)]
pub struct Metadata {
	pub schema: Schema,
	pub bounds: Bounds,
	pub bounds_cubic: Bounds,
	pub structure: Structure,
	pub dimensions: u64,
	pub reproject: Option<Reprojection>,
	pub tail_capacity: u64,
	pub tail_overflow: u64,
}

impl Metadata {
	pub fn geometry_type(&self) -> &'static str {
		if self.dimensions == 2 {
			"quadtree"
		} else {
			"octree"
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimMeta {
	pub name: String,
	pub r#type: DimType,
	pub size: usize,
}

/// The persisted metadata document, rewritten atomically on every save.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaDoc {
	pub version: String,
	pub geometry_type: String,
	pub bounds: Bounds,
	pub bounds_cubic: Bounds,
	pub structure: Structure,
	pub schema: Vec<DimMeta>,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub reproject: Option<Reprojection>,
	pub tail_capacity: u64,
	pub tail_overflow: u64,
	pub origins: Vec<String>,
	pub num_points: u64,
	pub num_tossed: u64,
	pub num_duplicates: u64,
	pub chunks: Vec<String>,
}

impl MetaDoc {
	pub fn dimensions(&self) -> Result<u64> {
		match self.geometry_type.as_str() {
			"quadtree" => Ok(2),
			"octree" => Ok(3),
			other => Err(Error::Config(format!("invalid tree type {}", other))),
		}
	}

	pub fn to_metadata(&self) -> Result<Metadata> {
		let dims = self
			.schema
			.iter()
			.map(|d| (d.name.clone(), d.r#type))
			.collect();

		Ok(Metadata {
			schema: Schema::new(dims)?,
			bounds: self.bounds.clone(),
			bounds_cubic: self.bounds_cubic.clone(),
			structure: self.structure,
			dimensions: self.dimensions()?,
			reproject: self.reproject.clone(),
			tail_capacity: self.tail_capacity,
			tail_overflow: self.tail_overflow,
		})
	}
}

pub fn schema_dims(schema: &Schema) -> Vec<DimMeta> {
	schema
		.dims()
		.iter()
		.map(|d| DimMeta {
			name: d.name.clone(),
			r#type: d.dim_type,
			size: d.dim_type.size(),
		})
		.collect()
}
