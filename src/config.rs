use serde::Deserialize;

use crate::error::{Error, Result};
use crate::tree::builder::BuildOptions;
use crate::types::bounds::Bounds;
use crate::types::reproject::Reprojection;
use crate::types::schema::DimType;
use crate::types::structure::Structure;

/// The single JSON document driving a build.
#[derive(Debug, Deserialize)]
pub struct Config {
	pub input: Vec<String>,
	pub build: BuildSection,
	pub output: OutputSection,
	#[serde(default)]
	pub tuning: TuningSection,
	pub geometry: GeometrySection,
}

#[derive(Debug, Deserialize)]
pub struct BuildSection {
	pub path: String,
	pub tmp: String,
	pub tree: TreeSection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSection {
	pub base_depth: u64,
	pub flat_depth: u64,
	pub disk_depth: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSection {
	pub export: String,
	#[serde(default)]
	pub base_depth: u64,
	#[serde(default)]
	pub compress: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TuningSection {
	/// Save after every this many input files; zero disables snapshots.
	pub snapshot: u64,
	pub threads: usize,
	pub tail_capacity: u64,
	pub tail_overflow: u64,
	pub cache_high_water: usize,
	pub cache_low_water: usize,
}

impl Default for TuningSection {
	fn default() -> TuningSection {
		TuningSection {
			snapshot: 0,
			threads: 8,
			tail_capacity: 4096,
			tail_overflow: 1024,
			cache_high_water: 512,
			cache_low_water: 384,
		}
	}
}

#[derive(Debug, Deserialize)]
pub struct GeometrySection {
	pub r#type: String,
	/// `[minX, minY, minZ, maxX, maxY, maxZ]`.
	pub bbox: [f64; 6],
	#[serde(default)]
	pub reproject: Option<Reprojection>,
	pub schema: Vec<DimSection>,
}

#[derive(Debug, Deserialize)]
pub struct DimSection {
	pub name: String,
	pub r#type: String,
	pub size: usize,
}

/// `{access, hidden}` pair consumed by remote object-store drivers.
#[derive(Debug, Deserialize)]
pub struct Credentials {
	pub access: String,
	pub hidden: String,
}

impl Config {
	pub fn from_slice(bytes: &[u8]) -> Result<Config> {
		serde_json::from_slice(bytes).map_err(|e| Error::Config(e.to_string()))
	}

	pub fn from_file(path: &str) -> Result<Config> {
		let bytes = std::fs::read(path)
			.map_err(|e| Error::Config(format!("couldn't open {}: {}", path, e)))?;
		Config::from_slice(&bytes)
	}

	pub fn dimensions(&self) -> Result<u64> {
		match self.geometry.r#type.as_str() {
			"quadtree" => Ok(2),
			"octree" => Ok(3),
			other => Err(Error::Config(format!("invalid tree type {}", other))),
		}
	}

	pub fn structure(&self) -> Result<Structure> {
		Structure::new(
			self.build.tree.base_depth,
			self.build.tree.flat_depth,
			self.build.tree.disk_depth,
		)
	}

	pub fn bounds(&self) -> Bounds {
		Bounds::from_slice(&self.geometry.bbox)
	}

	pub fn dims(&self) -> Result<Vec<(String, DimType)>> {
		let mut dims = Vec::with_capacity(self.geometry.schema.len());
		for d in &self.geometry.schema {
			let dim_type = DimType::parse(&d.r#type)?;
			if d.size != dim_type.size() {
				return Err(Error::Config(format!(
					"dimension {} declares size {} but {} is {} bytes",
					d.name,
					d.size,
					d.r#type,
					dim_type.size()
				)));
			}
			dims.push((d.name.clone(), dim_type));
		}
		Ok(dims)
	}

	pub fn build_options(&self) -> Result<BuildOptions> {
		let mut options = BuildOptions::new(
			self.bounds(),
			self.dims()?,
			self.dimensions()?,
			self.structure()?,
		);
		options.threads = self.tuning.threads.max(1);
		options.reproject = self
			.geometry
			.reproject
			.clone()
			.filter(Reprojection::valid);
		options.tail_capacity = self.tuning.tail_capacity;
		options.tail_overflow = self.tuning.tail_overflow;
		options.cache_high_water = self.tuning.cache_high_water;
		options.cache_low_water = self.tuning.cache_low_water;
		Ok(options)
	}
}
