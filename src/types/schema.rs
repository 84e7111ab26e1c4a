use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::point::Point;

/// Dimension appended by the indexer to trace every point back to the
/// source file it arrived from.
pub const ORIGIN_DIM: &str = "OriginId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
	Int8,
	Uint8,
	Int16,
	Uint16,
	Int32,
	Uint32,
	Int64,
	Uint64,
	Float,
	Double,
}

impl DimType {
	pub fn size(&self) -> usize {
		match self {
			DimType::Int8 | DimType::Uint8 => 1,
			DimType::Int16 | DimType::Uint16 => 2,
			DimType::Int32 | DimType::Uint32 | DimType::Float => 4,
			DimType::Int64 | DimType::Uint64 | DimType::Double => 8,
		}
	}

	/// Accepts both the short (`i32`, `f64`) and long (`int32`, `double`)
	/// spellings used by config documents.
	pub fn parse(s: &str) -> Result<DimType> {
		match s {
			"i8" | "int8" => Ok(DimType::Int8),
			"u8" | "uint8" => Ok(DimType::Uint8),
			"i16" | "int16" => Ok(DimType::Int16),
			"u16" | "uint16" => Ok(DimType::Uint16),
			"i32" | "int32" => Ok(DimType::Int32),
			"u32" | "uint32" => Ok(DimType::Uint32),
			"i64" | "int64" => Ok(DimType::Int64),
			"u64" | "uint64" => Ok(DimType::Uint64),
			"f32" | "float" => Ok(DimType::Float),
			"f64" | "double" => Ok(DimType::Double),
			other => Err(Error::Config(format!("unknown dimension type {}", other))),
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct DimInfo {
	pub name: String,
	pub dim_type: DimType,
	pub offset: usize,
}

/// Ordered dimension list defining a fixed-width little-endian row layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
	dims: Vec<DimInfo>,
	width: usize,
	x: usize,
	y: usize,
	z: usize,
	origin: usize,
}

impl Schema {
	/// Builds a schema from named dimensions, appending `OriginId` if the
	/// caller didn't carry it already. X, Y and Z must be present as
	/// doubles.
	pub fn new(dims: Vec<(String, DimType)>) -> Result<Schema> {
		let mut list: Vec<DimInfo> = Vec::with_capacity(dims.len() + 1);
		let mut offset = 0;

		for (name, dim_type) in dims {
			if list.iter().any(|d| d.name == name) {
				return Err(Error::Config(format!("duplicate dimension {}", name)));
			}
			list.push(DimInfo {
				name,
				dim_type,
				offset,
			});
			offset += list.last().map(|d| d.dim_type.size()).unwrap_or(0);
		}

		if !list.iter().any(|d| d.name == ORIGIN_DIM) {
			list.push(DimInfo {
				name: ORIGIN_DIM.to_string(),
				dim_type: DimType::Uint64,
				offset,
			});
			offset += 8;
		}

		let mut coord = [0usize; 3];
		for (i, name) in ["X", "Y", "Z"].iter().enumerate() {
			let dim = list
				.iter()
				.find(|d| d.name == *name)
				.ok_or_else(|| Error::Config(format!("schema is missing dimension {}", name)))?;
			if dim.dim_type != DimType::Double {
				return Err(Error::Config(format!("dimension {} must be a double", name)));
			}
			coord[i] = dim.offset;
		}

		let origin = list
			.iter()
			.find(|d| d.name == ORIGIN_DIM)
			.map(|d| d.offset)
			.unwrap_or(0);

		Ok(Schema {
			dims: list,
			width: offset,
			x: coord[0],
			y: coord[1],
			z: coord[2],
			origin,
		})
	}

	pub fn dims(&self) -> &[DimInfo] {
		&self.dims
	}

	pub fn width(&self) -> usize {
		self.width
	}

	pub fn origin_offset(&self) -> usize {
		self.origin
	}

	pub fn find(&self, name: &str) -> Option<&DimInfo> {
		self.dims.iter().find(|d| d.name == name)
	}

	pub fn point_of(&self, row: &[u8]) -> Point {
		Point::new(
			LittleEndian::read_f64(&row[self.x..self.x + 8]),
			LittleEndian::read_f64(&row[self.y..self.y + 8]),
			LittleEndian::read_f64(&row[self.z..self.z + 8]),
		)
	}

	pub fn origin_of(&self, row: &[u8]) -> u64 {
		LittleEndian::read_u64(&row[self.origin..self.origin + 8])
	}

	/// Packs a typed point into a row. Extra dimensions are matched by
	/// name; dimensions the source didn't carry stay zeroed.
	pub fn pack(&self, p: &Point, extras: &[(String, f64)], origin: u64) -> Vec<u8> {
		let mut row = vec![0u8; self.width];
		LittleEndian::write_f64(&mut row[self.x..self.x + 8], p.x);
		LittleEndian::write_f64(&mut row[self.y..self.y + 8], p.y);
		LittleEndian::write_f64(&mut row[self.z..self.z + 8], p.z);
		LittleEndian::write_u64(&mut row[self.origin..self.origin + 8], origin);

		for (name, value) in extras {
			if name == "X" || name == "Y" || name == "Z" || name == ORIGIN_DIM {
				continue;
			}
			if let Some(dim) = self.find(name) {
				write_value(dim, &mut row, *value);
			}
		}

		row
	}

	/// Reads one dimension as f64, whatever its storage type.
	pub fn read_value(&self, row: &[u8], dim: &DimInfo) -> f64 {
		let o = dim.offset;
		match dim.dim_type {
			DimType::Int8 => row[o] as i8 as f64,
			DimType::Uint8 => row[o] as f64,
			DimType::Int16 => LittleEndian::read_i16(&row[o..o + 2]) as f64,
			DimType::Uint16 => LittleEndian::read_u16(&row[o..o + 2]) as f64,
			DimType::Int32 => LittleEndian::read_i32(&row[o..o + 4]) as f64,
			DimType::Uint32 => LittleEndian::read_u32(&row[o..o + 4]) as f64,
			DimType::Int64 => LittleEndian::read_i64(&row[o..o + 8]) as f64,
			DimType::Uint64 => LittleEndian::read_u64(&row[o..o + 8]) as f64,
			DimType::Float => LittleEndian::read_f32(&row[o..o + 4]) as f64,
			DimType::Double => LittleEndian::read_f64(&row[o..o + 8]),
		}
	}

	/// Rearranges a row of this schema into the target schema's layout.
	/// Dimensions are matched by name; same-typed dimensions copy raw
	/// bytes, differing types cast numerically. Target dimensions absent
	/// here stay zeroed.
	pub fn translate(&self, row: &[u8], target: &Schema) -> Vec<u8> {
		let mut out = vec![0u8; target.width];
		for dim in &target.dims {
			if let Some(src) = self.find(&dim.name) {
				if src.dim_type == dim.dim_type {
					let size = src.dim_type.size();
					out[dim.offset..dim.offset + size]
						.copy_from_slice(&row[src.offset..src.offset + size]);
				} else {
					write_value(dim, &mut out, self.read_value(row, src));
				}
			}
		}
		out
	}
}

fn write_value(dim: &DimInfo, row: &mut [u8], v: f64) {
	let o = dim.offset;
	match dim.dim_type {
		DimType::Int8 => row[o] = v as i8 as u8,
		DimType::Uint8 => row[o] = v as u8,
		DimType::Int16 => LittleEndian::write_i16(&mut row[o..o + 2], v as i16),
		DimType::Uint16 => LittleEndian::write_u16(&mut row[o..o + 2], v as u16),
		DimType::Int32 => LittleEndian::write_i32(&mut row[o..o + 4], v as i32),
		DimType::Uint32 => LittleEndian::write_u32(&mut row[o..o + 4], v as u32),
		DimType::Int64 => LittleEndian::write_i64(&mut row[o..o + 8], v as i64),
		DimType::Uint64 => LittleEndian::write_u64(&mut row[o..o + 8], v as u64),
		DimType::Float => LittleEndian::write_f32(&mut row[o..o + 4], v as f32),
		DimType::Double => LittleEndian::write_f64(&mut row[o..o + 8], v),
	}
}

pub fn xyz_dims() -> Vec<(String, DimType)> {
	vec![
		("X".to_string(), DimType::Double),
		("Y".to_string(), DimType::Double),
		("Z".to_string(), DimType::Double),
	]
}
