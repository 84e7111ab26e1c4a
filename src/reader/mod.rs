use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::types::point::Point;

pub mod bin;
pub mod csv;
pub mod pcd;

pub use self::bin::BinSource;
pub use self::csv::CsvSource;
pub use self::pcd::PcdSource;

/// A decoded input point: coordinates plus whatever named attributes the
/// source format carried.
#[derive(Clone, Debug)]
pub struct RawPoint {
	pub point: Point,
	pub extras: Vec<(String, f64)>,
}

impl RawPoint {
	pub fn bare(point: Point) -> RawPoint {
		RawPoint {
			point,
			extras: Vec::new(),
		}
	}
}

/// Streams typed points out of one source file.
pub trait PointSource {
	fn next_point(&mut self) -> Result<Option<RawPoint>>;
}

/// Opens a local file with the reader matching its extension.
pub fn open(path: &str) -> Result<Box<dyn PointSource + Send>> {
	let buf = std::fs::read(path).with_context(|| format!("reading {}", path))?;
	from_bytes(path, buf)
}

pub fn from_bytes(path: &str, buf: Vec<u8>) -> Result<Box<dyn PointSource + Send>> {
	let ext = Path::new(path)
		.extension()
		.and_then(|e| e.to_str())
		.unwrap_or("")
		.to_ascii_lowercase();

	match ext.as_str() {
		"csv" | "txt" => Ok(Box::new(CsvSource::from_bytes(&buf)?)),
		"pcd" => Ok(Box::new(PcdSource::from_bytes(&buf)?)),
		"bin" => Ok(Box::new(BinSource::from_bytes(buf))),
		other => bail!("no reader for extension {:?} ({})", other, path),
	}
}
