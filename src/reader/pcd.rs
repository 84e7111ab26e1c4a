use anyhow::{anyhow, Result};
use pcd_rs::{DynReader, DynRecord};

use crate::reader::{PointSource, RawPoint};
use crate::types::point::Point;

/// PCD reader over the dynamic-schema decoder; only the coordinates are
/// lifted out, remaining fields stay with the source.
pub struct PcdSource {
	points: std::vec::IntoIter<RawPoint>,
}

impl PcdSource {
	pub fn from_bytes(buf: &[u8]) -> Result<PcdSource> {
		let reader = DynReader::from_bytes(buf)?;
		let records: Result<Vec<DynRecord>, _> = reader.collect();

		let mut points = Vec::new();
		for record in records? {
			let [x, y, z] = record
				.to_xyz::<f64>()
				.ok_or_else(|| anyhow!("pcd record without xyz fields"))?;
			points.push(RawPoint::bare(Point::new(x, y, z)));
		}

		Ok(PcdSource {
			points: points.into_iter(),
		})
	}
}

impl PointSource for PcdSource {
	fn next_point(&mut self) -> Result<Option<RawPoint>> {
		Ok(self.points.next())
	}
}
