use std::io::Cursor;

use anyhow::Result;
use csv::DeserializeRecordsIntoIter;
use serde::Deserialize;

use crate::reader::{PointSource, RawPoint};
use crate::types::point::Point;

#[derive(Debug, Deserialize)]
struct Row {
	#[serde(alias = "X")]
	x: f64,
	#[serde(alias = "Y")]
	y: f64,
	#[serde(alias = "Z")]
	z: f64,
	#[serde(alias = "Intensity", default)]
	intensity: Option<f64>,
}

/// Delimited text reader: a header row naming x, y, z and optionally
/// intensity, one point per line.
pub struct CsvSource {
	rows: DeserializeRecordsIntoIter<Cursor<Vec<u8>>, Row>,
}

impl CsvSource {
	pub fn from_bytes(buf: &[u8]) -> Result<CsvSource> {
		let reader = csv::Reader::from_reader(Cursor::new(buf.to_vec()));
		Ok(CsvSource {
			rows: reader.into_deserialize(),
		})
	}
}

impl PointSource for CsvSource {
	fn next_point(&mut self) -> Result<Option<RawPoint>> {
		match self.rows.next() {
			None => Ok(None),
			Some(row) => {
				let Row { x, y, z, intensity } = row?;
				let mut raw = RawPoint::bare(Point::new(x, y, z));
				if let Some(i) = intensity {
					raw.extras.push(("Intensity".to_string(), i));
				}
				Ok(Some(raw))
			}
		}
	}
}
