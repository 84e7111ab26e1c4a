use std::io::Cursor;

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};

use crate::reader::{PointSource, RawPoint};
use crate::types::point::Point;

/// Raw binary reader: consecutive little-endian `f64` x/y/z triples with
/// no header. A trailing partial triple is ignored.
pub struct BinSource {
	cursor: Cursor<Vec<u8>>,
	len: u64,
}

impl BinSource {
	pub fn from_bytes(buf: Vec<u8>) -> BinSource {
		let len = buf.len() as u64;
		BinSource {
			cursor: Cursor::new(buf),
			len,
		}
	}
}

impl PointSource for BinSource {
	fn next_point(&mut self) -> Result<Option<RawPoint>> {
		if self.cursor.position() + 24 > self.len {
			return Ok(None);
		}
		let x = self.cursor.read_f64::<LittleEndian>()?;
		let y = self.cursor.read_f64::<LittleEndian>()?;
		let z = self.cursor.read_f64::<LittleEndian>()?;
		Ok(Some(RawPoint::bare(Point::new(x, y, z))))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use byteorder::WriteBytesExt;

	#[test]
	fn test_reads_triples() {
		let mut buf = Vec::new();
		for v in [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0] {
			buf.write_f64::<LittleEndian>(v).unwrap();
		}
		// Trailing garbage shorter than a triple.
		buf.extend_from_slice(&[0xab; 7]);

		let mut source = BinSource::from_bytes(buf);
		assert_eq!(
			source.next_point().unwrap().unwrap().point,
			Point::new(1.0, 2.0, 3.0)
		);
		assert_eq!(
			source.next_point().unwrap().unwrap().point,
			Point::new(4.0, 5.0, 6.0)
		);
		assert!(source.next_point().unwrap().is_none());
	}
}
