use serde::{Deserialize, Serialize};

use crate::types::dir::Dir;
use crate::types::point::Point;

/// Axis-aligned bounding box, `min <= max` componentwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
	pub min: Point,
	pub max: Point,
}

impl Bounds {
	pub fn new(min: Point, max: Point) -> Bounds {
		Bounds { min, max }
	}

	/// From `[minX, minY, minZ, maxX, maxY, maxZ]`.
	pub fn from_slice(v: &[f64; 6]) -> Bounds {
		Bounds::new(Point::new(v[0], v[1], v[2]), Point::new(v[3], v[4], v[5]))
	}

	pub fn mid(&self) -> Point {
		(self.min + self.max) * 0.5
	}

	pub fn width(&self) -> f64 {
		self.max.x - self.min.x
	}

	pub fn contains(&self, p: &Point) -> bool {
		p.x >= self.min.x
			&& p.x <= self.max.x
			&& p.y >= self.min.y
			&& p.y <= self.max.y
			&& p.z >= self.min.z
			&& p.z <= self.max.z
	}

	pub fn intersects(&self, other: &Bounds) -> bool {
		self.min.x <= other.max.x
			&& self.max.x >= other.min.x
			&& self.min.y <= other.max.y
			&& self.max.y >= other.min.y
			&& self.min.z <= other.max.z
			&& self.max.z >= other.min.z
	}

	/// Half-sized child box in the given direction. A quadtree split
	/// (`dimensions == 2`) carries the Z extent through unchanged.
	pub fn go(&self, dir: Dir, dimensions: u64) -> Bounds {
		let mid = self.mid();
		let mut b = self.clone();

		if dir.east() {
			b.min.x = mid.x;
		} else {
			b.max.x = mid.x;
		}

		if dir.north() {
			b.min.y = mid.y;
		} else {
			b.max.y = mid.y;
		}

		if dimensions > 2 {
			if dir.up() {
				b.min.z = mid.z;
			} else {
				b.max.z = mid.z;
			}
		}

		b
	}

	/// Axis-aligned cube centred on this box's centre whose half-extent is
	/// the maximum half-extent of the box. Descent splits this cube so all
	/// levels halve symmetrically and integer keys compose cleanly.
	pub fn cubic(&self) -> Bounds {
		let mid = self.mid();
		let half = [
			(self.max.x - self.min.x) * 0.5,
			(self.max.y - self.min.y) * 0.5,
			(self.max.z - self.min.z) * 0.5,
		]
		.iter()
		.cloned()
		.fold(f64::NEG_INFINITY, f64::max);

		Bounds::new(
			Point::new(mid.x - half, mid.y - half, mid.z - half),
			Point::new(mid.x + half, mid.y + half, mid.z + half),
		)
	}
}
