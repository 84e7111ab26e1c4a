use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::key::Xyz;

/// Partitions tree depths into three storage regions:
/// `[0, base_depth)` lives in one pinned in-memory block, `[base_depth,
/// flat_depth)` shares that block and its single backing file, and
/// `[flat_depth, disk_depth)` is covered by one file per chunk key. Keys at
/// `disk_depth` or deeper are out of the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
	pub base_depth: u64,
	pub flat_depth: u64,
	pub disk_depth: u64,
}

// Caps the dense slab at a few hundred MB of slots; deeper flat regions are
// a config error rather than an allocation surprise.
const MAX_FLAT_BITS: u64 = 24;

impl Structure {
	pub fn new(base_depth: u64, flat_depth: u64, disk_depth: u64) -> Result<Structure> {
		if base_depth > flat_depth || flat_depth > disk_depth {
			return Err(Error::Config(format!(
				"tree depths must satisfy base <= flat <= disk, got {}/{}/{}",
				base_depth, flat_depth, disk_depth
			)));
		}
		if disk_depth > 60 {
			return Err(Error::Config(format!(
				"disk depth {} exceeds the addressable maximum of 60",
				disk_depth
			)));
		}
		Ok(Structure {
			base_depth,
			flat_depth,
			disk_depth,
		})
	}

	pub fn validate(&self, dimensions: u64) -> Result<()> {
		if self.flat_depth > 0 && (self.flat_depth - 1) * dimensions > MAX_FLAT_BITS {
			return Err(Error::Config(format!(
				"flat depth {} is too deep for a dense {}-d slab",
				self.flat_depth, dimensions
			)));
		}
		Ok(())
	}

	pub fn in_base(&self, d: u64) -> bool {
		d < self.base_depth
	}

	pub fn in_flat(&self, d: u64) -> bool {
		d >= self.base_depth && d < self.flat_depth
	}

	pub fn in_tail(&self, d: u64) -> bool {
		d >= self.flat_depth
	}

	/// Number of tree nodes at one depth: 4^d for a quadtree, 8^d for an
	/// octree.
	pub fn nodes_at(&self, dimensions: u64, d: u64) -> u64 {
		1u64 << (dimensions * d)
	}

	/// Slot offset of the first node at depth `d` within the depth-major
	/// base+flat slab.
	pub fn slab_offset(&self, dimensions: u64, d: u64) -> u64 {
		let mut total = 0;
		for i in 0..d {
			total += self.nodes_at(dimensions, i);
		}
		total
	}

	/// Total slot count of the base+flat slab.
	pub fn slab_slots(&self, dimensions: u64) -> u64 {
		self.slab_offset(dimensions, self.flat_depth)
	}

	/// Slot index of a node within its depth: `x + y * side + z * side^2`
	/// with `side = 2^d`.
	pub fn cell_slot(&self, d: u64, p: &Xyz) -> u64 {
		let side = 1u64 << d;
		p.x + p.y * side + p.z * side * side
	}

	/// Absolute slab slot of a node address.
	pub fn slab_slot(&self, dimensions: u64, d: u64, p: &Xyz) -> u64 {
		self.slab_offset(dimensions, d) + self.cell_slot(d, p)
	}

	/// Depth owning an absolute slab slot.
	pub fn depth_of_slab_slot(&self, dimensions: u64, slot: u64) -> u64 {
		let mut d = 0;
		let mut end = self.nodes_at(dimensions, 0);
		while slot >= end {
			d += 1;
			end += self.nodes_at(dimensions, d);
		}
		d
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_ordering_enforced() {
		assert!(Structure::new(2, 4, 6).is_ok());
		assert!(Structure::new(4, 2, 6).is_err());
		assert!(Structure::new(2, 6, 4).is_err());
	}

	#[test]
	fn test_regions() {
		let s = Structure::new(2, 4, 6).unwrap();
		assert!(s.in_base(0) && s.in_base(1));
		assert!(s.in_flat(2) && s.in_flat(3));
		assert!(s.in_tail(4) && s.in_tail(5));
		assert!(!s.in_base(2) && !s.in_flat(4));
	}

	#[test]
	fn test_slab_arithmetic_oct() {
		let s = Structure::new(2, 4, 6).unwrap();
		// 1 + 8 + 64 + 512 nodes across depths 0..4.
		assert_eq!(s.slab_slots(3), 585);
		assert_eq!(s.slab_offset(3, 2), 9);
		assert_eq!(s.depth_of_slab_slot(3, 0), 0);
		assert_eq!(s.depth_of_slab_slot(3, 8), 1);
		assert_eq!(s.depth_of_slab_slot(3, 9), 2);
		assert_eq!(s.depth_of_slab_slot(3, 584), 3);
	}

	#[test]
	fn test_slab_arithmetic_quad() {
		let s = Structure::new(1, 3, 3).unwrap();
		// 1 + 4 + 16 nodes across depths 0..3.
		assert_eq!(s.slab_slots(2), 21);
		let p = Xyz { x: 3, y: 2, z: 0 };
		assert_eq!(s.slab_slot(2, 2, &p), 5 + 3 + 2 * 4);
	}

	#[test]
	fn test_flat_depth_cap() {
		let s = Structure::new(0, 12, 12).unwrap();
		assert!(s.validate(3).is_err());
		assert!(s.validate(2).is_ok());
	}
}
