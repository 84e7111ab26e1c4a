use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::bounds::Bounds;
use crate::types::dir::{get_direction, Dir};
use crate::types::point::Point;
use crate::types::structure::Structure;

/// Integer node coordinates, one bit per descent. The MSB is the root's
/// child, the LSB the deepest step taken so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xyz {
	pub x: u64,
	pub y: u64,
	pub z: u64,
}

impl Xyz {
	pub fn new(x: u64, y: u64, z: u64) -> Xyz {
		Xyz { x, y, z }
	}

	pub fn reset(&mut self) {
		self.x = 0;
		self.y = 0;
		self.z = 0;
	}
}

/// Depth plus bit coordinates: the identity of a tree node. String form is
/// `DD-X-Y-Z`, depth zero-padded below 10.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dxyz {
	pub d: u64,
	pub p: Xyz,
}

impl Dxyz {
	pub fn new(d: u64, x: u64, y: u64, z: u64) -> Dxyz {
		Dxyz {
			d,
			p: Xyz::new(x, y, z),
		}
	}
}

impl fmt::Display for Dxyz {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.d < 10 {
			write!(f, "0{}-{}-{}-{}", self.d, self.p.x, self.p.y, self.p.z)
		} else {
			write!(f, "{}-{}-{}-{}", self.d, self.p.x, self.p.y, self.p.z)
		}
	}
}

impl FromStr for Dxyz {
	type Err = Error;

	/// Accepts exactly four integers separated by non-digit runs.
	fn from_str(v: &str) -> Result<Dxyz> {
		let fields: Vec<&str> = v
			.split(|c: char| !c.is_ascii_digit())
			.filter(|s| !s.is_empty())
			.collect();

		if fields.len() != 4 {
			return Err(Error::Parse(format!("couldn't parse {} as DXYZ", v)));
		}

		let mut parts = [0u64; 4];
		for (i, field) in fields.iter().enumerate() {
			parts[i] = field
				.parse::<u64>()
				.map_err(|_| Error::Parse(format!("couldn't parse {} as DXYZ", v)))?;
		}

		Ok(Dxyz::new(parts[0], parts[1], parts[2], parts[3]))
	}
}

/// A descent cursor: the bounds of the current cell plus the bit position
/// reached so far. Descent is branch-free, a shift and an OR per axis.
#[derive(Clone, Debug)]
pub struct Key {
	pub bounds: Bounds,
	pub pos: Xyz,
	root: Bounds,
	dimensions: u64,
}

impl Key {
	/// `root` must be the scaled-cubic bounds so that every level splits
	/// symmetrically.
	pub fn new(root: Bounds, dimensions: u64) -> Key {
		Key {
			bounds: root.clone(),
			pos: Xyz::default(),
			root,
			dimensions,
		}
	}

	pub fn reset(&mut self) {
		self.bounds = self.root.clone();
		self.pos.reset();
	}

	pub fn step(&mut self, dir: Dir) {
		self.pos.x = (self.pos.x << 1) | if dir.east() { 1 } else { 0 };
		self.pos.y = (self.pos.y << 1) | if dir.north() { 1 } else { 0 };
		self.pos.z = (self.pos.z << 1) | if dir.up() { 1 } else { 0 };
		self.bounds = self.bounds.go(dir, self.dimensions);
	}

	pub fn step_point(&mut self, p: &Point) -> Dir {
		let mut dir = get_direction(&self.bounds.mid(), p);
		if self.dimensions == 2 {
			dir = dir.flatten();
		}
		self.step(dir);
		dir
	}
}

/// Decodes the cell bounds of a node address by replaying its bits against
/// the cubic root.
pub fn bounds_of(key: &Dxyz, root: &Bounds, dimensions: u64) -> Bounds {
	let mut b = root.clone();
	for i in (0..key.d).rev() {
		let dir = Dir::new(
			(key.p.x >> i) & 1 == 1,
			(key.p.y >> i) & 1 == 1,
			(key.p.z >> i) & 1 == 1,
		);
		b = b.go(dir, dimensions);
	}
	b
}

/// Wraps a `Key` with a depth counter and the storage-region boundaries.
/// The wrapped key advances only while node keys still identify chunks;
/// once in the per-file tail the chunk is already identified and deeper
/// steps only count depth.
#[derive(Clone, Debug)]
pub struct ChunkKey {
	pub k: Key,
	pub d: u64,
	s: Structure,
}

impl ChunkKey {
	pub fn new(root: Bounds, dimensions: u64, s: Structure) -> ChunkKey {
		ChunkKey {
			k: Key::new(root, dimensions),
			d: 0,
			s,
		}
	}

	pub fn reset(&mut self) {
		self.d = 0;
		self.k.reset();
	}

	pub fn in_base(&self) -> bool {
		self.s.in_base(self.d)
	}

	pub fn in_body(&self) -> bool {
		self.s.in_flat(self.d)
	}

	pub fn in_tail(&self) -> bool {
		self.s.in_tail(self.d)
	}

	pub fn step(&mut self, dir: Dir) {
		if !self.in_tail() {
			self.k.step(dir);
		}
		self.d += 1;
	}

	pub fn step_point(&mut self, p: &Point) {
		if !self.in_tail() {
			self.k.step_point(p);
		}
		self.d += 1;
	}

	pub fn get(&self) -> Dxyz {
		Dxyz {
			d: self.d,
			p: self.k.pos,
		}
	}

	pub fn bounds(&self) -> &Bounds {
		&self.k.bounds
	}

	pub fn depth(&self) -> u64 {
		self.d
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::prelude::*;

	#[test]
	fn test_dxyz_string_roundtrip() {
		for s in ["00-0-0-0", "05-3-1-2", "10-1023-511-0", "42-1-2-3"] {
			let key: Dxyz = s.parse().unwrap();
			assert_eq!(key.to_string(), s);
		}
	}

	#[test]
	fn test_dxyz_depth_padding() {
		assert_eq!(Dxyz::new(3, 1, 2, 3).to_string(), "03-1-2-3");
		assert_eq!(Dxyz::new(12, 1, 2, 3).to_string(), "12-1-2-3");
	}

	#[test]
	fn test_dxyz_parse_rejects_malformed() {
		assert!("1-2-3".parse::<Dxyz>().is_err());
		assert!("1-2-3-4-5".parse::<Dxyz>().is_err());
		assert!("".parse::<Dxyz>().is_err());
		assert!("a-b-c-d".parse::<Dxyz>().is_err());
	}

	#[test]
	fn test_step_composes_bits() {
		let root = Bounds::from_slice(&[0.0, 0.0, 0.0, 8.0, 8.0, 8.0]);
		let mut key = Key::new(root, 3);
		key.step(Dir::new(true, false, true));
		key.step(Dir::new(false, true, true));
		assert_eq!(key.pos, Xyz::new(0b10, 0b01, 0b11));
	}

	#[test]
	fn test_descent_and_bit_decode_agree() {
		// Stepping bounds by a random direction sequence must land on the
		// same cell that decoding the composed bits yields.
		let root = Bounds::from_slice(&[-4.0, 0.0, 2.0, 12.0, 16.0, 18.0]).cubic();
		let mut rng = rand::thread_rng();

		for _ in 0..50 {
			let mut key = Key::new(root.clone(), 3);
			let depth = rng.gen_range(1..8);
			for _ in 0..depth {
				let dir = Dir::new(rng.gen(), rng.gen(), rng.gen());
				key.step(dir);
			}
			let decoded = bounds_of(
				&Dxyz {
					d: depth,
					p: key.pos,
				},
				&root,
				3,
			);
			assert_eq!(key.bounds, decoded);
		}
	}

	#[test]
	fn test_chunk_key_freezes_in_tail() {
		let root = Bounds::from_slice(&[0.0, 0.0, 0.0, 8.0, 8.0, 8.0]);
		let s = Structure::new(2, 4, 6).unwrap();
		let mut ck = ChunkKey::new(root, 3, s);
		let p = Point::new(7.9, 7.9, 7.9);

		for _ in 0..4 {
			ck.step_point(&p);
		}
		assert!(ck.in_tail());
		let frozen = ck.k.pos;

		ck.step_point(&p);
		assert_eq!(ck.d, 5);
		assert_eq!(ck.k.pos, frozen);
	}

	#[test]
	fn test_chunk_key_regions() {
		let root = Bounds::from_slice(&[0.0, 0.0, 0.0, 8.0, 8.0, 8.0]);
		let s = Structure::new(2, 4, 6).unwrap();
		let mut ck = ChunkKey::new(root, 3, s);
		assert!(ck.in_base());
		ck.step(Dir::new(false, false, false));
		ck.step(Dir::new(false, false, false));
		assert!(ck.in_body());
		ck.step(Dir::new(false, false, false));
		ck.step(Dir::new(false, false, false));
		assert!(ck.in_tail());
	}
}
