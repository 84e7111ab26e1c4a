use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::tree::slots::{Contention, SlotArray, SlotOutcome};
use crate::types::bounds::Bounds;
use crate::types::dir::get_direction;
use crate::types::key::{Dxyz, Xyz};
use crate::types::point::Point;
use crate::types::schema::Schema;
use crate::types::structure::Structure;

/// Judges an arriving row against a slot's incumbent: exact coordinate
/// matches deduplicate, otherwise the point closer to the cell midpoint
/// keeps the slot and equidistant rows fall back to byte order so every
/// run resolves the contest the same way.
pub fn judge(schema: &Schema, mid: &Point, p: &Point, row: &[u8], incumbent: &[u8]) -> Contention {
	let q = schema.point_of(incumbent);
	if q == *p {
		return Contention::Equal;
	}

	let dp = p.sq_dist(mid);
	let dq = q.sq_dist(mid);
	if dp < dq {
		Contention::Replace
	} else if dq < dp {
		Contention::Keep
	} else if row < incumbent {
		Contention::Replace
	} else {
		Contention::Keep
	}
}

/// The pinned base+flat region: one dense depth-major slot per tree node
/// across depths `[0, flat_depth)`, persisted whole as build file `0`.
pub struct Slab {
	slots: SlotArray,
	structure: Structure,
	dimensions: u64,
	dirty: AtomicBool,
}

impl Slab {
	pub fn new(structure: Structure, dimensions: u64, width: usize) -> Slab {
		let count = structure.slab_slots(dimensions) as usize;
		Slab {
			slots: SlotArray::new(count, width),
			structure,
			dimensions,
			dirty: AtomicBool::new(false),
		}
	}

	pub fn from_bytes(
		bytes: &[u8],
		structure: Structure,
		dimensions: u64,
		schema: &Schema,
	) -> Result<Slab> {
		let expected = structure.slab_slots(dimensions) as usize * schema.width();
		if bytes.len() != expected {
			return Err(Error::Storage(format!(
				"slab region is {} bytes, expected {}",
				bytes.len(),
				expected
			)));
		}
		Ok(Slab {
			slots: SlotArray::from_bytes(bytes, schema.width(), schema.origin_offset())?,
			structure,
			dimensions,
			dirty: AtomicBool::new(false),
		})
	}

	pub fn to_bytes(&self, schema: &Schema) -> Vec<u8> {
		self.slots.to_bytes(schema.origin_offset())
	}

	pub fn len(&self) -> u64 {
		self.slots.len() as u64
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	pub fn occupied(&self) -> usize {
		self.slots.occupied()
	}

	pub fn dirty(&self) -> bool {
		self.dirty.load(Ordering::Relaxed)
	}

	pub fn clear_dirty(&self) {
		self.dirty.store(false, Ordering::Relaxed);
	}

	pub fn read(&self, slot: u64) -> Option<Vec<u8>> {
		self.slots.read(slot as usize)
	}

	/// Runs the insertion rule at one node of the slab.
	pub fn contend(
		&self,
		d: u64,
		pos: &Xyz,
		row: &[u8],
		point: &Point,
		mid: &Point,
		schema: &Schema,
	) -> SlotOutcome {
		let slot = self.structure.slab_slot(self.dimensions, d, pos) as usize;
		let outcome = self
			.slots
			.contend(slot, row, |incumbent| judge(schema, mid, point, row, incumbent));
		if matches!(outcome, SlotOutcome::Inserted | SlotOutcome::Displaced(_)) {
			self.dirty.store(true, Ordering::Relaxed);
		}
		outcome
	}
}

pub enum TailInsert {
	Stored,
	Duplicate,
	/// Slot array and overflow region are both full; the point is lost.
	Exhausted,
}

/// A per-key file covering the subtree below the flat region: a fixed
/// budget of hashed slots for depths `[flat_depth, disk_depth)` plus a
/// bounded overflow section for points pushed past the deepest level.
pub struct TailChunk {
	key: Dxyz,
	bounds: Bounds,
	slots: SlotArray,
	overflow: Mutex<Vec<u8>>,
	overflow_budget: usize,
	width: usize,
	dirty: AtomicBool,
}

impl TailChunk {
	pub fn new(
		key: Dxyz,
		bounds: Bounds,
		capacity: usize,
		overflow_budget: usize,
		width: usize,
	) -> TailChunk {
		TailChunk {
			key,
			bounds,
			slots: SlotArray::new(capacity, width),
			overflow: Mutex::new(Vec::new()),
			overflow_budget,
			width,
			dirty: AtomicBool::new(false),
		}
	}

	/// Rebuilds a chunk from its file: `capacity` raw rows, optionally
	/// followed by a count-prefixed overflow section.
	pub fn from_bytes(
		key: Dxyz,
		bounds: Bounds,
		capacity: usize,
		overflow_budget: usize,
		schema: &Schema,
		bytes: &[u8],
	) -> Result<TailChunk> {
		let width = schema.width();
		let body = capacity * width;
		if bytes.len() < body {
			return Err(Error::Storage(format!(
				"chunk {} is {} bytes, expected at least {}",
				key,
				bytes.len(),
				body
			)));
		}

		let slots = SlotArray::from_bytes(&bytes[..body], width, schema.origin_offset())?;

		let mut overflow = Vec::new();
		if bytes.len() > body {
			if bytes.len() < body + 8 {
				return Err(Error::Storage(format!("chunk {} overflow header truncated", key)));
			}
			let count = LittleEndian::read_u64(&bytes[body..body + 8]) as usize;
			let start = body + 8;
			if bytes.len() != start + count * width {
				return Err(Error::Storage(format!("chunk {} overflow section truncated", key)));
			}
			overflow.extend_from_slice(&bytes[start..]);
		}

		Ok(TailChunk {
			key,
			bounds,
			slots,
			overflow: Mutex::new(overflow),
			overflow_budget,
			width,
			dirty: AtomicBool::new(false),
		})
	}

	pub fn to_bytes(&self, schema: &Schema) -> Vec<u8> {
		let mut out = self.slots.to_bytes(schema.origin_offset());
		let overflow = self.overflow.lock();
		if !overflow.is_empty() {
			let mut header = [0u8; 8];
			LittleEndian::write_u64(&mut header, (overflow.len() / self.width) as u64);
			out.extend_from_slice(&header);
			out.extend_from_slice(&overflow);
		}
		out
	}

	pub fn key(&self) -> Dxyz {
		self.key
	}

	pub fn bounds(&self) -> &Bounds {
		&self.bounds
	}

	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	pub fn occupied(&self) -> usize {
		self.slots.occupied() + self.overflow.lock().len() / self.width
	}

	pub fn dirty(&self) -> bool {
		self.dirty.load(Ordering::Relaxed)
	}

	pub fn clear_dirty(&self) {
		self.dirty.store(false, Ordering::Relaxed);
	}

	pub fn read_slot(&self, i: usize) -> Option<Vec<u8>> {
		self.slots.read(i)
	}

	pub fn read_overflow(&self, i: usize) -> Option<Vec<u8>> {
		let overflow = self.overflow.lock();
		let start = i * self.width;
		if start + self.width <= overflow.len() {
			Some(overflow[start..start + self.width].to_vec())
		} else {
			None
		}
	}

	pub fn overflow_rows(&self) -> usize {
		self.overflow.lock().len() / self.width
	}

	/// Drives a point down the chunk's internal tree. Each level hashes
	/// the local node address into the slot budget; the slot's loser
	/// descends one level until the deepest allowed depth pushes it into
	/// the overflow section.
	pub fn insert(
		&self,
		row: Vec<u8>,
		point: Point,
		schema: &Schema,
		structure: &Structure,
		dimensions: u64,
	) -> TailInsert {
		let capacity = self.slots.len() as u64;
		let mut bounds = self.bounds.clone();
		let mut local = Xyz::default();
		let mut delta = 0u64;
		let mut d = self.key.d;
		let mut row = row;
		let mut point = point;

		loop {
			if d >= structure.disk_depth {
				return self.append_overflow(&row);
			}

			let slot = (slot_mix(delta, &local) % capacity) as usize;
			let mid = bounds.mid();
			let outcome = self
				.slots
				.contend(slot, &row, |incumbent| judge(schema, &mid, &point, &row, incumbent));

			match outcome {
				SlotOutcome::Inserted => {
					self.dirty.store(true, Ordering::Relaxed);
					return TailInsert::Stored;
				}
				SlotOutcome::Duplicate => return TailInsert::Duplicate,
				SlotOutcome::Rejected => {}
				SlotOutcome::Displaced(incumbent) => {
					self.dirty.store(true, Ordering::Relaxed);
					row = incumbent;
					point = schema.point_of(&row);
				}
			}

			let mut dir = get_direction(&bounds.mid(), &point);
			if dimensions == 2 {
				dir = dir.flatten();
			}
			bounds = bounds.go(dir, dimensions);
			local.x = (local.x << 1) | if dir.east() { 1 } else { 0 };
			local.y = (local.y << 1) | if dir.north() { 1 } else { 0 };
			local.z = (local.z << 1) | if dir.up() { 1 } else { 0 };
			delta += 1;
			d += 1;
		}
	}

	fn append_overflow(&self, row: &[u8]) -> TailInsert {
		let mut overflow = self.overflow.lock();
		if overflow.len() / self.width >= self.overflow_budget {
			return TailInsert::Exhausted;
		}
		overflow.extend_from_slice(row);
		self.dirty.store(true, Ordering::Relaxed);
		TailInsert::Stored
	}
}

// The slot layout must be stable across processes: a resumed build has to
// land arrivals on the slots a previous run populated.
fn slot_mix(depth: u64, p: &Xyz) -> u64 {
	let mut h = depth.wrapping_mul(0x9e3779b97f4a7c15) ^ p.x;
	h = mix(h) ^ p.y;
	h = mix(h) ^ p.z;
	mix(h)
}

fn mix(mut z: u64) -> u64 {
	z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
	z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
	z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::schema::{xyz_dims, Schema};

	fn schema() -> Schema {
		Schema::new(xyz_dims()).unwrap()
	}

	fn oct_bounds() -> Bounds {
		Bounds::from_slice(&[0.0, 0.0, 0.0, 8.0, 8.0, 8.0])
	}

	#[test]
	fn test_slab_insert_and_read() {
		let schema = schema();
		let structure = Structure::new(2, 4, 6).unwrap();
		let slab = Slab::new(structure, 3, schema.width());

		let p = Point::new(1.0, 1.0, 1.0);
		let row = schema.pack(&p, &[], 0);
		let mid = oct_bounds().mid();
		let outcome = slab.contend(0, &Xyz::default(), &row, &p, &mid, &schema);
		assert!(matches!(outcome, SlotOutcome::Inserted));
		assert!(slab.dirty());
		assert_eq!(slab.read(0).unwrap(), row);
		assert_eq!(slab.occupied(), 1);
	}

	#[test]
	fn test_slab_closer_point_takes_root() {
		let schema = schema();
		let structure = Structure::new(1, 2, 2).unwrap();
		let slab = Slab::new(structure, 3, schema.width());
		let mid = oct_bounds().mid();

		let far = Point::new(1.0, 1.0, 1.0);
		let far_row = schema.pack(&far, &[], 0);
		slab.contend(0, &Xyz::default(), &far_row, &far, &mid, &schema);

		let near = Point::new(3.5, 3.5, 3.5);
		let near_row = schema.pack(&near, &[], 0);
		match slab.contend(0, &Xyz::default(), &near_row, &near, &mid, &schema) {
			SlotOutcome::Displaced(incumbent) => assert_eq!(incumbent, far_row),
			_ => panic!("nearer point should displace"),
		}
		assert_eq!(schema.point_of(&slab.read(0).unwrap()), near);
	}

	#[test]
	fn test_slab_coordinate_dedup_ignores_origin() {
		let schema = schema();
		let structure = Structure::new(1, 2, 2).unwrap();
		let slab = Slab::new(structure, 3, schema.width());
		let mid = oct_bounds().mid();

		let p = Point::new(3.0, 3.0, 3.0);
		let first = schema.pack(&p, &[], 0);
		let second = schema.pack(&p, &[], 1);

		slab.contend(0, &Xyz::default(), &first, &p, &mid, &schema);
		let outcome = slab.contend(0, &Xyz::default(), &second, &p, &mid, &schema);
		assert!(matches!(outcome, SlotOutcome::Duplicate));
		assert_eq!(schema.origin_of(&slab.read(0).unwrap()), 0);
	}

	#[test]
	fn test_slab_disk_roundtrip() {
		let schema = schema();
		let structure = Structure::new(2, 4, 6).unwrap();
		let slab = Slab::new(structure, 3, schema.width());
		let mid = oct_bounds().mid();

		let p = Point::new(7.0, 7.0, 7.0);
		let row = schema.pack(&p, &[], 3);
		slab.contend(0, &Xyz::default(), &row, &p, &mid, &schema);

		let bytes = slab.to_bytes(&schema);
		let back = Slab::from_bytes(&bytes, structure, 3, &schema).unwrap();
		assert_eq!(back.occupied(), 1);
		assert_eq!(back.read(0).unwrap(), row);
		assert!(!back.dirty());
	}

	#[test]
	fn test_tail_stores_and_descends() {
		let schema = schema();
		let structure = Structure::new(0, 0, 4).unwrap();
		let chunk = TailChunk::new(Dxyz::default(), oct_bounds(), 64, 16, schema.width());

		// Same cell at every level: each arrival pushes the loser down.
		for i in 0..8 {
			let p = Point::new(0.5 + i as f64 * 0.01, 0.5, 0.5);
			let row = schema.pack(&p, &[], 0);
			assert!(matches!(
				chunk.insert(row, p, &schema, &structure, 3),
				TailInsert::Stored
			));
		}
		assert_eq!(chunk.occupied(), 8);
		assert!(chunk.dirty());
	}

	#[test]
	fn test_tail_duplicate_coordinates_collapse() {
		let schema = schema();
		let structure = Structure::new(0, 0, 4).unwrap();
		let chunk = TailChunk::new(Dxyz::default(), oct_bounds(), 64, 16, schema.width());

		let p = Point::new(3.0, 3.0, 3.0);
		chunk.insert(schema.pack(&p, &[], 0), p, &schema, &structure, 3);
		let second = chunk.insert(schema.pack(&p, &[], 1), p, &schema, &structure, 3);
		assert!(matches!(second, TailInsert::Duplicate));
		assert_eq!(chunk.occupied(), 1);
	}

	#[test]
	fn test_tail_overflow_and_exhaustion() {
		let schema = schema();
		// Tail spans a single depth, so a one-slot chunk overflows fast.
		let structure = Structure::new(0, 0, 1).unwrap();
		let chunk = TailChunk::new(Dxyz::default(), oct_bounds(), 1, 2, schema.width());

		for i in 0..3 {
			let p = Point::new(1.0 + i as f64, 1.0, 1.0);
			let row = schema.pack(&p, &[], 0);
			assert!(matches!(
				chunk.insert(row, p, &schema, &structure, 3),
				TailInsert::Stored
			));
		}

		let p = Point::new(6.0, 6.0, 6.0);
		let row = schema.pack(&p, &[], 0);
		assert!(matches!(
			chunk.insert(row, p, &schema, &structure, 3),
			TailInsert::Exhausted
		));
		assert_eq!(chunk.occupied(), 3);
		assert_eq!(chunk.overflow_rows(), 2);
	}

	#[test]
	fn test_tail_disk_roundtrip_with_overflow() {
		let schema = schema();
		let structure = Structure::new(0, 0, 1).unwrap();
		let key = Dxyz::new(0, 0, 0, 0);
		let chunk = TailChunk::new(key, oct_bounds(), 1, 4, schema.width());

		for i in 0..3 {
			let p = Point::new(1.0 + i as f64, 2.0, 3.0);
			chunk.insert(schema.pack(&p, &[], i), p, &schema, &structure, 3);
		}

		let bytes = chunk.to_bytes(&schema);
		let back =
			TailChunk::from_bytes(key, oct_bounds(), 1, 4, &schema, &bytes).unwrap();
		assert_eq!(back.occupied(), 3);
		assert_eq!(back.overflow_rows(), 2);
		assert_eq!(back.to_bytes(&schema), bytes);
	}

	#[test]
	fn test_tail_rejects_truncated_file() {
		let schema = schema();
		let bytes = vec![0u8; 10];
		assert!(TailChunk::from_bytes(
			Dxyz::default(),
			oct_bounds(),
			4,
			4,
			&schema,
			&bytes
		)
		.is_err());
	}

	#[test]
	fn test_slot_mix_is_stable() {
		// Fixed expectations guard the on-disk layout against accidental
		// hash changes.
		let a = slot_mix(0, &Xyz::new(0, 0, 0));
		let b = slot_mix(0, &Xyz::new(0, 0, 0));
		assert_eq!(a, b);
		assert_ne!(slot_mix(1, &Xyz::new(0, 0, 0)), a);
		assert_ne!(slot_mix(0, &Xyz::new(1, 0, 0)), slot_mix(0, &Xyz::new(0, 1, 0)));
	}
}
