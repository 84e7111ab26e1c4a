use std::sync::Arc;

use ahash::AHashSet;

use crate::tree::registry::Registry;
use crate::types::key::Dxyz;

/// Scoped acquisition tracker. Every chunk a caller touches is recorded
/// here, and everything still held is released back to the registry when
/// the clipper goes out of scope, on every exit path.
pub struct Clipper {
	registry: Arc<Registry>,
	held: AHashSet<Dxyz>,
}

impl Clipper {
	pub fn new(registry: Arc<Registry>) -> Clipper {
		Clipper {
			registry,
			held: AHashSet::new(),
		}
	}

	/// Records an acquisition; true if this clipper didn't hold the key
	/// yet.
	pub(crate) fn add(&mut self, key: Dxyz) -> bool {
		self.held.insert(key)
	}

	pub fn holds(&self, key: &Dxyz) -> bool {
		self.held.contains(key)
	}

	pub fn len(&self) -> usize {
		self.held.len()
	}

	pub fn is_empty(&self) -> bool {
		self.held.is_empty()
	}

	/// Releases everything this clipper holds except `keep`. Queries use
	/// this to drop regions outside their range once identified.
	pub fn clip_except(&mut self, keep: Option<Dxyz>) {
		let registry = self.registry.clone();
		self.held.retain(|key| {
			if Some(*key) == keep {
				true
			} else {
				registry.release(*key);
				false
			}
		});
	}

	pub fn release_all(&mut self) {
		self.clip_except(None);
	}
}

impl Drop for Clipper {
	fn drop(&mut self) {
		for key in self.held.drain() {
			self.registry.release(key);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::drivers::Arbiter;
	use crate::tree::registry::Registry;
	use crate::types::bounds::Bounds;
	use crate::types::metadata::Metadata;
	use crate::types::schema::{xyz_dims, Schema};
	use crate::types::structure::Structure;

	fn registry(name: &str) -> Arc<Registry> {
		let dir = std::env::temp_dir().join(format!("entwine-clip-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		let bounds = Bounds::from_slice(&[0.0, 0.0, 0.0, 8.0, 8.0, 8.0]);
		let metadata = Arc::new(Metadata {
			schema: Schema::new(xyz_dims()).unwrap(),
			bounds: bounds.clone(),
			bounds_cubic: bounds.cubic(),
			structure: Structure::new(1, 2, 6).unwrap(),
			dimensions: 3,
			reproject: None,
			tail_capacity: 16,
			tail_overflow: 4,
		});
		let endpoint = Arbiter::new()
			.endpoint(&dir.to_string_lossy())
			.unwrap();
		Registry::open(metadata, endpoint, Vec::new(), 64, 32).unwrap()
	}

	#[test]
	fn test_tracks_distinct_keys() {
		let registry = registry("track");
		let mut clipper = Clipper::new(registry.clone());

		let a = Dxyz::new(2, 0, 0, 0);
		let b = Dxyz::new(2, 1, 0, 0);
		registry.acquire(a, &mut clipper).unwrap();
		registry.acquire(a, &mut clipper).unwrap();
		registry.acquire(b, &mut clipper).unwrap();

		assert_eq!(clipper.len(), 2);
		assert!(clipper.holds(&a) && clipper.holds(&b));
	}

	#[test]
	fn test_clip_except_keeps_one() {
		let registry = registry("except");
		let mut clipper = Clipper::new(registry.clone());

		let a = Dxyz::new(2, 0, 0, 0);
		let b = Dxyz::new(2, 1, 1, 0);
		registry.acquire(a, &mut clipper).unwrap();
		registry.acquire(b, &mut clipper).unwrap();

		clipper.clip_except(Some(a));
		assert_eq!(clipper.len(), 1);
		assert!(clipper.holds(&a));
	}

	#[test]
	fn test_drop_releases_everything() {
		let registry = registry("drop");
		{
			let mut clipper = Clipper::new(registry.clone());
			registry
				.acquire(Dxyz::new(2, 0, 1, 0), &mut clipper)
				.unwrap();
		}
		// A released chunk is evictable; a fresh clipper can re-acquire.
		let mut clipper = Clipper::new(registry.clone());
		registry
			.acquire(Dxyz::new(2, 0, 1, 0), &mut clipper)
			.unwrap();
	}
}
