use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use ahash::{AHashMap, AHasher};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::drivers::Endpoint;
use crate::error::{Error, Result};
use crate::tree::chunk::{Slab, TailChunk};
use crate::tree::clip::Clipper;
use crate::types::key::{bounds_of, Dxyz};
use crate::types::metadata::Metadata;

const SHARDS: usize = 16;

/// Build file holding the pinned base+flat slab.
pub const SLAB_KEY: &str = "0";

enum FlushJob {
	Chunk(Dxyz),
	Sweep,
	Sync(Sender<()>),
}

struct Entry {
	chunk: Mutex<Option<Arc<TailChunk>>>,
	refs: AtomicU64,
	touched: AtomicU64,
}

impl Entry {
	fn new() -> Entry {
		Entry {
			chunk: Mutex::new(None),
			refs: AtomicU64::new(0),
			touched: AtomicU64::new(0),
		}
	}
}

/// The set of live chunks. Hands out tail chunks behind a per-key
/// materialization barrier, keeps refcounts through clippers, flushes
/// dirty chunks on a dedicated writer thread, and evicts cold ones
/// between the configured water marks to bound memory.
pub struct Registry {
	metadata: Arc<Metadata>,
	endpoint: Endpoint,
	slab: Slab,
	shards: Vec<Mutex<HashMap<Dxyz, Arc<Entry>>>>,
	ordinals: RwLock<Ordinals>,
	resident: AtomicUsize,
	high_water: usize,
	low_water: usize,
	gate: (Mutex<()>, Condvar),
	clock: AtomicU64,
	loads: AtomicU64,
	tx: Sender<FlushJob>,
	fatal: Mutex<Option<String>>,
}

#[derive(Default)]
struct Ordinals {
	list: Vec<Dxyz>,
	index: AHashMap<Dxyz, u64>,
}

impl Registry {
	/// Opens the registry against a build endpoint. `chunks` is the
	/// persisted chunk list of a resumed build, in ordinal order; tail
	/// chunks themselves stay lazy, only the slab is materialized here
	/// since it is pinned for the whole run anyway.
	pub fn open(
		metadata: Arc<Metadata>,
		endpoint: Endpoint,
		chunks: Vec<Dxyz>,
		high_water: usize,
		low_water: usize,
	) -> Result<Arc<Registry>> {
		let slab = match endpoint.get(SLAB_KEY)? {
			Some(bytes) => Slab::from_bytes(
				&bytes,
				metadata.structure,
				metadata.dimensions,
				&metadata.schema,
			)?,
			None => Slab::new(
				metadata.structure,
				metadata.dimensions,
				metadata.schema.width(),
			),
		};

		let mut ordinals = Ordinals::default();
		for key in chunks {
			ordinals.index.insert(key, ordinals.list.len() as u64);
			ordinals.list.push(key);
		}

		let (tx, rx) = unbounded();
		let registry = Arc::new(Registry {
			metadata,
			endpoint,
			slab,
			shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
			ordinals: RwLock::new(ordinals),
			resident: AtomicUsize::new(0),
			high_water: high_water.max(2),
			low_water: low_water.min(high_water.max(2) - 1),
			gate: (Mutex::new(()), Condvar::new()),
			clock: AtomicU64::new(0),
			loads: AtomicU64::new(0),
			tx,
			fatal: Mutex::new(None),
		});

		let weak = Arc::downgrade(&registry);
		thread::Builder::new()
			.name("entwine-flush".to_string())
			.spawn(move || run_flusher(weak, rx))?;

		Ok(registry)
	}

	pub fn metadata(&self) -> &Arc<Metadata> {
		&self.metadata
	}

	pub fn slab(&self) -> &Slab {
		&self.slab
	}

	pub fn resident(&self) -> usize {
		self.resident.load(Ordering::Relaxed)
	}

	/// Total distinct tail chunks this build has ever materialized.
	pub fn chunk_count(&self) -> u64 {
		self.ordinals.read().list.len() as u64
	}

	pub fn chunk_keys(&self) -> Vec<Dxyz> {
		self.ordinals.read().list.clone()
	}

	pub fn ordinal_of(&self, key: &Dxyz) -> Option<u64> {
		self.ordinals.read().index.get(key).copied()
	}

	pub fn key_of_ordinal(&self, ordinal: u64) -> Option<Dxyz> {
		self.ordinals.read().list.get(ordinal as usize).copied()
	}

	/// Times the registry materialized chunk bytes; at most one load may
	/// be in flight per key, which the per-entry barrier guarantees.
	pub fn load_count(&self) -> u64 {
		self.loads.load(Ordering::Relaxed)
	}

	pub fn fatal(&self) -> Option<String> {
		self.fatal.lock().clone()
	}

	/// Marks the build as unable to guarantee consistency; the next save
	/// surfaces this as a storage error.
	pub fn record_fatal(&self, msg: String) {
		let mut fatal = self.fatal.lock();
		if fatal.is_none() {
			*fatal = Some(msg);
		}
	}

	/// Returns a live reference to the tail chunk at `key`, loading it if
	/// it isn't resident. Concurrent acquirers of an absent chunk
	/// serialize on the entry lock so exactly one of them loads the
	/// bytes. This and the high-water gate are the only places an
	/// insertion worker blocks.
	pub fn acquire(&self, key: Dxyz, clipper: &mut Clipper) -> Result<Arc<TailChunk>> {
		let entry = self.entry(key);
		if clipper.add(key) {
			entry.refs.fetch_add(1, Ordering::SeqCst);
		}
		entry
			.touched
			.store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);

		let mut guard = entry.chunk.lock();
		if let Some(chunk) = guard.as_ref() {
			return Ok(chunk.clone());
		}

		self.wait_below_high_water();

		let name = key.to_string();
		let bounds = bounds_of(&key, &self.metadata.bounds_cubic, self.metadata.dimensions);
		let capacity = self.metadata.tail_capacity as usize;
		let overflow = self.metadata.tail_overflow as usize;

		let chunk = match self.endpoint.get(&name)? {
			Some(bytes) => TailChunk::from_bytes(
				key,
				bounds,
				capacity,
				overflow,
				&self.metadata.schema,
				&bytes,
			)?,
			None => TailChunk::new(key, bounds, capacity, overflow, self.metadata.schema.width()),
		};
		self.loads.fetch_add(1, Ordering::Relaxed);

		let chunk = Arc::new(chunk);
		self.assign_ordinal(key);
		*guard = Some(chunk.clone());
		self.resident.fetch_add(1, Ordering::SeqCst);
		debug!(chunk = %key, resident = self.resident(), "materialized");
		Ok(chunk)
	}

	/// Drops one clipper's reference. At zero the chunk is handed to the
	/// writer executor for flush; base and flat live in the pinned slab
	/// and never pass through here.
	pub fn release(&self, key: Dxyz) {
		if let Some(entry) = self.lookup(key) {
			if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
				let _ = self.tx.send(FlushJob::Chunk(key));
			}
		}
	}

	/// Synchronously drains the writer queue and flushes every dirty
	/// chunk plus the slab. Callers quiesce insertion first.
	pub fn flush_all(&self) -> Result<()> {
		let (ack_tx, ack_rx) = bounded(1);
		if self.tx.send(FlushJob::Sync(ack_tx)).is_ok() {
			let _ = ack_rx.recv_timeout(Duration::from_secs(30));
		}

		if self.slab.dirty() {
			self.endpoint
				.put(SLAB_KEY, &self.slab.to_bytes(&self.metadata.schema))?;
			self.slab.clear_dirty();
		}

		for shard in &self.shards {
			let map = shard.lock();
			for (key, entry) in map.iter() {
				let guard = entry.chunk.lock();
				if let Some(chunk) = guard.as_ref() {
					if chunk.dirty() {
						self.endpoint
							.put(&key.to_string(), &chunk.to_bytes(&self.metadata.schema))?;
						chunk.clear_dirty();
					}
				}
			}
		}

		if let Some(msg) = self.fatal() {
			return Err(Error::Storage(msg));
		}
		Ok(())
	}

	fn entry(&self, key: Dxyz) -> Arc<Entry> {
		let shard = &self.shards[shard_of(&key)];
		let mut map = shard.lock();
		map.entry(key).or_insert_with(|| Arc::new(Entry::new())).clone()
	}

	fn lookup(&self, key: Dxyz) -> Option<Arc<Entry>> {
		self.shards[shard_of(&key)].lock().get(&key).cloned()
	}

	fn assign_ordinal(&self, key: Dxyz) {
		let mut ordinals = self.ordinals.write();
		if !ordinals.index.contains_key(&key) {
			let next = ordinals.list.len() as u64;
			ordinals.index.insert(key, next);
			ordinals.list.push(key);
		}
	}

	fn wait_below_high_water(&self) {
		let mut attempts = 0;
		while self.resident.load(Ordering::SeqCst) >= self.high_water {
			let _ = self.tx.send(FlushJob::Sweep);
			let mut guard = self.gate.0.lock();
			if self.resident.load(Ordering::SeqCst) < self.high_water {
				break;
			}
			if self
				.gate
				.1
				.wait_for(&mut guard, Duration::from_millis(50))
				.timed_out()
			{
				attempts += 1;
				if attempts > 100 {
					// Every resident chunk is referenced; refusing to
					// stall the build forever beats a deadlock.
					warn!(
						resident = self.resident(),
						"cache over high water with no evictable chunks"
					);
					break;
				}
			}
		}
	}

	fn flush_entry(&self, key: Dxyz, entry: &Entry, evict: bool) {
		if entry.refs.load(Ordering::SeqCst) > 0 {
			return;
		}
		// A busy entry lock means someone is acquiring right now; skip,
		// the next release or flush_all picks the chunk up again.
		let Some(mut guard) = entry.chunk.try_lock() else {
			return;
		};
		if entry.refs.load(Ordering::SeqCst) > 0 {
			return;
		}
		let Some(chunk) = guard.as_ref() else {
			return;
		};

		if chunk.dirty() {
			let bytes = chunk.to_bytes(&self.metadata.schema);
			match self.endpoint.put(&key.to_string(), &bytes) {
				Ok(()) => chunk.clear_dirty(),
				Err(e) => {
					error!(chunk = %key, "flush failed: {}", e);
					let mut fatal = self.fatal.lock();
					if fatal.is_none() {
						*fatal = Some(e.to_string());
					}
					return;
				}
			}
		}

		if evict {
			*guard = None;
			self.resident.fetch_sub(1, Ordering::SeqCst);
			debug!(chunk = %key, resident = self.resident(), "evicted");
		}
	}

	fn sweep(&self) {
		if self.resident.load(Ordering::SeqCst) <= self.low_water {
			self.gate.1.notify_all();
			return;
		}

		// Oldest-touched chunks with no holders go first. A blocked
		// acquirer may hold its entry lock while waiting on the gate, so
		// the scan must not block on entry locks.
		let mut candidates: Vec<(u64, Dxyz)> = Vec::new();
		for shard in &self.shards {
			let map = shard.lock();
			for (key, entry) in map.iter() {
				let resident = entry.chunk.try_lock().map(|g| g.is_some()).unwrap_or(false);
				if resident && entry.refs.load(Ordering::SeqCst) == 0 {
					candidates.push((entry.touched.load(Ordering::Relaxed), *key));
				}
			}
		}
		candidates.sort_unstable();

		for (_, key) in candidates {
			if self.resident.load(Ordering::SeqCst) <= self.low_water {
				break;
			}
			if let Some(entry) = self.lookup(key) {
				self.flush_entry(key, &entry, true);
			}
		}
		self.gate.1.notify_all();
	}
}

fn shard_of(key: &Dxyz) -> usize {
	let mut hasher = AHasher::default();
	key.hash(&mut hasher);
	hasher.finish() as usize % SHARDS
}

fn run_flusher(registry: Weak<Registry>, rx: Receiver<FlushJob>) {
	while let Ok(job) = rx.recv() {
		let Some(registry) = registry.upgrade() else {
			break;
		};
		match job {
			FlushJob::Chunk(key) => {
				if let Some(entry) = registry.lookup(key) {
					registry.flush_entry(key, &entry, false);
				}
				registry.gate.1.notify_all();
			}
			FlushJob::Sweep => registry.sweep(),
			FlushJob::Sync(ack) => {
				let _ = ack.send(());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::drivers::Arbiter;
	use crate::types::bounds::Bounds;
	use crate::types::point::Point;
	use crate::types::schema::{xyz_dims, Schema};
	use crate::types::structure::Structure;

	fn scratch(name: &str) -> String {
		let dir = std::env::temp_dir().join(format!(
			"entwine-registry-{}-{}",
			name,
			std::process::id()
		));
		let _ = std::fs::remove_dir_all(&dir);
		dir.to_string_lossy().to_string()
	}

	fn metadata() -> Arc<Metadata> {
		let bounds = Bounds::from_slice(&[0.0, 0.0, 0.0, 8.0, 8.0, 8.0]);
		Arc::new(Metadata {
			schema: Schema::new(xyz_dims()).unwrap(),
			bounds: bounds.clone(),
			bounds_cubic: bounds.cubic(),
			structure: Structure::new(1, 2, 6).unwrap(),
			dimensions: 3,
			reproject: None,
			tail_capacity: 32,
			tail_overflow: 8,
		})
	}

	fn registry(name: &str, high: usize, low: usize) -> Arc<Registry> {
		let endpoint = Arbiter::new().endpoint(&scratch(name)).unwrap();
		Registry::open(metadata(), endpoint, Vec::new(), high, low).unwrap()
	}

	#[test]
	fn test_one_materialization_per_key() {
		let registry = registry("barrier", 64, 32);
		let key = Dxyz::new(2, 1, 1, 0);

		let mut handles = Vec::new();
		for _ in 0..8 {
			let registry = registry.clone();
			handles.push(std::thread::spawn(move || {
				let mut clipper = Clipper::new(registry.clone());
				registry.acquire(key, &mut clipper).unwrap().key()
			}));
		}
		for h in handles {
			assert_eq!(h.join().unwrap(), key);
		}

		assert_eq!(registry.load_count(), 1);
		assert_eq!(registry.resident(), 1);
		assert_eq!(registry.ordinal_of(&key), Some(0));
	}

	#[test]
	fn test_release_flushes_dirty_chunk() {
		let registry = registry("flush", 64, 32);
		let key = Dxyz::new(2, 0, 0, 0);
		let schema = registry.metadata().schema.clone();
		let structure = registry.metadata().structure;

		{
			let mut clipper = Clipper::new(registry.clone());
			let chunk = registry.acquire(key, &mut clipper).unwrap();
			let p = Point::new(1.0, 1.0, 1.0);
			chunk.insert(schema.pack(&p, &[], 0), p, &schema, &structure, 3);
		}

		registry.flush_all().unwrap();
		let bytes = registry.endpoint.get(&key.to_string()).unwrap();
		assert!(bytes.is_some());

		let reloaded = TailChunk::from_bytes(
			key,
			bounds_of(&key, &registry.metadata().bounds_cubic, 3),
			32,
			8,
			&schema,
			&bytes.unwrap(),
		)
		.unwrap();
		assert_eq!(reloaded.occupied(), 1);
	}

	#[test]
	fn test_high_water_evicts_down_to_low_water() {
		let registry = registry("evict", 4, 2);

		// Acquire-and-release more chunks than the cache may keep.
		for x in 0..12 {
			let mut clipper = Clipper::new(registry.clone());
			let key = Dxyz::new(2, x % 4, x / 4, 0);
			registry.acquire(key, &mut clipper).unwrap();
		}

		// Cold chunks with no holders must have been swept under the
		// high-water mark.
		for _ in 0..100 {
			if registry.resident() <= 4 {
				break;
			}
			std::thread::sleep(Duration::from_millis(10));
		}
		assert!(registry.resident() <= 4);
		assert_eq!(registry.chunk_count(), 12);
	}

	#[test]
	fn test_reacquire_after_eviction_reloads_points() {
		let registry = registry("reload", 2, 1);
		let schema = registry.metadata().schema.clone();
		let structure = registry.metadata().structure;
		let first = Dxyz::new(2, 0, 0, 0);

		{
			let mut clipper = Clipper::new(registry.clone());
			let chunk = registry.acquire(first, &mut clipper).unwrap();
			let p = Point::new(0.5, 0.5, 0.5);
			chunk.insert(schema.pack(&p, &[], 0), p, &schema, &structure, 3);
		}

		// Push enough other chunks through to evict the first.
		for x in 1..6 {
			let mut clipper = Clipper::new(registry.clone());
			registry.acquire(Dxyz::new(2, x % 2, x / 2, 0), &mut clipper).unwrap();
		}
		for _ in 0..100 {
			if registry.resident() <= 2 {
				break;
			}
			std::thread::sleep(Duration::from_millis(10));
		}

		let mut clipper = Clipper::new(registry.clone());
		let chunk = registry.acquire(first, &mut clipper).unwrap();
		assert_eq!(chunk.occupied(), 1);
		// The ordinal assigned at first materialization is stable.
		assert_eq!(registry.ordinal_of(&first), Some(0));
	}
}
