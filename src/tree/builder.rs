use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::drivers::{Arbiter, Endpoint};
use crate::error::{Error, Result};
use crate::reader;
use crate::tree::chunk::{TailInsert, TailChunk};
use crate::tree::clip::Clipper;
use crate::tree::registry::Registry;
use crate::tree::slots::SlotOutcome;
use crate::types::bounds::Bounds;
use crate::types::key::{bounds_of, ChunkKey, Dxyz};
use crate::types::metadata::{schema_dims, MetaDoc, Metadata};
use crate::types::point::Point;
use crate::types::reproject::{Identity, Reprojection, Warp};
use crate::types::schema::{DimType, Schema};
use crate::types::structure::Structure;
use crate::util::pool::Pool;

const META_KEY: &str = "meta";
const META_VERSION: &str = "1.0";

/// Parameters of a fresh build; everything a resumed build reads back out
/// of its metadata instead.
pub struct BuildOptions {
	pub bounds: Bounds,
	pub dims: Vec<(String, DimType)>,
	pub dimensions: u64,
	pub structure: Structure,
	pub threads: usize,
	pub reproject: Option<Reprojection>,
	pub tail_capacity: u64,
	pub tail_overflow: u64,
	pub cache_high_water: usize,
	pub cache_low_water: usize,
}

impl BuildOptions {
	pub fn new(
		bounds: Bounds,
		dims: Vec<(String, DimType)>,
		dimensions: u64,
		structure: Structure,
	) -> BuildOptions {
		BuildOptions {
			bounds,
			dims,
			dimensions,
			structure,
			threads: 4,
			reproject: None,
			tail_capacity: 4096,
			tail_overflow: 1024,
			cache_high_water: 512,
			cache_low_water: 384,
		}
	}
}

#[derive(Default, Clone, Copy)]
struct Counts {
	points: u64,
	tossed: u64,
	duplicates: u64,
}

struct BuildState {
	origins: Vec<String>,
	num_points: u64,
	num_tossed: u64,
	num_duplicates: u64,
}

/// Top-level orchestrator: wires the registry, pool and metadata, and
/// drives insert/save/load/finalize plus the query surface.
pub struct Builder {
	metadata: Arc<Metadata>,
	registry: Arc<Registry>,
	state: Arc<Mutex<BuildState>>,
	endpoint: Endpoint,
	tmp: Endpoint,
	arbiter: Arc<Arbiter>,
	warp: Arc<dyn Warp>,
	pool: Pool,
}

impl Builder {
	/// Starts a fresh build and writes its initial metadata, so the build
	/// path immediately identifies itself as resumable.
	pub fn create(
		arbiter: Arc<Arbiter>,
		build_path: &str,
		tmp_path: &str,
		options: BuildOptions,
	) -> Result<Builder> {
		if options.dimensions != 2 && options.dimensions != 3 {
			return Err(Error::Config(format!(
				"invalid dimension count {}",
				options.dimensions
			)));
		}
		options.structure.validate(options.dimensions)?;

		let metadata = Arc::new(Metadata {
			schema: Schema::new(options.dims)?,
			bounds_cubic: options.bounds.cubic(),
			bounds: options.bounds,
			structure: options.structure,
			dimensions: options.dimensions,
			reproject: options.reproject.filter(|r| r.valid()),
			tail_capacity: options.tail_capacity.max(1),
			tail_overflow: options.tail_overflow,
		});

		let endpoint = arbiter.endpoint(build_path)?;
		let tmp = arbiter.endpoint(tmp_path)?;
		let registry = Registry::open(
			metadata.clone(),
			endpoint.clone(),
			Vec::new(),
			options.cache_high_water,
			options.cache_low_water,
		)?;

		let builder = Builder {
			metadata,
			registry,
			state: Arc::new(Mutex::new(BuildState {
				origins: Vec::new(),
				num_points: 0,
				num_tossed: 0,
				num_duplicates: 0,
			})),
			endpoint,
			tmp,
			arbiter,
			warp: Arc::new(Identity),
			pool: Pool::new(options.threads)?,
		};
		builder.write_meta()?;
		Ok(builder)
	}

	/// Awakens a saved build from `<build_path>/meta`: schema, bounds,
	/// structure, origin list and counters all come back from the
	/// document, chunks stay lazy.
	pub fn resume(
		arbiter: Arc<Arbiter>,
		build_path: &str,
		tmp_path: &str,
		threads: usize,
	) -> Result<Builder> {
		let endpoint = arbiter.endpoint(build_path)?;
		let bytes = endpoint.get(META_KEY)?.ok_or_else(|| {
			Error::Config(format!("no metadata at {}/{}", build_path, META_KEY))
		})?;
		let doc: MetaDoc = serde_json::from_slice(&bytes)?;
		let metadata = Arc::new(doc.to_metadata()?);

		let mut chunks = Vec::with_capacity(doc.chunks.len());
		for name in &doc.chunks {
			chunks.push(name.parse::<Dxyz>()?);
		}

		// Cache bounds aren't part of the persisted document; reopened
		// builds run with the defaults unless the caller adjusts them.
		let defaults = BuildOptions::new(
			metadata.bounds.clone(),
			Vec::new(),
			metadata.dimensions,
			metadata.structure,
		);
		let registry = Registry::open(
			metadata.clone(),
			endpoint.clone(),
			chunks,
			defaults.cache_high_water,
			defaults.cache_low_water,
		)?;

		Ok(Builder {
			metadata,
			registry,
			state: Arc::new(Mutex::new(BuildState {
				origins: doc.origins,
				num_points: doc.num_points,
				num_tossed: doc.num_tossed,
				num_duplicates: doc.num_duplicates,
			})),
			endpoint,
			tmp: arbiter.endpoint(tmp_path)?,
			arbiter,
			warp: Arc::new(Identity),
			pool: Pool::new(threads)?,
		})
	}

	/// Installs the coordinate warp collaborator applied to every input
	/// point before the bounds check.
	pub fn with_warp(mut self, warp: Arc<dyn Warp>) -> Builder {
		self.warp = warp;
		self
	}

	pub fn metadata(&self) -> &Arc<Metadata> {
		&self.metadata
	}

	pub fn bounds(&self) -> &Bounds {
		&self.metadata.bounds
	}

	pub fn schema(&self) -> &Schema {
		&self.metadata.schema
	}

	pub fn num_points(&self) -> u64 {
		self.state.lock().num_points
	}

	pub fn num_tossed(&self) -> u64 {
		self.state.lock().num_tossed
	}

	pub fn num_duplicates(&self) -> u64 {
		self.state.lock().num_duplicates
	}

	pub fn origins(&self) -> Vec<String> {
		self.state.lock().origins.clone()
	}

	pub fn clipper(&self) -> Clipper {
		Clipper::new(self.registry.clone())
	}

	/// Queues one input file for ingestion and returns immediately. The
	/// file gets the next origin id; a worker streams its points into the
	/// tree end-to-end. Await completion with `join`.
	pub fn insert(&self, path: &str) {
		let origin = {
			let mut state = self.state.lock();
			state.origins.push(path.to_string());
			(state.origins.len() - 1) as u64
		};

		let metadata = self.metadata.clone();
		let registry = self.registry.clone();
		let state = self.state.clone();
		let warp = self.warp.clone();
		let arbiter = self.arbiter.clone();
		let tmp = self.tmp.clone();
		let path = path.to_string();

		self.pool.add(move || {
			insert_file(metadata, registry, state, warp, arbiter, tmp, origin, &path);
		});
	}

	/// Awaits the pool drain. Does not flush.
	pub fn join(&self) {
		self.pool.join();
	}

	/// Pool drain, full flush, atomic metadata rewrite. Safe between
	/// inserts; the build on disk is consistent and resumable afterwards.
	pub fn save(&self) -> Result<()> {
		self.pool.join();
		self.registry.flush_all()?;
		self.write_meta()?;
		info!(
			points = self.num_points(),
			tossed = self.num_tossed(),
			chunks = self.registry.chunk_count(),
			"saved"
		);
		Ok(())
	}

	/// Re-reads counters and the origin list from the persisted metadata.
	/// No queries should run between a load and the next save.
	pub fn load(&self) -> Result<()> {
		let bytes = self
			.endpoint
			.get(META_KEY)?
			.ok_or_else(|| Error::Config("no metadata to load".to_string()))?;
		let doc: MetaDoc = serde_json::from_slice(&bytes)?;

		let mut state = self.state.lock();
		state.origins = doc.origins;
		state.num_points = doc.num_points;
		state.num_tossed = doc.num_tossed;
		state.num_duplicates = doc.num_duplicates;
		Ok(())
	}

	fn write_meta(&self) -> Result<()> {
		let doc = self.meta_doc();
		self.endpoint.put(META_KEY, &serde_json::to_vec_pretty(&doc)?)
	}

	fn meta_doc(&self) -> MetaDoc {
		let state = self.state.lock();
		MetaDoc {
			version: META_VERSION.to_string(),
			geometry_type: self.metadata.geometry_type().to_string(),
			bounds: self.metadata.bounds.clone(),
			bounds_cubic: self.metadata.bounds_cubic.clone(),
			structure: self.metadata.structure,
			schema: schema_dims(&self.metadata.schema),
			reproject: self.metadata.reproject.clone(),
			tail_capacity: self.metadata.tail_capacity,
			tail_overflow: self.metadata.tail_overflow,
			origins: state.origins.clone(),
			num_points: state.num_points,
			num_tossed: state.num_tossed,
			num_duplicates: state.num_duplicates,
			chunks: self
				.registry
				.chunk_keys()
				.iter()
				.map(|k| k.to_string())
				.collect(),
		}
	}

	/// Point indices across `[depth_begin, depth_end)`; `depth_end == 0`
	/// means no upper bound.
	pub fn query(
		&self,
		clipper: Option<&mut Clipper>,
		depth_begin: u64,
		depth_end: u64,
	) -> Result<Vec<u64>> {
		self.run_query(clipper, None, depth_begin, depth_end)
	}

	/// Spatially restricted query: only chunks whose bounds intersect
	/// `bbox` are visited and only points inside it are returned.
	pub fn query_bounds(
		&self,
		clipper: Option<&mut Clipper>,
		bbox: &Bounds,
		depth_begin: u64,
		depth_end: u64,
	) -> Result<Vec<u64>> {
		self.run_query(clipper, Some(bbox), depth_begin, depth_end)
	}

	fn run_query(
		&self,
		clipper: Option<&mut Clipper>,
		bbox: Option<&Bounds>,
		depth_begin: u64,
		depth_end: u64,
	) -> Result<Vec<u64>> {
		let depth_end = if depth_end == 0 { u64::MAX } else { depth_end };
		let schema = &self.metadata.schema;
		let structure = &self.metadata.structure;
		let dimensions = self.metadata.dimensions;
		let slab = self.registry.slab();
		let mut out = Vec::new();

		for slot in 0..slab.len() {
			let d = structure.depth_of_slab_slot(dimensions, slot);
			if d < depth_begin || d >= depth_end {
				continue;
			}
			if let Some(row) = slab.read(slot) {
				if bbox.map_or(true, |b| b.contains(&schema.point_of(&row))) {
					out.push(slot);
				}
			}
		}

		// The per-file tail is visited at chunk granularity: a chunk's
		// hashed layout doesn't record per-point depths, so the whole
		// chunk joins when its depth span meets the range.
		if structure.flat_depth < structure.disk_depth
			&& structure.flat_depth < depth_end
			&& structure.disk_depth > depth_begin
		{
			let mut local = self.clipper();
			let clipper = match clipper {
				Some(c) => c,
				None => &mut local,
			};

			for key in self.registry.chunk_keys() {
				if let Some(b) = bbox {
					let cell = bounds_of(&key, &self.metadata.bounds_cubic, dimensions);
					if !cell.intersects(b) {
						continue;
					}
				}
				let chunk = self.registry.acquire(key, clipper)?;
				self.collect_chunk(&chunk, bbox, &mut out);
			}
		}

		Ok(out)
	}

	fn collect_chunk(&self, chunk: &TailChunk, bbox: Option<&Bounds>, out: &mut Vec<u64>) {
		let schema = &self.metadata.schema;
		let base = self.chunk_index_base(&chunk.key());
		let capacity = chunk.capacity() as u64;

		for i in 0..chunk.capacity() {
			if let Some(row) = chunk.read_slot(i) {
				if bbox.map_or(true, |b| b.contains(&schema.point_of(&row))) {
					out.push(base + i as u64);
				}
			}
		}
		for j in 0..chunk.overflow_rows() {
			if let Some(row) = chunk.read_overflow(j) {
				if bbox.map_or(true, |b| b.contains(&schema.point_of(&row))) {
					out.push(base + capacity + j as u64);
				}
			}
		}
	}

	fn chunk_span(&self) -> u64 {
		self.metadata.tail_capacity + self.metadata.tail_overflow
	}

	fn chunk_index_base(&self, key: &Dxyz) -> u64 {
		let ordinal = self.registry.ordinal_of(key).unwrap_or(0);
		self.registry.slab().len() + ordinal * self.chunk_span()
	}

	/// Locates the chunk owning a global point index; `None` for the
	/// pinned slab or an out-of-range index.
	fn chunk_of_index(&self, index: u64) -> Option<Dxyz> {
		let slab_len = self.registry.slab().len();
		if index < slab_len {
			return None;
		}
		self.registry
			.key_of_ordinal((index - slab_len) / self.chunk_span())
	}

	/// Narrows a clipper to the single chunk containing `index`,
	/// releasing everything else it holds.
	pub fn clip(&self, clipper: &mut Clipper, index: u64) {
		clipper.clip_except(self.chunk_of_index(index));
	}

	/// The bytes of the point at `index`, arranged per the requested
	/// schema; empty if no point lives there.
	pub fn point_data(
		&self,
		clipper: Option<&mut Clipper>,
		index: u64,
		schema: &Schema,
	) -> Result<Vec<u8>> {
		let own = &self.metadata.schema;
		let slab = self.registry.slab();

		if index < slab.len() {
			return Ok(slab
				.read(index)
				.map(|row| own.translate(&row, schema))
				.unwrap_or_default());
		}

		let rel = index - slab.len();
		let span = self.chunk_span();
		let Some(key) = self.registry.key_of_ordinal(rel / span) else {
			return Ok(Vec::new());
		};

		let mut local = self.clipper();
		let clipper = match clipper {
			Some(c) => c,
			None => &mut local,
		};
		let chunk = self.registry.acquire(key, clipper)?;

		let slot = rel % span;
		let row = if slot < self.metadata.tail_capacity {
			chunk.read_slot(slot as usize)
		} else {
			chunk.read_overflow((slot - self.metadata.tail_capacity) as usize)
		};
		Ok(row.map(|r| own.translate(&r, schema)).unwrap_or_default())
	}

	/// Emits a rearranged, immutable export: depths below `base_depth` as
	/// one compact document, every remaining region rewritten (optionally
	/// compressed) with a manifest describing the layout. Idempotent for
	/// a fixed build.
	pub fn finalize(&self, path: &str, base_depth: u64, compress: bool) -> Result<()> {
		self.pool.join();
		self.registry.flush_all()?;

		let out = self.arbiter.endpoint(path)?;
		let schema = &self.metadata.schema;
		let structure = &self.metadata.structure;
		let dimensions = self.metadata.dimensions;
		let slab = self.registry.slab();
		let base_end = base_depth.min(structure.flat_depth);

		let mut entries = Vec::new();

		// Base document: every populated row below the rebase depth, in
		// slot order.
		let mut base = Vec::new();
		let mut base_points = 0u64;
		for slot in 0..structure.slab_offset(dimensions, base_end) {
			if let Some(row) = slab.read(slot) {
				base.extend_from_slice(&row);
				base_points += 1;
			}
		}
		out.put("base", &base)?;
		entries.push(ExportEntry {
			id: "base".to_string(),
			kind: "base".to_string(),
			points: base_points,
			compressed: false,
		});

		// Remaining flat depths, one compact slice per depth.
		for d in base_end..structure.flat_depth {
			let begin = structure.slab_offset(dimensions, d);
			let end = begin + structure.nodes_at(dimensions, d);
			let mut slice = Vec::new();
			let mut points = 0u64;
			for slot in begin..end {
				if let Some(row) = slab.read(slot) {
					slice.extend_from_slice(&row);
					points += 1;
				}
			}
			if points == 0 {
				continue;
			}
			let id = format!("{:02}", d);
			out.put(&id, &encode(slice, compress))?;
			entries.push(ExportEntry {
				id,
				kind: "slice".to_string(),
				points,
				compressed: compress,
			});
		}

		// Tail chunks, compacted to their populated rows.
		let mut clipper = self.clipper();
		for key in self.registry.chunk_keys() {
			let chunk = self.registry.acquire(key, &mut clipper)?;
			let mut rows = Vec::new();
			let mut points = 0u64;
			for i in 0..chunk.capacity() {
				if let Some(row) = chunk.read_slot(i) {
					rows.extend_from_slice(&row);
					points += 1;
				}
			}
			for j in 0..chunk.overflow_rows() {
				if let Some(row) = chunk.read_overflow(j) {
					rows.extend_from_slice(&row);
					points += 1;
				}
			}
			if points == 0 {
				continue;
			}
			let id = key.to_string();
			out.put(&id, &encode(rows, compress))?;
			entries.push(ExportEntry {
				id,
				kind: "chunk".to_string(),
				points,
				compressed: compress,
			});
			clipper.release_all();
		}

		let manifest = Manifest {
			version: META_VERSION.to_string(),
			base_depth,
			compress,
			row_width: schema.width() as u64,
			num_points: self.num_points(),
			entries,
		};
		out.put("manifest", &serde_json::to_vec_pretty(&manifest)?)?;
		info!(path, base_depth, compress, "export finished");
		Ok(())
	}
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportEntry {
	id: String,
	kind: String,
	points: u64,
	compressed: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
	version: String,
	base_depth: u64,
	compress: bool,
	row_width: u64,
	num_points: u64,
	entries: Vec<ExportEntry>,
}

fn encode(bytes: Vec<u8>, compress: bool) -> Vec<u8> {
	if compress {
		lz4_flex::compress_prepend_size(&bytes)
	} else {
		bytes
	}
}

/// Stages remote inputs into the scratch endpoint so readers always see a
/// local file.
fn stage(arbiter: &Arbiter, tmp: &Endpoint, path: &str) -> Result<String> {
	if !path.contains("://") {
		return Ok(path.to_string());
	}
	let bytes = arbiter
		.fetch(path)?
		.ok_or_else(|| Error::Source(format!("{} not found", path)))?;
	let name = Path::new(path)
		.file_name()
		.and_then(|n| n.to_str())
		.unwrap_or("staged")
		.to_string();
	tmp.put(&name, &bytes)?;
	Ok(format!("{}/{}", tmp.root().trim_end_matches('/'), name))
}

#[allow(clippy::too_many_arguments)]
fn insert_file(
	metadata: Arc<Metadata>,
	registry: Arc<Registry>,
	state: Arc<Mutex<BuildState>>,
	warp: Arc<dyn Warp>,
	arbiter: Arc<Arbiter>,
	tmp: Endpoint,
	origin: u64,
	path: &str,
) {
	let mut clipper = Clipper::new(registry.clone());
	let mut counts = Counts::default();

	let staged = match stage(&arbiter, &tmp, path) {
		Ok(staged) => staged,
		Err(e) => {
			warn!(origin, path, "skipping source: {}", e);
			return;
		}
	};

	let mut source = match reader::open(&staged) {
		Ok(source) => source,
		Err(e) => {
			warn!(origin, path, "skipping source: {}", e);
			return;
		}
	};

	loop {
		match source.next_point() {
			Ok(Some(raw)) => {
				if let Err(e) = insert_one(
					&metadata,
					&registry,
					warp.as_ref(),
					origin,
					raw.point,
					&raw.extras,
					&mut clipper,
					&mut counts,
				) {
					error!(origin, path, "insert failed: {}", e);
					registry.record_fatal(e.to_string());
					break;
				}
			}
			Ok(None) => break,
			Err(e) => {
				warn!(origin, path, "decode failed, rest of file skipped: {}", e);
				break;
			}
		}
	}

	{
		let mut state = state.lock();
		state.num_points += counts.points;
		state.num_tossed += counts.tossed;
		state.num_duplicates += counts.duplicates;
	}
	info!(
		origin,
		path,
		points = counts.points,
		tossed = counts.tossed,
		"file indexed"
	);
}

/// Drives one point down the tree: slab descent while node keys identify
/// storage, then the tail chunk's internal descent. At every contested
/// slot the loser continues down.
#[allow(clippy::too_many_arguments)]
fn insert_one(
	metadata: &Metadata,
	registry: &Registry,
	warp: &dyn Warp,
	origin: u64,
	point: Point,
	extras: &[(String, f64)],
	clipper: &mut Clipper,
	counts: &mut Counts,
) -> Result<()> {
	let point = warp.warp(point);
	if !metadata.bounds.contains(&point) {
		counts.tossed += 1;
		return Ok(());
	}

	let schema = &metadata.schema;
	let structure = &metadata.structure;
	let mut row = schema.pack(&point, extras, origin);
	let mut point = point;
	let mut ck = ChunkKey::new(
		metadata.bounds_cubic.clone(),
		metadata.dimensions,
		*structure,
	);

	while !ck.in_tail() {
		let mid = ck.bounds().mid();
		match registry
			.slab()
			.contend(ck.d, &ck.k.pos, &row, &point, &mid, schema)
		{
			SlotOutcome::Inserted => {
				counts.points += 1;
				return Ok(());
			}
			SlotOutcome::Duplicate => {
				counts.duplicates += 1;
				return Ok(());
			}
			SlotOutcome::Rejected => {
				let p = point;
				ck.step_point(&p);
			}
			SlotOutcome::Displaced(incumbent) => {
				row = incumbent;
				point = schema.point_of(&row);
				let p = point;
				ck.step_point(&p);
			}
		}
	}

	if structure.flat_depth == structure.disk_depth {
		// No tail region configured; whatever falls off the slab is lost.
		counts.tossed += 1;
		return Ok(());
	}

	let key = ck.get();
	let chunk = registry.acquire(key, clipper)?;
	match chunk.insert(row, point, schema, structure, metadata.dimensions) {
		TailInsert::Stored => counts.points += 1,
		TailInsert::Duplicate => counts.duplicates += 1,
		TailInsert::Exhausted => {
			counts.tossed += 1;
			error!(chunk = %key, "chunk full including overflow, point dropped");
		}
	}
	Ok(())
}
