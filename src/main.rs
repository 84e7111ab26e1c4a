use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};

use entwine::config::{Config, Credentials};
use entwine::drivers::Arbiter;
use entwine::tree::builder::Builder;

fn main() {
	tracing_subscriber::fmt().init();
	if let Err(e) = run() {
		error!("{:#}", e);
		std::process::exit(1);
	}
}

fn run() -> Result<()> {
	let args: Vec<String> = std::env::args().collect();
	if args.len() < 2 {
		bail!("input file required\n\tusage: entwine <config> [-c <credentials>]");
	}
	let config_path = &args[1];

	let mut cred_path = "credentials.json".to_string();
	if args.len() == 4 && args[2] == "-c" {
		cred_path = args[3].clone();
	}

	let config = Config::from_file(config_path)?;
	let options = config.build_options()?;
	let snapshot = config.tuning.snapshot;

	// Credentials feed remote object-store drivers, which register on the
	// arbiter; only the local filesystem driver ships here.
	let arbiter = Arc::new(Arbiter::new());
	if let Ok(bytes) = std::fs::read(&cred_path) {
		let _: Credentials = serde_json::from_slice(&bytes)
			.with_context(|| format!("parsing {}", cred_path))?;
		warn!(
			path = cred_path.as_str(),
			"credentials parsed but no remote driver is registered"
		);
	}

	let endpoint = arbiter.endpoint(&config.build.path)?;
	let builder = if endpoint.exists("meta")? {
		info!(
			inputs = config.input.len(),
			build = config.build.path.as_str(),
			tmp = config.build.tmp.as_str(),
			threads = config.tuning.threads,
			snapshot,
			"continuing previous index"
		);
		Builder::resume(
			arbiter.clone(),
			&config.build.path,
			&config.build.tmp,
			config.tuning.threads,
		)?
	} else {
		info!(
			inputs = config.input.len(),
			build = config.build.path.as_str(),
			tmp = config.build.tmp.as_str(),
			export = config.output.export.as_str(),
			tree_type = config.geometry.r#type.as_str(),
			base_depth = config.build.tree.base_depth,
			flat_depth = config.build.tree.flat_depth,
			disk_depth = config.build.tree.disk_depth,
			threads = config.tuning.threads,
			snapshot,
			"starting new index"
		);
		Builder::create(arbiter.clone(), &config.build.path, &config.build.tmp, options)?
	};

	let start = Instant::now();
	for (i, input) in config.input.iter().enumerate() {
		builder.insert(input);
		if snapshot != 0 && (i as u64 + 1) % snapshot == 0 {
			builder.save()?;
		}
	}
	builder.join();
	info!(
		seconds = start.elapsed().as_secs(),
		points = builder.num_points(),
		tossed = builder.num_tossed(),
		"indexing complete"
	);

	info!("saving to build location");
	builder.save()?;

	if !config.output.export.is_empty() {
		info!(export = config.output.export.as_str(), "exporting");
		builder.finalize(
			&config.output.export,
			config.output.base_depth,
			config.output.compress,
		)?;
	}

	info!("finished");
	Ok(())
}
