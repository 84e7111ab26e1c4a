use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod fs;

pub use fs::FsDriver;

/// Byte-addressed key/value surface over a storage backend. The indexer
/// consumes only this; whether bytes land on a local disk or a remote
/// object store is the driver's business.
pub trait Driver: Send + Sync {
	fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
	fn put(&self, path: &str, data: &[u8]) -> Result<()>;
	fn exists(&self, path: &str) -> Result<bool>;
}

/// Routes paths to drivers by URI scheme. Plain paths go to the local
/// filesystem driver; remote drivers are registered by the caller.
pub struct Arbiter {
	drivers: HashMap<String, Arc<dyn Driver>>,
}

impl Arbiter {
	pub fn new() -> Arbiter {
		let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
		drivers.insert("file".to_string(), Arc::new(FsDriver));
		Arbiter { drivers }
	}

	pub fn register(&mut self, scheme: &str, driver: Arc<dyn Driver>) {
		self.drivers.insert(scheme.to_string(), driver);
	}

	/// One-shot read of a full path through whichever driver owns its
	/// scheme.
	pub fn fetch(&self, path: &str) -> Result<Option<Vec<u8>>> {
		let (scheme, rest) = split_scheme(path);
		let driver = self
			.drivers
			.get(scheme)
			.ok_or_else(|| Error::Config(format!("no driver registered for scheme {}", scheme)))?;
		driver.get(rest)
	}

	pub fn endpoint(&self, root: &str) -> Result<Endpoint> {
		let (scheme, path) = split_scheme(root);
		let driver = self
			.drivers
			.get(scheme)
			.ok_or_else(|| Error::Config(format!("no driver registered for scheme {}", scheme)))?;
		Ok(Endpoint {
			driver: driver.clone(),
			root: path.to_string(),
		})
	}
}

impl Default for Arbiter {
	fn default() -> Arbiter {
		Arbiter::new()
	}
}

fn split_scheme(path: &str) -> (&str, &str) {
	match path.split_once("://") {
		Some((scheme, rest)) => (scheme, rest),
		None => ("file", path),
	}
}

/// A driver plus a root prefix; all keys are resolved under the root.
#[derive(Clone)]
pub struct Endpoint {
	driver: Arc<dyn Driver>,
	root: String,
}

impl Endpoint {
	pub fn new(driver: Arc<dyn Driver>, root: &str) -> Endpoint {
		Endpoint {
			driver,
			root: root.to_string(),
		}
	}

	pub fn root(&self) -> &str {
		&self.root
	}

	fn full(&self, key: &str) -> String {
		if self.root.is_empty() {
			key.to_string()
		} else {
			format!("{}/{}", self.root.trim_end_matches('/'), key)
		}
	}

	pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
		self.driver.get(&self.full(key))
	}

	pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
		self.driver.put(&self.full(key), data)
	}

	pub fn exists(&self, key: &str) -> Result<bool> {
		self.driver.exists(&self.full(key))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_scheme_split() {
		assert_eq!(split_scheme("/tmp/build"), ("file", "/tmp/build"));
		assert_eq!(split_scheme("s3://bucket/index"), ("s3", "bucket/index"));
	}

	#[test]
	fn test_unknown_scheme_rejected() {
		let arbiter = Arbiter::new();
		assert!(arbiter.endpoint("s3://bucket/index").is_err());
		assert!(arbiter.endpoint("/tmp/anywhere").is_ok());
	}
}
