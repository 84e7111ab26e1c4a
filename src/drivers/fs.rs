use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::drivers::Driver;
use crate::error::{Error, Result};

/// Local filesystem driver. Writes go through a sibling temp file and a
/// rename so a crash never leaves a half-written object behind.
pub struct FsDriver;

impl Driver for FsDriver {
	fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
		match fs::read(path) {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(Error::Storage(format!("read {}: {}", path, e))),
		}
	}

	fn put(&self, path: &str, data: &[u8]) -> Result<()> {
		let target = Path::new(path);
		if let Some(parent) = target.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)
					.map_err(|e| Error::Storage(format!("mkdir {}: {}", parent.display(), e)))?;
			}
		}

		let tmp = format!("{}.tmp", path);
		fs::write(&tmp, data).map_err(|e| Error::Storage(format!("write {}: {}", tmp, e)))?;
		fs::rename(&tmp, target)
			.map_err(|e| Error::Storage(format!("rename {} -> {}: {}", tmp, path, e)))?;
		Ok(())
	}

	fn exists(&self, path: &str) -> Result<bool> {
		Ok(Path::new(path).exists())
	}
}
