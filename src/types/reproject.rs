use serde::{Deserialize, Serialize};

use crate::types::point::Point;

/// Coordinate system pair carried through the build. An empty or omitted
/// pair means identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reprojection {
	#[serde(rename = "in", default)]
	pub from: String,
	#[serde(rename = "out", default)]
	pub to: String,
}

impl Reprojection {
	pub fn valid(&self) -> bool {
		!self.from.is_empty() && !self.to.is_empty()
	}
}

/// Warps points between coordinate systems. The warp implementation is a
/// collaborator supplied by the caller; the indexer only applies it.
pub trait Warp: Send + Sync {
	fn warp(&self, p: Point) -> Point;
}

pub struct Identity;

impl Warp for Identity {
	fn warp(&self, p: Point) -> Point {
		p
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_validity() {
		assert!(!Reprojection::default().valid());
		let r = Reprojection {
			from: "EPSG:26915".to_string(),
			to: "EPSG:3857".to_string(),
		};
		assert!(r.valid());
	}

	#[test]
	fn test_identity_warp() {
		let p = Point::new(1.0, 2.0, 3.0);
		assert_eq!(Identity.warp(p), p);
	}
}
