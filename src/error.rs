use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// Bad configuration: missing key, invalid geometry type, depth ordering.
	Config(String),
	/// Malformed tree address.
	Parse(String),
	/// A write to the build destination failed; the build cannot guarantee
	/// consistency past this point.
	Storage(String),
	/// An input file could not be opened or decoded.
	Source(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Config(m) => write!(f, "invalid config: {}", m),
			Error::Parse(m) => write!(f, "parse failure: {}", m),
			Error::Storage(m) => write!(f, "storage failure: {}", m),
			Error::Source(m) => write!(f, "unreadable source: {}", m),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Storage(e.to_string())
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Error {
		Error::Storage(e.to_string())
	}
}
