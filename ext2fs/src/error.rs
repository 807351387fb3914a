//! Error taxonomy for image construction.

use std::fmt;
use std::io;

/// An error produced while building or loading an ext2 image.
///
/// There is no partial success: any variant aborts the current build. Callers
/// are expected to propagate this with `?` up to the command-line boundary,
/// which is the only place that prints a message and exits.
#[derive(Debug)]
pub enum Ext2Error {
	/// An option passed at image construction is invalid or inconsistent with
	/// the others (bad block size, too few blocks for the requested inode
	/// count, an oversized volume label, ...).
	Configuration(String),
	/// No free block or inode remained to satisfy an allocation.
	ResourceExhaustion(String),
	/// The on-disk structure being read is inconsistent (bad magic,
	/// unsupported revision or feature bits, an allocated-but-unmarked
	/// block, a directory record overflowing its block, a cache that did
	/// not drain to zero on finalize, ...).
	Corruption(String),
	/// A read, write, seek or truncate on the backing file failed.
	Io(io::Error),
	/// The material handed to the core by its caller (an ingest path that
	/// does not exist, a malformed device-table line, ...) was invalid.
	Input(String),
}

impl fmt::Display for Ext2Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
			Self::ResourceExhaustion(msg) => write!(f, "resource exhausted: {msg}"),
			Self::Corruption(msg) => write!(f, "corrupt filesystem: {msg}"),
			Self::Io(err) => write!(f, "i/o error: {err}"),
			Self::Input(msg) => write!(f, "invalid input: {msg}"),
		}
	}
}

impl std::error::Error for Ext2Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io(err) => Some(err),
			_ => None,
		}
	}
}

impl From<io::Error> for Ext2Error {
	fn from(err: io::Error) -> Self {
		Self::Io(err)
	}
}

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Ext2Error>;
