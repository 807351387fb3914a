//! Hardlink detection across ingested source files.
//!
//! Keyed by the producer's `(device, inode)` identity. A `HashMap` gives
//! O(1) lookup, an upgrade over the historical source's linear scan of a
//! chunk-grown array; the observable behavior (one inode per distinct
//! `(dev, ino)`, one directory entry per occurrence) is unchanged.

use std::collections::HashMap;

/// Tracks which `(dev, ino)` source identities have already produced an
/// image inode, so later occurrences only add a directory entry.
#[derive(Debug, Default)]
pub struct HardlinkTable {
	seen: HashMap<(u64, u64), u32>,
}

impl HardlinkTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns the already-created image inode for `(dev, ino)`, if any.
	pub fn lookup(&self, dev: u64, ino: u64) -> Option<u32> {
		self.seen.get(&(dev, ino)).copied()
	}

	/// Records that `(dev, ino)` now maps to image inode `image_ino`.
	pub fn record(&mut self, dev: u64, ino: u64, image_ino: u32) {
		self.seen.insert((dev, ino), image_ino);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn records_and_looks_up() {
		let mut table = HardlinkTable::new();
		assert_eq!(table.lookup(1, 2), None);
		table.record(1, 2, 42);
		assert_eq!(table.lookup(1, 2), Some(42));
	}
}
