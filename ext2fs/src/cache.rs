//! A pinned, writeback cache of fixed-size blocks.
//!
//! Block numbers hash into a map of entries; each entry tracks a use count
//! and a monotonically increasing "last touched" tick. Adding an entry past
//! `max_free` unpinned slots evicts the least-recently-touched unpinned
//! entry, writing it back first if dirty. This replaces the historical
//! bucketed-intrusive-list design (see `original_source/cache.h` for the
//! pattern it descends from) with an index keyed directly by block number
//! and a scan-based LRU victim search, which keeps the borrow-checker-safe
//! surface simple: callers address entries by key instead of holding a
//! pinning handle across other cache calls.

use std::collections::HashMap;
use std::io;

use crate::store::BackingStore;

struct Entry {
	data: Vec<u8>,
	dirty: bool,
	use_count: u32,
	last_touched: u64,
}

/// A cache of blocks backed by a [`BackingStore`].
pub struct BlockCache {
	entries: HashMap<u32, Entry>,
	max_free: usize,
	tick: u64,
}

impl BlockCache {
	pub fn new(max_free: usize) -> Self {
		Self {
			entries: HashMap::new(),
			max_free,
			tick: 0,
		}
	}

	fn next_tick(&mut self) -> u64 {
		self.tick += 1;
		self.tick
	}

	/// Pins block `num`, loading it from `store` if not already cached, and
	/// returns a reference to its bytes. The pin must be matched with
	/// [`BlockCache::put`].
	pub fn get(&mut self, store: &mut BackingStore, num: u32) -> io::Result<&[u8]> {
		self.ensure_loaded(store, num)?;
		let tick = self.next_tick();
		let entry = self.entries.get_mut(&num).unwrap();
		entry.use_count += 1;
		entry.last_touched = tick;
		Ok(&entry.data)
	}

	/// Pins block `num` for mutation; the caller must call
	/// [`BlockCache::mark_dirty`] after writing through the returned slice.
	pub fn get_mut(&mut self, store: &mut BackingStore, num: u32) -> io::Result<&mut [u8]> {
		self.ensure_loaded(store, num)?;
		let tick = self.next_tick();
		let entry = self.entries.get_mut(&num).unwrap();
		entry.use_count += 1;
		entry.last_touched = tick;
		Ok(&mut entry.data)
	}

	pub fn mark_dirty(&mut self, num: u32) {
		if let Some(entry) = self.entries.get_mut(&num) {
			entry.dirty = true;
		}
	}

	/// Releases one pin on block `num`. Calling this on a block with no
	/// outstanding pins is a logic error in the caller and is fatal, matching
	/// the historical source's behavior for an unbalanced `put_blk`.
	pub fn put(&mut self, store: &mut BackingStore, num: u32) -> io::Result<()> {
		let entry = self
			.entries
			.get_mut(&num)
			.expect("put on a block not present in the cache");
		assert!(entry.use_count > 0, "unbalanced cache put for block {num}");
		entry.use_count -= 1;
		self.evict_excess(store)
	}

	fn ensure_loaded(&mut self, store: &mut BackingStore, num: u32) -> io::Result<()> {
		if self.entries.contains_key(&num) {
			return Ok(());
		}
		let data = store.read_block(num)?;
		self.entries.insert(
			num,
			Entry {
				data,
				dirty: false,
				use_count: 0,
				last_touched: 0,
			},
		);
		Ok(())
	}

	fn evict_excess(&mut self, store: &mut BackingStore) -> io::Result<()> {
		loop {
			let unpinned = self.entries.values().filter(|e| e.use_count == 0).count();
			if unpinned <= self.max_free {
				return Ok(());
			}
			let victim = self
				.entries
				.iter()
				.filter(|(_, e)| e.use_count == 0)
				.min_by_key(|(_, e)| e.last_touched)
				.map(|(&num, _)| num);
			let Some(num) = victim else {
				return Ok(());
			};
			let entry = self.entries.remove(&num).unwrap();
			if entry.dirty {
				store.write_block(num, &entry.data)?;
			}
		}
	}

	/// Writes back every dirty entry and drops the cache. Returns the number
	/// of entries that were still pinned (use_count > 0) at the time of the
	/// call; a non-zero result means the caller leaked a pin and the image
	/// cannot be trusted to be fully flushed.
	pub fn flush_all(&mut self, store: &mut BackingStore) -> io::Result<usize> {
		let mut leaked = 0;
		for (&num, entry) in self.entries.iter() {
			if entry.use_count > 0 {
				leaked += 1;
			}
			if entry.dirty {
				store.write_block(num, &entry.data)?;
			}
		}
		self.entries.clear();
		Ok(leaked)
	}
}
