//! Image lifecycle: create, load, and finalize a backing file as an ext2
//! image, plus the raw block/inode accessors every higher-level module
//! builds on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::bitmap;
use crate::cache::BlockCache;
use crate::config::ImageOptions;
use crate::error::{Ext2Error, Result};
use crate::fsops;
use crate::group::GroupDescriptor;
use crate::inode::{INode, INODE_SIZE, S_IFDIR};
use crate::superblock::{
	Superblock, ERRORS_CONTINUE, EXT2_MAGIC, FIRST_INO_REV0, ROOT_INO, STATE_CLEAN,
	SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use crate::store::BackingStore;

/// Number of unpinned blocks the cache keeps around before evicting.
const CACHE_MAX_FREE: usize = 64;
/// Minimum image size, in blocks, accepted by [`Image::load`].
const MIN_IMAGE_BLOCKS: u32 = 16;

/// Statistics returned by [`Image::finalize`].
#[derive(Debug, Clone, Copy)]
pub struct BuildSummary {
	pub blocks_used: u32,
	pub inodes_used: u32,
	pub groups: u32,
	pub image_bytes: u64,
}

/// An open ext2 image under construction or being read back.
pub struct Image {
	store: BackingStore,
	cache: BlockCache,
	pub(crate) sb: Superblock,
	pub(crate) groups: Vec<GroupDescriptor>,
	pub(crate) swap: bool,
	pub(crate) holes: bool,
	pub(crate) squash_uids: bool,
	pub(crate) squash_perms: bool,
}

impl Image {
	pub fn block_size(&self) -> u32 {
		self.sb.block_size()
	}

	pub fn swap(&self) -> bool {
		self.swap
	}

	pub fn holes_enabled(&self) -> bool {
		self.holes
	}

	pub fn squash_uids(&self) -> bool {
		self.squash_uids
	}

	pub fn squash_perms(&self) -> bool {
		self.squash_perms
	}

	pub fn groups_count(&self) -> u32 {
		self.groups.len() as u32
	}

	pub fn blocks_per_group(&self) -> u32 {
		self.sb.blocks_per_group
	}

	pub fn inodes_per_group(&self) -> u32 {
		self.sb.inodes_per_group
	}

	pub fn first_data_block(&self) -> u32 {
		self.sb.first_data_block
	}

	pub fn total_blocks(&self) -> u32 {
		self.sb.blocks_count
	}

	pub fn total_inodes(&self) -> u32 {
		self.sb.inodes_count
	}

	pub fn free_blocks_count(&self) -> u32 {
		self.sb.free_blocks_count
	}

	pub fn free_inodes_count(&self) -> u32 {
		self.sb.free_inodes_count
	}

	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	pub fn superblock_mut(&mut self) -> &mut Superblock {
		&mut self.sb
	}

	pub fn group(&self, g: u32) -> &GroupDescriptor {
		&self.groups[g as usize]
	}

	pub fn group_mut(&mut self, g: u32) -> &mut GroupDescriptor {
		&mut self.groups[g as usize]
	}

	pub fn group_for_block(&self, block: u32) -> u32 {
		(block - self.sb.first_data_block) / self.sb.blocks_per_group
	}

	pub fn group_for_inode(&self, ino: u32) -> u32 {
		(ino - 1) / self.sb.inodes_per_group
	}

	/// Reads a raw block into an owned buffer.
	pub fn read_block(&mut self, num: u32) -> Result<Vec<u8>> {
		let data = self.cache.get(&mut self.store, num)?.to_vec();
		self.cache.put(&mut self.store, num)?;
		Ok(data)
	}

	/// Overwrites a whole raw block.
	pub fn write_block(&mut self, num: u32, data: &[u8]) -> Result<()> {
		let slot = self.cache.get_mut(&mut self.store, num)?;
		slot.copy_from_slice(data);
		self.cache.mark_dirty(num);
		self.cache.put(&mut self.store, num)?;
		Ok(())
	}

	/// Pins block `num`, lets `f` mutate it in place, marks it dirty, and
	/// releases the pin.
	pub fn modify_block<F: FnOnce(&mut [u8])>(&mut self, num: u32, f: F) -> Result<()> {
		let slot = self.cache.get_mut(&mut self.store, num)?;
		f(slot);
		self.cache.mark_dirty(num);
		self.cache.put(&mut self.store, num)?;
		Ok(())
	}

	pub fn read_block_bitmap(&mut self, group: u32) -> Result<Vec<u8>> {
		self.read_block(self.groups[group as usize].block_bitmap)
	}

	pub fn with_block_bitmap_mut<F: FnOnce(&mut [u8])>(&mut self, group: u32, f: F) -> Result<()> {
		let num = self.groups[group as usize].block_bitmap;
		self.modify_block(num, f)
	}

	pub fn read_inode_bitmap(&mut self, group: u32) -> Result<Vec<u8>> {
		self.read_block(self.groups[group as usize].inode_bitmap)
	}

	pub fn with_inode_bitmap_mut<F: FnOnce(&mut [u8])>(&mut self, group: u32, f: F) -> Result<()> {
		let num = self.groups[group as usize].inode_bitmap;
		self.modify_block(num, f)
	}

	fn inode_location(&self, ino: u32) -> (u32, usize) {
		let group = self.group_for_inode(ino);
		let idx_in_group = (ino - 1) % self.sb.inodes_per_group;
		let inode_size = self.sb.inode_size() as u32;
		let per_block = self.block_size() / inode_size;
		let block = self.groups[group as usize].inode_table + idx_in_group / per_block;
		let offset = (idx_in_group % per_block) as usize * inode_size as usize;
		(block, offset)
	}

	pub fn read_inode(&mut self, ino: u32) -> Result<INode> {
		let (block, offset) = self.inode_location(ino);
		let raw = self.read_block(block)?;
		let mut buf = [0u8; INODE_SIZE];
		buf.copy_from_slice(&raw[offset..offset + INODE_SIZE]);
		Ok(INode::read_le(&buf, self.swap))
	}

	pub fn write_inode(&mut self, ino: u32, inode: &INode) -> Result<()> {
		let (block, offset) = self.inode_location(ino);
		let bytes = inode.write_le(self.swap);
		self.modify_block(block, |buf| {
			buf[offset..offset + INODE_SIZE].copy_from_slice(&bytes);
		})
	}

	/// Creates a brand-new image on disk at `path` per `opts`.
	pub fn create(path: &Path, opts: &ImageOptions) -> Result<Self> {
		validate_options(opts)?;

		let block_size = opts.block_size;
		let first_data_block = if block_size == 1024 { 1 } else { 0 };
		let blocks = opts.blocks;
		let bits_per_block = block_size * 8;

		let inodes = opts.inodes.unwrap_or_else(|| {
			let derived = (blocks as u64 * block_size as u64 / opts.bytes_per_inode as u64) as u32;
			derived.max(16)
		});
		let reserved_blocks = if opts.reserved_blocks > 0 {
			opts.reserved_blocks
		} else {
			(blocks as f64 * opts.reserved_fraction) as u32
		};

		let min_groups = utils::util::ceil_division(inodes, bits_per_block).max(1);
		let data_span = blocks - first_data_block;
		let groups = min_groups.max(utils::util::ceil_division(data_span, bits_per_block));

		let mut blocks_per_group =
			utils::util::round_up(utils::util::ceil_division(data_span as u64, groups as u64), 8)
				as u32;
		blocks_per_group = blocks_per_group.min(bits_per_block);

		let inode_size = 128u32;
		let inodes_per_unit = block_size / inode_size;
		let mut inodes_per_group =
			utils::util::round_up(utils::util::ceil_division(inodes, groups) as u64, inodes_per_unit as u64)
				as u32;
		inodes_per_group = inodes_per_group.max(16).min(bits_per_block);

		let gdt_blocks = utils::util::ceil_division(groups as u64 * 32, block_size as u64) as u32;
		let inode_table_blocks =
			utils::util::ceil_division(inodes_per_group as u64 * inode_size as u64, block_size as u64)
				as u32;

		let mut group_descs = Vec::with_capacity(groups as usize);
		let mut group_starts = Vec::with_capacity(groups as usize);
		for g in 0..groups {
			let group_start = first_data_block + g * blocks_per_group;
			group_starts.push(group_start);
			let meta_start = if g == 0 {
				group_start + 1 /* superblock */ + gdt_blocks
			} else {
				group_start
			};
			let block_bitmap = meta_start;
			let inode_bitmap = block_bitmap + 1;
			let inode_table = inode_bitmap + 1;
			group_descs.push(GroupDescriptor {
				block_bitmap,
				inode_bitmap,
				inode_table,
				free_blocks_count: 0,
				free_inodes_count: 0,
				used_dirs_count: 0,
			});
		}
		let last_group_data_start = group_descs[(groups - 1) as usize].inode_table + inode_table_blocks;
		if last_group_data_start > blocks {
			return Err(Ext2Error::Configuration(format!(
				"not enough blocks ({blocks}) to hold superblock, group descriptors, \
				 bitmaps and inode table for {groups} groups"
			)));
		}

		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path)
			.map_err(Ext2Error::Io)?;
		file.set_len(blocks as u64 * block_size as u64)
			.map_err(Ext2Error::Io)?;

		let swap = opts.byte_order.needs_swap();
		let store = BackingStore::new(file, block_size);
		let cache = BlockCache::new(CACHE_MAX_FREE);

		let mut volume_name = [0u8; 16];
		if let Some(label) = &opts.volume_label {
			let bytes = label.as_bytes();
			let n = bytes.len().min(16);
			volume_name[..n].copy_from_slice(&bytes[..n]);
		}
		let uuid = *uuid::Uuid::new_v4().as_bytes();
		let timestamp = opts.timestamp.unwrap_or_else(|| {
			utils::util::get_timestamp().as_secs() as u32
		});

		let sb = Superblock {
			inodes_count: inodes_per_group * groups,
			blocks_count: blocks,
			r_blocks_count: reserved_blocks,
			free_blocks_count: 0,
			free_inodes_count: 0,
			first_data_block,
			log_block_size: (block_size / 1024).trailing_zeros(),
			log_frag_size: (block_size / 1024).trailing_zeros(),
			blocks_per_group,
			frags_per_group: blocks_per_group,
			inodes_per_group,
			mtime: timestamp,
			wtime: timestamp,
			mnt_count: 0,
			max_mnt_count: 20,
			magic: EXT2_MAGIC,
			state: STATE_CLEAN,
			errors: ERRORS_CONTINUE,
			minor_rev_level: 0,
			lastcheck: timestamp,
			checkinterval: 0,
			creator_os: opts.creator_os.to_id(),
			rev_level: 1,
			def_resuid: 0,
			def_resgid: 0,
			first_ino: FIRST_INO_REV0,
			inode_size: inode_size as u16,
			block_group_nr: 0,
			feature_compat: 0,
			feature_incompat: 0,
			feature_ro_compat: 0,
			uuid,
			volume_name,
			last_mounted: [0; 64],
			algo_bitmap: 0,
			prealloc_blocks: 0,
			prealloc_dir_blocks: 0,
		};

		let mut img = Self {
			store,
			cache,
			sb,
			groups: group_descs,
			swap,
			holes: opts.holes,
			squash_uids: opts.squash_uids,
			squash_perms: opts.squash_perms,
		};

		for g in 0..groups {
			let group_start = group_starts[g as usize];
			let data_start = img.groups[g as usize].inode_table + inode_table_blocks;
			let meta_end = (data_start - group_start) as usize;
			let blocks_in_group = if g == groups - 1 {
				blocks - group_start
			} else {
				blocks_per_group
			} as usize;

			img.with_block_bitmap_mut(g, |bm| {
				bitmap::fill_prefix(bm, meta_end);
				bitmap::mark_range(bm, blocks_in_group, bits_per_block as usize);
			})?;
			let free_blocks = bitmap::count_free(&img.read_block_bitmap(g)?, bits_per_block as usize);
			img.groups[g as usize].free_blocks_count = free_blocks as u16;
			img.sb.free_blocks_count += free_blocks as u32;

			let reserved_here = if g == 0 {
				(FIRST_INO_REV0 - 1) as usize
			} else {
				0
			};
			let inodes_in_group = if g == groups - 1 {
				(img.sb.inodes_count - g * inodes_per_group) as usize
			} else {
				inodes_per_group as usize
			};
			img.with_inode_bitmap_mut(g, |bm| {
				bitmap::fill_prefix(bm, reserved_here);
				bitmap::mark_range(bm, inodes_in_group, bits_per_block as usize);
			})?;
			let free_inodes = bitmap::count_free(&img.read_inode_bitmap(g)?, bits_per_block as usize);
			img.groups[g as usize].free_inodes_count = free_inodes as u16;
			img.sb.free_inodes_count += free_inodes as u32;
		}

		fsops::init_root(&mut img, timestamp)?;
		if reserved_blocks > 0 || opts.reserved_fraction > 0.0 {
			fsops::init_lost_and_found(&mut img, timestamp)?;
		}

		Ok(img)
	}

	/// Opens an existing image file for inspection/extension.
	pub fn load(path: &Path) -> Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.open(path)
			.map_err(Ext2Error::Io)?;
		let len = file.metadata().map_err(Ext2Error::Io)?.len();
		if len == 0 || len % 1024 != 0 {
			return Err(Ext2Error::Corruption(
				"image size is not a positive multiple of 1024".into(),
			));
		}

		let mut probe = BackingStore::new(
			file.try_clone().map_err(Ext2Error::Io)?,
			1024,
		);
		let mut raw_sb = [0u8; SUPERBLOCK_SIZE];
		probe
			.read_at(SUPERBLOCK_OFFSET, &mut raw_sb)
			.map_err(Ext2Error::Io)?;
		let sb_le = Superblock::read_le(&raw_sb, false);
		let swap = sb_le.magic.swap_bytes() == EXT2_MAGIC;
		let sb = if swap {
			Superblock::read_le(&raw_sb, true)
		} else {
			sb_le
		};
		if sb.magic != EXT2_MAGIC {
			return Err(Ext2Error::Corruption("bad magic number".into()));
		}
		if sb.rev_level > 1 {
			return Err(Ext2Error::Corruption(format!(
				"unsupported revision {}",
				sb.rev_level
			)));
		}
		if sb.rev_level == 1 {
			if sb.first_ino != FIRST_INO_REV0 || sb.inode_size() != 128 {
				return Err(Ext2Error::Corruption(
					"unsupported rev1 inode layout".into(),
				));
			}
			let known_ro_compat = crate::superblock::RO_COMPAT_LARGE_FILE;
			if sb.feature_ro_compat & !known_ro_compat != 0 || sb.feature_incompat != 0 {
				return Err(Ext2Error::Corruption("unsupported feature bits".into()));
			}
		}
		if len < MIN_IMAGE_BLOCKS as u64 * sb.block_size() as u64 {
			return Err(Ext2Error::Corruption("image too small".into()));
		}

		let block_size = sb.block_size();
		let store = BackingStore::new(file, block_size);
		let mut img = Self {
			store,
			cache: BlockCache::new(CACHE_MAX_FREE),
			sb,
			groups: Vec::new(),
			swap,
			holes: false,
			squash_uids: false,
			squash_perms: false,
		};

		let groups_count = img.sb.groups_count();
		let gdt_start = img.sb.first_data_block + 1;
		let gd_size = crate::group::GROUP_DESC_SIZE as u64;
		let per_block = block_size as u64 / gd_size;
		let mut groups = Vec::with_capacity(groups_count as usize);
		for g in 0..groups_count {
			let block = gdt_start + (g as u64 / per_block) as u32;
			let raw = img.read_block(block)?;
			let off = ((g as u64 % per_block) * gd_size) as usize;
			let mut buf = [0u8; crate::group::GROUP_DESC_SIZE];
			buf.copy_from_slice(&raw[off..off + crate::group::GROUP_DESC_SIZE]);
			groups.push(GroupDescriptor::read_le(&buf, swap));
		}
		img.groups = groups;
		Ok(img)
	}

	fn write_group_descriptors(&mut self) -> Result<()> {
		let gdt_start = self.sb.first_data_block + 1;
		let gd_size = crate::group::GROUP_DESC_SIZE as u64;
		let per_block = self.block_size() as u64 / gd_size;
		for (g, desc) in self.groups.clone().iter().enumerate() {
			let block = gdt_start + (g as u64 / per_block) as u32;
			let off = ((g as u64 % per_block) * gd_size) as usize;
			let bytes = desc.write_le(self.swap);
			self.modify_block(block, |buf| {
				buf[off..off + crate::group::GROUP_DESC_SIZE].copy_from_slice(&bytes);
			})?;
		}
		Ok(())
	}

	/// Flushes all caches, writes the superblock and group descriptor
	/// table, and truncates the backing file to its final size.
	pub fn finalize(mut self) -> Result<BuildSummary> {
		self.write_group_descriptors()?;

		let leaked = self.cache.flush_all(&mut self.store)?;
		if leaked > 0 {
			return Err(Ext2Error::Corruption(format!(
				"{leaked} cache entries were still pinned at finalize"
			)));
		}

		let sb_bytes = self.sb.write_le(self.swap);
		self.store
			.write_at(SUPERBLOCK_OFFSET, &sb_bytes)
			.map_err(Ext2Error::Io)?;

		let total_bytes = self.sb.blocks_count as u64 * self.block_size() as u64;
		self.store.set_len(total_bytes).map_err(Ext2Error::Io)?;
		self.store.sync().map_err(Ext2Error::Io)?;

		Ok(BuildSummary {
			blocks_used: self.sb.blocks_count - self.sb.free_blocks_count,
			inodes_used: self.sb.inodes_count - self.sb.free_inodes_count,
			groups: self.groups.len() as u32,
			image_bytes: total_bytes,
		})
	}

	/// Streams the (not-yet-finalized) backing file's first `total_blocks`
	/// blocks to `out`, for `-o -` style stdout output.
	pub fn stream_to<W: Write>(&mut self, out: &mut W) -> Result<()> {
		let total = self.sb.blocks_count;
		self.store.copy_to(out, total).map_err(Ext2Error::Io)
	}
}

fn validate_options(opts: &ImageOptions) -> Result<()> {
	if !matches!(opts.block_size, 1024 | 2048 | 4096) {
		return Err(Ext2Error::Configuration(format!(
			"block size must be 1024, 2048 or 4096, got {}",
			opts.block_size
		)));
	}
	if opts.blocks < MIN_IMAGE_BLOCKS {
		return Err(Ext2Error::Configuration(format!(
			"at least {MIN_IMAGE_BLOCKS} blocks are required, got {}",
			opts.blocks
		)));
	}
	if let Some(label) = &opts.volume_label {
		if label.len() > 16 {
			return Err(Ext2Error::Configuration(
				"volume label must be at most 16 bytes".into(),
			));
		}
	}
	Ok(())
}

/// Convenience constant re-exported for callers that build a fresh root
/// directory outside [`Image::create`] (none currently do; kept alongside
/// the other reserved-inode constants for discoverability).
pub const DIR_MODE_DEFAULT: u16 = S_IFDIR | 0o755;
pub use crate::superblock::ROOT_INO as ROOT_INODE;

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::ImageOptions;
	use std::path::PathBuf;

	fn scratch_path(name: &str) -> PathBuf {
		std::env::temp_dir().join(format!("ext2fs-image-test-{name}-{:?}", std::thread::current().id()))
	}

	#[test]
	fn create_small_image_has_clean_root() {
		let path = scratch_path("small");
		let opts = ImageOptions {
			block_size: 1024,
			blocks: 64,
			inodes: Some(16),
			..Default::default()
		};
		let mut img = Image::create(&path, &opts).unwrap();
		assert_eq!(img.superblock().magic, EXT2_MAGIC);
		let root = img.read_inode(ROOT_INO).unwrap();
		assert!(root.is_dir());
		assert_eq!(root.links_count, 2);
		let _ = img.finalize();
		let _ = std::fs::remove_file(&path);
	}

	#[test]
	fn load_round_trips_a_freshly_created_image() {
		let path = scratch_path("roundtrip");
		let opts = ImageOptions {
			block_size: 1024,
			blocks: 64,
			inodes: Some(16),
			..Default::default()
		};
		let img = Image::create(&path, &opts).unwrap();
		let summary = img.finalize().unwrap();
		assert!(summary.blocks_used > 0);

		let mut loaded = Image::load(&path).unwrap();
		assert_eq!(loaded.superblock().magic, EXT2_MAGIC);
		let root = loaded.read_inode(ROOT_INO).unwrap();
		assert!(root.is_dir());
		std::fs::remove_file(&path).unwrap();
	}
}
