//! Block and inode allocation across groups.

use crate::bitmap;
use crate::error::{Ext2Error, Result};
use crate::image::Image;

/// Allocates a free block, preferring `preferred_group` and falling back to
/// scanning every other group in order.
pub fn alloc_block(img: &mut Image, preferred_group: u32) -> Result<u32> {
	let groups = img.groups_count();
	let limit = img.blocks_per_group() as usize;

	let mut order = vec![preferred_group];
	order.extend((0..groups).filter(|&g| g != preferred_group));

	for g in order {
		let bit = {
			let bm = img.read_block_bitmap(g)?;
			bitmap::allocate_first_free(&bm, limit)
		};
		if let Some(bit) = bit {
			img.with_block_bitmap_mut(g, |bm| bitmap::set(bm, bit))?;
			img.group_mut(g).free_blocks_count -= 1;
			img.superblock_mut().free_blocks_count -= 1;
			let block = img.first_data_block() + g * img.blocks_per_group() + (bit as u32 - 1);
			return Ok(block);
		}
	}
	Err(Ext2Error::ResourceExhaustion(
		"no free block left in any group".into(),
	))
}

/// Allocates a free inode using the "most free blocks among groups with at
/// least the average free-inode count" heuristic.
pub fn alloc_inode(img: &mut Image) -> Result<u32> {
	let groups = img.groups_count();
	let avg_free = img.free_inodes_count() / groups.max(1);

	let mut best: Option<(u32, u16)> = None;
	for g in 0..groups {
		let group = img.group(g);
		if group.free_inodes_count == 0 {
			continue;
		}
		if (group.free_inodes_count as u32) >= avg_free {
			let candidate_free_blocks = group.free_blocks_count;
			if best.map(|(_, b)| candidate_free_blocks > b).unwrap_or(true) {
				best = Some((g, candidate_free_blocks));
			}
		}
	}
	let group = match best {
		Some((g, _)) => g,
		None => (0..groups)
			.find(|&g| img.group(g).free_inodes_count > 0)
			.ok_or_else(|| Ext2Error::ResourceExhaustion("no free inode left".into()))?,
	};

	let limit = img.inodes_per_group() as usize;
	let bit = {
		let bm = img.read_inode_bitmap(group)?;
		bitmap::allocate_first_free(&bm, limit)
	}
	.ok_or_else(|| Ext2Error::ResourceExhaustion(format!("group {group} reported free inodes but bitmap is full")))?;

	img.with_inode_bitmap_mut(group, |bm| bitmap::set(bm, bit))?;
	img.group_mut(group).free_inodes_count -= 1;
	img.superblock_mut().free_inodes_count -= 1;

	Ok(img.inodes_per_group() * group + bit as u32)
}

/// Frees a previously allocated block.
pub fn free_block(img: &mut Image, block: u32) -> Result<()> {
	let group = img.group_for_block(block);
	let bit = (block - img.first_data_block() - group * img.blocks_per_group()) as usize + 1;
	img.with_block_bitmap_mut(group, |bm| bitmap::clear(bm, bit))?;
	img.group_mut(group).free_blocks_count += 1;
	img.superblock_mut().free_blocks_count += 1;
	Ok(())
}

/// Frees a previously allocated inode.
pub fn free_inode(img: &mut Image, ino: u32) -> Result<()> {
	let group = img.group_for_inode(ino);
	let bit = ((ino - 1) % img.inodes_per_group()) as usize + 1;
	img.with_inode_bitmap_mut(group, |bm| bitmap::clear(bm, bit))?;
	img.group_mut(group).free_inodes_count += 1;
	img.superblock_mut().free_inodes_count += 1;
	Ok(())
}
