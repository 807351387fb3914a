//! Maps an inode's logical data-block index to a physical block, allocating
//! or freeing indirection blocks as needed.
//!
//! Rather than a resumable state machine mirroring the historical source's
//! `bpdir/bpind/bpdind/bptind` cursor one step at a time, this computes the
//! direct/indirect/double-indirect/triple-indirect path for a logical block
//! index directly (the same closed-form mapping ext2 readers use), because
//! every caller in this crate either appends strictly at the tail or
//! truncates the whole tree — there is no need to resume a paused walk.
//! Index 11 of `i_block` is never assigned, preserving the historical
//! 11-direct-blocks-plus-gap layout (see [`crate::inode`]).

use crate::alloc::{alloc_block, free_block};
use crate::endian::{ru32, wu32};
use crate::error::Result;
use crate::image::Image;
use crate::inode::{INode, DIND_BLOCK, IND_BLOCK, NDIR_BLOCKS, TIND_BLOCK};

fn pointers_per_block(block_size: u32) -> u64 {
	block_size as u64 / 4
}

enum Region {
	Direct(usize),
	Indirect { top_slot: usize, indices: Vec<usize> },
}

fn locate(l: u64, ppb: u64) -> Option<Region> {
	if l < NDIR_BLOCKS as u64 {
		return Some(Region::Direct(l as usize));
	}
	let l2 = l - NDIR_BLOCKS as u64;
	if l2 < ppb {
		return Some(Region::Indirect {
			top_slot: IND_BLOCK,
			indices: vec![l2 as usize],
		});
	}
	let l3 = l2 - ppb;
	if l3 < ppb * ppb {
		return Some(Region::Indirect {
			top_slot: DIND_BLOCK,
			indices: vec![(l3 / ppb) as usize, (l3 % ppb) as usize],
		});
	}
	let l4 = l3 - ppb * ppb;
	if l4 < ppb * ppb * ppb {
		return Some(Region::Indirect {
			top_slot: TIND_BLOCK,
			indices: vec![
				(l4 / (ppb * ppb)) as usize,
				((l4 / ppb) % ppb) as usize,
				(l4 % ppb) as usize,
			],
		});
	}
	None
}

/// Largest logical block index (exclusive) an inode's block tree can hold.
pub fn capacity(block_size: u32) -> u64 {
	let ppb = pointers_per_block(block_size);
	NDIR_BLOCKS as u64 + ppb + ppb * ppb + ppb * ppb * ppb
}

fn read_block_map(img: &mut Image, num: u32) -> Result<Vec<u32>> {
	let raw = img.read_block(num)?;
	let swap = img.swap();
	let count = raw.len() / 4;
	Ok((0..count).map(|i| ru32(&raw, i * 4, swap)).collect())
}

fn write_block_map(img: &mut Image, num: u32, values: &[u32]) -> Result<()> {
	let block_size = img.block_size() as usize;
	let swap = img.swap();
	let mut raw = vec![0u8; block_size];
	for (i, &v) in values.iter().enumerate() {
		wu32(&mut raw, i * 4, v, swap);
	}
	img.write_block(num, &raw)
}

/// Returns the physical block number backing logical data-block index `l`,
/// or 0 if it is a hole or past the end of the allocated tree. Never
/// allocates.
pub fn read_logical(img: &mut Image, inode: &INode, l: u64) -> Result<u32> {
	let ppb = pointers_per_block(img.block_size());
	let region = match locate(l, ppb) {
		Some(r) => r,
		None => return Ok(0),
	};
	match region {
		Region::Direct(idx) => Ok(inode.block[idx]),
		Region::Indirect { top_slot, indices } => {
			let mut current = inode.block[top_slot];
			if current == 0 {
				return Ok(0);
			}
			let last = indices.len() - 1;
			for (depth, &idx) in indices.iter().enumerate() {
				let entries = read_block_map(img, current)?;
				let v = entries[idx];
				if depth == last {
					return Ok(v);
				}
				if v == 0 {
					return Ok(0);
				}
				current = v;
			}
			unreachable!()
		}
	}
}

/// Appends one logical data block (index `l`, 0-based among data blocks
/// only) to `inode`, allocating any indirection blocks lazily. `data` must
/// be exactly one block long. If `data` is all zeros and holes are enabled
/// on the image, no block is allocated and the slot is left as a hole.
pub fn append_block(img: &mut Image, inode: &mut INode, group_hint: u32, l: u64, data: &[u8]) -> Result<()> {
	let ppb = pointers_per_block(img.block_size());
	let region = locate(l, ppb).ok_or_else(|| {
		crate::error::Ext2Error::ResourceExhaustion(format!(
			"logical block {l} exceeds the triple-indirect capacity"
		))
	})?;

	let is_hole = img.holes_enabled() && data.iter().all(|&b| b == 0);
	let sectors_per_block = (img.block_size() / 512) as u32;
	let mut newly_allocated_meta = 0u32;

	match region {
		Region::Direct(idx) => {
			let blk = if is_hole {
				0
			} else {
				alloc_block(img, group_hint)?
			};
			if blk != 0 {
				img.write_block(blk, data)?;
			}
			inode.block[idx] = blk;
		}
		Region::Indirect { top_slot, indices } => {
			if inode.block[top_slot] == 0 {
				let new_blk = alloc_block(img, group_hint)?;
				write_block_map(img, new_blk, &vec![0u32; ppb as usize])?;
				inode.block[top_slot] = new_blk;
				newly_allocated_meta += 1;
			}
			let mut current = inode.block[top_slot];
			let last = indices.len() - 1;
			for (depth, &idx) in indices.iter().enumerate() {
				let mut entries = read_block_map(img, current)?;
				if depth == last {
					let blk = if is_hole {
						0
					} else {
						alloc_block(img, group_hint)?
					};
					if blk != 0 {
						img.write_block(blk, data)?;
					}
					entries[idx] = blk;
					write_block_map(img, current, &entries)?;
				} else {
					if entries[idx] == 0 {
						let new_blk = alloc_block(img, group_hint)?;
						write_block_map(img, new_blk, &vec![0u32; ppb as usize])?;
						entries[idx] = new_blk;
						write_block_map(img, current, &entries)?;
						newly_allocated_meta += 1;
					}
					current = entries[idx];
				}
			}
		}
	}

	let data_blocks_allocated = if is_hole { 0 } else { 1 };
	inode.blocks += (data_blocks_allocated + newly_allocated_meta) * sectors_per_block;
	Ok(())
}

/// Frees every block (data and indirection) reachable from `inode`'s block
/// tree and resets it to empty.
pub fn truncate(img: &mut Image, inode: &mut INode) -> Result<()> {
	for slot in inode.block.iter_mut().take(NDIR_BLOCKS) {
		if *slot != 0 {
			free_block(img, *slot)?;
			*slot = 0;
		}
	}
	free_indirect(img, inode.block[IND_BLOCK], 1)?;
	inode.block[IND_BLOCK] = 0;
	free_indirect(img, inode.block[DIND_BLOCK], 2)?;
	inode.block[DIND_BLOCK] = 0;
	free_indirect(img, inode.block[TIND_BLOCK], 3)?;
	inode.block[TIND_BLOCK] = 0;
	inode.blocks = 0;
	Ok(())
}

fn free_indirect(img: &mut Image, ptr: u32, levels: u32) -> Result<()> {
	if ptr == 0 {
		return Ok(());
	}
	let entries = read_block_map(img, ptr)?;
	for &e in &entries {
		if e == 0 {
			continue;
		}
		if levels == 1 {
			free_block(img, e)?;
		} else {
			free_indirect(img, e, levels - 1)?;
		}
	}
	free_block(img, ptr)
}
