//! Filesystem-building operations: turn inode/directory primitives into the
//! things an ingest layer actually needs (make a node, write a file, link a
//! name, fix up permissions).

use std::io::Read;

use crate::alloc::alloc_inode;
use crate::dir;
use crate::error::{Ext2Error, Result};
use crate::image::Image;
use crate::inode::{INode, S_IFBLK, S_IFCHR, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::superblock::{RO_COMPAT_LARGE_FILE, ROOT_INO};
use crate::walker;

/// Largest size that fits in a rev-0/rev-1 32-bit `i_size` before the
/// large-file ro-compat bit and revision bump are required.
const MAX_SMALL_FILE_SIZE: u64 = i32::MAX as u64;
/// Symlink targets shorter than this are stored inline in `i_block`
/// (15 slots * 4 bytes = 60 bytes) instead of as data blocks.
const INLINE_SYMLINK_LIMIT: usize = 60;

/// Builds the root directory's `.`/`..` block and inode. Called once, while
/// [`Image::create`] still owns every block and inode bitmap directly;
/// unlike [`mknod_fs`] the root inode is never linked into a parent.
pub(crate) fn init_root(img: &mut Image, timestamp: u32) -> Result<()> {
	let block_size = img.block_size() as usize;
	let raw = dir::format_dir_block(ROOT_INO, ROOT_INO, block_size, img.swap());
	let blk = crate::alloc::alloc_block(img, 0)?;
	img.write_block(blk, &raw)?;

	let mut inode = INode {
		mode: S_IFDIR | 0o755,
		links_count: 2,
		atime: timestamp,
		ctime: timestamp,
		mtime: timestamp,
		..Default::default()
	};
	inode.block[0] = blk;
	inode.set_size(block_size as u64);
	inode.blocks = block_size as u32 / 512;
	img.write_inode(ROOT_INO, &inode)?;
	img.group_mut(0).used_dirs_count += 1;
	Ok(())
}

/// Creates `lost+found` under root and pre-grows it to 16 blocks, so later
/// `e2fsck` recovery has somewhere to reattach orphaned inodes without
/// immediately running out of directory space.
pub(crate) fn init_lost_and_found(img: &mut Image, timestamp: u32) -> Result<()> {
	let ino = mknod_fs(img, ROOT_INO, b"lost+found", S_IFDIR | 0o700, 0, 0, None, timestamp)?;
	let mut inode = img.read_inode(ino)?;
	let block_size = img.block_size() as usize;
	let group_hint = img.group_for_inode(ino);
	let filler = dir::empty_record_block(block_size, img.swap());
	for l in 1..16u64 {
		walker::append_block(img, &mut inode, group_hint, l, &filler)?;
	}
	inode.set_size(block_size as u64 * 16);
	img.write_inode(ino, &inode)?;
	Ok(())
}

/// Rewrites `uid`/`gid`/`mode` per the image's squash settings: `squash_uids`
/// forces ownership to root, `squash_perms` copies the owner's permission
/// bits over the group and other bits, leaving the file-type and
/// setuid/setgid/sticky bits untouched.
fn apply_squash(img: &Image, uid: u16, gid: u16, mode: u16) -> (u16, u16, u16) {
	let (uid, gid) = if img.squash_uids() { (0, 0) } else { (uid, gid) };
	let mode = if img.squash_perms() {
		let owner_bits = (mode >> 6) & 0o7;
		(mode & !0o077) | (owner_bits << 3) | owner_bits
	} else {
		mode
	};
	(uid, gid, mode)
}

/// Allocates an inode of the given `mode`'s file type, fills in its
/// type-specific fields, and links it into `parent` under `name`.
///
/// Device nodes pack `minor` into `i_block[0]`'s low byte and `major` into
/// the next byte (`rdev` is ignored for every other type). Directories get
/// their initial `.`/`..` block and bump both their own and their parent's
/// link count; everything else is left with zero content for the caller to
/// fill in (see [`mkfile_fs`], [`mklink_fs`]). `uid`/`gid`/`mode` are passed
/// through [`apply_squash`] before being written, so `squash_uids`/
/// `squash_perms` apply uniformly to every node this crate creates.
pub fn mknod_fs(
	img: &mut Image,
	parent: u32,
	name: &[u8],
	mode: u16,
	uid: u16,
	gid: u16,
	rdev: Option<(u8, u8)>,
	timestamp: u32,
) -> Result<u32> {
	let (uid, gid, mode) = apply_squash(img, uid, gid, mode);
	let file_type = mode & S_IFMT;
	let effective_mode = if file_type == S_IFLNK { S_IFLNK | 0o777 } else { mode };

	let ino = alloc_inode(img)?;
	let mut inode = INode {
		mode: effective_mode,
		uid,
		gid,
		atime: timestamp,
		ctime: timestamp,
		mtime: timestamp,
		..Default::default()
	};

	match file_type {
		S_IFDIR => {
			let block_size = img.block_size() as usize;
			let raw = dir::format_dir_block(ino, parent, block_size, img.swap());
			let blk = crate::alloc::alloc_block(img, img.group_for_inode(ino))?;
			img.write_block(blk, &raw)?;
			inode.block[0] = blk;
			inode.set_size(block_size as u64);
			inode.blocks = block_size as u32 / 512;
			inode.links_count = 1;
		}
		S_IFCHR | S_IFBLK => {
			let (minor, major) = rdev.unwrap_or((0, 0));
			inode.block[0] = minor as u32 | ((major as u32) << 8);
		}
		_ => {}
	}

	img.write_inode(ino, &inode)?;
	dir::add2dir(img, parent, ino, name)?;

	if file_type == S_IFDIR {
		dir::bump_links(img, parent)?;
		let g = img.group_for_inode(ino);
		img.group_mut(g).used_dirs_count += 1;
	}

	Ok(ino)
}

/// `mknod_fs` with the directory bit forced on.
pub fn mkdir_fs(img: &mut Image, parent: u32, name: &[u8], mode: u16, uid: u16, gid: u16, timestamp: u32) -> Result<u32> {
	mknod_fs(img, parent, name, mode | S_IFDIR, uid, gid, None, timestamp)
}

/// Creates a symlink inode and writes `target` as its content: inline in
/// `i_block` under [`INLINE_SYMLINK_LIMIT`] bytes, as ordinary data blocks
/// otherwise.
pub fn mklink_fs(img: &mut Image, parent: u32, name: &[u8], target: &[u8], uid: u16, gid: u16, timestamp: u32) -> Result<u32> {
	let ino = mknod_fs(img, parent, name, S_IFLNK, uid, gid, None, timestamp)?;
	let mut inode = img.read_inode(ino)?;

	if target.len() < INLINE_SYMLINK_LIMIT {
		let mut raw = [0u8; INLINE_SYMLINK_LIMIT];
		raw[..target.len()].copy_from_slice(target);
		for (i, slot) in inode.block.iter_mut().enumerate() {
			*slot = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
		}
		inode.blocks = 0;
	} else {
		let block_size = img.block_size() as usize;
		let group_hint = img.group_for_inode(ino);
		let mut l = 0u64;
		let mut remaining = target;
		while !remaining.is_empty() {
			let take = remaining.len().min(block_size);
			let mut buf = vec![0u8; block_size];
			buf[..take].copy_from_slice(&remaining[..take]);
			walker::append_block(img, &mut inode, group_hint, l, &buf)?;
			remaining = &remaining[take..];
			l += 1;
		}
	}
	inode.set_size(target.len() as u64);
	img.write_inode(ino, &inode)?;
	Ok(ino)
}

/// Creates a regular file inode and copies `reader`'s content into it, 16
/// blocks at a time, zero-padding the final partial block.
pub fn mkfile_fs(
	img: &mut Image,
	parent: u32,
	name: &[u8],
	mode: u16,
	uid: u16,
	gid: u16,
	reader: &mut dyn Read,
	timestamp: u32,
) -> Result<u32> {
	let ino = mknod_fs(img, parent, name, S_IFREG | (mode & !S_IFMT), uid, gid, None, timestamp)?;
	let mut inode = img.read_inode(ino)?;

	let block_size = img.block_size() as usize;
	let group_hint = img.group_for_inode(ino);
	let mut chunk = vec![0u8; block_size * 16];
	let mut total = 0u64;
	let mut l = 0u64;

	loop {
		let n = fill(reader, &mut chunk)?;
		if n == 0 {
			break;
		}
		let mut off = 0;
		while off < n {
			let take = (n - off).min(block_size);
			let mut buf = vec![0u8; block_size];
			buf[..take].copy_from_slice(&chunk[off..off + take]);
			walker::append_block(img, &mut inode, group_hint, l, &buf)?;
			l += 1;
			off += take;
		}
		total += n as u64;
		if n < chunk.len() {
			break;
		}
	}

	inode.set_size(total);
	if total > MAX_SMALL_FILE_SIZE {
		let sb = img.superblock_mut();
		sb.rev_level = sb.rev_level.max(1);
		sb.feature_ro_compat |= RO_COMPAT_LARGE_FILE;
	}
	img.write_inode(ino, &inode)?;
	Ok(ino)
}

/// Reads until `buf` is full or the source is exhausted, returning the
/// number of bytes actually filled (0 means end of input).
fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
	let mut filled = 0;
	while filled < buf.len() {
		let n = reader.read(&mut buf[filled..]).map_err(Ext2Error::Io)?;
		if n == 0 {
			break;
		}
		filled += n;
	}
	Ok(filled)
}

/// Overwrites an inode's permission bits and ownership, preserving its file
/// format (`S_IFMT`) bits. Subject to `squash_uids`/`squash_perms` like
/// every other operation in this module (see [`apply_squash`]).
pub fn chmod_fs(img: &mut Image, ino: u32, mode: u16, uid: u16, gid: u16) -> Result<()> {
	let (uid, gid, mode) = apply_squash(img, uid, gid, mode);
	let mut inode = img.read_inode(ino)?;
	inode.mode = (inode.mode & S_IFMT) | (mode & !S_IFMT);
	inode.uid = uid;
	inode.gid = gid;
	img.write_inode(ino, &inode)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::config::ImageOptions;
	use std::io::Cursor;
	use std::path::PathBuf;

	fn scratch(name: &str) -> PathBuf {
		std::env::temp_dir().join(format!("ext2fs-fsops-test-{name}-{:?}", std::thread::current().id()))
	}

	fn fresh(name: &str) -> Image {
		let path = scratch(name);
		let opts = ImageOptions {
			block_size: 1024,
			blocks: 512,
			inodes: Some(64),
			..Default::default()
		};
		Image::create(&path, &opts).unwrap()
	}

	fn fresh_squashed(name: &str, squash_uids: bool, squash_perms: bool) -> Image {
		let path = scratch(name);
		let opts = ImageOptions {
			block_size: 1024,
			blocks: 512,
			inodes: Some(64),
			squash_uids,
			squash_perms,
			..Default::default()
		};
		Image::create(&path, &opts).unwrap()
	}

	#[test]
	fn mkfile_writes_content_and_size() {
		let mut img = fresh("mkfile");
		let mut reader = Cursor::new(b"hi".to_vec());
		let ino = mkfile_fs(&mut img, ROOT_INO, b"hello", 0o644, 0, 0, &mut reader, 1_000).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.size(), 2);
		assert_eq!(inode.blocks, 2);
		assert_eq!(dir::find(&mut img, ROOT_INO, b"hello").unwrap(), ino);
		let block = img.read_block(inode.block[0]).unwrap();
		assert_eq!(&block[..2], b"hi");
		assert!(block[2..].iter().all(|&b| b == 0));
	}

	#[test]
	fn mkdir_links_self_and_parent() {
		let mut img = fresh("mkdir");
		let root_before = img.read_inode(ROOT_INO).unwrap().links_count;
		let ino = mkdir_fs(&mut img, ROOT_INO, b"sub", 0o755, 0, 0, 1_000).unwrap();
		let sub = img.read_inode(ino).unwrap();
		assert!(sub.is_dir());
		assert_eq!(sub.links_count, 2);
		let root_after = img.read_inode(ROOT_INO).unwrap().links_count;
		assert_eq!(root_after, root_before + 1);
	}

	#[test]
	fn mklink_inline_vs_block_backed() {
		let mut img = fresh("mklink");
		let small = mklink_fs(&mut img, ROOT_INO, b"small", b"short-target", 0, 0, 1_000).unwrap();
		let small_inode = img.read_inode(small).unwrap();
		assert_eq!(small_inode.blocks, 0);

		let target = vec![b'x'; 4097];
		let big = mklink_fs(&mut img, ROOT_INO, b"big", &target, 0, 0, 1_000).unwrap();
		let big_inode = img.read_inode(big).unwrap();
		assert_eq!(big_inode.size(), 4097);
		assert!(big_inode.blocks > 0);
	}

	#[test]
	fn mknod_device_packs_major_minor() {
		let mut img = fresh("mknod");
		let ino = mknod_fs(&mut img, ROOT_INO, b"null", S_IFCHR | 0o666, 0, 0, Some((3, 1)), 1_000).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.block[0] & 0xff, 3);
		assert_eq!((inode.block[0] >> 8) & 0xff, 1);
	}

	#[test]
	fn chmod_preserves_file_type() {
		let mut img = fresh("chmod");
		let mut reader = Cursor::new(Vec::new());
		let ino = mkfile_fs(&mut img, ROOT_INO, b"f", 0o644, 0, 0, &mut reader, 1_000).unwrap();
		chmod_fs(&mut img, ino, 0o600, 1, 2).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.mode & S_IFMT, S_IFREG);
		assert_eq!(inode.mode & 0o7777, 0o600);
		assert_eq!(inode.uid, 1);
		assert_eq!(inode.gid, 2);
	}

	#[test]
	fn squash_uids_forces_root_ownership() {
		let mut img = fresh_squashed("squash-uids", true, false);
		let mut reader = Cursor::new(Vec::new());
		let ino = mkfile_fs(&mut img, ROOT_INO, b"f", 0o644, 1000, 1000, &mut reader, 1_000).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.uid, 0);
		assert_eq!(inode.gid, 0);

		chmod_fs(&mut img, ino, 0o600, 42, 42).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.uid, 0);
		assert_eq!(inode.gid, 0);
	}

	#[test]
	fn squash_perms_copies_owner_bits_onto_group_and_other() {
		let mut img = fresh_squashed("squash-perms", false, true);
		let mut reader = Cursor::new(Vec::new());
		let ino = mkfile_fs(&mut img, ROOT_INO, b"f", 0o741, 0, 0, &mut reader, 1_000).unwrap();
		let inode = img.read_inode(ino).unwrap();
		// Owner bits (7 = rwx) are copied onto both group and other, setuid/
		// setgid/sticky and the file-type bits are left alone.
		assert_eq!(inode.mode & 0o7777, 0o777);
		assert_eq!(inode.mode & S_IFMT, S_IFREG);
	}

	#[test]
	fn squash_off_by_default_leaves_ownership_and_perms_alone() {
		let mut img = fresh("squash-off");
		let mut reader = Cursor::new(Vec::new());
		let ino = mkfile_fs(&mut img, ROOT_INO, b"f", 0o741, 7, 9, &mut reader, 1_000).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.uid, 7);
		assert_eq!(inode.gid, 9);
		assert_eq!(inode.mode & 0o7777, 0o741);
	}
}
