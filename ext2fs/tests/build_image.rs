//! End-to-end and boundary-case tests exercising a built image the way a
//! caller of the library actually would: through `Image` and `fsops`, never
//! by poking at bitmaps or inodes directly.

use std::io::Cursor;
use std::path::PathBuf;

use ext2fs::inode::S_IFCHR;
use ext2fs::superblock::EXT2_MAGIC;
use ext2fs::{dir, fsops, walker, Image, ImageOptions, ROOT_INODE};

fn scratch(name: &str) -> PathBuf {
	std::env::temp_dir().join(format!("ext2fs-integration-{name}-{:?}", std::thread::current().id()))
}

fn fresh(name: &str, blocks: u32, inodes: u32) -> Image {
	let opts = ImageOptions {
		block_size: 1024,
		blocks,
		inodes: Some(inodes),
		..Default::default()
	};
	Image::create(&scratch(name), &opts).unwrap()
}

#[test]
fn scenario_empty_image_has_clean_root() {
	let mut img = fresh("scenario1", 64, 16);
	assert_eq!(img.superblock().magic, EXT2_MAGIC);
	assert_eq!(dir::find_path(&mut img, ROOT_INODE, "/").unwrap(), ROOT_INODE);
	assert_eq!(dir::find(&mut img, ROOT_INODE, b".").unwrap(), ROOT_INODE);
	assert_eq!(dir::find(&mut img, ROOT_INODE, b"..").unwrap(), ROOT_INODE);
}

#[test]
fn scenario_single_small_file() {
	let mut img = fresh("scenario2", 64, 16);
	let mut reader = Cursor::new(b"hi".to_vec());
	let ino = fsops::mkfile_fs(&mut img, ROOT_INODE, b"hello", 0o644, 0, 0, &mut reader, 1_000).unwrap();
	assert_eq!(dir::find_path(&mut img, ROOT_INODE, "/hello").unwrap(), ino);

	let inode = img.read_inode(ino).unwrap();
	assert_eq!(inode.size(), 2);
	assert_eq!(inode.blocks, 2);

	let block = img.read_block(inode.block[0]).unwrap();
	assert_eq!(&block[..2], b"hi");
	assert!(block[2..].iter().all(|&b| b == 0));
}

#[test]
fn scenario_thirteen_files_each_spill_into_one_indirect_block() {
	let mut img = fresh("scenario3", 2048, 64);
	let before = img.free_blocks_count();

	let file_size = 11 * 1024 + 1;
	for i in 0..13 {
		let mut reader = Cursor::new(vec![b'a'; file_size]);
		let name = format!("f{i}");
		let ino = fsops::mkfile_fs(&mut img, ROOT_INODE, name.as_bytes(), 0o644, 0, 0, &mut reader, 1_000).unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert!(inode.block[..11].iter().all(|&b| b != 0), "all 11 direct blocks allocated");
		assert_ne!(inode.block[12], 0, "single-indirect pointer allocated");
		let indirect = img.read_block(inode.block[12]).unwrap();
		let first_entry = u32::from_le_bytes([indirect[0], indirect[1], indirect[2], indirect[3]]);
		assert_ne!(first_entry, 0, "one populated slot in the indirect block");
	}

	let after = img.free_blocks_count();
	assert_eq!(before - after, 13 * (11 + 1 + 1));
}

#[test]
fn scenario_symlinks_inline_vs_block_backed() {
	let mut img = fresh("scenario4", 64, 16);

	let big_target = vec![b'x'; 4097];
	let big = fsops::mklink_fs(&mut img, ROOT_INODE, b"big", &big_target, 0, 0, 1_000).unwrap();
	let big_inode = img.read_inode(big).unwrap();
	assert_eq!(big_inode.size(), 4097);
	assert!(big_inode.blocks > 0, "large target is not stored inline");
	let mut read_back = Vec::new();
	let count = (big_inode.size() + 1023) / 1024;
	for l in 0..count {
		let blk = walker::read_logical(&mut img, &big_inode, l).unwrap();
		read_back.extend_from_slice(&img.read_block(blk).unwrap());
	}
	read_back.truncate(big_inode.size() as usize);
	assert_eq!(read_back, big_target);

	let small_target = vec![b'y'; 59];
	let small = fsops::mklink_fs(&mut img, ROOT_INODE, b"small", &small_target, 0, 0, 1_000).unwrap();
	let small_inode = img.read_inode(small).unwrap();
	assert_eq!(small_inode.size(), 59);
	assert_eq!(small_inode.blocks, 0, "short target is stored inline");
}

#[test]
fn scenario_device_table_style_char_device() {
	let mut img = fresh("scenario5", 64, 16);
	// major=1, minor=3, as in `/dev/null c 0666 0 0 1 3 0 0 0`.
	let ino = fsops::mknod_fs(&mut img, ROOT_INODE, b"null", S_IFCHR | 0o666, 0, 0, Some((3, 1)), 1_000).unwrap();
	let inode = img.read_inode(ino).unwrap();
	assert_eq!(inode.block[0] & 0xff, 3);
	assert_eq!((inode.block[0] >> 8) & 0xff, 1);
}

#[test]
fn scenario_two_sources_sharing_dev_ino_produce_one_inode() {
	let mut img = fresh("scenario6", 64, 16);
	let mut reader = Cursor::new(b"shared".to_vec());
	let ino = fsops::mkfile_fs(&mut img, ROOT_INODE, b"first", 0o644, 0, 0, &mut reader, 1_000).unwrap();
	dir::add2dir(&mut img, ROOT_INODE, ino, b"second").unwrap();

	let inode = img.read_inode(ino).unwrap();
	assert_eq!(inode.links_count, 2);
	assert_eq!(dir::find(&mut img, ROOT_INODE, b"first").unwrap(), ino);
	assert_eq!(dir::find(&mut img, ROOT_INODE, b"second").unwrap(), ino);
}

#[test]
fn boundary_exactly_direct_capacity_uses_no_indirect_block() {
	let mut img = fresh("boundary-direct", 64, 16);
	let mut reader = Cursor::new(vec![b'a'; 11 * 1024]);
	let ino = fsops::mkfile_fs(&mut img, ROOT_INODE, b"f", 0o644, 0, 0, &mut reader, 1_000).unwrap();
	let inode = img.read_inode(ino).unwrap();
	assert!(inode.block[..11].iter().all(|&b| b != 0));
	assert_eq!(inode.block[12], 0, "no single-indirect block needed yet");
}

#[test]
fn boundary_one_byte_past_direct_capacity_allocates_indirect() {
	let mut img = fresh("boundary-indirect", 64, 16);
	let mut reader = Cursor::new(vec![b'a'; 11 * 1024 + 1]);
	let ino = fsops::mkfile_fs(&mut img, ROOT_INODE, b"f", 0o644, 0, 0, &mut reader, 1_000).unwrap();
	let inode = img.read_inode(ino).unwrap();
	assert_ne!(inode.block[12], 0);
	assert_eq!(inode.block[13], 0, "double-indirect not needed yet");
}

#[test]
fn boundary_full_single_indirect_then_double_indirect() {
	let mut img = fresh("boundary-dind", 2048, 16);
	let ppb = 1024u64 / 4;
	let full_single_indirect = 11 * 1024 + (ppb as usize) * 1024;

	let mut reader = Cursor::new(vec![b'a'; full_single_indirect]);
	let ino = fsops::mkfile_fs(&mut img, ROOT_INODE, b"full", 0o644, 0, 0, &mut reader, 1_000).unwrap();
	let inode = img.read_inode(ino).unwrap();
	assert_ne!(inode.block[12], 0);
	assert_eq!(inode.block[13], 0, "single indirect exactly full, double not touched");

	let mut reader2 = Cursor::new(vec![b'a'; full_single_indirect + 1]);
	let ino2 = fsops::mkfile_fs(&mut img, ROOT_INODE, b"overflow", 0o644, 0, 0, &mut reader2, 1_000).unwrap();
	let inode2 = img.read_inode(ino2).unwrap();
	assert_ne!(inode2.block[13], 0, "one byte past single-indirect capacity needs double-indirect");
}

#[test]
fn init_finalize_load_finalize_is_bit_identical() {
	let path = scratch("idempotence");
	let opts = ImageOptions {
		block_size: 1024,
		blocks: 64,
		inodes: Some(16),
		timestamp: Some(1_700_000_000),
		..Default::default()
	};
	let img = Image::create(&path, &opts).unwrap();
	img.finalize().unwrap();
	let first = std::fs::read(&path).unwrap();

	let loaded = Image::load(&path).unwrap();
	loaded.finalize().unwrap();
	let second = std::fs::read(&path).unwrap();

	assert_eq!(first, second);
	std::fs::remove_file(&path).unwrap();
}

#[test]
fn allocate_and_free_round_trips_counters() {
	let mut img = fresh("alloc-free", 64, 16);
	let free_blocks_before = img.free_blocks_count();
	let free_inodes_before = img.free_inodes_count();

	let blk = ext2fs::alloc::alloc_block(&mut img, 0).unwrap();
	let ino = ext2fs::alloc::alloc_inode(&mut img).unwrap();
	assert_eq!(img.free_blocks_count(), free_blocks_before - 1);
	assert_eq!(img.free_inodes_count(), free_inodes_before - 1);

	ext2fs::alloc::free_block(&mut img, blk).unwrap();
	ext2fs::alloc::free_inode(&mut img, ino).unwrap();
	assert_eq!(img.free_blocks_count(), free_blocks_before);
	assert_eq!(img.free_inodes_count(), free_inodes_before);
}
