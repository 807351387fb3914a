//! Device-table ingestion: a line-oriented format describing nodes to
//! create (or fix up, via `chmod_fs`) inside an already-built image,
//! independent of any staged source directory.
//!
//! Each non-comment, non-blank line has ten whitespace-separated fields:
//! `<path> <type> <mode> <uid> <gid> <major> <minor> <start> <inc> <count>`.

use ext2fs::inode::{S_IFBLK, S_IFCHR, S_IFIFO, S_IFREG, S_IFSOCK};
use ext2fs::{dir, fsops, Ext2Error, Image, Result, ROOT_INODE};

pub fn apply(img: &mut Image, text: &str) -> Result<()> {
	for (lineno, raw_line) in text.lines().enumerate() {
		let line = raw_line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		apply_line(img, line).map_err(|e| Ext2Error::Input(format!("line {}: {e}", lineno + 1)))?;
	}
	Ok(())
}

fn apply_line(img: &mut Image, line: &str) -> Result<()> {
	let fields: Vec<&str> = line.split_whitespace().collect();
	if fields.len() != 10 {
		return Err(Ext2Error::Input(format!("expected 10 fields, got {}", fields.len())));
	}
	let path = fields[0];
	let kind = fields[1];
	let mode = u16::from_str_radix(fields[2], 8).map_err(|_| Ext2Error::Input(format!("bad mode `{}`", fields[2])))?;
	let uid: u16 = fields[3].parse().map_err(|_| Ext2Error::Input(format!("bad uid `{}`", fields[3])))?;
	let gid: u16 = fields[4].parse().map_err(|_| Ext2Error::Input(format!("bad gid `{}`", fields[4])))?;
	let major: u32 = fields[5].parse().map_err(|_| Ext2Error::Input(format!("bad major `{}`", fields[5])))?;
	let minor: u32 = fields[6].parse().map_err(|_| Ext2Error::Input(format!("bad minor `{}`", fields[6])))?;
	let start: u32 = fields[7].parse().map_err(|_| Ext2Error::Input(format!("bad start `{}`", fields[7])))?;
	let inc: u32 = fields[8].parse().map_err(|_| Ext2Error::Input(format!("bad inc `{}`", fields[8])))?;
	let count: u32 = fields[9].parse().map_err(|_| Ext2Error::Input(format!("bad count `{}`", fields[9])))?;

	let file_type = match kind {
		"f" => S_IFREG,
		"d" => ext2fs::inode::S_IFDIR,
		"c" => S_IFCHR,
		"b" => S_IFBLK,
		"p" => S_IFIFO,
		"s" => S_IFSOCK,
		other => return Err(Ext2Error::Input(format!("unknown node type `{other}`"))),
	};

	if matches!(file_type, S_IFCHR | S_IFBLK) && count > 0 {
		// Preserves the historical `[start, count)` loop bound rather than
		// `[start, start + count)`; a table author who wants N nodes must
		// set `count = start + N`.
		for i in start..count {
			let name = format!("{path}{i}");
			let this_minor = minor.wrapping_add(i.wrapping_mul(inc)).wrapping_sub(start);
			create_or_fixup(img, &name, file_type, mode, uid, gid, major, this_minor)?;
		}
		return Ok(());
	}

	create_or_fixup(img, path, file_type, mode, uid, gid, major, minor)
}

fn create_or_fixup(img: &mut Image, path: &str, file_type: u16, mode: u16, uid: u16, gid: u16, major: u32, minor: u32) -> Result<()> {
	let (parent_path, name) = split_path(path);
	let parent = resolve_dir(img, parent_path)?;

	let existing = dir::find(img, parent, name.as_bytes())?;
	if existing != 0 {
		return fsops::chmod_fs(img, existing, mode, uid, gid);
	}

	let rdev = matches!(file_type, S_IFCHR | S_IFBLK).then_some((minor as u8, major as u8));
	let timestamp = utils::util::get_timestamp().as_secs() as u32;
	fsops::mknod_fs(img, parent, name.as_bytes(), file_type | (mode & 0o7777), uid, gid, rdev, timestamp)?;
	Ok(())
}

fn split_path(path: &str) -> (&str, &str) {
	let trimmed = path.trim_start_matches('/');
	match trimmed.rsplit_once('/') {
		Some((dir, name)) => (dir, name),
		None => ("", trimmed),
	}
}

fn resolve_dir(img: &mut Image, path: &str) -> Result<u32> {
	if path.is_empty() {
		return Ok(ROOT_INODE);
	}
	let ino = dir::find_path(img, ROOT_INODE, path)?;
	if ino == 0 {
		return Err(Ext2Error::Input(format!("{path}: no such directory in image")));
	}
	Ok(ino)
}

#[cfg(test)]
mod test {
	use super::*;
	use ext2fs::ImageOptions;

	fn fresh(name: &str) -> Image {
		let path = std::env::temp_dir().join(format!("mkfs-devtable-test-{name}-{:?}", std::thread::current().id()));
		let opts = ImageOptions {
			block_size: 1024,
			blocks: 128,
			inodes: Some(32),
			..Default::default()
		};
		Image::create(&path, &opts).unwrap()
	}

	#[test]
	fn creates_a_single_char_device() {
		let mut img = fresh("single");
		fsops::mkdir_fs(&mut img, ROOT_INODE, b"dev", 0o755, 0, 0, 1_000).unwrap();
		apply(&mut img, "/dev/null c 0666 0 0 1 3 0 0 0\n").unwrap();
		let dev_ino = dir::find(&mut img, ROOT_INODE, b"dev").unwrap();
		let ino = dir::find(&mut img, dev_ino, b"null").unwrap();
		let inode = img.read_inode(ino).unwrap();
		assert_eq!(inode.block[0] & 0xff, 3);
		assert_eq!((inode.block[0] >> 8) & 0xff, 1);
	}

	#[test]
	fn expands_count_range_with_start_exclusive_bound() {
		let mut img = fresh("range");
		fsops::mkdir_fs(&mut img, ROOT_INODE, b"dev", 0o755, 0, 0, 1_000).unwrap();
		apply(&mut img, "/dev/tty c 0666 0 0 4 0 0 1 3\n").unwrap();
		// [start=0, count=3) yields tty0, tty1, tty2 only.
		let dev_ino = dir::find(&mut img, ROOT_INODE, b"dev").unwrap();
		assert_ne!(dir::find(&mut img, dev_ino, b"tty0").unwrap(), 0);
		assert_ne!(dir::find(&mut img, dev_ino, b"tty2").unwrap(), 0);
		assert_eq!(dir::find(&mut img, dev_ino, b"tty3").unwrap(), 0);
	}

	#[test]
	fn skips_comments_and_blank_lines() {
		let mut img = fresh("comments");
		apply(&mut img, "# a comment\n\n").unwrap();
	}
}
