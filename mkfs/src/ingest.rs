//! Walks a staging directory and replays it into an image through the
//! `fsops` operations, detecting hard links by `(dev, ino)` along the way.

use std::fs;
use std::io::BufReader;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use ext2fs::inode::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFREG, S_IFSOCK};
use ext2fs::{dir, fsops, Ext2Error, HardlinkTable, Image, Result, ROOT_INODE};

pub fn ingest_tree(img: &mut Image, root: &Path) -> Result<()> {
	let mut links = HardlinkTable::new();
	ingest_dir(img, root, ROOT_INODE, &mut links)
}

fn ingest_dir(img: &mut Image, dir_path: &Path, image_parent: u32, links: &mut HardlinkTable) -> Result<()> {
	let mut entries = fs::read_dir(dir_path)
		.map_err(Ext2Error::Io)?
		.collect::<std::io::Result<Vec<_>>>()
		.map_err(Ext2Error::Io)?;
	entries.sort_by_key(|e| e.file_name());

	for entry in entries {
		let name = entry.file_name();
		let name_bytes = name.as_encoded_bytes();
		let path = entry.path();
		let meta = fs::symlink_metadata(&path).map_err(Ext2Error::Io)?;
		let uid = meta.uid() as u16;
		let gid = meta.gid() as u16;
		let mode = meta.mode() as u16 & 0o7777;
		let timestamp = meta.mtime() as u32;
		let file_type = meta.file_type();
		let is_hardlinkable = !file_type.is_dir() && meta.nlink() > 1;

		if is_hardlinkable {
			if let Some(existing) = links.lookup(meta.dev(), meta.ino()) {
				dir::add2dir(img, image_parent, existing, name_bytes)?;
				continue;
			}
		}

		let child_ino = if file_type.is_dir() {
			let ino = fsops::mkdir_fs(img, image_parent, name_bytes, S_IFDIR | mode, uid, gid, timestamp)?;
			ingest_dir(img, &path, ino, links)?;
			ino
		} else if file_type.is_symlink() {
			let target = fs::read_link(&path).map_err(Ext2Error::Io)?;
			fsops::mklink_fs(img, image_parent, name_bytes, target.as_os_str().as_encoded_bytes(), uid, gid, timestamp)?
		} else if file_type.is_file() {
			let mut reader = BufReader::new(fs::File::open(&path).map_err(Ext2Error::Io)?);
			fsops::mkfile_fs(img, image_parent, name_bytes, S_IFREG | mode, uid, gid, &mut reader, timestamp)?
		} else if file_type.is_char_device() || file_type.is_block_device() {
			let rdev = meta.rdev();
			let major = ((rdev >> 8) & 0xff) as u8;
			let minor = (rdev & 0xff) as u8;
			let kind = if file_type.is_char_device() { S_IFCHR } else { S_IFBLK };
			fsops::mknod_fs(img, image_parent, name_bytes, kind | mode, uid, gid, Some((minor, major)), timestamp)?
		} else if file_type.is_fifo() {
			fsops::mknod_fs(img, image_parent, name_bytes, S_IFIFO | mode, uid, gid, None, timestamp)?
		} else if file_type.is_socket() {
			fsops::mknod_fs(img, image_parent, name_bytes, S_IFSOCK | mode, uid, gid, None, timestamp)?
		} else {
			continue;
		};

		if is_hardlinkable {
			links.record(meta.dev(), meta.ino(), child_ino);
		}
	}
	Ok(())
}
