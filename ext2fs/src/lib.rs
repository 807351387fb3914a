//! Builds ext2 filesystem images entirely in userspace: no root privileges,
//! no loopback mount, no kernel involvement. A caller picks a size and inode
//! budget, populates the image through [`fsops`], and finalizes it to a
//! regular file.

pub mod alloc;
pub mod bitmap;
pub mod cache;
pub mod config;
pub mod dir;
pub mod endian;
pub mod error;
pub mod fsops;
pub mod group;
pub mod hardlink;
pub mod image;
pub mod inode;
pub mod store;
pub mod superblock;
pub mod walker;

pub use config::{ByteOrder, CreatorOs, ImageOptions};
pub use error::{Ext2Error, Result};
pub use fsops::{chmod_fs, mkdir_fs, mkfile_fs, mklink_fs, mknod_fs};
pub use hardlink::HardlinkTable;
pub use image::{BuildSummary, Image, DIR_MODE_DEFAULT, ROOT_INODE};
pub use inode::{INode, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
