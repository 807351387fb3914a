//! Construction-time configuration.
//!
//! Everything the core needs to know to build an image travels in one
//! explicit record handed to [`crate::image::Image::create`]; there is no
//! global mutable configuration state. `squash_uids`/`squash_perms` in
//! particular are carried on [`crate::image::Image`] and applied by every
//! node-creating operation in [`crate::fsops`] (see `fsops::apply_squash`),
//! rather than read from a process-wide flag the way a global would be.

/// The operating system recorded as having created the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorOs {
	Linux,
	Hurd,
	Masix,
	FreeBsd,
	Lites,
}

impl CreatorOs {
	pub(crate) fn to_id(self) -> u32 {
		match self {
			Self::Linux => 0,
			Self::Hurd => 1,
			Self::Masix => 2,
			Self::FreeBsd => 3,
			Self::Lites => 4,
		}
	}
}

impl Default for CreatorOs {
	fn default() -> Self {
		Self::Linux
	}
}

/// The byte order an image's on-disk structures are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
	#[default]
	Little,
	Big,
}

impl ByteOrder {
	/// Whether fields must be byte-swapped when moving between memory and
	/// this target order on the host this process is running on.
	pub(crate) fn needs_swap(self) -> bool {
		let host_is_big = cfg!(target_endian = "big");
		match self {
			Self::Little => host_is_big,
			Self::Big => !host_is_big,
		}
	}
}

/// Options accepted when creating a new image.
#[derive(Debug, Clone)]
pub struct ImageOptions {
	/// Block size in bytes; one of 1024, 2048, 4096.
	pub block_size: u32,
	/// Total number of blocks in the image.
	pub blocks: u32,
	/// Total number of inodes, if explicitly requested.
	pub inodes: Option<u32>,
	/// Number of blocks reserved for the superuser.
	pub reserved_blocks: u32,
	/// Bytes of image space per inode, used to derive an inode count when
	/// `inodes` is unset. Defaults to 4096 (the historical default).
	pub bytes_per_inode: u32,
	/// Fraction (0.0-1.0) of blocks reserved for the superuser, used when
	/// `reserved_blocks` is unset. Defaults to 0.05.
	pub reserved_fraction: f64,
	/// Operating system recorded as having created the filesystem.
	pub creator_os: CreatorOs,
	/// Volume label, truncated to 16 bytes.
	pub volume_label: Option<String>,
	/// Whether all-zero source blocks are written as holes.
	pub holes: bool,
	/// Rewrite every file's owner/group to root (uid=gid=0).
	pub squash_uids: bool,
	/// Rewrite every file's group/other permission bits to match owner.
	pub squash_perms: bool,
	/// Fixed mtime/ctime/atime for every inode and the superblock; `None`
	/// means "use the current wall-clock time" (the non-reproducible
	/// default, matching the historical tool's "fake time" flag when set
	/// to `Some(0)` upstream - here expressed directly as an `Option`).
	pub timestamp: Option<u32>,
	/// Byte order of the produced image.
	pub byte_order: ByteOrder,
}

impl Default for ImageOptions {
	fn default() -> Self {
		Self {
			block_size: 1024,
			blocks: 0,
			inodes: None,
			reserved_blocks: 0,
			bytes_per_inode: 4096,
			reserved_fraction: 0.05,
			creator_os: CreatorOs::default(),
			volume_label: None,
			holes: false,
			squash_uids: false,
			squash_perms: false,
			timestamp: None,
			byte_order: ByteOrder::default(),
		}
	}
}
