//! The backing file: a fixed block size, random-access blob of blocks.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A single backing file addressed in fixed-size blocks.
pub struct BackingStore {
	file: File,
	block_size: u32,
}

impl BackingStore {
	pub fn new(file: File, block_size: u32) -> Self {
		Self { file, block_size }
	}

	pub fn block_size(&self) -> u32 {
		self.block_size
	}

	/// Reads block `num`, zero-extending if it lies past the current end of
	/// file (happens the first time a freshly truncated image's block is
	/// touched).
	pub fn read_block(&mut self, num: u32) -> io::Result<Vec<u8>> {
		let mut buf = vec![0u8; self.block_size as usize];
		let off = num as u64 * self.block_size as u64;
		let len = self.file.metadata()?.len();
		if off >= len {
			return Ok(buf);
		}
		self.file.seek(SeekFrom::Start(off))?;
		let to_read = ((len - off).min(self.block_size as u64)) as usize;
		self.file.read_exact(&mut buf[..to_read])?;
		Ok(buf)
	}

	pub fn write_block(&mut self, num: u32, data: &[u8]) -> io::Result<()> {
		debug_assert_eq!(data.len(), self.block_size as usize);
		let off = num as u64 * self.block_size as u64;
		self.file.seek(SeekFrom::Start(off))?;
		self.file.write_all(data)
	}

	pub fn read_at(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()> {
		self.file.seek(SeekFrom::Start(off))?;
		self.file.read_exact(buf)
	}

	pub fn write_at(&mut self, off: u64, buf: &[u8]) -> io::Result<()> {
		self.file.seek(SeekFrom::Start(off))?;
		self.file.write_all(buf)
	}

	pub fn set_len(&mut self, len: u64) -> io::Result<()> {
		self.file.set_len(len)
	}

	pub fn len(&mut self) -> io::Result<u64> {
		Ok(self.file.metadata()?.len())
	}

	pub fn sync(&mut self) -> io::Result<()> {
		self.file.flush()
	}

	pub fn copy_to<W: Write>(&mut self, out: &mut W, total_blocks: u32) -> io::Result<()> {
		self.file.seek(SeekFrom::Start(0))?;
		let mut buf = vec![0u8; self.block_size as usize];
		for _ in 0..total_blocks {
			self.file.read_exact(&mut buf)?;
			out.write_all(&buf)?;
		}
		Ok(())
	}
}
