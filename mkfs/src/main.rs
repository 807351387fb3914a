//! The `mkfs.ext2` tool builds an ext2 filesystem image entirely in
//! userspace: no root privileges, no loopback mount, no kernel involvement.
//! It parses command-line flags, builds an [`ImageOptions`], populates the
//! image from an optional source directory and/or device table, and writes
//! the result to a file or to standard output.

mod device_table;
mod ingest;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use ext2fs::{ByteOrder, CreatorOs, Image, Result};

struct Args {
	prog: String,
	device_path: Option<PathBuf>,
	blocks: Option<u32>,
	block_size: u32,
	inodes: Option<u32>,
	bytes_per_inode: u32,
	reserved_percentage: f64,
	volume_label: Option<String>,
	creator_os: CreatorOs,
	source_dir: Option<PathBuf>,
	device_table: Option<PathBuf>,
	holes: bool,
	squash_uids: bool,
	squash_perms: bool,
	big_endian: bool,
	output: Option<PathBuf>,
	block_map: Option<(PathBuf, PathBuf)>,
	help: bool,
}

impl Default for Args {
	fn default() -> Self {
		Self {
			prog: "mkfs.ext2".to_owned(),
			device_path: None,
			blocks: None,
			block_size: 1024,
			inodes: None,
			bytes_per_inode: 4096,
			reserved_percentage: 5.0,
			volume_label: None,
			creator_os: CreatorOs::Linux,
			source_dir: None,
			device_table: None,
			holes: false,
			squash_uids: false,
			squash_perms: false,
			big_endian: false,
			output: None,
			block_map: None,
			help: false,
		}
	}
}

/// Prints `msg` to stderr prefixed with the program name, then exits non-zero.
fn error(prog: &str, msg: &str) -> ! {
	eprintln!("{prog}: {msg}");
	exit(1);
}

fn expect_value(prog: &str, flag: &str, value: Option<String>) -> String {
	value.unwrap_or_else(|| error(prog, &format!("option `{flag}` requires a value")))
}

fn parse_size_arg(prog: &str, flag: &str, value: &str) -> u64 {
	utils::util::parse_size(value).unwrap_or_else(|| error(prog, &format!("`{flag}`: invalid size `{value}`")))
}

fn parse_args() -> Args {
	let mut args = Args::default();
	let mut iter = env::args();
	args.prog = iter.next().unwrap_or_else(|| "mkfs.ext2".to_owned());

	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-b" | "--block-size" => {
				let v = expect_value(&args.prog, &arg, iter.next());
				args.block_size = parse_size_arg(&args.prog, &arg, &v) as u32;
			}
			"-N" | "--number-of-inodes" => {
				let v = expect_value(&args.prog, &arg, iter.next());
				args.inodes = Some(v.parse().unwrap_or_else(|_| error(&args.prog, &format!("invalid inode count `{v}`"))));
			}
			"-i" | "--bytes-per-inode" => {
				let v = expect_value(&args.prog, &arg, iter.next());
				args.bytes_per_inode = parse_size_arg(&args.prog, &arg, &v) as u32;
			}
			"-m" | "--reserved-percentage" => {
				let v = expect_value(&args.prog, &arg, iter.next());
				args.reserved_percentage = v.parse().unwrap_or_else(|_| error(&args.prog, &format!("invalid percentage `{v}`")));
			}
			"-r" | "--revision" => {
				// Accepted for command-line compatibility; this implementation
				// always writes rev 1 images (promoting to rev 1 on demand is
				// handled internally by mkfile_fs for large files).
				let _ = expect_value(&args.prog, &arg, iter.next());
			}
			"-L" | "--volume-label" => {
				args.volume_label = Some(expect_value(&args.prog, &arg, iter.next()));
			}
			"-U" | "--fs-uuid" => {
				// TODO accept an explicit UUID; currently every image gets a random one.
				let _ = expect_value(&args.prog, &arg, iter.next());
			}
			"-O" | "--creator-os" => {
				let v = expect_value(&args.prog, &arg, iter.next());
				args.creator_os = match v.as_str() {
					"linux" => CreatorOs::Linux,
					"hurd" => CreatorOs::Hurd,
					"masix" => CreatorOs::Masix,
					"freebsd" => CreatorOs::FreeBsd,
					"lites" => CreatorOs::Lites,
					other => error(&args.prog, &format!("unknown creator OS `{other}`")),
				};
			}
			"-d" => args.source_dir = Some(PathBuf::from(expect_value(&args.prog, &arg, iter.next()))),
			"-D" => args.device_table = Some(PathBuf::from(expect_value(&args.prog, &arg, iter.next()))),
			"-z" | "--holes" => args.holes = true,
			"-q" | "--squash-uids" => args.squash_uids = true,
			"-p" | "--squash-perms" => args.squash_perms = true,
			"-B" | "--big-endian" => args.big_endian = true,
			"-o" => args.output = Some(PathBuf::from(expect_value(&args.prog, &arg, iter.next()))),
			"-M" => {
				let path = PathBuf::from(expect_value(&args.prog, &arg, iter.next()));
				let out = PathBuf::from(expect_value(&args.prog, &arg, iter.next()));
				args.block_map = Some((path, out));
			}
			_ if arg.starts_with('-') && arg.len() > 1 => {
				error(&args.prog, &format!("unrecognized option `{arg}`"))
			}
			_ => {
				if args.device_path.is_none() {
					args.device_path = Some(PathBuf::from(&arg));
				} else if args.blocks.is_none() {
					args.blocks = Some(parse_size_arg(&args.prog, "blocks-count", &arg) as u32);
				} else {
					error(&args.prog, &format!("unexpected argument `{arg}`"));
				}
			}
		}
	}

	args
}

fn print_help(prog: &str) {
	println!("Usage: {prog} [options] device-or-output [blocks-count]");
	println!();
	println!("  -b, --block-size SIZE       block size in bytes (1024, 2048 or 4096)");
	println!("  -N, --number-of-inodes N    number of inodes");
	println!("  -i, --bytes-per-inode SIZE  bytes per inode, used to derive -N");
	println!("  -m, --reserved-percentage P percentage of blocks reserved for the superuser");
	println!("  -r, --revision REV          accepted for compatibility");
	println!("  -L, --volume-label LABEL    volume label, at most 16 bytes");
	println!("  -U, --fs-uuid UUID          accepted for compatibility, currently ignored");
	println!("  -O, --creator-os OS         linux, hurd, masix, freebsd or lites");
	println!("  -d DIR                      populate the image from a source directory");
	println!("  -D TABLE                    apply a device-table file");
	println!("  -z, --holes                 write sparse source blocks as holes");
	println!("  -q, --squash-uids           rewrite every uid/gid to 0");
	println!("  -p, --squash-perms          rewrite group/other perms to match owner");
	println!("  -B, --big-endian            write a big-endian image");
	println!("  -o FILE                     output path; `-` streams the image to stdout");
	println!("  -M PATH OUT                 dump PATH's block map to OUT");
	println!("  -h, --help                  print this help and exit");
}

fn stream_to_stdout(path: &Path) -> Result<()> {
	let mut img = Image::load(path)?;
	let stdout = std::io::stdout();
	let mut lock = stdout.lock();
	img.stream_to(&mut lock)
}

fn dump_block_map(img: &mut Image, path: &Path, out: &Path) -> Result<()> {
	let ino = ext2fs::dir::find_path(img, ext2fs::ROOT_INODE, &path.to_string_lossy())?;
	if ino == 0 {
		return Err(ext2fs::Ext2Error::Input(format!("{}: no such path in image", path.display())));
	}
	let inode = img.read_inode(ino)?;
	let block_size = img.block_size() as u64;
	let count = (inode.size() + block_size - 1) / block_size;
	let mut blocks = Vec::with_capacity(count as usize);
	for l in 0..count {
		blocks.push(ext2fs::walker::read_logical(img, &inode, l)?);
	}
	let line = format!(
		"{}:{}\n",
		inode.size(),
		blocks.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(" ")
	);
	fs::write(out, line).map_err(ext2fs::Ext2Error::Io)
}

fn main() {
	let args = parse_args();
	if args.help {
		print_help(&args.prog);
		return;
	}

	let target = args
		.device_path
		.clone()
		.unwrap_or_else(|| error(&args.prog, "specify a device or output path"));

	let streaming_to_stdout = args.output.as_deref() == Some(Path::new("-"));
	let build_path = if streaming_to_stdout {
		env::temp_dir().join(format!("mkfs-ext2-stage-{}", std::process::id()))
	} else {
		args.output.clone().unwrap_or_else(|| target.clone())
	};

	let blocks = args.blocks.unwrap_or_else(|| {
		let len = fs::metadata(&target)
			.map(|m| m.len())
			.unwrap_or_else(|e| error(&args.prog, &format!("{}: {e}", target.display())));
		(len / args.block_size as u64) as u32
	});

	let opts = ext2fs::ImageOptions {
		block_size: args.block_size,
		blocks,
		inodes: args.inodes,
		reserved_blocks: 0,
		bytes_per_inode: args.bytes_per_inode,
		reserved_fraction: args.reserved_percentage / 100.0,
		creator_os: args.creator_os,
		volume_label: args.volume_label.clone(),
		holes: args.holes,
		squash_uids: args.squash_uids,
		squash_perms: args.squash_perms,
		timestamp: None,
		byte_order: if args.big_endian { ByteOrder::Big } else { ByteOrder::Little },
	};

	let mut img = Image::create(&build_path, &opts).unwrap_or_else(|e| error(&args.prog, &format!("{e}")));

	if let Some(dir) = &args.source_dir {
		ingest::ingest_tree(&mut img, dir).unwrap_or_else(|e| error(&args.prog, &format!("{}: {e}", dir.display())));
	}
	if let Some(table_path) = &args.device_table {
		let text = fs::read_to_string(table_path).unwrap_or_else(|e| error(&args.prog, &format!("{}: {e}", table_path.display())));
		device_table::apply(&mut img, &text).unwrap_or_else(|e| error(&args.prog, &format!("{}: {e}", table_path.display())));
	}
	if let Some((path, out)) = &args.block_map {
		dump_block_map(&mut img, path, out).unwrap_or_else(|e| error(&args.prog, &format!("{e}")));
	}

	let summary = img.finalize().unwrap_or_else(|e| error(&args.prog, &format!("{e}")));
	eprintln!(
		"{}: {} blocks used, {} inodes used, {} group(s), {}",
		args.prog,
		summary.blocks_used,
		summary.inodes_used,
		summary.groups,
		utils::util::ByteSize(summary.image_bytes)
	);

	if streaming_to_stdout {
		stream_to_stdout(&build_path).unwrap_or_else(|e| error(&args.prog, &format!("{e}")));
		let _ = fs::remove_file(&build_path);
	}
}
