//! This module implements utility functions.

use std::fmt;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("System clock panic!")
}

/// Performs the log2 operatin on the given integer.
///
/// If the result is undefined, the function returns None.
pub fn log2(n: u64) -> Option<u64> {
	let num_bits = (std::mem::size_of::<u64>() * 8) as u64;

	let n = num_bits - n.leading_zeros() as u64;
	if n > 0 {
		Some(n - 1)
	} else {
		None
	}
}

/// Returns `n / d`, rounded up to the nearest integer.
pub fn ceil_division<T>(n: T, d: T) -> T
where
	T: Copy
		+ std::ops::Add<Output = T>
		+ std::ops::Sub<Output = T>
		+ std::ops::Div<Output = T>
		+ From<u8>,
{
	(n + d - T::from(1u8)) / d
}

/// Rounds `n` up to the nearest multiple of `mult`.
pub fn round_up(n: u64, mult: u64) -> u64 {
	ceil_division(n, mult) * mult
}

/// Parses a size expressed with an optional IEC (`Ki`, `Mi`, `Gi`) or SI (`k`, `M`, `G`) suffix.
///
/// Returns `None` if `s` is empty or the numeric part does not parse.
pub fn parse_size(s: &str) -> Option<u64> {
	let s = s.trim();
	let (num, mult) = if let Some(n) = s.strip_suffix("Ki") {
		(n, 1024)
	} else if let Some(n) = s.strip_suffix("Mi") {
		(n, 1024 * 1024)
	} else if let Some(n) = s.strip_suffix("Gi") {
		(n, 1024 * 1024 * 1024)
	} else if let Some(n) = s.strip_suffix('k') {
		(n, 1_000)
	} else if let Some(n) = s.strip_suffix('M') {
		(n, 1_000_000)
	} else if let Some(n) = s.strip_suffix('G') {
		(n, 1_000_000_000)
	} else {
		(s, 1)
	};
	let num: u64 = num.trim().parse().ok()?;
	Some(num * mult)
}

/// A byte count formatted in the largest whole IEC unit it fits,
/// e.g. for a finished image's size in `mkfs`'s build summary.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut order = log2(self.0).unwrap_or(0) / log2(1024).unwrap();

		let suffix = match order {
			0 => "bytes",
			1 => "KiB",
			2 => "MiB",
			3 => "GiB",
			4 => "TiB",
			5 => "PiB",
			6 => "EiB",
			7 => "ZiB",
			8 => "YiB",

			_ => {
				order = 0;
				"bytes"
			}
		};

		let unit = 1024usize.pow(order as u32);
		let nbr = self.0 / unit as u64;

		write!(fmt, "{} {}", nbr, suffix)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn bytesize() {
		assert_eq!(format!("{}", ByteSize(0)).as_str(), "0 bytes");
		assert_eq!(format!("{}", ByteSize(1)).as_str(), "1 bytes");
		assert_eq!(format!("{}", ByteSize(1023)).as_str(), "1023 bytes");
		assert_eq!(format!("{}", ByteSize(1024)).as_str(), "1 KiB");
		assert_eq!(format!("{}", ByteSize(1025)).as_str(), "1 KiB");
		assert_eq!(format!("{}", ByteSize(2048)).as_str(), "2 KiB");
		assert_eq!(format!("{}", ByteSize(1024 * 1024)).as_str(), "1 MiB");
		assert_eq!(
			format!("{}", ByteSize(1024 * 1024 * 1024)).as_str(),
			"1 GiB"
		);
		assert_eq!(
			format!("{}", ByteSize(1024 * 1024 * 1024 * 1024)).as_str(),
			"1 TiB"
		);
	}

	#[test]
	fn ceil_division_rounds_up() {
		assert_eq!(ceil_division(0u32, 8), 0);
		assert_eq!(ceil_division(1u32, 8), 1);
		assert_eq!(ceil_division(8u32, 8), 1);
		assert_eq!(ceil_division(9u32, 8), 2);
	}

	#[test]
	fn parse_size_suffixes() {
		assert_eq!(parse_size("1024"), Some(1024));
		assert_eq!(parse_size("1Ki"), Some(1024));
		assert_eq!(parse_size("4Mi"), Some(4 * 1024 * 1024));
		assert_eq!(parse_size("1G"), Some(1_000_000_000));
		assert_eq!(parse_size("bogus"), None);
	}
}
