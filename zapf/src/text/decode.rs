//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use super::{from_zscii, StringEncoder};

/// Unpacks an encoded string up to and including its end-marked word.
fn unpack(bytes: &[u8]) -> Vec<u8> {
	let mut zchars = Vec::with_capacity(bytes.len() / 2 * 3);

	for pair in bytes.chunks_exact(2) {
		let word = u16::from_be_bytes([pair[0], pair[1]]);
		zchars.push(((word >> 10) & 31) as u8);
		zchars.push(((word >> 5) & 31) as u8);
		zchars.push((word & 31) as u8);

		if word & 0x8000 != 0 {
			break;
		}
	}

	zchars
}

/// Decodes packed Z-characters using the given alphabets. `abbreviation`
/// supplies the text of abbreviation `n` (0..96).
pub fn decode<F>(bytes: &[u8], charset: &[Vec<u8>; 3], abbreviation: F) -> String
where
	F: Fn(u8) -> Option<String>,
{
	let zchars = unpack(bytes);
	let mut out = String::new();
	let mut iter = zchars.iter().copied().peekable();

	let alphabet_char = |alphabet: usize, idx: u8| -> Option<char> {
		charset[alphabet].get(idx as usize).map(|&z| from_zscii(z))
	};

	while let Some(z) = iter.next() {
		match z {
			0 => out.push(' '),
			1..=3 => {
				if let Some(n) = iter.next() {
					if let Some(text) = abbreviation((z - 1) * 32 + n) {
						out.push_str(&text);
					}
				}
			},
			4 => match iter.peek().copied() {
				Some(n) if n >= 6 => {
					iter.next();
					out.extend(alphabet_char(1, n - 6));
				},
				_ => {},
			},
			5 => match iter.peek().copied() {
				Some(6) => {
					iter.next();
					let hi = iter.next().unwrap_or(0);
					let lo = iter.next().unwrap_or(0);
					out.push(from_zscii(hi << 5 | lo));
				},
				Some(7) => {
					iter.next();
					out.push('\n');
				},
				Some(n) if n >= 8 => {
					iter.next();
					out.extend(alphabet_char(2, n - 8));
				},
				// padding
				_ => {},
			},
			n => out.extend(alphabet_char(0, n - 6)),
		}
	}

	out
}

impl StringEncoder {
	/// Reverses [`StringEncoder::encode`] using this encoder's alphabets and
	/// abbreviations.
	pub fn decode(&self, bytes: &[u8]) -> String {
		decode(bytes, self.charset(), |n| {
			self.abbreviation(n).map(str::to_owned)
		})
	}
}
