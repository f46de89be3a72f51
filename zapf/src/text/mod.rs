//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! Z-character text encoding.
//!
//! Text is turned into a stream of 5-bit Z-characters using three 26-entry
//! alphabets, shift codes and 10-bit ZSCII escapes, then packed three to a
//! 16-bit word. The top bit of the final word marks the end of the string.

mod decode;
mod horspool;
mod unicode;

use log::trace;
use thiserror::Error;

pub use self::{
	decode::decode,
	horspool::Horspool,
	unicode::{from_zscii, to_zscii},
};

pub const MAX_ABBREVIATIONS: usize = 96;

/// Padding Z-character.
pub const PAD: u8 = 5;

/// Abbreviation `n` is stood in for by this character plus `n` while encoding.
const ABBREV_SENTINEL: u32 = 0xe000;

const DEFAULT_CHARSET: [&str; 3] = [
	"abcdefghijklmnopqrstuvwxyz",
	"ABCDEFGHIJKLMNOPQRSTUVWXYZ",
	// first two slots of A2 are the escape and newline codes
	"0123456789.,!?_#'\"/\\-:()",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
	Normal,
	NoAbbreviations,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
	#[error("too late to add abbreviations")]
	AbbreviationsFrozen,
	#[error("too many abbreviations (at most {MAX_ABBREVIATIONS})")]
	TooManyAbbreviations,
	#[error("too late to change the character set")]
	CharsetFrozen,
	#[error("there is no alphabet {0}")]
	InvalidAlphabet(usize),
	#[error("alphabet {alphabet} has {count} characters, at most 26 allowed")]
	AlphabetTooLong { alphabet: usize, count: usize },
}

#[derive(Debug, Clone)]
struct Abbreviation {
	pattern: Horspool,
	number: u8,
}

#[derive(Debug, Clone)]
pub struct StringEncoder {
	/// ZSCII codes of each alphabet; A2 omits its two reserved slots.
	charset: [Vec<u8>; 3],
	/// Sorted longest first, then by text.
	abbrevs: Vec<Abbreviation>,
	frozen: bool,
}

impl Default for StringEncoder {
	fn default() -> Self {
		Self::new()
	}
}

impl StringEncoder {
	pub fn new() -> Self {
		Self {
			charset: DEFAULT_CHARSET.map(|s| s.chars().map(to_zscii).collect()),
			abbrevs: Vec::new(),
			frozen: false,
		}
	}

	/// Once a string has been encoded with abbreviations, neither the
	/// abbreviation set nor the alphabets may change.
	pub fn is_frozen(&self) -> bool {
		self.frozen
	}

	pub fn abbreviation_count(&self) -> usize {
		self.abbrevs.len()
	}

	/// Text of abbreviation `number`, if registered.
	pub fn abbreviation(&self, number: u8) -> Option<&str> {
		self.abbrevs
			.iter()
			.find(|a| a.number == number)
			.map(|a| a.pattern.text())
	}

	pub fn charset(&self) -> &[Vec<u8>; 3] {
		&self.charset
	}

	/// Registers an abbreviation and returns its number.
	pub fn add_abbreviation(&mut self, text: &str) -> Result<u8, EncoderError> {
		if self.frozen {
			return Err(EncoderError::AbbreviationsFrozen);
		}
		if self.abbrevs.len() >= MAX_ABBREVIATIONS {
			return Err(EncoderError::TooManyAbbreviations);
		}

		let number = self.abbrevs.len() as u8;
		let entry = Abbreviation {
			pattern: Horspool::new(text),
			number,
		};
		let len = entry.pattern.len();

		let idx = self.abbrevs.partition_point(|a| {
			a.pattern.len() > len || (a.pattern.len() == len && a.pattern.text() < text)
		});
		self.abbrevs.insert(idx, entry);

		Ok(number)
	}

	/// Replaces an alphabet. Short alphabets are padded with spaces at the
	/// front; alphabet 2 then loses its first two (reserved) slots.
	pub fn set_charset(&mut self, alphabet: usize, chars: &[u8]) -> Result<(), EncoderError> {
		if self.frozen {
			return Err(EncoderError::CharsetFrozen);
		}
		if alphabet > 2 {
			return Err(EncoderError::InvalidAlphabet(alphabet));
		}
		if chars.len() > 26 {
			return Err(EncoderError::AlphabetTooLong {
				alphabet,
				count: chars.len(),
			});
		}

		let mut cs = vec![b' '; 26 - chars.len()];
		cs.extend_from_slice(chars);
		if alphabet == 2 {
			cs.drain(..2);
		}

		self.charset[alphabet] = cs;
		Ok(())
	}

	/// Encodes `text` into packed Z-characters. With `size`, the output is
	/// padded or truncated to that many Z-characters.
	pub fn encode(&mut self, text: &str, size: Option<usize>, mode: EncodeMode) -> Vec<u8> {
		if mode == EncodeMode::Normal && !self.frozen {
			trace!("freezing {} abbreviation(s)", self.abbrevs.len());
			self.frozen = true;
		}

		let zchars = self.zchars(text, mode);
		pack(zchars, size)
	}

	/// Number of Z-characters `text` takes before padding.
	pub fn count_zchars(&self, text: &str, mode: EncodeMode) -> usize {
		self.zchars(text, mode).len()
	}

	fn zchars(&self, text: &str, mode: EncodeMode) -> Vec<u8> {
		let mut chars: Vec<char> = text.chars().collect();

		if mode == EncodeMode::Normal {
			for abbrev in &self.abbrevs {
				if abbrev.pattern.is_empty() {
					continue;
				}
				let Some(sentinel) = char::from_u32(ABBREV_SENTINEL + abbrev.number as u32) else {
					continue;
				};

				let mut start = 0;
				while let Some(idx) = abbrev.pattern.find_in(&chars, start) {
					chars.drain(idx + 1..idx + abbrev.pattern.len());
					chars[idx] = sentinel;
					start = idx + 1;
				}
			}
		}

		let mut out = Vec::with_capacity(chars.len() * 2);
		let abbrev_range = ABBREV_SENTINEL..ABBREV_SENTINEL + MAX_ABBREVIATIONS as u32;

		for c in chars {
			match c {
				' ' => out.push(0),
				'\n' => out.extend_from_slice(&[5, 7]),
				c if mode == EncodeMode::Normal && abbrev_range.contains(&(c as u32)) => {
					let n = (c as u32 - ABBREV_SENTINEL) as u8;
					out.extend_from_slice(&[1 + n / 32, n % 32]);
				},
				c => {
					let z = to_zscii(c);
					if let Some(idx) = self.charset[0].iter().position(|&b| b == z) {
						out.push(idx as u8 + 6);
					} else if let Some(idx) = self.charset[1].iter().position(|&b| b == z) {
						out.extend_from_slice(&[4, idx as u8 + 6]);
					} else if let Some(idx) = self.charset[2].iter().position(|&b| b == z) {
						out.extend_from_slice(&[5, idx as u8 + 8]);
					} else {
						out.extend_from_slice(&[5, 6, (z >> 5) & 31, z & 31]);
					}
				},
			}
		}

		out
	}
}

fn pack(mut zchars: Vec<u8>, size: Option<usize>) -> Vec<u8> {
	let budget = match size {
		None => {
			if zchars.is_empty() {
				zchars.push(PAD);
			}
			while zchars.len() % 3 != 0 {
				zchars.push(PAD);
			}
			zchars.len()
		},
		Some(size) => {
			while zchars.len() < size {
				zchars.push(PAD);
			}
			size
		},
	};

	let triples = budget.min(zchars.len()) / 3;
	let mut result = Vec::with_capacity(triples * 2);

	for t in zchars.chunks_exact(3).take(triples) {
		// _aaaaabb bbbccccc
		result.push(t[0] << 2 | t[1] >> 3);
		result.push(t[1] << 5 | t[2]);
	}

	let len = result.len();
	if len >= 2 {
		result[len - 2] |= 0x80;
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;

	fn words(bytes: &[u8]) -> Vec<u16> {
		bytes
			.chunks(2)
			.map(|w| u16::from_be_bytes([w[0], w[1]]))
			.collect()
	}

	#[test]
	fn lowercase_word() {
		let mut enc = StringEncoder::new();
		// h=13 e=10 l=17 l=17 o=20, padded with 5
		let bytes = enc.encode("hello", None, EncodeMode::NoAbbreviations);
		assert_eq!(words(&bytes), vec![13 << 10 | 10 << 5 | 17, 0x8000 | 17 << 10 | 20 << 5 | 5]);
	}

	#[test]
	fn empty_string_is_one_word() {
		let mut enc = StringEncoder::new();
		assert_eq!(enc.encode("", None, EncodeMode::NoAbbreviations), vec![0x94, 0xa5]);
	}

	#[test]
	fn shifts_and_escapes() {
		let enc = StringEncoder::new();
		assert_eq!(enc.zchars("A", EncodeMode::Normal), vec![4, 6]);
		assert_eq!(enc.zchars("0", EncodeMode::Normal), vec![5, 8]);
		assert_eq!(enc.zchars("\n", EncodeMode::Normal), vec![5, 7]);
		assert_eq!(enc.zchars(" ", EncodeMode::Normal), vec![0]);
		assert_eq!(enc.zchars("@", EncodeMode::Normal), vec![5, 6, 2, 0]);
		assert_eq!(enc.zchars("ä", EncodeMode::Normal), vec![5, 6, 155 >> 5, 155 & 31]);
	}

	#[test]
	fn fixed_size_pads_and_truncates() {
		let mut enc = StringEncoder::new();
		let zebra = enc.encode("zebra", Some(9), EncodeMode::NoAbbreviations);
		assert_eq!(zebra.len(), 6);
		assert_eq!(zebra[4] & 0x80, 0x80);
		assert_eq!(zebra[0] & 0x80, 0);

		let long = enc.encode("abcdefghijkl", Some(6), EncodeMode::NoAbbreviations);
		assert_eq!(long.len(), 4);
		assert_eq!(words(&long)[1] & 0x7fff, 9 << 10 | 10 << 5 | 11);
	}

	#[test]
	fn end_bit_set_exactly_once() {
		let mut enc = StringEncoder::new();
		let bytes = enc.encode("the quick brown fox", None, EncodeMode::NoAbbreviations);
		let w = words(&bytes);
		assert_eq!(w.iter().filter(|&&x| x & 0x8000 != 0).count(), 1);
		assert!(w.last().unwrap() & 0x8000 != 0);
	}

	#[test]
	fn longest_abbreviation_wins() {
		let mut enc = StringEncoder::new();
		let a = enc.add_abbreviation("a").unwrap();
		let ab = enc.add_abbreviation("ab").unwrap();
		assert_eq!((a, ab), (0, 1));

		assert_eq!(enc.zchars("ab", EncodeMode::Normal), vec![1, 1]);
		assert_eq!(enc.zchars("aab", EncodeMode::Normal), vec![1, 0, 1, 1]);
		assert_eq!(enc.zchars("ab", EncodeMode::NoAbbreviations), vec![6, 7]);
	}

	#[test]
	fn abbreviation_pages() {
		let mut enc = StringEncoder::new();
		for i in 0..40 {
			enc.add_abbreviation(&format!("#{:02}#", i)).unwrap();
		}
		assert_eq!(enc.zchars("#33#", EncodeMode::Normal), vec![2, 1]);
	}

	#[test]
	fn freezing_is_one_way() {
		let mut enc = StringEncoder::new();
		enc.add_abbreviation("the").unwrap();
		enc.encode("xyz", None, EncodeMode::NoAbbreviations);
		assert!(!enc.is_frozen());

		enc.encode("the end", None, EncodeMode::Normal);
		assert!(enc.is_frozen());
		assert_eq!(enc.add_abbreviation("end"), Err(EncoderError::AbbreviationsFrozen));
		assert_eq!(enc.set_charset(0, b"abc"), Err(EncoderError::CharsetFrozen));
	}

	#[test]
	fn abbreviation_limit() {
		let mut enc = StringEncoder::new();
		for i in 0..MAX_ABBREVIATIONS {
			enc.add_abbreviation(&format!("x{}", i)).unwrap();
		}
		assert_eq!(enc.add_abbreviation("one more"), Err(EncoderError::TooManyAbbreviations));
	}

	#[test]
	fn custom_alphabets() {
		let mut enc = StringEncoder::new();
		enc.set_charset(0, b"zyxwvutsrqponmlkjihgfedcba").unwrap();
		assert_eq!(enc.zchars("z", EncodeMode::Normal), vec![6]);

		// padded at the front to 26, then the two reserved slots dropped
		enc.set_charset(2, b"0123456789").unwrap();
		assert_eq!(enc.charset()[2].len(), 24);
		assert_eq!(enc.zchars("0", EncodeMode::Normal), vec![5, 8 + 14]);

		assert_eq!(enc.set_charset(3, b""), Err(EncoderError::InvalidAlphabet(3)));
	}
}
