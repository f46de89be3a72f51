//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::collections::HashMap;

/// Boyer-Moore-Horspool substring search over `char` slices.
#[derive(Debug, Clone)]
pub struct Horspool {
	text: String,
	needle: Vec<char>,
	skip: SkipTable,
}

#[derive(Debug, Clone)]
struct SkipTable {
	small: [usize; 256],
	big: HashMap<char, usize>,
	default: usize,
}

impl SkipTable {
	fn new(default: usize) -> Self {
		Self {
			small: [default; 256],
			big: HashMap::new(),
			default,
		}
	}

	fn get(&self, c: char) -> usize {
		match u8::try_from(c) {
			Ok(b) => self.small[b as usize],
			Err(_) => self.big.get(&c).copied().unwrap_or(self.default),
		}
	}

	fn set(&mut self, c: char, value: usize) {
		match u8::try_from(c) {
			Ok(b) => self.small[b as usize] = value,
			Err(_) => {
				self.big.insert(c, value);
			},
		}
	}
}

impl Horspool {
	pub fn new(needle: &str) -> Self {
		let chars: Vec<char> = needle.chars().collect();
		let mut skip = SkipTable::new(chars.len());

		if let Some(last) = chars.len().checked_sub(1) {
			for (i, &c) in chars[..last].iter().enumerate() {
				skip.set(c, last - i);
			}
		}

		Self {
			text: needle.to_owned(),
			needle: chars,
			skip,
		}
	}

	pub fn text(&self) -> &str {
		&self.text
	}

	/// Length of the needle in characters.
	pub fn len(&self) -> usize {
		self.needle.len()
	}

	pub fn is_empty(&self) -> bool {
		self.needle.is_empty()
	}

	/// Index of the first occurrence at or after `start`.
	pub fn find_in(&self, haystack: &[char], start: usize) -> Option<usize> {
		let nlen = self.needle.len();
		if nlen == 0 {
			return None;
		}

		let last = nlen - 1;
		let mut pos = start;

		while pos + nlen <= haystack.len() {
			let window = &haystack[pos..pos + nlen];
			if window.iter().rev().zip(self.needle.iter().rev()).all(|(a, b)| a == b) {
				return Some(pos);
			}

			pos += self.skip.get(haystack[pos + last]);
		}

		None
	}

	pub fn count_in(&self, haystack: &[char]) -> usize {
		let mut count = 0;
		let mut start = 0;

		while let Some(idx) = self.find_in(haystack, start) {
			count += 1;
			start = idx + 1;
		}

		count
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn chars(s: &str) -> Vec<char> {
		s.chars().collect()
	}

	#[test]
	fn finds_first_occurrence() {
		let h = Horspool::new("needle");
		let hay = chars("haystack with a needle and another needle");
		assert_eq!(h.find_in(&hay, 0), Some(16));
		assert_eq!(h.find_in(&hay, 17), Some(35));
		assert_eq!(h.find_in(&hay, 36), None);
		assert_eq!(h.count_in(&hay), 2);
	}

	#[test]
	fn edges() {
		let h = Horspool::new("ab");
		assert_eq!(h.find_in(&chars("ab"), 0), Some(0));
		assert_eq!(h.find_in(&chars("a"), 0), None);
		assert_eq!(h.find_in(&chars("xxab"), 5), None);
		assert_eq!(Horspool::new("").find_in(&chars("abc"), 0), None);
	}

	#[test]
	fn overlapping_matches_and_wide_chars() {
		let h = Horspool::new("aa");
		assert_eq!(h.count_in(&chars("aaaa")), 3);

		let h = Horspool::new("über");
		assert_eq!(h.find_in(&chars("Das ist über alles"), 0), Some(8));
		let h = Horspool::new("\u{e000}x");
		assert_eq!(h.find_in(&chars("ab\u{e000}x"), 0), Some(2));
	}
}
