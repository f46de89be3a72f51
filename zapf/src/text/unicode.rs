//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::collections::HashMap;

use lazy_static::lazy_static;

/// Default extra characters, ZSCII 155 onward.
const EXTRA_CHARACTERS: &str = "äöüÄÖÜß»«ëïÿËÏáéíóúýÁÉÍÓÚÝàèìòùÀÈÌÒÙâêîôûÂÊÎÔÛåÅøØãñõÃÑÕæÆçÇþðÞÐ£œŒ¡¿";

const FIRST_EXTRA: u8 = 155;

lazy_static! {
	static ref TO_ZSCII: HashMap<char, u8> = EXTRA_CHARACTERS
		.chars()
		.zip(FIRST_EXTRA..)
		.collect();
	static ref FROM_ZSCII: HashMap<u8, char> = TO_ZSCII.iter().map(|(&c, &z)| (z, c)).collect();
}

/// Maps a character to its ZSCII code. Characters with no code become `?`.
pub fn to_zscii(c: char) -> u8 {
	if let Some(&z) = TO_ZSCII.get(&c) {
		return z;
	}

	match c {
		'\n' => 13,
		_ => u8::try_from(c).unwrap_or(b'?'),
	}
}

pub fn from_zscii(z: u8) -> char {
	if let Some(&c) = FROM_ZSCII.get(&z) {
		return c;
	}

	match z {
		13 => '\n',
		_ => z as char,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extra_characters() {
		assert_eq!(to_zscii('ä'), 155);
		assert_eq!(to_zscii('¿'), 223);
		assert_eq!(EXTRA_CHARACTERS.chars().count(), 69);
		assert_eq!(from_zscii(219), '£');
	}

	#[test]
	fn ascii_passes_through() {
		assert_eq!(to_zscii('A'), b'A');
		assert_eq!(from_zscii(b'~'), '~');
		assert_eq!(to_zscii('\u{2603}'), b'?');
	}
}
