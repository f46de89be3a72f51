//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! Story file header and finishing touches.

use bitflags::bitflags;
use byteorder::{BigEndian, WriteBytesExt};
use log::debug;
use positioned_io::WriteBytesAtExt;

use crate::{error::AsmError, options::AssembleOptions};

pub const HEADER_SIZE: usize = 64;

/// Some tools assume story files are at least this long.
pub const MIN_STORY_SIZE: usize = 512;

const RELEASE_OFFSET: u64 = 0x02;
const FLAGS2_OFFSET: u64 = 0x10;
const SERIAL_OFFSET: u64 = 0x12;
const LENGTH_OFFSET: u64 = 0x1A;
const CHECKSUM_OFFSET: u64 = 0x1C;
const CREATOR_OFFSET: u64 = 0x3C;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct Flags1: u8 {
		/// The status line shows hours and minutes instead of score and moves.
		const TIME_GAME = 0x02;
	}

	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct Flags2: u16 {
		const SOUND = 0x80;
	}
}

/// Packed addresses are byte addresses divided by this.
pub fn packing_divisor(version: u8) -> i32 {
	match version {
		1..=3 => 2,
		8 => 8,
		_ => 4,
	}
}

/// The length field at 0x1A counts units of this many bytes.
pub fn header_length_divisor(version: u8) -> usize {
	match version {
		1..=3 => 2,
		4 | 5 => 4,
		_ => 8,
	}
}

pub fn max_story_size(version: u8) -> usize {
	match version {
		1..=3 => 128 * 1024,
		4 | 5 => 256 * 1024,
		7 => 320 * 1024,
		_ => 512 * 1024,
	}
}

/// Header values taken from the symbols of the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFields {
	pub release: i32,
	pub endlod: i32,
	pub start: i32,
	pub vocab: i32,
	pub object: i32,
	pub global: i32,
	pub impure: i32,
	pub words: i32,
}

impl HeaderFields {
	pub fn validate(&self) -> Result<(), AsmError> {
		if self.start > 0x10000 {
			return Err(AsmError::HeaderFieldOutOfRange {
				field: "START",
				value: self.start,
			});
		}
		if self.impure > 0x10000 {
			return Err(AsmError::HeaderFieldOutOfRange {
				field: "IMPURE",
				value: self.impure,
			});
		}
		if self.endlod < self.impure {
			return Err(AsmError::EndlodBeforeImpure {
				endlod: self.endlod,
				impure: self.impure,
			});
		}
		Ok(())
	}
}

/// Writes the 64-byte header used before V5. Serial, length and checksum
/// are left zero for [`finalize`].
pub fn write_header(out: &mut Vec<u8>, version: u8, flags1: Flags1, flags2: Flags2, fields: &HeaderFields) {
	// writes to a Vec cannot fail
	let mut put = |value: i32| {
		let _ = out.write_u16::<BigEndian>(value as u16);
	};
	put(((version as i32) << 8) | flags1.bits() as i32);
	put(fields.release);
	put(fields.endlod);
	put(fields.start);
	put(fields.vocab);
	put(fields.object);
	put(fields.global);
	put(fields.impure);
	put(flags2.bits() as i32);
	// serial
	put(0);
	put(0);
	put(0);
	put(fields.words);
	// length, checksum
	put(0);
	put(0);

	let header_start = out.len() - 30;
	out.resize(header_start + HEADER_SIZE, 0);
}

/// Sum of every byte after the header, modulo 65536.
pub fn checksum(story: &[u8]) -> u16 {
	story
		.iter()
		.skip(HEADER_SIZE)
		.fold(0u16, |sum, &b| sum.wrapping_add(b as u16))
}

/// Pads the story and fills in the header fields that depend on the whole
/// file: version, release override, flags, serial, length, checksum and
/// creator.
pub fn finalize(
	story: &mut Vec<u8>,
	version: u8,
	flags1: Flags1,
	flags2: Flags2,
	options: &AssembleOptions,
) -> Result<(), AsmError> {
	let divisor = header_length_divisor(version);
	let mut length = story.len().max(MIN_STORY_SIZE);
	length = (length + divisor - 1) / divisor * divisor;
	story.resize(length, 0);

	let max = max_story_size(version);
	if length > max {
		return Err(AsmError::FileTooLarge {
			size: length,
			max,
			version,
		});
	}

	story[0] = version;
	story[1] |= flags1.bits();
	let flags2 = u16::from_be_bytes([story[0x10], story[0x11]]) | flags2.bits();

	let checksum = checksum(story);
	let serial = options.serial_bytes();
	let creator = options.creator_bytes();

	let patch = |story: &mut Vec<u8>| -> std::io::Result<()> {
		if let Some(release) = options.release {
			story.write_u16_at::<BigEndian>(RELEASE_OFFSET, release)?;
		}
		story.write_u16_at::<BigEndian>(FLAGS2_OFFSET, flags2)?;
		for (i, b) in serial.iter().enumerate() {
			story.write_u8_at(SERIAL_OFFSET + i as u64, *b)?;
		}
		story.write_u16_at::<BigEndian>(LENGTH_OFFSET, (length / divisor) as u16)?;
		story.write_u16_at::<BigEndian>(CHECKSUM_OFFSET, checksum)?;
		for (i, b) in creator.iter().enumerate() {
			story.write_u8_at(CREATOR_OFFSET + i as u64, *b)?;
		}
		Ok(())
	};
	patch(story).map_err(AsmError::ImageWrite)?;

	debug!(
		"finalized V{} story: {} bytes, checksum {:#06x}",
		version, length, checksum
	);
	Ok(())
}
