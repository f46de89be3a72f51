//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use chrono::Local;

use crate::opcodes::NameStyle;

/// Settings for one assembly. The source may still change the version with
/// `.NEW`.
#[derive(Debug, Clone)]
pub struct AssembleOptions {
	/// Version assumed until a `.NEW` says otherwise.
	pub version: u8,
	/// Takes precedence over `RELEASEID` in the source.
	pub release: Option<u16>,
	/// Six characters; defaults to today's date as `yyMMdd`.
	pub serial: Option<String>,
	/// Four characters written at 0x3C.
	pub creator: String,
	pub name_style: NameStyle,
	/// Collect string literals for abbreviation discovery.
	pub abbreviate: bool,
	pub abbreviation_count: usize,
	pub list_labels: bool,
	pub quiet: bool,
	/// Overrides the pass ceiling derived from the number of span-dependent
	/// instructions.
	pub max_passes: Option<usize>,
}

impl Default for AssembleOptions {
	fn default() -> Self {
		Self {
			version: 3,
			release: None,
			serial: None,
			creator: "ZAPF".to_owned(),
			name_style: NameStyle::Classic,
			abbreviate: false,
			abbreviation_count: crate::text::MAX_ABBREVIATIONS,
			list_labels: false,
			quiet: false,
			max_passes: None,
		}
	}
}

impl AssembleOptions {
	pub fn with_version(mut self, version: u8) -> Self {
		self.version = version;
		self
	}

	pub fn with_release(mut self, release: u16) -> Self {
		self.release = Some(release);
		self
	}

	/// Serial number to write, padded or cut to six characters.
	pub fn serial_bytes(&self) -> [u8; 6] {
		let serial = self
			.serial
			.clone()
			.unwrap_or_else(|| Local::now().format("%y%m%d").to_string());
		fixed_ascii(&serial, b'0')
	}

	pub fn creator_bytes(&self) -> [u8; 4] {
		fixed_ascii(&self.creator, b' ')
	}
}

fn fixed_ascii<const N: usize>(text: &str, pad: u8) -> [u8; N] {
	let mut out = [pad; N];
	for (slot, c) in out.iter_mut().zip(text.chars()) {
		*slot = u8::try_from(c).unwrap_or(b'?');
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn serial_and_creator_are_fixed_width() {
		let opts = AssembleOptions {
			serial: Some("8401021234".into()),
			creator: "ZX".into(),
			..Default::default()
		};
		assert_eq!(&opts.serial_bytes(), b"840102");
		assert_eq!(&opts.creator_bytes(), b"ZX  ");
	}

	#[test]
	fn default_serial_is_a_date() {
		let serial = AssembleOptions::default().serial_bytes();
		assert!(serial.iter().all(u8::is_ascii_digit));
	}
}
