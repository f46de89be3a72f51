//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! Sorted vocabulary tables.
//!
//! Records are laid out in source order, then sorted by their leading key
//! bytes. Pointers from one record to another are tracked as reference
//! sites and rewritten after the sort, so the caller never observes a
//! half-sorted table.

use std::collections::HashMap;

use byteorder::BigEndian;
use log::trace;
use positioned_io::WriteBytesAtExt;

use crate::{
	error::AsmError,
	text::{EncodeMode, StringEncoder},
};

#[derive(Debug, Clone)]
struct Reference {
	/// Offset of the pointer word from the start of the table.
	site: usize,
	label: String,
	addend: i32,
}

#[derive(Debug, Clone)]
pub struct VocabTable {
	start: i32,
	record_size: usize,
	key_size: usize,
	labels: Vec<(String, usize)>,
	refs: Vec<Reference>,
}

impl VocabTable {
	pub fn new(start: i32, record_size: usize, key_size: usize) -> Result<Self, AsmError> {
		if record_size == 0 || key_size > record_size {
			return Err(AsmError::BadDirective {
				directive: ".VOCBEG",
				message: format!("bad record size {} with key size {}", record_size, key_size),
			});
		}

		Ok(Self {
			start,
			record_size,
			key_size,
			labels: Vec::new(),
			refs: Vec::new(),
		})
	}

	pub fn start(&self) -> i32 {
		self.start
	}

	pub fn is_record_boundary(&self, pos: i32) -> bool {
		(pos - self.start) as usize % self.record_size == 0
	}

	/// Records a label on a record boundary. Its address follows the record
	/// through the sort.
	pub fn add_label(&mut self, name: &str, pos: i32) {
		self.labels.push((name.to_owned(), (pos - self.start) as usize));
	}

	/// Records that the word at `pos` holds the address of `label` plus
	/// `addend`. Only labels defined inside this table are rewritten.
	pub fn add_reference(&mut self, pos: i32, label: &str, addend: i32) {
		self.refs.push(Reference {
			site: (pos - self.start) as usize,
			label: label.to_owned(),
			addend,
		});
	}

	/// Sorts the records of `block` in place, rewrites every internal
	/// pointer and returns the new address of each label in the table.
	pub fn finish(self, block: &mut [u8]) -> Vec<(String, i32)> {
		let rs = self.record_size;
		let records = block.len() / rs;

		let mut order: Vec<usize> = (0..records).collect();
		order.sort_by(|&a, &b| {
			block[a * rs..a * rs + self.key_size].cmp(&block[b * rs..b * rs + self.key_size])
		});

		let mut new_index = vec![0; records];
		for (new, &old) in order.iter().enumerate() {
			new_index[old] = new;
		}
		trace!("vocab at {}: {} record(s), order {:?}", self.start, records, order);

		let moved = |offset: usize| -> usize {
			if offset < records * rs {
				new_index[offset / rs] * rs + offset % rs
			} else {
				offset
			}
		};

		let original = block[..records * rs].to_vec();
		for (new, &old) in order.iter().enumerate() {
			block[new * rs..(new + 1) * rs].copy_from_slice(&original[old * rs..(old + 1) * rs]);
		}

		let addresses: HashMap<&str, i32> = self
			.labels
			.iter()
			.map(|(name, offset)| (name.as_str(), self.start + moved(*offset) as i32))
			.collect();

		let mut slice = &mut block[..];
		for reference in &self.refs {
			let Some(&target) = addresses.get(reference.label.as_str()) else {
				continue;
			};
			let site = moved(reference.site);
			if site + 2 <= slice.len() {
				// in-bounds writes to a slice cannot fail
				let _ = slice.write_u16_at::<BigEndian>(site as u64, (target + reference.addend) as u16);
			}
		}

		self.labels
			.iter()
			.map(|(name, _)| (name.clone(), addresses[name.as_str()]))
			.collect()
	}
}

/// A field following a word's encoded text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VocabField {
	Byte(u8),
	Word(u16),
	/// Address of another entry, by its index in the input list.
	WordRef(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabWord {
	pub text: String,
	pub data: Vec<VocabField>,
}

/// Builds a sorted dictionary table at `base` from a list of words. Every
/// word must have the same data layout.
pub fn build_vocab(
	encoder: &mut StringEncoder,
	version: u8,
	base: i32,
	words: &[VocabWord],
) -> Result<Vec<u8>, AsmError> {
	let zchars = if version >= 4 { 9 } else { 6 };
	let key_size = zchars / 3 * 2;
	let data_size: usize = words
		.first()
		.map(|w| {
			w.data
				.iter()
				.map(|f| match f {
					VocabField::Byte(_) => 1,
					_ => 2,
				})
				.sum()
		})
		.unwrap_or(0);

	let mut table = VocabTable::new(base, key_size + data_size, key_size)?;
	let mut bytes = Vec::with_capacity(words.len() * (key_size + data_size));
	let label = |i: usize| format!("#{}", i);

	for (i, word) in words.iter().enumerate() {
		let pos = base + bytes.len() as i32;
		table.add_label(&label(i), pos);
		bytes.extend(encoder.encode(&word.text, Some(zchars), EncodeMode::NoAbbreviations));

		for field in &word.data {
			match field {
				VocabField::Byte(b) => bytes.push(*b),
				VocabField::Word(w) => bytes.extend(w.to_be_bytes()),
				VocabField::WordRef(target) => {
					if *target >= words.len() {
						return Err(AsmError::UndefinedSymbol(label(*target)));
					}
					table.add_reference(base + bytes.len() as i32, &label(*target), 0);
					bytes.extend([0, 0]);
				},
			}
		}

		let expected = (i + 1) * (key_size + data_size);
		if bytes.len() != expected {
			return Err(AsmError::BadDirective {
				directive: ".VOCBEG",
				message: format!("entry for \"{}\" has a different size", word.text),
			});
		}
	}

	table.finish(&mut bytes);
	Ok(bytes)
}
