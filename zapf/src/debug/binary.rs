//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use positioned_io::WriteBytesAtExt;

use super::{DebugFileWriter, DebugRecord, LineRef};

const MAGIC: u16 = 0xDEBF;
const FORMAT: u16 = 0;
const CREATOR: u16 = 2001;

/// Size of the LINEREF record header: record type, routine number, count.
const LINEREF_HEADER: usize = 5;

#[derive(Debug)]
struct OpenRoutine {
	start: i32,
	points: u16,
	/// The LINEREF record, held back until the count is known.
	lines: Vec<u8>,
}

/// Writes the binary DEBF format.
#[derive(Debug)]
pub struct BinaryDebugFileWriter<W: Write> {
	out: W,
	next_routine: u16,
	routine: Option<OpenRoutine>,
}

impl<W: Write> BinaryDebugFileWriter<W> {
	pub fn new(mut out: W) -> io::Result<Self> {
		out.write_u16::<BigEndian>(MAGIC)?;
		out.write_u16::<BigEndian>(FORMAT)?;
		out.write_u16::<BigEndian>(CREATOR)?;

		Ok(Self {
			out,
			next_routine: 0,
			routine: None,
		})
	}

	pub fn into_inner(self) -> W {
		self.out
	}

	fn record(&mut self, kind: DebugRecord) -> io::Result<()> {
		self.out.write_u8(kind.into())
	}
}

fn write_address(out: &mut impl Write, address: i32) -> io::Result<()> {
	out.write_u24::<BigEndian>(address as u32 & 0xff_ffff)
}

fn write_line_ref(out: &mut impl Write, loc: LineRef) -> io::Result<()> {
	out.write_u8(loc.file)?;
	out.write_u16::<BigEndian>(loc.line)?;
	out.write_u8(loc.col)
}

fn write_string(out: &mut impl Write, s: &str) -> io::Result<()> {
	let bytes: Vec<u8> = s.chars().map(|c| if c.is_ascii() { c as u8 } else { b'?' }).collect();
	out.write_all(&bytes)?;
	out.write_u8(0)
}

impl<W: Write> DebugFileWriter for BinaryDebugFileWriter<W> {
	fn start_routine(
		&mut self,
		start: LineRef,
		address: i32,
		name: &str,
		locals: &[String],
	) -> io::Result<()> {
		let number = self.next_routine;
		self.record(DebugRecord::Routine)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_line_ref(&mut self.out, start)?;
		write_address(&mut self.out, address)?;
		write_string(&mut self.out, name)?;
		for local in locals {
			write_string(&mut self.out, local)?;
		}
		self.out.write_u8(0)?;

		let mut lines = Vec::with_capacity(LINEREF_HEADER + 64);
		lines.write_u8(DebugRecord::LineRef.into())?;
		lines.write_u16::<BigEndian>(number)?;
		lines.write_u16::<BigEndian>(0)?;

		self.routine = Some(OpenRoutine {
			start: address,
			points: 0,
			lines,
		});
		Ok(())
	}

	fn in_routine(&self) -> bool {
		self.routine.is_some()
	}

	fn restart_routine(&mut self) -> io::Result<()> {
		if let Some(routine) = &mut self.routine {
			routine.lines.truncate(LINEREF_HEADER);
			routine.points = 0;
		}
		Ok(())
	}

	fn write_line(&mut self, loc: LineRef, address: i32) -> io::Result<()> {
		let Some(routine) = &mut self.routine else {
			return Err(io::Error::new(
				io::ErrorKind::InvalidInput,
				"line record outside of a routine",
			));
		};

		write_line_ref(&mut routine.lines, loc)?;
		routine
			.lines
			.write_u16::<BigEndian>((address - routine.start) as u16)?;
		routine.points += 1;
		Ok(())
	}

	fn end_routine(&mut self, end: LineRef, address: i32) -> io::Result<()> {
		match self.routine.take() {
			Some(mut routine) => {
				let mut lines = &mut routine.lines[..];
				lines.write_u16_at::<BigEndian>(3, routine.points)?;
				self.out.write_all(&routine.lines)?;
			},
			None => warn!("routine end without a routine start"),
		}

		let number = self.next_routine;
		self.next_routine += 1;
		self.record(DebugRecord::RoutineEnd)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_line_ref(&mut self.out, end)?;
		write_address(&mut self.out, address)
	}

	fn write_action(&mut self, number: u16, name: &str) -> io::Result<()> {
		self.record(DebugRecord::Action)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_string(&mut self.out, name)
	}

	fn write_array(&mut self, offset_from_global: u16, name: &str) -> io::Result<()> {
		self.record(DebugRecord::Array)?;
		self.out.write_u16::<BigEndian>(offset_from_global)?;
		write_string(&mut self.out, name)
	}

	fn write_attr(&mut self, number: u16, name: &str) -> io::Result<()> {
		self.record(DebugRecord::Attr)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_string(&mut self.out, name)
	}

	fn write_class(&mut self, name: &str, start: LineRef, end: LineRef) -> io::Result<()> {
		self.record(DebugRecord::Class)?;
		write_string(&mut self.out, name)?;
		write_line_ref(&mut self.out, start)?;
		write_line_ref(&mut self.out, end)
	}

	fn write_fake_action(&mut self, number: u16, name: &str) -> io::Result<()> {
		self.record(DebugRecord::FakeAction)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_string(&mut self.out, name)
	}

	fn write_file(&mut self, number: u8, include_name: &str, actual_name: &str) -> io::Result<()> {
		self.record(DebugRecord::File)?;
		self.out.write_u8(number)?;
		write_string(&mut self.out, include_name)?;
		write_string(&mut self.out, actual_name)
	}

	fn write_global(&mut self, number: u8, name: &str) -> io::Result<()> {
		self.record(DebugRecord::Global)?;
		self.out.write_u8(number)?;
		write_string(&mut self.out, name)
	}

	fn write_header(&mut self, header: &[u8]) -> io::Result<()> {
		let mut block = [0u8; 64];
		let n = header.len().min(64);
		block[..n].copy_from_slice(&header[..n]);
		self.record(DebugRecord::Header)?;
		self.out.write_all(&block)
	}

	fn write_map(&mut self, map: &[(String, i32)]) -> io::Result<()> {
		self.record(DebugRecord::Map)?;
		for (name, address) in map {
			write_string(&mut self.out, name)?;
			write_address(&mut self.out, *address)?;
		}
		self.out.write_u8(0)
	}

	fn write_object(&mut self, number: u16, name: &str, start: LineRef, end: LineRef) -> io::Result<()> {
		self.record(DebugRecord::Object)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_string(&mut self.out, name)?;
		write_line_ref(&mut self.out, start)?;
		write_line_ref(&mut self.out, end)
	}

	fn write_prop(&mut self, number: u16, name: &str) -> io::Result<()> {
		self.record(DebugRecord::Prop)?;
		self.out.write_u16::<BigEndian>(number)?;
		write_string(&mut self.out, name)
	}

	fn close(&mut self) -> io::Result<()> {
		self.record(DebugRecord::Eof)?;
		self.out.flush()
	}
}

fn read_string(cur: &mut Cursor<&[u8]>, body: &mut Vec<u8>) -> io::Result<usize> {
	let mut len = 0;
	loop {
		let b = cur.read_u8()?;
		body.push(b);
		if b == 0 {
			return Ok(len);
		}
		len += 1;
	}
}

fn read_fixed(cur: &mut Cursor<&[u8]>, body: &mut Vec<u8>, n: usize) -> io::Result<()> {
	let mut buf = vec![0; n];
	cur.read_exact(&mut buf)?;
	body.extend(buf);
	Ok(())
}

/// Splits a DEBF stream into records, each with the bytes that follow its
/// type byte. Stops after the EOF record.
pub fn read_records(data: &[u8]) -> io::Result<Vec<(DebugRecord, Vec<u8>)>> {
	let mut cur = Cursor::new(data);
	if cur.read_u16::<BigEndian>()? != MAGIC {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "not a debug file"));
	}
	cur.read_u16::<BigEndian>()?;
	cur.read_u16::<BigEndian>()?;

	let mut records = Vec::new();
	loop {
		let byte = cur.read_u8()?;
		let kind = DebugRecord::try_from(byte).map_err(|_| {
			io::Error::new(
				io::ErrorKind::InvalidData,
				format!("unknown debug record {}", byte),
			)
		})?;

		let mut body = Vec::new();
		let c = &mut cur;
		let b = &mut body;
		match kind {
			DebugRecord::Eof => {
				records.push((kind, body));
				return Ok(records);
			},
			DebugRecord::File => {
				read_fixed(c, b, 1)?;
				read_string(c, b)?;
				read_string(c, b)?;
			},
			DebugRecord::Class => {
				read_string(c, b)?;
				read_fixed(c, b, 8)?;
			},
			DebugRecord::Object => {
				read_fixed(c, b, 2)?;
				read_string(c, b)?;
				read_fixed(c, b, 8)?;
			},
			DebugRecord::Global => {
				read_fixed(c, b, 1)?;
				read_string(c, b)?;
			},
			DebugRecord::Attr
			| DebugRecord::Prop
			| DebugRecord::FakeAction
			| DebugRecord::Action
			| DebugRecord::Array => {
				read_fixed(c, b, 2)?;
				read_string(c, b)?;
			},
			DebugRecord::Header => read_fixed(c, b, 64)?,
			DebugRecord::LineRef => {
				read_fixed(c, b, 4)?;
				let count = u16::from_be_bytes([b[2], b[3]]) as usize;
				read_fixed(c, b, count * 6)?;
			},
			DebugRecord::Routine => {
				read_fixed(c, b, 2 + 4 + 3)?;
				read_string(c, b)?;
				while read_string(c, b)? > 0 {}
			},
			DebugRecord::Map => {
				while read_string(c, b)? > 0 {
					read_fixed(c, b, 3)?;
				}
			},
			DebugRecord::RoutineEnd => read_fixed(c, b, 2 + 4 + 3)?,
		}
		records.push((kind, body));
	}
}
