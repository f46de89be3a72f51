//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! Debug information in the Inform debug file format.
//!
//! The layout engine never talks to a writer directly while it is laying
//! out code. It records [`journal::DebugEvent`]s for every pass and replays
//! only the winning pass into a [`DebugFileWriter`].

use std::io;

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod binary;
pub mod journal;

pub use self::{
	binary::{read_records, BinaryDebugFileWriter},
	journal::{DebugEvent, DebugJournal},
};

pub const ABBREVIATIONS_MAP_NAME: &str = "abbreviations table";
pub const PROPERTIES_MAP_NAME: &str = "property defaults";
pub const OBJECTS_MAP_NAME: &str = "object tree";
pub const GLOBALS_MAP_NAME: &str = "global variables";
pub const VOCAB_MAP_NAME: &str = "dictionary";

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DebugRecord {
	Eof = 0,
	File = 1,
	Class = 2,
	Object = 3,
	Global = 4,
	Attr = 5,
	Prop = 6,
	FakeAction = 7,
	Action = 8,
	Header = 9,
	LineRef = 10,
	Routine = 11,
	Array = 12,
	Map = 13,
	RoutineEnd = 14,
}

/// A position in a source file as the debug format stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LineRef {
	pub file: u8,
	pub line: u16,
	pub col: u8,
}

impl LineRef {
	pub fn new(file: u8, line: u16, col: u8) -> Self {
		Self { file, line, col }
	}
}

/// Receives debug records once layout has converged.
///
/// Line records always fall between `start_routine` and `end_routine`;
/// `restart_routine` throws away the lines written since the last
/// `start_routine`.
pub trait DebugFileWriter {
	fn start_routine(
		&mut self,
		start: LineRef,
		address: i32,
		name: &str,
		locals: &[String],
	) -> io::Result<()>;
	fn in_routine(&self) -> bool;
	fn restart_routine(&mut self) -> io::Result<()>;
	fn write_line(&mut self, loc: LineRef, address: i32) -> io::Result<()>;
	fn end_routine(&mut self, end: LineRef, address: i32) -> io::Result<()>;

	fn write_action(&mut self, number: u16, name: &str) -> io::Result<()>;
	fn write_array(&mut self, offset_from_global: u16, name: &str) -> io::Result<()>;
	fn write_attr(&mut self, number: u16, name: &str) -> io::Result<()>;
	fn write_class(&mut self, name: &str, start: LineRef, end: LineRef) -> io::Result<()>;
	fn write_fake_action(&mut self, number: u16, name: &str) -> io::Result<()>;
	fn write_file(&mut self, number: u8, include_name: &str, actual_name: &str) -> io::Result<()>;
	fn write_global(&mut self, number: u8, name: &str) -> io::Result<()>;
	fn write_header(&mut self, header: &[u8]) -> io::Result<()>;
	fn write_map(&mut self, map: &[(String, i32)]) -> io::Result<()>;
	fn write_object(&mut self, number: u16, name: &str, start: LineRef, end: LineRef) -> io::Result<()>;
	fn write_prop(&mut self, number: u16, name: &str) -> io::Result<()>;

	fn close(&mut self) -> io::Result<()>;
}
