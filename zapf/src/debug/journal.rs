//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::io;

use log::warn;

use super::{DebugFileWriter, LineRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
	StartRoutine {
		start: LineRef,
		address: i32,
		name: String,
		locals: Vec<String>,
	},
	Line {
		loc: LineRef,
		address: i32,
	},
	EndRoutine {
		end: LineRef,
		address: i32,
	},
	RestartRoutine,
	Action(u16, String),
	Array(u16, String),
	Attr(u16, String),
	Class {
		name: String,
		start: LineRef,
		end: LineRef,
	},
	FakeAction(u16, String),
	File {
		number: u8,
		include_name: String,
		actual_name: String,
	},
	Global(u8, String),
	Object {
		number: u16,
		name: String,
		start: LineRef,
		end: LineRef,
	},
	Prop(u16, String),
}

/// Debug events recorded during one pass, plus the `.DEBUG-MAP` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugJournal {
	events: Vec<DebugEvent>,
	map: Vec<(String, i32)>,
	in_routine: bool,
}

impl DebugJournal {
	pub fn new() -> Self {
		Self::default()
	}

	/// Whether any debug directive has been seen.
	pub fn is_empty(&self) -> bool {
		self.events.is_empty() && self.map.is_empty()
	}

	pub fn events(&self) -> &[DebugEvent] {
		&self.events
	}

	pub fn in_routine(&self) -> bool {
		self.in_routine
	}

	pub fn push(&mut self, event: DebugEvent) {
		match &event {
			DebugEvent::StartRoutine { .. } => self.in_routine = true,
			DebugEvent::EndRoutine { .. } => self.in_routine = false,
			_ => {},
		}
		self.events.push(event);
	}

	/// Later entries replace earlier ones with the same name.
	pub fn set_map_entry(&mut self, name: &str, address: i32) {
		match self.map.iter_mut().find(|(n, _)| n == name) {
			Some(entry) => entry.1 = address,
			None => self.map.push((name.to_owned(), address)),
		}
	}

	pub fn map(&self) -> &[(String, i32)] {
		&self.map
	}

	/// Sends every recorded event to `writer`, in order.
	pub fn replay(&self, writer: &mut dyn DebugFileWriter) -> io::Result<()> {
		for event in &self.events {
			match event {
				DebugEvent::StartRoutine {
					start,
					address,
					name,
					locals,
				} => writer.start_routine(*start, *address, name, locals)?,
				DebugEvent::Line { loc, address } => {
					if writer.in_routine() {
						writer.write_line(*loc, *address)?;
					} else {
						warn!("dropping debug line {} outside of a routine", loc.line);
					}
				},
				DebugEvent::EndRoutine { end, address } => writer.end_routine(*end, *address)?,
				DebugEvent::RestartRoutine => writer.restart_routine()?,
				DebugEvent::Action(number, name) => writer.write_action(*number, name)?,
				DebugEvent::Array(offset, name) => writer.write_array(*offset, name)?,
				DebugEvent::Attr(number, name) => writer.write_attr(*number, name)?,
				DebugEvent::Class { name, start, end } => writer.write_class(name, *start, *end)?,
				DebugEvent::FakeAction(number, name) => writer.write_fake_action(*number, name)?,
				DebugEvent::File {
					number,
					include_name,
					actual_name,
				} => writer.write_file(*number, include_name, actual_name)?,
				DebugEvent::Global(number, name) => writer.write_global(*number, name)?,
				DebugEvent::Object {
					number,
					name,
					start,
					end,
				} => writer.write_object(*number, name, *start, *end)?,
				DebugEvent::Prop(number, name) => writer.write_prop(*number, name)?,
			}
		}
		Ok(())
	}
}
