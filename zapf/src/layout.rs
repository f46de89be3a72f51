//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! The layout engine.
//!
//! Every pass walks the whole line list and writes a fresh image. Backward
//! references read the symbols defined so far in the same pass; forward
//! references read the snapshot left by the previous pass. Assembly is done
//! when a pass ends with exactly the snapshot it started from.
//!
//! Span-dependent slots (branch offsets, JUMP operands and operands holding
//! forward constants) start narrow and only ever widen. Branch targets and
//! most JUMP targets are local labels, so they are settled inside the pass:
//! when a routine closes, every narrow slot in it is checked against the
//! addresses just laid out, and a routine with a slot that no longer fits
//! is rewound and walked again. A JUMP to a global label defined past the
//! routine is sized like a forward constant and left to the next pass.

use std::{collections::HashSet, fmt::Write as _, io};

use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, info, trace, warn};
use positioned_io::WriteBytesAtExt;

use crate::{
	ast::{AsmExpr, AsmLine, Branch, DirectiveKind, Instruction, LineKind},
	debug::{
		DebugEvent, DebugFileWriter, DebugJournal, LineRef, ABBREVIATIONS_MAP_NAME, GLOBALS_MAP_NAME,
		OBJECTS_MAP_NAME, PROPERTIES_MAP_NAME, VOCAB_MAP_NAME,
	},
	encode::{
		branch_offset, encode_branch, encode_head, jump_operand, short_branch_fits, short_jump_fits,
		BranchTarget, Operand,
	},
	error::{AsmError, AssemblyFailed, Located, SourceLocation, Warning},
	image::{self, packing_divisor, Flags1, Flags2, HeaderFields},
	opcodes::{by_op, NameStyle, OpcodeDict, ZOpDescriptor, ZOpFlags},
	options::AssembleOptions,
	symbols::{Scope, Symbol, SymbolKind, SymbolTable},
	text::{EncodeMode, StringEncoder},
	vocab::VocabTable,
};

const MAX_LOCALS: usize = 15;
const MAX_GLOBALS: usize = 240;

/// Passes allowed beyond one per span-dependent slot.
const EXTRA_PASSES: usize = 16;

/// A finished story file and what went into it.
#[derive(Debug, Clone)]
pub struct Assembly {
	pub story: Vec<u8>,
	pub symbols: SymbolTable,
	pub warnings: Vec<Located<Warning>>,
	/// The version in effect at the end, after any `.NEW`.
	pub version: u8,
	pub passes: usize,
	/// String literals seen in the first pass, when collecting them for
	/// abbreviation discovery.
	pub strings: Vec<String>,
}

impl Assembly {
	/// Global labels, routines and strings by byte address, with the distance
	/// to the next entry.
	pub fn label_listing(&self) -> String {
		let divisor = packing_divisor(self.version);
		let mut entries: Vec<(i32, &str)> = self
			.symbols
			.globals()
			.filter_map(|(name, sym)| match sym.kind {
				SymbolKind::GlobalLabel => Some((sym.value, name)),
				SymbolKind::Function | SymbolKind::String => Some((sym.value * divisor, name)),
				_ => None,
			})
			.collect();
		entries.sort();

		let width = entries.iter().map(|(_, name)| name.len()).max().unwrap_or(0).max(4);
		let mut out = String::new();
		// writing to a String cannot fail
		let _ = writeln!(out, "{:width$}  {:>6}  Length", "Name", "Addr", width = width);
		for (i, (addr, name)) in entries.iter().enumerate() {
			let length = match entries.get(i + 1) {
				Some((next, _)) => (next - addr).to_string(),
				None => "to end".to_owned(),
			};
			let _ = writeln!(out, "{:width$}  {:06x}  {}", name, addr, length, width = width);
		}
		out
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
	Branch,
	Jump,
	Operand(u8),
}

/// Identifies one span-dependent slot across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SdiKey {
	line: usize,
	slot: Slot,
}

#[derive(Debug, Clone, Copy)]
struct Value {
	symbol: Symbol,
	/// Read from the previous pass, so it may still move.
	forward: bool,
}

impl Value {
	fn exact(symbol: Symbol) -> Self {
		Self {
			symbol,
			forward: false,
		}
	}

	fn forward(symbol: Symbol) -> Self {
		Self {
			symbol,
			forward: true,
		}
	}

	fn value(&self) -> i32 {
		self.symbol.value
	}
}

#[derive(Debug, Clone, Copy)]
enum PatchSite {
	Branch { pos: usize, polarity: bool },
	Jump { opcode_pos: usize },
}

impl PatchSite {
	fn short_fits(&self, target: i32) -> bool {
		match *self {
			Self::Branch { pos, .. } => short_branch_fits(branch_offset(target, pos as i32, false)),
			Self::Jump { opcode_pos } => short_jump_fits(target, opcode_pos as i32),
		}
	}
}

/// A branch or JUMP to a label that had not been defined yet.
#[derive(Debug, Clone)]
struct Fixup {
	key: SdiKey,
	site: PatchSite,
	label: String,
	long: bool,
	location: SourceLocation,
}

#[derive(Debug)]
struct Checkpoint {
	line: usize,
	out_len: usize,
	errors: usize,
	warnings: usize,
	strings: usize,
	/// Symbol definitions made since the checkpoint, with what they replaced.
	undo: Vec<(Scope, String, Option<Symbol>)>,
}

#[derive(Debug)]
struct Routine {
	name: String,
	checkpoint: Checkpoint,
	fixups: Vec<Fixup>,
}

#[derive(Debug, Clone, Copy)]
struct OpenTable {
	start: usize,
	size: Option<i32>,
}

enum Flow {
	Next,
	Stop,
	/// `.NEW` changed the version; start over.
	Restart,
}

/// State that survives from one pass to the next.
struct Layout<'a> {
	lines: &'a [AsmLine],
	options: &'a AssembleOptions,
	version: u8,
	version_fixed: bool,
	widened: HashSet<SdiKey>,
	sdi_seen: HashSet<SdiKey>,
	previous: SymbolTable,
	pass: usize,
	/// String literals collected by the first pass.
	strings: Vec<String>,
}

impl<'a> Layout<'a> {
	fn new(lines: &'a [AsmLine], options: &'a AssembleOptions) -> Self {
		Self {
			lines,
			options,
			version: options.version,
			version_fixed: false,
			widened: HashSet::new(),
			sdi_seen: HashSet::new(),
			previous: SymbolTable::new(),
			pass: 0,
			strings: Vec::new(),
		}
	}

	fn restart(&mut self) {
		self.widened.clear();
		self.sdi_seen.clear();
		self.previous = SymbolTable::new();
		self.pass = 0;
		self.strings.clear();
	}

	fn widen(&mut self, key: SdiKey) -> bool {
		let new = self.widened.insert(key);
		if new {
			trace!("widening {:?} at line {}", key.slot, key.line);
		}
		new
	}
}

struct PassOutput {
	story: Vec<u8>,
	symbols: SymbolTable,
	journal: DebugJournal,
	errors: Vec<Located<AsmError>>,
	warnings: Vec<Located<Warning>>,
	strings: Vec<String>,
	flags1: Flags1,
	flags2: Flags2,
}

struct Pass<'l, 'a> {
	layout: &'l mut Layout<'a>,
	out: Vec<u8>,
	symbols: SymbolTable,
	/// Constants whose value came from a forward reference.
	forward_constants: HashSet<String>,
	locked: HashSet<String>,
	journal: DebugJournal,
	encoder: StringEncoder,
	opcodes: OpcodeDict,
	errors: Vec<Located<AsmError>>,
	warnings: Vec<Located<Warning>>,
	strings: Vec<String>,
	flags1: Flags1,
	flags2: Flags2,
	routine: Option<Routine>,
	table: Option<OpenTable>,
	vocab: Option<VocabTable>,
	globals: usize,
	objects: usize,
	location: Option<SourceLocation>,
}

fn bad(kind: DirectiveKind, message: impl Into<String>) -> AsmError {
	AsmError::BadDirective {
		directive: kind.name(),
		message: message.into(),
	}
}

fn arg(kind: DirectiveKind, args: &[AsmExpr], i: usize) -> Result<&AsmExpr, AsmError> {
	args.get(i)
		.ok_or_else(|| bad(kind, format!("missing argument {}", i + 1)))
}

fn symbol_arg(kind: DirectiveKind, args: &[AsmExpr], i: usize) -> Result<&str, AsmError> {
	arg(kind, args, i)?
		.symbol_name()
		.ok_or_else(|| bad(kind, format!("argument {} must be a name", i + 1)))
}

fn text_arg(kind: DirectiveKind, args: &[AsmExpr], i: usize) -> Result<&str, AsmError> {
	arg(kind, args, i)?
		.as_string()
		.ok_or_else(|| bad(kind, format!("argument {} must be a string", i + 1)))
}

/// Names in debug directives may be written as strings, symbols or numbers.
fn name_arg(kind: DirectiveKind, args: &[AsmExpr], i: usize) -> Result<String, AsmError> {
	match arg(kind, args, i)? {
		AsmExpr::String(text) | AsmExpr::Symbol(text) => Ok(text.clone()),
		AsmExpr::Number(n) => Ok(n.to_string()),
		other => Err(bad(kind, format!("expected a name, got {}", other))),
	}
}

fn closes_routine(kind: &LineKind) -> bool {
	match kind {
		LineKind::Label { .. } | LineKind::Instruction(_) => false,
		LineKind::Directive { kind, .. } => !kind.keeps_routine_open(),
		LineKind::Equate { .. } | LineKind::Data(_) => true,
	}
}

fn is_debug_directive(kind: DirectiveKind) -> bool {
	kind.name().starts_with(".DEBUG-")
}

fn return_target(label: &str) -> Option<bool> {
	match label {
		"TRUE" | "rtrue" => Some(true),
		"FALSE" | "rfalse" => Some(false),
		_ => None,
	}
}

impl<'l, 'a> Pass<'l, 'a> {
	fn new(layout: &'l mut Layout<'a>) -> Self {
		let options = layout.options;
		let mut symbols = SymbolTable::new();
		let stack = match options.name_style {
			NameStyle::Classic => "STACK",
			NameStyle::Inform => "sp",
		};
		symbols.define(Scope::Global, stack, Symbol::new(SymbolKind::Variable, 0));

		let mut locked = HashSet::new();
		if let Some(release) = options.release {
			symbols.define(Scope::Global, "RELEASEID", Symbol::constant(release as i32));
			locked.insert("RELEASEID".to_owned());
		}

		let opcodes = OpcodeDict::new(layout.version, options.name_style);

		Self {
			layout,
			out: Vec::new(),
			symbols,
			forward_constants: HashSet::new(),
			locked,
			journal: DebugJournal::new(),
			encoder: StringEncoder::new(),
			opcodes,
			errors: Vec::new(),
			warnings: Vec::new(),
			strings: Vec::new(),
			flags1: Flags1::empty(),
			flags2: Flags2::empty(),
			routine: None,
			table: None,
			vocab: None,
			globals: 0,
			objects: 0,
			location: None,
		}
	}

	fn version(&self) -> u8 {
		self.layout.version
	}

	fn pos(&self) -> usize {
		self.out.len()
	}

	fn align(&mut self, alignment: usize) {
		let alignment = alignment.max(1);
		while self.out.len() % alignment != 0 {
			self.out.push(0);
		}
	}

	fn put_word(&mut self, value: i32) {
		// writes to a Vec cannot fail
		let _ = self.out.write_u16::<BigEndian>(value as u16);
	}

	fn error(&mut self, error: AsmError) {
		self.errors.push(Located::new(self.location.clone(), error));
	}

	fn warning(&mut self, warning: Warning) {
		self.warnings.push(Located::new(self.location.clone(), warning));
	}

	fn define(&mut self, scope: Scope, name: &str, symbol: Symbol) {
		let old = self.symbols.define(scope.clone(), name, symbol);
		if let Some(routine) = &mut self.routine {
			routine.checkpoint.undo.push((scope, name.to_owned(), old));
		}
	}

	fn routine_name(&self) -> Option<String> {
		self.routine.as_ref().map(|r| r.name.clone())
	}

	fn collect_string(&mut self, text: &str) {
		if self.layout.options.abbreviate && self.layout.pass == 1 {
			self.strings.push(text.to_owned());
		}
	}

	/// Walks every line once. Returns `true` if the pass must be thrown away
	/// because the version changed.
	fn walk(&mut self) -> bool {
		let lines = self.layout.lines;

		if self.version() < 5 {
			self.write_header();
		}

		let mut i = 0;
		loop {
			let line = lines.get(i);
			if let Some(line) = line {
				self.location = Some(line.location.clone());
			}

			let closing = line.map_or(true, |line| closes_routine(&line.kind));
			if closing && self.routine.is_some() {
				if let Some(start) = self.close_routine() {
					i = start;
					continue;
				}
			}

			let Some(line) = line else {
				break;
			};
			match self.line(i, line) {
				Flow::Next => i += 1,
				Flow::Stop => break,
				Flow::Restart => return true,
			}
		}

		if self.table.is_some() {
			self.warning(Warning::UnterminatedTable);
		}
		if self.vocab.is_some() {
			self.warning(Warning::UnterminatedVocab);
		}
		false
	}

	fn finish(self) -> PassOutput {
		PassOutput {
			story: self.out,
			symbols: self.symbols,
			journal: self.journal,
			errors: self.errors,
			warnings: self.warnings,
			strings: self.strings,
			flags1: self.flags1,
			flags2: self.flags2,
		}
	}

	fn header_value(&mut self, name: &str, required: bool) -> i32 {
		let symbol = self
			.symbols
			.global(name)
			.or_else(|| self.layout.previous.global(name));
		match symbol {
			Some(sym) => match sym.kind {
				SymbolKind::GlobalLabel | SymbolKind::Function | SymbolKind::Constant => sym.value,
				_ => 0,
			},
			None => {
				if required {
					self.error(AsmError::UndefinedSymbol(name.to_owned()));
				}
				0
			},
		}
	}

	fn is_defined(&self, name: &str) -> bool {
		self.symbols.global(name).is_some() || self.layout.previous.global(name).is_some()
	}

	fn write_header(&mut self) {
		let release_name = if self.is_defined("RELEASEID") { "RELEASEID" } else { "ZORKID" };
		let release = self.header_value(release_name, false);
		let fields = HeaderFields {
			release,
			endlod: self.header_value("ENDLOD", true),
			start: self.header_value("START", true),
			vocab: self.header_value("VOCAB", true),
			object: self.header_value("OBJECT", true),
			global: self.header_value("GLOBAL", true),
			impure: self.header_value("IMPURE", true),
			words: self.header_value("WORDS", true),
		};
		if let Err(err) = fields.validate() {
			self.error(err);
		}

		let version = self.version();
		image::write_header(&mut self.out, version, Flags1::empty(), Flags2::empty(), &fields);
	}

	fn line(&mut self, index: usize, line: &AsmLine) -> Flow {
		let result = match &line.kind {
			LineKind::Label { name, global } => self.label(name, *global),
			LineKind::Equate { name, value } => self.equate(name, value),
			LineKind::Instruction(instr) => self.instruction(index, instr),
			LineKind::Directive { kind, args } => match self.directive(index, *kind, args) {
				Ok(flow) => return flow,
				Err(err) => Err(err),
			},
			LineKind::Data(args) => args.iter().try_for_each(|arg| self.data_word(arg)),
		};

		if let Err(err) = result {
			self.error(err);
		}
		Flow::Next
	}

	/// Settles the fixups of the open routine. Returns the line to resume at
	/// if the routine has to be laid out again.
	fn close_routine(&mut self) -> Option<usize> {
		let routine = self.routine.take()?;

		let targets: Vec<Option<i32>> = routine
			.fixups
			.iter()
			.map(|fixup| {
				let local = self
					.symbols
					.local(&routine.name, &fixup.label)
					.filter(|sym| sym.kind == SymbolKind::LocalLabel);
				let global = || match fixup.site {
					PatchSite::Jump { .. } => self
						.symbols
						.global(&fixup.label)
						.filter(|sym| sym.kind == SymbolKind::GlobalLabel),
					PatchSite::Branch { .. } => None,
				};
				local.or_else(global).map(|sym| sym.value)
			})
			.collect();

		let mut overflowed = false;
		for (fixup, target) in routine.fixups.iter().zip(&targets) {
			if let Some(target) = target {
				if !fixup.long && !fixup.site.short_fits(*target) {
					self.layout.widen(fixup.key);
					overflowed = true;
				}
			}
		}

		if overflowed {
			let checkpoint = routine.checkpoint;
			for (scope, name, old) in checkpoint.undo.into_iter().rev() {
				match old {
					Some(sym) => {
						self.symbols.define(scope, &name, sym);
					},
					None => {
						self.symbols.remove(&scope, &name);
					},
				}
			}
			self.out.truncate(checkpoint.out_len);
			self.errors.truncate(checkpoint.errors);
			self.warnings.truncate(checkpoint.warnings);
			self.strings.truncate(checkpoint.strings);
			if self.journal.in_routine() {
				self.journal.push(DebugEvent::RestartRoutine);
			}
			debug!("laying out {} again", routine.name);
			return Some(checkpoint.line);
		}

		for (fixup, target) in routine.fixups.iter().zip(targets) {
			let result = match target {
				Some(target) => self.patch(fixup, target),
				None => Err(AsmError::UndefinedSymbol(fixup.label.clone())),
			};
			if let Err(err) = result {
				self.errors.push(Located::new(Some(fixup.location.clone()), err));
			}
		}
		None
	}

	fn patch(&mut self, fixup: &Fixup, target: i32) -> Result<(), AsmError> {
		match fixup.site {
			PatchSite::Branch { pos, polarity } => {
				let bytes = encode_branch(polarity, BranchTarget::Address(target), pos as i32, fixup.long)?;
				self.out[pos..pos + bytes.len()].copy_from_slice(&bytes);
			},
			PatchSite::Jump { opcode_pos } => {
				let offset = target - opcode_pos as i32 - 1;
				if fixup.long && !(i16::MIN as i32..=i16::MAX as i32).contains(&offset) {
					return Err(AsmError::BranchOutOfRange(offset));
				}
				let operand = jump_operand(target, opcode_pos as i32, fixup.long);
				let at = opcode_pos as u64 + 1;
				let written = if fixup.long {
					self.out.write_u16_at::<BigEndian>(at, operand.value)
				} else {
					self.out.write_u8_at(at, operand.value as u8)
				};
				written.map_err(AsmError::ImageWrite)?;
			},
		}
		Ok(())
	}

	fn lookup(&mut self, name: &str) -> Value {
		if let Some(routine) = &self.routine {
			if let Some(sym) = self.symbols.local(&routine.name, name) {
				return Value::exact(sym);
			}
		}
		if let Some(sym) = self.symbols.global(name) {
			return Value {
				symbol: sym,
				forward: self.forward_constants.contains(name),
			};
		}
		if let Some(sym) = self.layout.previous.global(name) {
			return Value::forward(sym);
		}
		if let Some(routine) = &self.routine {
			if let Some(sym) = self.layout.previous.local(&routine.name, name) {
				return Value::forward(sym);
			}
		}

		self.error(AsmError::UndefinedSymbol(name.to_owned()));
		Value::forward(Symbol::constant(0))
	}

	fn eval(&mut self, expr: &AsmExpr) -> Result<Value, AsmError> {
		match expr {
			AsmExpr::Number(n) => Ok(Value::exact(Symbol::constant(*n))),
			AsmExpr::Symbol(name) => Ok(self.lookup(name)),
			AsmExpr::Quote(inner) => self.eval(inner),
			AsmExpr::Plus(a, b) => {
				let a = self.eval(a)?;
				let b = self.eval(b)?;
				Ok(Value {
					symbol: Symbol::constant(a.value().wrapping_add(b.value())),
					forward: a.forward || b.forward,
				})
			},
			AsmExpr::String(_) => Err(AsmError::UnexpectedString),
			AsmExpr::Assign(..) => Err(AsmError::Syntax(format!("unexpected assignment: {}", expr))),
		}
	}

	fn operand(&mut self, index: usize, slot: u8, expr: &AsmExpr) -> Result<Operand, AsmError> {
		match expr {
			AsmExpr::Quote(inner) => Ok(Operand::small(self.eval(inner)?.value() as u8)),
			AsmExpr::String(_) => Err(AsmError::UnexpectedString),
			_ => {
				let value = self.eval(expr)?;
				match value.symbol.kind {
					SymbolKind::Variable => Ok(Operand::variable(value.value() as u8)),
					SymbolKind::LocalLabel => Err(AsmError::LocalLabelOperand(expr.to_string())),
					_ => Ok(self.sized(
						SdiKey {
							line: index,
							slot: Slot::Operand(slot),
						},
						value,
					)),
				}
			},
		}
	}

	/// Picks byte or word form for a constant operand. Only values read from
	/// the previous pass take part in widening.
	fn sized(&mut self, key: SdiKey, value: Value) -> Operand {
		let n = value.value();
		let fits = (0..=255).contains(&n);

		if value.forward {
			self.layout.sdi_seen.insert(key);
			if !fits {
				self.layout.widen(key);
			}
			if !self.layout.widened.contains(&key) {
				return Operand::small(n as u8);
			}
		} else if fits {
			return Operand::small(n as u8);
		}

		Operand::large(n as u16)
	}

	fn store_target(&mut self, name: &str) -> Result<u8, AsmError> {
		let local = self
			.routine
			.as_ref()
			.and_then(|r| self.symbols.local(&r.name, name));
		let found = local
			.or_else(|| self.symbols.global(name))
			.or_else(|| self.layout.previous.global(name));

		match found {
			Some(sym) if sym.kind == SymbolKind::Variable => Ok(sym.value as u8),
			_ => Err(AsmError::InvalidStoreTarget(name.to_owned())),
		}
	}

	fn label(&mut self, name: &str, global: bool) -> Result<(), AsmError> {
		let pos = self.pos() as i32;

		if !global {
			let routine = self
				.routine_name()
				.ok_or_else(|| AsmError::LocalLabelOutsideRoutine(name.to_owned()))?;
			if self.symbols.local(&routine, name).is_some() {
				return Err(AsmError::Redefinition {
					kind: SymbolKind::LocalLabel.describe(),
					name: name.to_owned(),
				});
			}
			self.define(Scope::Local(routine), name, Symbol::new(SymbolKind::LocalLabel, pos));
			return Ok(());
		}

		if let Some(existing) = self.symbols.global(name) {
			return Err(AsmError::Redefinition {
				kind: existing.kind.describe(),
				name: name.to_owned(),
			});
		}
		if let Some(vocab) = &mut self.vocab {
			if !vocab.is_record_boundary(pos) {
				return Err(AsmError::UnalignedVocabLabel(name.to_owned()));
			}
			vocab.add_label(name, pos);
		}
		self.define(Scope::Global, name, Symbol::new(SymbolKind::GlobalLabel, pos));
		Ok(())
	}

	fn equate(&mut self, name: &str, value: &AsmExpr) -> Result<(), AsmError> {
		if self.locked.contains(name) {
			trace!("ignoring {}: value fixed by options", name);
			return Ok(());
		}

		let value = self.eval(value)?;
		if let Some(existing) = self.symbols.global(name) {
			if existing.kind != SymbolKind::Constant {
				return Err(AsmError::Redefinition {
					kind: existing.kind.describe(),
					name: name.to_owned(),
				});
			}
		}

		if value.forward {
			self.forward_constants.insert(name.to_owned());
		} else {
			self.forward_constants.remove(name);
		}
		self.define(Scope::Global, name, Symbol::constant(value.value()));
		Ok(())
	}

	fn data_word(&mut self, expr: &AsmExpr) -> Result<(), AsmError> {
		let pos = self.pos() as i32;
		let value = self.eval(expr)?;

		if let Some(vocab) = &mut self.vocab {
			match expr {
				AsmExpr::Symbol(name) => vocab.add_reference(pos, name, 0),
				AsmExpr::Plus(a, b) => match (a.as_ref(), b.as_ref()) {
					(AsmExpr::Symbol(name), AsmExpr::Number(n)) | (AsmExpr::Number(n), AsmExpr::Symbol(name)) => {
						vocab.add_reference(pos, name, *n)
					},
					_ => {},
				},
				_ => {},
			}
		}

		self.put_word(value.value());
		Ok(())
	}

	fn instruction(&mut self, index: usize, instr: &Instruction) -> Result<(), AsmError> {
		let mut desc = self.opcodes.resolve(&instr.name)?;
		if instr.operands.len() > 4 {
			if let Some(extra) = desc.extra_form().and_then(|op| by_op(op, self.version())) {
				desc = extra;
			}
		}

		let name = &instr.name;
		let counts = desc.operand_counts();
		if !counts.contains(&instr.operands.len()) {
			let expected = if counts.start() == counts.end() {
				counts.start().to_string()
			} else {
				format!("{} to {}", counts.start(), counts.end())
			};
			return Err(AsmError::WrongOperandCount {
				name: name.clone(),
				expected,
				found: instr.operands.len(),
			});
		}
		if instr.store_target.is_some() && !desc.stores() {
			return Err(AsmError::UnexpectedStore(name.clone()));
		}
		match (&instr.branch, desc.branches()) {
			(Some(_), false) => return Err(AsmError::UnexpectedBranch(name.clone())),
			(None, true) => return Err(AsmError::MissingBranch(name.clone())),
			_ => {},
		}

		if desc.flags.contains(ZOpFlags::STRING) {
			let text = instr.operands[0]
				.as_string()
				.ok_or_else(|| AsmError::ExpectedString(name.clone()))?;
			self.collect_string(text);
			let head = encode_head(desc, &[]);
			let body = self.encoder.encode(text, None, EncodeMode::Normal);
			self.out.extend(head);
			self.out.extend(body);
			return Ok(());
		}

		if desc.flags.contains(ZOpFlags::LABEL) {
			return self.jump(index, desc, &instr.operands[0]);
		}

		let mut operands = Vec::with_capacity(instr.operands.len());
		for (i, expr) in instr.operands.iter().enumerate() {
			operands.push(self.operand(index, i as u8, expr)?);
		}

		let store = match &instr.store_target {
			Some(target) => self.store_target(target).unwrap_or_else(|err| {
				self.error(err);
				0
			}),
			None => 0,
		};

		self.out.extend(encode_head(desc, &operands));
		if desc.stores() {
			self.out.push(store);
		}
		if let Some(branch) = &instr.branch {
			self.branch(index, branch)?;
		}
		Ok(())
	}

	fn branch(&mut self, index: usize, branch: &Branch) -> Result<(), AsmError> {
		let pos = self.pos();

		if let Some(value) = return_target(&branch.target) {
			let bytes = encode_branch(branch.polarity, BranchTarget::Return(value), pos as i32, false)?;
			self.out.extend(bytes);
			return Ok(());
		}

		let key = SdiKey {
			line: index,
			slot: Slot::Branch,
		};
		self.layout.sdi_seen.insert(key);
		let mut long = self.layout.widened.contains(&key);

		let Some(routine) = self.routine_name() else {
			self.out.push(0);
			return Err(AsmError::InvalidBranchTarget(branch.target.clone()));
		};

		match self.symbols.local(&routine, &branch.target) {
			Some(sym) if sym.kind == SymbolKind::LocalLabel => {
				if !long && !short_branch_fits(branch_offset(sym.value, pos as i32, false)) {
					self.layout.widen(key);
					long = true;
				}
				match encode_branch(branch.polarity, BranchTarget::Address(sym.value), pos as i32, long) {
					Ok(bytes) => self.out.extend(bytes),
					Err(err) => {
						self.out.resize(pos + if long { 2 } else { 1 }, 0);
						return Err(err);
					},
				}
			},
			Some(_) => {
				self.out.push(0);
				return Err(AsmError::InvalidBranchTarget(branch.target.clone()));
			},
			None => {
				if !self.is_possible_local(&routine, &branch.target) {
					self.out.push(0);
					return Err(AsmError::InvalidBranchTarget(branch.target.clone()));
				}
				self.out.resize(pos + if long { 2 } else { 1 }, 0);
				self.add_fixup(
					key,
					PatchSite::Branch {
						pos,
						polarity: branch.polarity,
					},
					&branch.target,
					long,
				);
			},
		}
		Ok(())
	}

	/// Whether a name not yet defined in this routine could still become a
	/// local label further down.
	fn is_possible_local(&self, routine: &str, name: &str) -> bool {
		self.layout.previous.local(routine, name).is_some()
			|| (self.symbols.global(name).is_none() && self.layout.previous.global(name).is_none())
	}

	fn add_fixup(&mut self, key: SdiKey, site: PatchSite, label: &str, long: bool) {
		let location = self.location.clone();
		if let (Some(routine), Some(location)) = (&mut self.routine, location) {
			routine.fixups.push(Fixup {
				key,
				site,
				label: label.to_owned(),
				long,
				location,
			});
		}
	}

	fn jump(&mut self, index: usize, desc: &ZOpDescriptor, target: &AsmExpr) -> Result<(), AsmError> {
		let label = target
			.symbol_name()
			.ok_or_else(|| AsmError::InvalidBranchTarget(target.to_string()))?;
		let routine = self
			.routine_name()
			.ok_or_else(|| AsmError::InvalidBranchTarget(label.to_owned()))?;

		let key = SdiKey {
			line: index,
			slot: Slot::Jump,
		};
		self.layout.sdi_seen.insert(key);
		let long = self.layout.widened.contains(&key);
		let opcode_pos = self.pos();

		match self.symbols.local(&routine, label) {
			Some(sym) if sym.kind == SymbolKind::LocalLabel => {
				let operand = self.known_jump(key, long, sym.value, opcode_pos)?;
				self.out.extend(encode_head(desc, &[operand]));
			},
			Some(_) => return Err(AsmError::InvalidBranchTarget(label.to_owned())),
			None => match self.symbols.global(label) {
				Some(sym) if sym.kind == SymbolKind::GlobalLabel => {
					let operand = self.known_jump(key, long, sym.value, opcode_pos)?;
					self.out.extend(encode_head(desc, &[operand]));
				},
				Some(_) => return Err(AsmError::InvalidBranchTarget(label.to_owned())),
				None if self.is_possible_local(&routine, label) => {
					let placeholder = if long { Operand::large(0) } else { Operand::small(0) };
					self.out.extend(encode_head(desc, &[placeholder]));
					self.add_fixup(key, PatchSite::Jump { opcode_pos }, label, long);
				},
				None => match self.layout.previous.global(label) {
					// settled by the pass loop rather than by the routine
					Some(sym) if sym.kind == SymbolKind::GlobalLabel => {
						let operand = self.known_jump(key, long, sym.value, opcode_pos)?;
						self.out.extend(encode_head(desc, &[operand]));
					},
					_ => return Err(AsmError::InvalidBranchTarget(label.to_owned())),
				},
			},
		}
		Ok(())
	}

	/// JUMP operand for a target whose address is already known, widening
	/// the slot if the byte form no longer reaches it.
	fn known_jump(&mut self, key: SdiKey, mut long: bool, target: i32, opcode_pos: usize) -> Result<Operand, AsmError> {
		if !long && !short_jump_fits(target, opcode_pos as i32) {
			self.layout.widen(key);
			long = true;
		}
		let offset = target - opcode_pos as i32 - 1;
		if long && !(i16::MIN as i32..=i16::MAX as i32).contains(&offset) {
			return Err(AsmError::BranchOutOfRange(offset));
		}
		Ok(jump_operand(target, opcode_pos as i32, long))
	}

	fn number(&mut self, kind: DirectiveKind, args: &[AsmExpr], i: usize) -> Result<i32, AsmError> {
		let expr = arg(kind, args, i)?;
		Ok(self.eval(expr)?.value())
	}

	fn line_ref(&mut self, kind: DirectiveKind, args: &[AsmExpr], first: usize) -> Result<LineRef, AsmError> {
		Ok(LineRef::new(
			self.number(kind, args, first)? as u8,
			self.number(kind, args, first + 1)? as u16,
			self.number(kind, args, first + 2)? as u8,
		))
	}

	fn directive(&mut self, index: usize, kind: DirectiveKind, args: &[AsmExpr]) -> Result<Flow, AsmError> {
		if is_debug_directive(kind)
			&& self.journal.in_routine()
			&& !matches!(kind, DirectiveKind::DebugLine | DirectiveKind::DebugRoutineEnd)
		{
			return Err(AsmError::DebugDirectiveInRoutine);
		}

		match kind {
			DirectiveKind::New => return self.new_version(args),
			DirectiveKind::End => return Ok(Flow::Stop),

			DirectiveKind::Align => {
				let alignment = self.number(kind, args, 0)?;
				if alignment < 1 {
					return Err(bad(kind, format!("bad alignment {}", alignment)));
				}
				self.align(alignment as usize);
			},
			DirectiveKind::Byte => {
				for expr in args {
					let value = self.eval(expr)?;
					self.out.push(value.value() as u8);
				}
			},
			DirectiveKind::Word => {
				for expr in args {
					self.data_word(expr)?;
				}
			},
			DirectiveKind::Table => {
				if self.table.is_some() {
					self.warning(Warning::NestedTable);
				}
				let size = match args.first() {
					None => None,
					Some(expr) => {
						let value = self.eval(expr)?;
						if value.forward {
							self.warning(Warning::NonConstantTableSize);
							None
						} else {
							Some(value.value())
						}
					},
				};
				self.table = Some(OpenTable {
					start: self.pos(),
					size,
				});
			},
			DirectiveKind::Endt => match self.table.take() {
				None => self.warning(Warning::EndtOutsideTable),
				Some(table) => {
					let actual = (self.pos() - table.start) as i32;
					if let Some(expected) = table.size {
						if expected != actual {
							self.warning(Warning::TableSize { expected, actual });
						}
					}
				},
			},
			DirectiveKind::Prop => self.property(args)?,
			DirectiveKind::Object => self.object(args)?,
			DirectiveKind::Gvar => self.global_variable(args)?,

			DirectiveKind::Str => {
				let text = text_arg(kind, args, 0)?;
				self.collect_string(text);
				let bytes = self.encoder.encode(text, None, EncodeMode::Normal);
				self.out.extend(bytes);
			},
			DirectiveKind::Strl => {
				let text = text_arg(kind, args, 0)?;
				self.collect_string(text);
				let bytes = self.encoder.encode(text, None, EncodeMode::Normal);
				self.out.push((bytes.len() / 2) as u8);
				self.out.extend(bytes);
			},
			DirectiveKind::Len => {
				let text = text_arg(kind, args, 0)?;
				let bytes = self.encoder.encode(text, None, EncodeMode::Normal);
				self.out.push((bytes.len() / 2) as u8);
			},
			DirectiveKind::Zword => {
				let text = text_arg(kind, args, 0)?;
				let zchars = if self.version() < 4 { 6 } else { 9 };
				let bytes = self.encoder.encode(text, Some(zchars), EncodeMode::NoAbbreviations);
				self.out.extend(bytes);
			},
			DirectiveKind::Gstr => {
				let name = symbol_arg(kind, args, 0)?;
				let text = text_arg(kind, args, 1)?;
				let divisor = packing_divisor(self.version());
				self.align(divisor as usize);
				if let Some(existing) = self.symbols.global(name) {
					return Err(AsmError::Redefinition {
						kind: existing.kind.describe(),
						name: name.to_owned(),
					});
				}
				let packed = self.pos() as i32 / divisor;
				self.define(Scope::Global, name, Symbol::new(SymbolKind::String, packed));
				self.collect_string(text);
				let bytes = self.encoder.encode(text, None, EncodeMode::Normal);
				self.out.extend(bytes);
			},
			DirectiveKind::Fstr => {
				let name = symbol_arg(kind, args, 0)?;
				let text = text_arg(kind, args, 1)?;
				if self.encoder.is_frozen() {
					return Err(AsmError::AbbreviationsAfterStrings);
				}
				self.align(2);
				if let Some(existing) = self.symbols.global(name) {
					if existing.kind != SymbolKind::Constant {
						return Err(AsmError::Redefinition {
							kind: existing.kind.describe(),
							name: name.to_owned(),
						});
					}
				}
				let address = self.pos() as i32 / 2;
				self.define(Scope::Global, name, Symbol::constant(address));
				let bytes = self.encoder.encode(text, None, EncodeMode::NoAbbreviations);
				self.out.extend(bytes);
				if !text.is_empty() {
					self.encoder.add_abbreviation(text)?;
				}
			},
			DirectiveKind::Chrset => {
				let alphabet = self.number(kind, args, 0)?;
				let mut chars = Vec::with_capacity(args.len().saturating_sub(1));
				for expr in &args[1..] {
					chars.push(self.eval(expr)?.value() as u8);
				}
				self.encoder.set_charset(alphabet as usize, &chars)?;
			},
			DirectiveKind::Lang => self.warning(Warning::LangIgnored),

			DirectiveKind::Funct => self.function(index, args)?,

			DirectiveKind::Vocbeg => {
				if self.vocab.is_some() {
					self.warning(Warning::NestedVocab);
					return Ok(Flow::Next);
				}
				let record = self.eval(arg(kind, args, 0)?)?;
				let key = self.eval(arg(kind, args, 1)?)?;
				if record.forward || key.forward {
					self.warning(Warning::NonConstantVocabSizes);
					return Ok(Flow::Next);
				}
				if record.value() < 1 || key.value() < 0 {
					return Err(bad(kind, "sizes must be positive"));
				}
				let table = VocabTable::new(self.pos() as i32, record.value() as usize, key.value() as usize)?;
				self.vocab = Some(table);
			},
			DirectiveKind::Vocend => {
				let Some(vocab) = self.vocab.take() else {
					self.warning(Warning::VocendOutsideVocab);
					return Ok(Flow::Next);
				};
				let start = vocab.start() as usize;
				let end = self.pos();
				for (name, address) in vocab.finish(&mut self.out[start..end]) {
					self.define(Scope::Global, &name, Symbol::new(SymbolKind::GlobalLabel, address));
				}
			},

			DirectiveKind::Time if self.version() == 3 => self.flags1 |= Flags1::TIME_GAME,
			DirectiveKind::Time => self.warning(Warning::TimeIgnored(self.version())),
			DirectiveKind::Sound => self.flags2 |= Flags2::SOUND,

			DirectiveKind::Defseg
			| DirectiveKind::Endseg
			| DirectiveKind::Options
			| DirectiveKind::Picfile
			| DirectiveKind::Segment
			| DirectiveKind::Endi
			| DirectiveKind::Insert => trace!("ignoring {}", kind.name()),

			DirectiveKind::DebugAction => {
				let number = self.number(kind, args, 0)?;
				self.journal
					.push(DebugEvent::Action(number as u16, name_arg(kind, args, 1)?));
			},
			DirectiveKind::DebugArray => {
				let global = self
					.symbols
					.global("GLOBAL")
					.or_else(|| self.layout.previous.global("GLOBAL"))
					.ok_or(AsmError::DebugArrayWithoutGlobals)?;
				let address = self.number(kind, args, 0)?;
				self.journal.push(DebugEvent::Array(
					(address - global.value) as u16,
					name_arg(kind, args, 1)?,
				));
			},
			DirectiveKind::DebugAttr => {
				let number = self.number(kind, args, 0)?;
				self.journal
					.push(DebugEvent::Attr(number as u16, name_arg(kind, args, 1)?));
			},
			DirectiveKind::DebugClass => {
				let name = name_arg(kind, args, 0)?;
				let start = self.line_ref(kind, args, 1)?;
				let end = self.line_ref(kind, args, 4)?;
				self.journal.push(DebugEvent::Class { name, start, end });
			},
			DirectiveKind::DebugFakeAction => {
				let number = self.number(kind, args, 0)?;
				self.journal
					.push(DebugEvent::FakeAction(number as u16, name_arg(kind, args, 1)?));
			},
			DirectiveKind::DebugFile => {
				let number = self.number(kind, args, 0)?;
				self.journal.push(DebugEvent::File {
					number: number as u8,
					include_name: name_arg(kind, args, 1)?,
					actual_name: name_arg(kind, args, 2)?,
				});
			},
			DirectiveKind::DebugGlobal => {
				let number = self.number(kind, args, 0)?;
				self.journal
					.push(DebugEvent::Global((number - 16) as u8, name_arg(kind, args, 1)?));
			},
			DirectiveKind::DebugLine => {
				if !self.journal.in_routine() {
					return Err(AsmError::DebugLineOutsideRoutine);
				}
				let loc = self.line_ref(kind, args, 0)?;
				let address = self.pos() as i32;
				self.journal.push(DebugEvent::Line { loc, address });
			},
			DirectiveKind::DebugMap => {
				let (name, expr) = match args {
					[AsmExpr::Assign(name, expr)] => (name.clone(), expr.as_ref()),
					[_, expr] => (name_arg(kind, args, 0)?, expr),
					_ => return Err(bad(kind, "expected name=value")),
				};
				let value = self.eval(expr)?;
				self.journal.set_map_entry(&name, value.value());
			},
			DirectiveKind::DebugObject => {
				let number = self.number(kind, args, 0)?;
				let name = name_arg(kind, args, 1)?;
				let start = self.line_ref(kind, args, 2)?;
				let end = self.line_ref(kind, args, 5)?;
				self.journal.push(DebugEvent::Object {
					number: number as u16,
					name,
					start,
					end,
				});
			},
			DirectiveKind::DebugProp => {
				let number = self.number(kind, args, 0)?;
				self.journal
					.push(DebugEvent::Prop(number as u16, name_arg(kind, args, 1)?));
			},
			DirectiveKind::DebugRoutine => {
				let start = self.line_ref(kind, args, 0)?;
				let name = name_arg(kind, args, 3)?;
				let locals = (4..args.len())
					.map(|i| name_arg(kind, args, i))
					.collect::<Result<Vec<_>, _>>()?;
				self.align(packing_divisor(self.version()) as usize);
				let address = self.pos() as i32;
				self.journal.push(DebugEvent::StartRoutine {
					start,
					address,
					name,
					locals,
				});
			},
			DirectiveKind::DebugRoutineEnd => {
				if !self.journal.in_routine() {
					return Err(AsmError::DebugRoutineEndOutsideRoutine);
				}
				let end = self.line_ref(kind, args, 0)?;
				let address = self.pos() as i32;
				self.journal.push(DebugEvent::EndRoutine { end, address });
			},
		}

		Ok(Flow::Next)
	}

	fn new_version(&mut self, args: &[AsmExpr]) -> Result<Flow, AsmError> {
		let requested = match args.first() {
			None => 4,
			Some(expr) => self.eval(expr)?.value(),
		};
		if !(3..=8).contains(&requested) {
			return Err(AsmError::UnsupportedVersion(requested));
		}
		let requested = requested as u8;

		if requested == self.layout.version {
			self.layout.version_fixed = true;
			return Ok(Flow::Next);
		}
		if self.layout.version_fixed {
			return Err(AsmError::ConflictingVersions {
				first: self.layout.version,
				second: requested,
			});
		}

		info!("switching from version {} to {}", self.layout.version, requested);
		self.layout.version = requested;
		self.layout.version_fixed = true;
		Ok(Flow::Restart)
	}

	fn function(&mut self, index: usize, args: &[AsmExpr]) -> Result<(), AsmError> {
		let kind = DirectiveKind::Funct;
		let name = symbol_arg(kind, args, 0)?;

		self.routine = Some(Routine {
			name: name.to_owned(),
			checkpoint: Checkpoint {
				line: index,
				out_len: self.out.len(),
				errors: self.errors.len(),
				warnings: self.warnings.len(),
				strings: self.strings.len(),
				undo: Vec::new(),
			},
			fixups: Vec::new(),
		});

		let divisor = packing_divisor(self.version());
		self.align(divisor as usize);
		if let Some(existing) = self.symbols.global(name) {
			return Err(AsmError::Redefinition {
				kind: existing.kind.describe(),
				name: name.to_owned(),
			});
		}
		let packed = self.pos() as i32 / divisor;
		self.define(Scope::Global, name, Symbol::new(SymbolKind::Function, packed));

		let mut locals = Vec::with_capacity(args.len().saturating_sub(1));
		for expr in &args[1..] {
			match expr {
				AsmExpr::Symbol(local) => locals.push((local.as_str(), None)),
				AsmExpr::Assign(local, default) => locals.push((local.as_str(), Some(default.as_ref()))),
				other => return Err(bad(kind, format!("bad local variable {}", other))),
			}
		}
		if locals.len() > MAX_LOCALS {
			return Err(AsmError::TooManyLocals(locals.len()));
		}

		self.out.push(locals.len() as u8);
		let scope = Scope::Local(name.to_owned());
		let mut has_defaults = false;
		for (i, (local, default)) in locals.into_iter().enumerate() {
			self.define(scope.clone(), local, Symbol::new(SymbolKind::Variable, i as i32 + 1));
			has_defaults |= default.is_some();
			if self.version() < 5 {
				let value = match default {
					Some(expr) => self.eval(expr)?.value(),
					None => 0,
				};
				self.put_word(value);
			}
		}
		if has_defaults && self.version() >= 5 {
			self.warning(Warning::IgnoredLocalDefaults);
		}
		Ok(())
	}

	fn property(&mut self, args: &[AsmExpr]) -> Result<(), AsmError> {
		let kind = DirectiveKind::Prop;
		let size = self.eval(arg(kind, args, 0)?)?;
		let number = self.eval(arg(kind, args, 1)?)?;
		if size.forward || number.forward {
			self.error(AsmError::NonConstantProperty);
		}
		let (size, number) = (size.value(), number.value());

		if self.version() < 4 {
			if !(1..=8).contains(&size) {
				return Err(AsmError::PropertyTooLong { size, max: 8 });
			}
			self.out.push((32 * (size - 1) + number) as u8);
		} else if !(1..=64).contains(&size) {
			return Err(AsmError::PropertyTooLong { size, max: 64 });
		} else if size > 2 {
			self.out.push(number as u8 | 0x80);
			self.out.push(0x80 | (size & 0x3f) as u8);
		} else {
			self.out.push(number as u8 | if size == 2 { 0x40 } else { 0 });
		}
		Ok(())
	}

	fn object(&mut self, args: &[AsmExpr]) -> Result<(), AsmError> {
		let kind = DirectiveKind::Object;
		let name = symbol_arg(kind, args, 0)?;
		let version = self.version();

		let max = if version < 4 { 255 } else { 65535 };
		if self.objects >= max {
			return Err(AsmError::TooManyObjects(max));
		}
		let expected = if version < 4 { 7 } else { 8 };
		if args.len() != expected {
			return Err(AsmError::ObjectSyntax(version));
		}
		if let Some(existing) = self.symbols.global(name) {
			return Err(AsmError::Redefinition {
				kind: existing.kind.describe(),
				name: name.to_owned(),
			});
		}

		self.objects += 1;
		self.define(Scope::Global, name, Symbol::new(SymbolKind::Object, self.objects as i32));

		let mut values = Vec::with_capacity(expected - 1);
		for expr in &args[1..] {
			values.push(self.eval(expr)?.value());
		}
		if version < 4 {
			// flags, parent, sibling, child, properties
			self.put_word(values[0]);
			self.put_word(values[1]);
			for link in &values[2..5] {
				self.out.push(*link as u8);
			}
			self.put_word(values[5]);
		} else {
			for value in values {
				self.put_word(value);
			}
		}
		Ok(())
	}

	fn global_variable(&mut self, args: &[AsmExpr]) -> Result<(), AsmError> {
		let kind = DirectiveKind::Gvar;
		let (name, default) = match arg(kind, args, 0)? {
			AsmExpr::Symbol(name) => (name.as_str(), None),
			AsmExpr::Assign(name, value) => (name.as_str(), Some(value.as_ref())),
			other => return Err(bad(kind, format!("bad global variable {}", other))),
		};

		if self.globals >= MAX_GLOBALS {
			return Err(AsmError::TooManyGlobals(MAX_GLOBALS));
		}
		if let Some(existing) = self.symbols.global(name) {
			return Err(AsmError::Redefinition {
				kind: existing.kind.describe(),
				name: name.to_owned(),
			});
		}

		self.define(
			Scope::Global,
			name,
			Symbol::new(SymbolKind::Variable, 16 + self.globals as i32),
		);
		self.globals += 1;

		let value = match default {
			Some(expr) => self.eval(expr)?.value(),
			None => 0,
		};
		self.put_word(value);
		Ok(())
	}
}

fn write_debug(
	writer: &mut dyn DebugFileWriter,
	output: &PassOutput,
	story: &[u8],
	version: u8,
) -> io::Result<()> {
	output.journal.replay(writer)?;

	if !output.journal.is_empty() {
		let mut journal = output.journal.clone();
		let object_tree = if version < 4 { 31 } else { 63 };
		let defaults = [
			(ABBREVIATIONS_MAP_NAME, "WORDS", 0),
			(GLOBALS_MAP_NAME, "GLOBAL", 0),
			(OBJECTS_MAP_NAME, "OBJECT", object_tree),
			(PROPERTIES_MAP_NAME, "OBJECT", 0),
			(VOCAB_MAP_NAME, "VOCAB", 0),
		];
		for (map_name, symbol, offset) in defaults {
			if journal.map().iter().any(|(name, _)| name == map_name) {
				continue;
			}
			if let Some(sym) = output.symbols.global(symbol) {
				journal.set_map_entry(map_name, sym.value + offset);
			}
		}

		writer.write_map(journal.map())?;
		writer.write_header(&story[..image::HEADER_SIZE.min(story.len())])?;
	}
	writer.close()
}

/// Lays out `lines` until every label settles, then finishes the story
/// file. Debug records from the final pass go to `debug`, if given.
pub fn assemble(
	lines: &[AsmLine],
	options: &AssembleOptions,
	debug: Option<&mut dyn DebugFileWriter>,
) -> Result<Assembly, AssemblyFailed> {
	if !(3..=8).contains(&options.version) {
		return Err(AssemblyFailed::single(AsmError::UnsupportedVersion(
			options.version as i32,
		)));
	}

	let mut layout = Layout::new(lines, options);
	let output = loop {
		layout.pass += 1;
		let ceiling = options
			.max_passes
			.unwrap_or(layout.sdi_seen.len() + EXTRA_PASSES);
		if layout.pass > ceiling {
			return Err(AssemblyFailed::single(AsmError::ConvergenceFailed(ceiling)));
		}

		let mut pass = Pass::new(&mut layout);
		let restart = pass.walk();
		let mut output = pass.finish();
		if restart {
			layout.restart();
			continue;
		}
		if layout.pass == 1 {
			layout.strings = std::mem::take(&mut output.strings);
		}

		let (layout_errors, errors): (Vec<_>, Vec<_>) = output
			.errors
			.into_iter()
			.partition(|e| e.error.is_layout_dependent());
		if !errors.is_empty() {
			return Err(AssemblyFailed {
				errors,
				warnings: output.warnings,
			});
		}

		if output.symbols != layout.previous {
			debug!(
				"pass {}: {} bytes, {} symbol(s) moved",
				layout.pass,
				output.story.len(),
				output.symbols.changes_from(&layout.previous).len()
			);
			layout.previous = output.symbols;
			continue;
		}

		if !layout_errors.is_empty() {
			return Err(AssemblyFailed {
				errors: layout_errors,
				warnings: output.warnings,
			});
		}
		break PassOutput {
			errors: Vec::new(),
			..output
		};
	};

	let version = layout.version;
	info!("layout settled after {} pass(es)", layout.pass);
	for warning in &output.warnings {
		warn!("{}", warning);
	}

	let mut story = output.story.clone();
	image::finalize(&mut story, version, output.flags1, output.flags2, options).map_err(|err| {
		AssemblyFailed {
			errors: vec![Located::unlocated(err)],
			warnings: output.warnings.clone(),
		}
	})?;

	if let Some(writer) = debug {
		write_debug(writer, &output, &story, version).map_err(|err| AssemblyFailed {
			errors: vec![Located::unlocated(AsmError::DebugFile(err))],
			warnings: output.warnings.clone(),
		})?;
	}

	Ok(Assembly {
		story,
		symbols: output.symbols,
		warnings: output.warnings,
		version,
		passes: layout.pass,
		strings: layout.strings,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::parser::parse_source;

	const V3_TABLES: &str = "
WORDS::
GLOBAL::
OBJECT::
VOCAB::
IMPURE::
ENDLOD::
";

	fn assemble_text(source: &str, options: &AssembleOptions) -> Result<Assembly, AssemblyFailed> {
		let lines = parse_source(source, "test.zap", options.name_style).unwrap();
		assemble(&lines, options, None)
	}

	fn v3(body: &str) -> Result<Assembly, AssemblyFailed> {
		assemble_text(&format!("{}{}", V3_TABLES, body), &AssembleOptions::default())
	}

	fn global(assembly: &Assembly, name: &str) -> i32 {
		assembly.symbols.global(name).unwrap().value
	}

	#[test]
	fn minimal_story() {
		let asm = v3("
	.FUNCT GO
START::
	QUIT
	.END
")
		.unwrap();

		assert_eq!(asm.version, 3);
		assert_eq!(global(&asm, "GO"), 32);
		assert_eq!(global(&asm, "START"), 65);
		assert_eq!(&asm.story[64..66], &[0, 0xBA]);
		assert_eq!(&asm.story[6..8], &[0, 65]);
		assert_eq!(asm.story.len(), 512);
		assert!(asm.passes >= 2);
	}

	#[test]
	fn branches_and_jumps() {
		let asm = v3("
	.FUNCT GO,X
START::
?LOOP:	ZERO? X /?DONE
	DEC 'X
	JUMP ?LOOP
?DONE:	RTRUE
	.END
")
		.unwrap();

		assert_eq!(
			&asm.story[64..76],
			&[1, 0, 0, 0xA0, 0x01, 0xC7, 0x96, 0x01, 0x8C, 0xFF, 0xFA, 0xB0]
		);
		assert_eq!(asm.symbols.local("GO", "?DONE").unwrap().value, 75);
	}

	#[test]
	fn short_forward_jump() {
		let asm = v3("
	.FUNCT GO
START::
	JUMP ?SKIP
	QUIT
?SKIP:	RTRUE
	.END
")
		.unwrap();

		// JUMP at 65, QUIT at 67, ?SKIP at 68
		assert_eq!(&asm.story[65..69], &[0x9C, 3, 0xBA, 0xB0]);
	}

	#[test]
	fn far_forward_branch_is_widened() {
		let mut body = String::from("\t.FUNCT GO\nSTART::\n\tZERO? 0 \\?FAR\n");
		for _ in 0..10 {
			body.push_str("\tPRINTI \"A long enough line of text to push the label out of reach.\"\n");
		}
		body.push_str("?FAR:\tRTRUE\n\t.END\n");
		let asm = v3(&body).unwrap();

		let start = global(&asm, "START") as usize;
		let far = asm.symbols.local("GO", "?FAR").unwrap().value;
		// ZERO? small constant, then a two-byte branch
		assert_eq!(asm.story[start], 0x90);
		let branch = u16::from_be_bytes([asm.story[start + 2], asm.story[start + 3]]);
		assert_eq!(branch & 0xC000, 0);
		let offset = (branch & 0x3FFF) as i32;
		assert_eq!(start as i32 + 4 + offset - 2, far);
		assert_eq!(asm.story[far as usize], 0xB0);
	}

	#[test]
	fn return_targets() {
		let asm = v3("
	.FUNCT GO
START::
	ZERO? 0 /TRUE
	ZERO? 0 \\FALSE
	.END
")
		.unwrap();
		assert_eq!(&asm.story[65..71], &[0x90, 0, 0xC1, 0x90, 0, 0x40]);
	}

	#[test]
	fn new_restarts_at_the_requested_version() {
		let asm = assemble_text(
			"
	.NEW 5
	.WORD 0
	.FUNCT GO
	QUIT
	.END
",
			&AssembleOptions::default(),
		)
		.unwrap();
		assert_eq!(asm.version, 5);
		assert_eq!(asm.story[0], 5);
		// no header is written for V5; the routine follows the word
		assert_eq!(global(&asm, "GO"), 1);
	}

	#[test]
	fn conflicting_versions() {
		let err = assemble_text(".NEW 5\n.NEW 6\n", &AssembleOptions::default()).unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::ConflictingVersions { first: 5, second: 6 })));

		let err = assemble_text(".NEW 2\n", &AssembleOptions::default()).unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::UnsupportedVersion(2))));
	}

	#[test]
	fn redefinitions() {
		let err = v3("
	.FUNCT GO
START::
START::
	QUIT
").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::Redefinition { name, .. } if name == "START")));

		let err = v3("
	.FUNCT GO
START::
?A:	QUIT
?A:	QUIT
").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::Redefinition { name, .. } if name == "?A")));
	}

	#[test]
	fn constants_may_change() {
		let asm = v3("
	X=1
	X=2
	.FUNCT GO
START::
	PRINTN X
	QUIT
").unwrap();
		assert_eq!(global(&asm, "X"), 2);
	}

	#[test]
	fn forward_constant_operand_widens() {
		let asm = v3("
	.FUNCT GO
START::
	PRINTN FAR
	QUIT
	FAR=1000
").unwrap();
		let start = global(&asm, "START") as usize;
		// PRINTN is VAR: opcode, type byte with a large constant first
		assert_eq!(&asm.story[start..start + 4], &[0xE6, 0x3F, 0x03, 0xE8]);
	}

	#[test]
	fn forward_small_constant_stays_a_byte() {
		let asm = v3("
	.FUNCT GO
START::
	PRINTN NEAR
	QUIT
	NEAR=7
").unwrap();
		let start = global(&asm, "START") as usize;
		assert_eq!(&asm.story[start..start + 3], &[0xE6, 0x7F, 7]);
	}

	#[test]
	fn store_targets() {
		let asm = v3("
	.GVAR G1
	.FUNCT GO,L
START::
	ADD 1,2 >L
	ADD 1,2 >G1
	ADD 1,2 >STACK
	ADD 1,2
	QUIT
").unwrap();
		let start = global(&asm, "START") as usize;
		assert_eq!(
			&asm.story[start..start + 16],
			&[0x14, 1, 2, 1, 0x14, 1, 2, 16, 0x14, 1, 2, 0, 0x14, 1, 2, 0]
		);

		let err = v3("
	.FUNCT GO
START::
	ADD 1,2 >NOWHERE
").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::InvalidStoreTarget(name) if name == "NOWHERE")));
	}

	#[test]
	fn operand_checks() {
		let err = v3("\t.FUNCT GO\nSTART::\n\tADD 1 >STACK\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::WrongOperandCount { found: 1, .. })));

		let err = v3("\t.FUNCT GO\nSTART::\n\tQUIT >STACK\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::UnexpectedStore(_))));

		let err = v3("\t.FUNCT GO\nSTART::\n\tZERO? 0\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::MissingBranch(_))));

		let err = v3("\t.FUNCT GO\nSTART::\n\tPRINTI 5\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::ExpectedString(_))));

		let err = v3("\t.FUNCT GO\nSTART::\n?L:\tPRINTN ?L\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::LocalLabelOperand(_))));
	}

	#[test]
	fn local_labels_need_a_routine() {
		let err = v3("?ORPHAN:\n\t.WORD 0\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::LocalLabelOutsideRoutine(_))));
	}

	#[test]
	fn undefined_symbols_are_reported() {
		let err = v3("\t.FUNCT GO\nSTART::\n\tPRINTN MISSING\n\tQUIT\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::UndefinedSymbol(name) if name == "MISSING")));

		let err = v3("\t.FUNCT GO\nSTART::\n\tJUMP ?NOWHERE\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::UndefinedSymbol(name) if name == "?NOWHERE")));
	}

	#[test]
	fn too_many_locals() {
		let locals: Vec<String> = (0..16).map(|i| format!("L{}", i)).collect();
		let err = v3(&format!("\t.FUNCT GO,{}\n", locals.join(","))).unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::TooManyLocals(16))));
	}

	#[test]
	fn local_defaults() {
		let asm = v3("\t.FUNCT GO,A=5,B\nSTART::\n\tQUIT\n").unwrap();
		assert_eq!(&asm.story[64..69], &[2, 0, 5, 0, 0]);

		let asm = assemble_text(
			".NEW 5\n\t.FUNCT GO,A=5\n\tQUIT\n",
			&AssembleOptions::default(),
		)
		.unwrap();
		assert!(asm
			.warnings
			.iter()
			.any(|w| w.error == Warning::IgnoredLocalDefaults));
	}

	#[test]
	fn table_warnings() {
		let asm = v3("
	.TABLE 4
	.WORD 1
	.ENDT
	.ENDT
	.FUNCT GO
START::
	QUIT
").unwrap();
		let warnings: Vec<_> = asm.warnings.iter().map(|w| w.error.clone()).collect();
		assert!(warnings.contains(&Warning::TableSize {
			expected: 4,
			actual: 2
		}));
		assert!(warnings.contains(&Warning::EndtOutsideTable));
	}

	#[test]
	fn properties() {
		let asm = v3("\t.PROP 2,5\n\t.FUNCT GO\nSTART::\n\tQUIT\n").unwrap();
		assert_eq!(asm.story[64], 32 + 5);

		let asm = assemble_text(".NEW 5\n\t.PROP 2,5\n\t.PROP 1,6\n\t.PROP 10,7\n", &AssembleOptions::default())
			.unwrap();
		// byte 0 becomes the version number
		assert_eq!(&asm.story[1..5], &[6, 0x87, 0x8A, 0]);

		let err = v3("\t.PROP 9,1\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::PropertyTooLong { size: 9, max: 8 })));
	}

	#[test]
	fn fstr_after_strings() {
		let err = v3("\t.STR \"hello\"\n\t.FSTR F1,\"the\"\n").unwrap_err();
		assert!(err.has(|e| matches!(e, AsmError::AbbreviationsAfterStrings)));
	}

	#[test]
	fn header_flags() {
		let asm = v3("\t.TIME\n\t.SOUND\n\t.FUNCT GO\nSTART::\n\tQUIT\n").unwrap();
		assert_eq!(asm.story[1] & 0x02, 0x02);
		assert_eq!(asm.story[0x11] & 0x80, 0x80);
	}

	#[test]
	fn time_flag_is_version_3_only() {
		let asm = assemble_text("\t.NEW 5\n\t.TIME\n\t.WORD 0,0\n\t.END\n", &AssembleOptions::default()).unwrap();
		assert_eq!(asm.story[1], 0);
		assert!(asm.warnings.iter().any(|w| w.error == Warning::TimeIgnored(5)));
	}

	#[test]
	fn label_listing_is_sorted() {
		let asm = v3("
	.FUNCT GO
START::
	QUIT
	.GSTR HELLO,\"hello\"
").unwrap();
		let listing = asm.label_listing();
		let start = listing.find("START").unwrap();
		let hello = listing.find("HELLO").unwrap();
		let go = listing.find("GO ").unwrap();
		assert!(go < start && start < hello);
		assert!(listing.trim_end().ends_with("to end"));
	}

	#[test]
	fn strings_are_collected_for_abbreviation() {
		let options = AssembleOptions {
			abbreviate: true,
			..Default::default()
		};
		let asm = assemble_text(
			&format!("{}\t.FUNCT GO\nSTART::\n\tPRINTI \"one\"\n\tPRINTR \"two\"\n", V3_TABLES),
			&options,
		)
		.unwrap();
		assert_eq!(asm.strings, vec!["one".to_owned(), "two".to_owned()]);
	}
}
