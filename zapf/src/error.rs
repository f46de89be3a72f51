//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::{fmt::Display, sync::Arc};

use thiserror::Error;

use crate::text::EncoderError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
	pub file: Arc<str>,
	pub line: usize,
}

impl Display for SourceLocation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.file, self.line)
	}
}

#[derive(Debug, Error)]
pub enum AsmError {
	#[error("syntax error: {0}")]
	Syntax(String),
	#[error("unable to read {name}: {source}")]
	Source {
		name: String,
		#[source]
		source: std::io::Error,
	},
	#[error("inserted file not found: {0}")]
	InsertNotFound(String),

	#[error("unrecognized opcode: {0}")]
	UnknownOpcode(String),
	#[error("opcode {name} is not supported in version {version}")]
	UnsupportedOpcodeForVersion { name: String, version: u8 },
	#[error("{name} expects {expected} operand(s), got {found}")]
	WrongOperandCount {
		name: String,
		expected: String,
		found: usize,
	},
	#[error("{0} expects a branch target")]
	MissingBranch(String),
	#[error("{0} does not branch")]
	UnexpectedBranch(String),
	#[error("{0} does not store a result")]
	UnexpectedStore(String),
	#[error("{0} expects a literal string operand")]
	ExpectedString(String),
	#[error("string literal is not a valid operand here")]
	UnexpectedString,
	#[error("expected local or global variable as store target, got {0}")]
	InvalidStoreTarget(String),
	#[error("local label used as operand: {0}")]
	LocalLabelOperand(String),
	#[error("branch target must be a local label: {0}")]
	InvalidBranchTarget(String),

	#[error("undefined symbol: {0}")]
	UndefinedSymbol(String),
	#[error("{kind} redefined: {name}")]
	Redefinition { kind: &'static str, name: String },
	#[error("local labels not allowed outside a function: {0}")]
	LocalLabelOutsideRoutine(String),
	#[error("unaligned global label in vocab section: {0}")]
	UnalignedVocabLabel(String),

	#[error("too many local variables ({0}, at most 15)")]
	TooManyLocals(usize),
	#[error("too many global variables (at most {0})")]
	TooManyGlobals(usize),
	#[error("too many objects (at most {0})")]
	TooManyObjects(usize),
	#[error("property too long ({size} bytes, at most {max} in this version)")]
	PropertyTooLong { size: i32, max: i32 },
	#[error("non-constant arguments to .PROP")]
	NonConstantProperty,
	#[error("wrong .OBJECT syntax for version {0}")]
	ObjectSyntax(u8),
	#[error("abbreviations must be defined before strings")]
	AbbreviationsAfterStrings,
	#[error(transparent)]
	Encoder(#[from] EncoderError),

	#[error("branch target is too far away (offset {0})")]
	BranchOutOfRange(i32),
	#[error("layout did not converge after {0} passes")]
	ConvergenceFailed(usize),

	#[error("unsupported Z-machine version: {0}")]
	UnsupportedVersion(i32),
	#[error("conflicting .NEW directives: version {first} then {second}")]
	ConflictingVersions { first: u8, second: u8 },
	#[error("header field {field} out of range: {value}")]
	HeaderFieldOutOfRange { field: &'static str, value: i32 },
	#[error("ENDLOD ({endlod}) must not come before IMPURE ({impure})")]
	EndlodBeforeImpure { endlod: i32, impure: i32 },
	#[error("unable to patch story image: {0}")]
	ImageWrite(#[source] std::io::Error),
	#[error("story file too large: {size} bytes (at most {max} in version {version})")]
	FileTooLarge { size: usize, max: usize, version: u8 },

	#[error("debug directives other than .DEBUG-LINE not allowed inside routines")]
	DebugDirectiveInRoutine,
	#[error(".DEBUG-LINE outside of .DEBUG-ROUTINE")]
	DebugLineOutsideRoutine,
	#[error(".DEBUG-ROUTINE-END outside of .DEBUG-ROUTINE")]
	DebugRoutineEndOutsideRoutine,
	#[error("define GLOBAL before using .DEBUG-ARRAY")]
	DebugArrayWithoutGlobals,
	#[error("unable to write debug information: {0}")]
	DebugFile(#[source] std::io::Error),

	#[error("{directive}: {message}")]
	BadDirective {
		directive: &'static str,
		message: String,
	},
}

impl AsmError {
	/// Errors whose presence depends on where things ended up; those found
	/// before layout converges may disappear on a later pass.
	pub fn is_layout_dependent(&self) -> bool {
		matches!(
			self,
			Self::UndefinedSymbol(_)
				| Self::BranchOutOfRange(_)
				| Self::HeaderFieldOutOfRange { .. }
				| Self::EndlodBeforeImpure { .. }
				| Self::InvalidStoreTarget(_)
				| Self::NonConstantProperty
		)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Warning {
	#[error("incorrect table size: expected {expected}, actual {actual}")]
	TableSize { expected: i32, actual: i32 },
	#[error("starting new table before ending old table")]
	NestedTable,
	#[error("ignoring .ENDT outside of a table definition")]
	EndtOutsideTable,
	#[error("ignoring non-constant table size specifier")]
	NonConstantTableSize,
	#[error("ignoring .VOCBEG inside another vocabulary block")]
	NestedVocab,
	#[error("ignoring .VOCEND outside of a vocabulary block")]
	VocendOutsideVocab,
	#[error("ignoring .VOCBEG with non-constant size specifiers")]
	NonConstantVocabSizes,
	#[error("ignoring default local variable values")]
	IgnoredLocalDefaults,
	#[error("ignoring .TIME in version {0}: only version 3 has a time status line")]
	TimeIgnored(u8),
	#[error("ignoring .LANG: alternate languages are not supported")]
	LangIgnored,
	#[error("table did not end before end of file")]
	UnterminatedTable,
	#[error("vocabulary block did not end before end of file")]
	UnterminatedVocab,
}

/// An error or warning tied to the source line that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located<E> {
	pub location: Option<SourceLocation>,
	pub error: E,
}

impl<E> Located<E> {
	pub fn new(location: Option<SourceLocation>, error: E) -> Self {
		Self { location, error }
	}

	pub fn unlocated(error: E) -> Self {
		Self {
			location: None,
			error,
		}
	}
}

impl<E: Display> Display for Located<E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.location {
			Some(loc) => write!(f, "{}: {}", loc, self.error),
			None => write!(f, "{}", self.error),
		}
	}
}

/// Result of an assembly that produced at least one error. No image is
/// returned alongside it.
#[derive(Debug, Error)]
#[error("assembly failed with {} error(s)", .errors.len())]
pub struct AssemblyFailed {
	pub errors: Vec<Located<AsmError>>,
	pub warnings: Vec<Located<Warning>>,
}

impl AssemblyFailed {
	pub fn single(error: AsmError) -> Self {
		Self {
			errors: vec![Located::unlocated(error)],
			warnings: Vec::new(),
		}
	}

	pub fn has(&self, pred: impl Fn(&AsmError) -> bool) -> bool {
		self.errors.iter().any(|e| pred(&e.error))
	}
}
