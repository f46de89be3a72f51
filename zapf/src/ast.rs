//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::fmt::Display;

use crate::error::SourceLocation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmExpr {
	Number(i32),
	Symbol(String),
	String(String),
	/// `'expr`: forces a one-byte operand.
	Quote(Box<AsmExpr>),
	Plus(Box<AsmExpr>, Box<AsmExpr>),
	/// `name=value` inside an argument list.
	Assign(String, Box<AsmExpr>),
}

impl AsmExpr {
	pub fn symbol_name(&self) -> Option<&str> {
		match self {
			Self::Symbol(name) => Some(name),
			_ => None,
		}
	}

	pub fn as_string(&self) -> Option<&str> {
		match self {
			Self::String(text) => Some(text),
			_ => None,
		}
	}
}

impl Display for AsmExpr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Number(n) => write!(f, "{}", n),
			Self::Symbol(name) => write!(f, "{}", name),
			Self::String(text) => write!(f, "\"{}\"", text.replace('"', "\"\"")),
			Self::Quote(inner) => write!(f, "'{}", inner),
			Self::Plus(a, b) => write!(f, "{}+{}", a, b),
			Self::Assign(name, value) => write!(f, "{}={}", name, value),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
	pub target: String,
	/// Branch when the condition is true (`/`) or false (`\`).
	pub polarity: bool,
}

/// One symbolic instruction. Never modified in place; the `with_*`
/// methods return altered copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
	pub name: String,
	pub operands: Vec<AsmExpr>,
	pub store_target: Option<String>,
	pub branch: Option<Branch>,
}

impl Instruction {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			operands: Vec::new(),
			store_target: None,
			branch: None,
		}
	}

	pub fn with_name(&self, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..self.clone()
		}
	}

	pub fn with_store_target(&self, target: impl Into<String>) -> Self {
		Self {
			store_target: Some(target.into()),
			..self.clone()
		}
	}

	pub fn with_branch(&self, target: impl Into<String>, polarity: bool) -> Self {
		Self {
			branch: Some(Branch {
				target: target.into(),
				polarity,
			}),
			..self.clone()
		}
	}

	pub fn with_operands(&self, operands: Vec<AsmExpr>) -> Self {
		Self {
			operands,
			..self.clone()
		}
	}
}

impl Display for Instruction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.name)?;
		for (i, op) in self.operands.iter().enumerate() {
			write!(f, "{}{}", if i == 0 { " " } else { "," }, op)?;
		}
		if let Some(store) = &self.store_target {
			write!(f, " >{}", store)?;
		}
		if let Some(branch) = &self.branch {
			write!(f, " {}{}", if branch.polarity { '/' } else { '\\' }, branch.target)?;
		}
		Ok(())
	}
}

macro_rules! directives {
	($($variant:ident = $name:literal,)*) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum DirectiveKind {
			$($variant,)*
		}

		impl DirectiveKind {
			pub fn from_name(name: &str) -> Option<Self> {
				match name {
					$($name => Some(Self::$variant),)*
					_ => None,
				}
			}

			pub fn name(&self) -> &'static str {
				match self {
					$(Self::$variant => $name,)*
				}
			}
		}
	};
}

directives! {
	Align = ".ALIGN",
	Byte = ".BYTE",
	Chrset = ".CHRSET",
	DebugAction = ".DEBUG-ACTION",
	DebugArray = ".DEBUG-ARRAY",
	DebugAttr = ".DEBUG-ATTR",
	DebugClass = ".DEBUG-CLASS",
	DebugFakeAction = ".DEBUG-FAKE-ACTION",
	DebugFile = ".DEBUG-FILE",
	DebugGlobal = ".DEBUG-GLOBAL",
	DebugLine = ".DEBUG-LINE",
	DebugMap = ".DEBUG-MAP",
	DebugObject = ".DEBUG-OBJECT",
	DebugProp = ".DEBUG-PROP",
	DebugRoutine = ".DEBUG-ROUTINE",
	DebugRoutineEnd = ".DEBUG-ROUTINE-END",
	Defseg = ".DEFSEG",
	End = ".END",
	Endi = ".ENDI",
	Endseg = ".ENDSEG",
	Endt = ".ENDT",
	Fstr = ".FSTR",
	Funct = ".FUNCT",
	Gstr = ".GSTR",
	Gvar = ".GVAR",
	Insert = ".INSERT",
	Lang = ".LANG",
	Len = ".LEN",
	New = ".NEW",
	Object = ".OBJECT",
	Options = ".OPTIONS",
	Picfile = ".PICFILE",
	Prop = ".PROP",
	Segment = ".SEGMENT",
	Sound = ".SOUND",
	Str = ".STR",
	Strl = ".STRL",
	Table = ".TABLE",
	Time = ".TIME",
	Vocbeg = ".VOCBEG",
	Vocend = ".VOCEND",
	Word = ".WORD",
	Zword = ".ZWORD",
}

impl DirectiveKind {
	/// Directives that leave the current routine's local scope open.
	pub fn keeps_routine_open(&self) -> bool {
		matches!(self, Self::DebugLine)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
	Label { name: String, global: bool },
	Equate { name: String, value: AsmExpr },
	Instruction(Instruction),
	Directive { kind: DirectiveKind, args: Vec<AsmExpr> },
	/// A line of bare expressions, assembled as words.
	Data(Vec<AsmExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmLine {
	pub location: SourceLocation,
	pub kind: LineKind,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn instructions_are_copied_not_mutated() {
		let original = Instruction::new("ADD").with_operands(vec![
			AsmExpr::Symbol("X".into()),
			AsmExpr::Number(1),
		]);
		let stored = original.with_store_target("STACK");
		let renamed = stored.with_name("SUB");

		assert_eq!(original.store_target, None);
		assert_eq!(stored.store_target.as_deref(), Some("STACK"));
		assert_eq!(renamed.name, "SUB");
		assert_eq!(stored.name, "ADD");
		assert_ne!(original, stored);
		assert_eq!(renamed.with_name("ADD"), stored);
	}

	#[test]
	fn display_round_trips_syntax() {
		let instr = Instruction::new("EQUAL?")
			.with_operands(vec![
				AsmExpr::Symbol("X".into()),
				AsmExpr::Quote(Box::new(AsmExpr::Number(5))),
			])
			.with_branch("FALSE", false);
		assert_eq!(instr.to_string(), "EQUAL? X,'5 \\FALSE");
		assert_eq!(
			AsmExpr::String("say \"hi\"".into()).to_string(),
			"\"say \"\"hi\"\"\""
		);
	}

	#[test]
	fn directive_names() {
		assert_eq!(DirectiveKind::from_name(".FUNCT"), Some(DirectiveKind::Funct));
		assert_eq!(DirectiveKind::from_name(".DEBUG-ROUTINE-END"), Some(DirectiveKind::DebugRoutineEnd));
		assert_eq!(DirectiveKind::from_name(".FROB"), None);
		assert_eq!(DirectiveKind::Vocend.name(), ".VOCEND");
		assert!(DirectiveKind::DebugLine.keeps_routine_open());
		assert!(!DirectiveKind::Funct.keeps_routine_open());
	}
}
