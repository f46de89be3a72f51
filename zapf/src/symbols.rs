//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
	Constant,
	GlobalLabel,
	LocalLabel,
	/// Value is the packed routine address.
	Function,
	/// Value is the packed string address.
	String,
	/// Value is the variable number.
	Variable,
	/// Value is the object number.
	Object,
}

impl SymbolKind {
	pub fn describe(&self) -> &'static str {
		match self {
			Self::Constant => "constant",
			Self::GlobalLabel => "global label",
			Self::LocalLabel => "local label",
			Self::Function => "function",
			Self::String => "string",
			Self::Variable => "variable",
			Self::Object => "object",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
	pub kind: SymbolKind,
	pub value: i32,
}

impl Symbol {
	pub fn new(kind: SymbolKind, value: i32) -> Self {
		Self { kind, value }
	}

	pub fn constant(value: i32) -> Self {
		Self::new(SymbolKind::Constant, value)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
	Global,
	/// Local to the named routine.
	Local(String),
}

/// Every symbol resolved during one layout pass.
///
/// A pass starts from an empty table, reads forward references out of the
/// previous pass's table and produces a new one; comparing the two tells
/// whether layout has converged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
	globals: BTreeMap<String, Symbol>,
	locals: BTreeMap<(String, String), Symbol>,
}

impl SymbolTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.globals.len() + self.locals.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn global(&self, name: &str) -> Option<Symbol> {
		self.globals.get(name).copied()
	}

	pub fn local(&self, routine: &str, name: &str) -> Option<Symbol> {
		self.locals
			.get(&(routine.to_owned(), name.to_owned()))
			.copied()
	}

	pub fn get(&self, scope: &Scope, name: &str) -> Option<Symbol> {
		match scope {
			Scope::Global => self.global(name),
			Scope::Local(routine) => self.local(routine, name),
		}
	}

	/// Returns the previous definition, if any.
	pub fn define(&mut self, scope: Scope, name: &str, symbol: Symbol) -> Option<Symbol> {
		match scope {
			Scope::Global => self.globals.insert(name.to_owned(), symbol),
			Scope::Local(routine) => self.locals.insert((routine, name.to_owned()), symbol),
		}
	}

	pub fn remove(&mut self, scope: &Scope, name: &str) -> Option<Symbol> {
		match scope {
			Scope::Global => self.globals.remove(name),
			Scope::Local(routine) => self.locals.remove(&(routine.clone(), name.to_owned())),
		}
	}

	pub fn globals(&self) -> impl Iterator<Item = (&str, Symbol)> {
		self.globals.iter().map(|(name, sym)| (name.as_str(), *sym))
	}

	pub fn locals_of<'a>(&'a self, routine: &'a str) -> impl Iterator<Item = (&'a str, Symbol)> {
		self.locals
			.iter()
			.filter(move |((r, _), _)| r == routine)
			.map(|((_, name), sym)| (name.as_str(), *sym))
	}

	/// Symbols whose value differs from (or is missing in) `previous`, with
	/// their previous value.
	pub fn changes_from(&self, previous: &SymbolTable) -> Vec<(String, Option<i32>, i32)> {
		let globals = self.globals.iter().filter_map(|(name, sym)| {
			let old = previous.globals.get(name).map(|s| s.value);
			(old != Some(sym.value)).then(|| (name.clone(), old, sym.value))
		});
		let locals = self.locals.iter().filter_map(|((routine, name), sym)| {
			let old = previous
				.locals
				.get(&(routine.clone(), name.clone()))
				.map(|s| s.value);
			(old != Some(sym.value)).then(|| (format!("{} {}", routine, name), old, sym.value))
		});

		globals.chain(locals).collect()
	}
}
