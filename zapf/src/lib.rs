//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! An assembler for Z-machine story files, taking ZAP source as written by
//! ZIL compilers.

pub mod abbrev;
pub mod ast;
pub mod debug;
pub mod encode;
pub mod error;
pub mod image;
pub mod layout;
pub mod opcodes;
pub mod options;
pub mod parser;
pub mod source;
pub mod symbols;
pub mod text;
pub mod vocab;

pub use self::{
	debug::DebugFileWriter,
	error::{AsmError, AssemblyFailed, Located, Warning},
	layout::{assemble, Assembly},
	options::AssembleOptions,
	source::{FsSourceProvider, MemorySourceProvider, SourceProvider},
};

/// Loads `name` and everything it inserts from `provider`, then assembles
/// it.
pub fn assemble_module(
	provider: &dyn SourceProvider,
	name: &str,
	options: &AssembleOptions,
	debug: Option<&mut dyn DebugFileWriter>,
) -> Result<Assembly, AssemblyFailed> {
	let lines = parser::load_module(provider, name, options.name_style).map_err(|err| AssemblyFailed {
		errors: vec![err],
		warnings: Vec::new(),
	})?;
	assemble(&lines, options, debug)
}
