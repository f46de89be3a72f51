//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::{
	collections::HashMap,
	fs, io,
	path::{Path, PathBuf},
};

/// Where the assembler reads source files from. The assembler itself never
/// touches the filesystem.
pub trait SourceProvider {
	fn read_source(&self, name: &str) -> io::Result<String>;
	fn source_exists(&self, name: &str) -> bool;

	/// Finds the file an `.INSERT` names: as given, then with `.zap`, then
	/// with `.xzap` appended.
	fn find_inserted(&self, name: &str) -> Option<String> {
		[name.to_owned(), format!("{}.zap", name), format!("{}.xzap", name)]
			.into_iter()
			.find(|candidate| self.source_exists(candidate))
	}
}

/// Reads files relative to a base directory.
#[derive(Debug, Clone)]
pub struct FsSourceProvider {
	base: PathBuf,
}

impl FsSourceProvider {
	pub fn new(base: impl Into<PathBuf>) -> Self {
		Self { base: base.into() }
	}

	fn resolve(&self, name: &str) -> PathBuf {
		let path = Path::new(name);
		if path.is_absolute() {
			path.to_owned()
		} else {
			self.base.join(path)
		}
	}
}

impl SourceProvider for FsSourceProvider {
	fn read_source(&self, name: &str) -> io::Result<String> {
		fs::read_to_string(self.resolve(name))
	}

	fn source_exists(&self, name: &str) -> bool {
		self.resolve(name).is_file()
	}
}

#[derive(Debug, Clone, Default)]
pub struct MemorySourceProvider {
	files: HashMap<String, String>,
}

impl MemorySourceProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_file(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
		self.add_file(name, text);
		self
	}

	pub fn add_file(&mut self, name: impl Into<String>, text: impl Into<String>) {
		self.files.insert(name.into(), text.into());
	}
}

impl SourceProvider for MemorySourceProvider {
	fn read_source(&self, name: &str) -> io::Result<String> {
		self.files
			.get(name)
			.cloned()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", name)))
	}

	fn source_exists(&self, name: &str) -> bool {
		self.files.contains_key(name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inserted_file_search_order() {
		let sources = MemorySourceProvider::new()
			.with_file("globals.zap", "")
			.with_file("strings.xzap", "")
			.with_file("both", "")
			.with_file("both.zap", "");

		assert_eq!(sources.find_inserted("globals").as_deref(), Some("globals.zap"));
		assert_eq!(sources.find_inserted("strings").as_deref(), Some("strings.xzap"));
		assert_eq!(sources.find_inserted("both").as_deref(), Some("both"));
		assert_eq!(sources.find_inserted("missing"), None);
	}

	#[test]
	fn missing_memory_file_is_not_found() {
		let err = MemorySourceProvider::new().read_source("x.zap").unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::NotFound);
	}
}
