//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::fmt::Display;

use syn::{parse::Parse, LitInt, Token};

/// Inclusive range of Z-machine versions an opcode entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionRange {
	pub min: u8,
	pub max: u8,
}

impl VersionRange {
	pub fn overlaps(&self, other: &VersionRange) -> bool {
		self.min <= other.max && other.min <= self.max
	}

	pub fn intersection(&self, other: &VersionRange) -> VersionRange {
		VersionRange {
			min: self.min.max(other.min),
			max: self.max.min(other.max),
		}
	}
}

impl Display for VersionRange {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.min == self.max {
			write!(f, "{}", self.min)
		} else {
			write!(f, "{}..={}", self.min, self.max)
		}
	}
}

impl Parse for VersionRange {
	fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
		let min_lit: LitInt = input.parse()?;
		let min: u8 = min_lit.base10_parse()?;

		let max = if input.peek(Token![..=]) {
			input.parse::<Token![..=]>()?;
			let max_lit: LitInt = input.parse()?;
			let max: u8 = max_lit.base10_parse()?;
			if max < min {
				return Err(syn::Error::new(max_lit.span(), "Empty version range"));
			}
			max
		} else {
			min
		};

		if min < 1 || max > 6 {
			return Err(syn::Error::new(
				min_lit.span(),
				"Opcode versions must lie within 1..=6 (V7 and V8 map onto 6 and 5)",
			));
		}

		Ok(Self { min, max })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn overlapping_ranges() {
		let a = VersionRange { min: 1, max: 4 };
		let b = VersionRange { min: 4, max: 6 };
		let c = VersionRange { min: 5, max: 6 };

		assert!(a.overlaps(&b));
		assert!(!a.overlaps(&c));
		assert_eq!(a.intersection(&b), VersionRange { min: 4, max: 4 });
		assert_eq!(a.intersection(&b).to_string(), "4");
	}
}
