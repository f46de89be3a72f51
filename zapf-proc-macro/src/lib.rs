//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

mod util;

use std::collections::HashMap;

use proc_macro2::{Ident, Span, TokenStream};
use quote::quote;
use syn::{
	parse::{Parse, ParseStream},
	parse_macro_input, LitInt, LitStr, Token,
};

use crate::util::VersionRange;

const FLAG_NAMES: &[&str] = &[
	"STORE",
	"BRANCH",
	"EXTRA",
	"VAR_ARGS",
	"STRING",
	"LABEL",
	"INDIRECT_VAR",
	"CALL",
	"TERMINATES",
];

/// Highest numbered opcode: EXT 0x1f.
const MAX_OPCODE: u16 = 256 + 0x1f;

#[derive(Debug, Clone)]
struct Opcode {
	variant: Ident,
	classic_name: LitStr,
	inform_name: LitStr,
	number: u16,
	number_span: Span,
	versions: VersionRange,
	flags: Vec<Ident>,
}

struct OpcodeTable {
	opcodes: Vec<Opcode>,
}

impl Parse for OpcodeTable {
	fn parse(input: ParseStream) -> syn::Result<Self> {
		let mut opcodes = Vec::new();

		while !input.is_empty() {
			opcodes.push(input.parse()?);
			input.parse::<Token![;]>()?;
		}

		Ok(Self { opcodes })
	}
}

impl Parse for Opcode {
	fn parse(input: ParseStream) -> syn::Result<Self> {
		let variant: Ident = input.parse()?;
		input.parse::<Token![=]>()?;
		let classic_name: LitStr = input.parse()?;
		input.parse::<Token![/]>()?;
		let inform_name: LitStr = input.parse()?;
		input.parse::<Token![,]>()?;

		let number_lit: LitInt = input.parse()?;
		let number: u16 = number_lit.base10_parse()?;
		if number > MAX_OPCODE {
			return Err(syn::Error::new(
				number_lit.span(),
				format!("Opcode number {} is out of range", number),
			));
		}
		input.parse::<Token![,]>()?;

		let versions: VersionRange = input.parse()?;
		input.parse::<Token![,]>()?;

		let mut flags = Vec::new();
		if input.peek(Token![_]) {
			input.parse::<Token![_]>()?;
		} else {
			loop {
				let flag: Ident = input.parse()?;
				if !FLAG_NAMES.contains(&flag.to_string().as_str()) {
					return Err(syn::Error::new(
						flag.span(),
						format!("Unknown opcode flag \"{}\"", flag),
					));
				}
				flags.push(flag);

				if input.peek(Token![|]) {
					input.parse::<Token![|]>()?;
				} else {
					break;
				}
			}
		}

		Ok(Self {
			variant,
			classic_name,
			inform_name,
			number,
			number_span: number_lit.span(),
			versions,
			flags,
		})
	}
}

/// Every `(name, version)` pair must resolve to at most one entry.
fn check_ambiguity(opcodes: &[Opcode]) -> syn::Result<()> {
	let mut seen: HashMap<String, Vec<(VersionRange, &Ident)>> = HashMap::new();

	for op in opcodes {
		for name in [&op.classic_name, &op.inform_name] {
			let entries = seen.entry(name.value()).or_default();

			for (other, other_variant) in entries.iter() {
				if other.overlaps(&op.versions) {
					return Err(syn::Error::new(
						name.span(),
						format!(
							"\"{}\" is ambiguous: {} and {} both cover versions {}",
							name.value(),
							other_variant,
							op.variant,
							other.intersection(&op.versions),
						),
					));
				}
			}

			entries.push((op.versions, &op.variant));
		}
	}

	Ok(())
}

#[proc_macro]
pub fn opcodes(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
	let table = parse_macro_input!(item as OpcodeTable);

	if let Err(err) = check_ambiguity(&table.opcodes) {
		return err.to_compile_error().into();
	}

	for op in &table.opcodes {
		// numbers 176..=191 are 0OP forms and cannot take operands
		if (176..192).contains(&op.number) && op.flags.iter().any(|f| f == "VAR_ARGS") {
			return syn::Error::new(op.number_span, "0OP opcodes cannot take variable arguments")
				.to_compile_error()
				.into();
		}
	}

	let mut variants: Vec<&Ident> = Vec::new();
	for op in &table.opcodes {
		if !variants.contains(&&op.variant) {
			variants.push(&op.variant);
		}
	}

	let entries = table.opcodes.iter().map(|op| {
		let Opcode {
			variant,
			classic_name,
			inform_name,
			number,
			versions,
			flags,
			..
		} = op;
		let min = versions.min;
		let max = versions.max;
		let flags: TokenStream = flags
			.iter()
			.fold(quote!(ZOpFlags::empty()), |acc, flag| {
				quote!(#acc.union(ZOpFlags::#flag))
			});

		quote! {
			ZOpDescriptor {
				op: ZOp::#variant,
				classic_name: #classic_name,
				inform_name: #inform_name,
				number: #number,
				min_version: #min,
				max_version: #max,
				flags: #flags,
			}
		}
	});

	let count = table.opcodes.len();

	quote! {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum ZOp {
			#(#variants,)*
		}

		pub static OPCODE_TABLE: [ZOpDescriptor; #count] = [
			#(#entries,)*
		];
	}
	.into()
}
