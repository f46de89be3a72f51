//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! Byte-level instruction encoding. Nothing here knows about symbols or
//! passes; the layout engine resolves operands and chooses widths first.

use byteorder::{BigEndian, WriteBytesExt};
use num_enum::IntoPrimitive;

use crate::{
	error::AsmError,
	opcodes::{OpcodeForm, ZOpDescriptor, ZOpFlags},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum OperandType {
	Large = 0,
	Small = 1,
	Variable = 2,
	Omitted = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
	pub kind: OperandType,
	pub value: u16,
}

impl Operand {
	pub fn large(value: u16) -> Self {
		Self {
			kind: OperandType::Large,
			value,
		}
	}

	pub fn small(value: u8) -> Self {
		Self {
			kind: OperandType::Small,
			value: value as u16,
		}
	}

	pub fn variable(number: u8) -> Self {
		Self {
			kind: OperandType::Variable,
			value: number as u16,
		}
	}

	fn push_to(&self, out: &mut Vec<u8>) {
		match self.kind {
			OperandType::Large => {
				// writing to a Vec cannot fail
				let _ = out.write_u16::<BigEndian>(self.value);
			},
			OperandType::Small | OperandType::Variable => out.push(self.value as u8),
			OperandType::Omitted => {},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
	/// Return from the routine with this truth value instead of branching.
	Return(bool),
	Address(i32),
}

/// Whether a 2OP opcode must use the variable form for these operands.
pub fn needs_variable_form(desc: &ZOpDescriptor, operands: &[Operand]) -> bool {
	desc.form() == OpcodeForm::Two
		&& (operands.len() != 2 || operands.iter().any(|op| op.kind == OperandType::Large))
}

/// Encodes the opcode, operand types and operands. Store and branch bytes
/// and inline strings are appended by the caller.
pub fn encode_head(desc: &ZOpDescriptor, operands: &[Operand]) -> Vec<u8> {
	let mut out = Vec::with_capacity(2 + 2 + operands.len() * 2);
	let number = desc.number;

	match desc.form() {
		OpcodeForm::Two if !needs_variable_form(desc, operands) => {
			let mut b = number as u8;
			if operands[0].kind == OperandType::Variable {
				b |= 0x40;
			}
			if operands[1].kind == OperandType::Variable {
				b |= 0x20;
			}
			out.push(b);
		},
		OpcodeForm::One => {
			let kind = operands.first().map_or(OperandType::Omitted, |op| op.kind);
			out.push(number as u8 | u8::from(kind) << 4);
		},
		OpcodeForm::Zero => out.push(number as u8),
		form => {
			match form {
				OpcodeForm::Two => out.push((number + 192) as u8),
				OpcodeForm::Extended => {
					out.push(190);
					out.push((number - 256) as u8);
				},
				_ => out.push(number as u8),
			}

			let slots = if desc.flags.contains(ZOpFlags::EXTRA) { 8 } else { 4 };
			let mut type_byte = 0u8;
			for i in 0..slots {
				let kind = operands.get(i).map_or(OperandType::Omitted, |op| op.kind);
				type_byte |= u8::from(kind) << (6 - i % 4 * 2);
				if i % 4 == 3 {
					out.push(type_byte);
					type_byte = 0;
				}
			}
		},
	}

	for op in operands {
		op.push_to(&mut out);
	}

	out
}

/// Offset stored in a branch whose first branch byte sits at `branch_pos`.
pub fn branch_offset(target: i32, branch_pos: i32, long: bool) -> i32 {
	let width = if long { 2 } else { 1 };
	target - (branch_pos + width) + 2
}

/// Short offsets 0 and 1 mean "return false" and "return true".
pub fn short_branch_fits(offset: i32) -> bool {
	(2..=63).contains(&offset)
}

pub fn encode_branch(
	polarity: bool,
	target: BranchTarget,
	branch_pos: i32,
	long: bool,
) -> Result<Vec<u8>, AsmError> {
	let short = |offset: i32| {
		let b = if polarity { 0xc0 } else { 0x40 };
		vec![b | (offset & 0x3f) as u8]
	};

	match target {
		BranchTarget::Return(value) => Ok(short(value as i32)),
		BranchTarget::Address(addr) if !long => Ok(short(branch_offset(addr, branch_pos, false))),
		BranchTarget::Address(addr) => {
			let offset = branch_offset(addr, branch_pos, true);
			if !(-8192..=8191).contains(&offset) {
				return Err(AsmError::BranchOutOfRange(offset));
			}
			let word = (if polarity { 0x8000 } else { 0 }) | (offset & 0x3fff) as u16;
			Ok(word.to_be_bytes().to_vec())
		},
	}
}

/// The operand of a JUMP at `opcode_addr`. The short form is a byte
/// constant holding the distance from the opcode.
pub fn jump_operand(target: i32, opcode_addr: i32, long: bool) -> Operand {
	if long {
		Operand::large((target - opcode_addr - 1) as u16)
	} else {
		Operand::small((target - opcode_addr) as u8)
	}
}

pub fn short_jump_fits(target: i32, opcode_addr: i32) -> bool {
	(0..=255).contains(&(target - opcode_addr))
}
