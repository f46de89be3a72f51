//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::{collections::HashMap, ops::RangeInclusive};

use bitflags::bitflags;
use lazy_static::lazy_static;
use zapf_proc_macro::opcodes;

use crate::error::AsmError;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct ZOpFlags: u16 {
		/// Followed by a store target byte.
		const STORE = 1;
		/// Followed by a branch offset.
		const BRANCH = 2;
		/// Takes up to 8 operands and two operand type bytes.
		const EXTRA = 4;
		/// A 2OP that may also be given 3 or 4 operands.
		const VAR_ARGS = 8;
		/// Followed by an inline encoded string.
		const STRING = 16;
		/// The single operand is a relative jump target.
		const LABEL = 32;
		/// The first operand names a variable by number.
		const INDIRECT_VAR = 64;
		/// The first operand is a packed routine address.
		const CALL = 128;
		/// Control never falls through to the next instruction.
		const TERMINATES = 256;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZOpDescriptor {
	pub op: ZOp,
	pub classic_name: &'static str,
	pub inform_name: &'static str,
	pub number: u16,
	pub min_version: u8,
	pub max_version: u8,
	pub flags: ZOpFlags,
}

opcodes! {
	Add = "ADD" / "add", 20, 1..=6, STORE;
	Ashift = "ASHIFT" / "art_shift", 259, 5..=6, STORE;
	Assigned = "ASSIGNED?" / "check_arg_count", 255, 5..=6, BRANCH | INDIRECT_VAR;
	Band = "BAND" / "and", 9, 1..=6, STORE;
	Bcom = "BCOM" / "not", 143, 1..=4, STORE;
	Bcom = "BCOM" / "not", 248, 5..=6, STORE;
	Bor = "BOR" / "or", 8, 1..=6, STORE;
	Btst = "BTST" / "test", 7, 1..=6, BRANCH;
	Bufout = "BUFOUT" / "buffer_mode", 242, 4..=6, _;
	Call = "CALL" / "call_vs", 224, 1..=6, STORE | CALL;
	Call1 = "CALL1" / "call_1s", 136, 4..=6, STORE | CALL;
	Call2 = "CALL2" / "call_2s", 25, 4..=6, STORE | CALL;
	Catch = "CATCH" / "catch", 185, 5..=6, STORE;
	Checku = "CHECKU" / "check_unicode", 268, 5..=6, STORE;
	Clear = "CLEAR" / "erase_window", 237, 4..=6, _;
	Color = "COLOR" / "set_colour", 27, 5, _;
	Color = "COLOR" / "set_colour", 27, 6, VAR_ARGS;
	Copyt = "COPYT" / "copy_table", 253, 5..=6, _;
	Crlf = "CRLF" / "new_line", 187, 1..=6, _;
	Curget = "CURGET" / "get_cursor", 240, 4..=6, _;
	Curset = "CURSET" / "set_cursor", 239, 4..=6, _;
	Dclear = "DCLEAR" / "erase_picture", 263, 6, _;
	Dec = "DEC" / "dec", 134, 1..=6, INDIRECT_VAR;
	Dirin = "DIRIN" / "input_stream", 244, 3..=6, _;
	Dirout = "DIROUT" / "output_stream", 243, 3..=6, _;
	Display = "DISPLAY" / "draw_picture", 261, 6, _;
	Div = "DIV" / "div", 23, 1..=6, STORE;
	Dless = "DLESS?" / "dec_chk", 4, 1..=6, BRANCH | INDIRECT_VAR;
	Equal = "EQUAL?" / "je", 1, 1..=6, BRANCH | VAR_ARGS;
	Erase = "ERASE" / "erase_line", 238, 4..=6, _;
	Fclear = "FCLEAR" / "clear_attr", 12, 1..=6, _;
	First = "FIRST?" / "get_child", 130, 1..=6, STORE | BRANCH;
	Font = "FONT" / "set_font", 260, 5..=6, STORE;
	Fset = "FSET" / "set_attr", 11, 1..=6, _;
	FsetP = "FSET?" / "test_attr", 10, 1..=6, BRANCH;
	Fstack = "FSTACK" / "pop", 185, 1..=4, _;
	Fstack = "FSTACK" / "pop_stack", 277, 6, _;
	Get = "GET" / "loadw", 15, 1..=6, STORE;
	Getb = "GETB" / "loadb", 16, 1..=6, STORE;
	Getp = "GETP" / "get_prop", 17, 1..=6, STORE;
	Getpt = "GETPT" / "get_prop_addr", 18, 1..=6, STORE;
	Grtr = "GRTR?" / "jg", 3, 1..=6, BRANCH;
	Hlight = "HLIGHT" / "set_text_style", 241, 4..=6, _;
	Icall = "ICALL" / "call_vn", 249, 5..=6, CALL;
	Icall1 = "ICALL1" / "call_1n", 143, 5..=6, CALL;
	Icall2 = "ICALL2" / "call_2n", 26, 5..=6, CALL;
	Igrtr = "IGRTR?" / "inc_chk", 5, 1..=6, BRANCH | INDIRECT_VAR;
	In = "IN?" / "jin", 6, 1..=6, BRANCH;
	Inc = "INC" / "inc", 133, 1..=6, INDIRECT_VAR;
	Input = "INPUT" / "read_char", 246, 4..=6, STORE;
	Intbl = "INTBL?" / "scan_table", 247, 4..=6, STORE | BRANCH;
	Irestore = "IRESTORE" / "restore_undo", 266, 5..=6, STORE;
	Isave = "ISAVE" / "save_undo", 265, 5..=6, STORE;
	Ixcall = "IXCALL" / "call_vn2", 250, 5..=6, EXTRA | CALL;
	Jump = "JUMP" / "jump", 140, 1..=6, LABEL | TERMINATES;
	Less = "LESS?" / "jl", 2, 1..=6, BRANCH;
	Lex = "LEX" / "tokenise", 251, 5..=6, _;
	Loc = "LOC" / "get_parent", 131, 1..=6, STORE;
	Margin = "MARGIN" / "set_margins", 264, 6, _;
	Menu = "MENU" / "make_menu", 283, 6, BRANCH;
	Mod = "MOD" / "mod", 24, 1..=6, STORE;
	MouseInfo = "MOUSE-INFO" / "read_mouse", 278, 6, _;
	MouseLimit = "MOUSE-LIMIT" / "mouse_window", 279, 6, _;
	Move = "MOVE" / "insert_obj", 14, 1..=6, _;
	Mul = "MUL" / "mul", 22, 1..=6, STORE;
	Next = "NEXT?" / "get_sibling", 129, 1..=6, STORE | BRANCH;
	Nextp = "NEXTP" / "get_next_prop", 19, 1..=6, STORE;
	Noop = "NOOP" / "nop", 180, 1..=6, _;
	Original = "ORIGINAL?" / "piracy", 191, 5..=6, BRANCH;
	Picinf = "PICINF" / "picture_data", 262, 6, BRANCH;
	Picset = "PICSET" / "picture_table", 284, 6, _;
	Pop = "POP" / "pull", 233, 1..=5, _;
	Pop = "POP" / "pull", 233, 6, STORE;
	Print = "PRINT" / "print_paddr", 141, 1..=6, _;
	Printb = "PRINTB" / "print_addr", 135, 1..=6, _;
	Printc = "PRINTC" / "print_char", 229, 1..=6, _;
	Printd = "PRINTD" / "print_obj", 138, 1..=6, _;
	Printf = "PRINTF" / "print_form", 282, 6, _;
	Printi = "PRINTI" / "print", 178, 1..=6, STRING;
	Printn = "PRINTN" / "print_num", 230, 1..=6, _;
	Printr = "PRINTR" / "print_ret", 179, 1..=6, STRING | TERMINATES;
	Printt = "PRINTT" / "print_table", 254, 5..=6, _;
	Printu = "PRINTU" / "print_unicode", 267, 5..=6, _;
	Ptsize = "PTSIZE" / "get_prop_len", 132, 1..=6, STORE;
	Push = "PUSH" / "push", 232, 1..=6, _;
	Put = "PUT" / "storew", 225, 1..=6, _;
	Putb = "PUTB" / "storeb", 226, 1..=6, _;
	Putp = "PUTP" / "put_prop", 227, 1..=6, _;
	Quit = "QUIT" / "quit", 186, 1..=6, TERMINATES;
	Random = "RANDOM" / "random", 231, 1..=6, STORE;
	Read = "READ" / "sread", 228, 1..=4, _;
	Read = "READ" / "aread", 228, 5..=6, STORE;
	Remove = "REMOVE" / "remove_obj", 137, 1..=6, _;
	Restart = "RESTART" / "restart", 183, 1..=6, TERMINATES;
	Restore = "RESTORE" / "restore", 182, 1..=3, BRANCH;
	Restore = "RESTORE" / "restore", 182, 4, STORE;
	Restore = "RESTORE" / "restore", 257, 5..=6, STORE;
	Return = "RETURN" / "ret", 139, 1..=6, TERMINATES;
	Rfalse = "RFALSE" / "rfalse", 177, 1..=6, TERMINATES;
	Rstack = "RSTACK" / "ret_popped", 184, 1..=6, TERMINATES;
	Rtrue = "RTRUE" / "rtrue", 176, 1..=6, TERMINATES;
	Save = "SAVE" / "save", 181, 1..=3, BRANCH;
	Save = "SAVE" / "save", 181, 4, STORE;
	Save = "SAVE" / "save", 256, 5..=6, STORE;
	Screen = "SCREEN" / "set_window", 235, 3..=6, _;
	Scroll = "SCROLL" / "scroll_window", 276, 6, _;
	Set = "SET" / "store", 13, 1..=6, INDIRECT_VAR;
	Shift = "SHIFT" / "log_shift", 258, 5..=6, STORE;
	Sound = "SOUND" / "sound_effect", 245, 3..=6, _;
	Split = "SPLIT" / "split_window", 234, 3..=6, _;
	Sub = "SUB" / "sub", 21, 1..=6, STORE;
	Throw = "THROW" / "throw", 28, 5..=6, TERMINATES;
	Usl = "USL" / "show_status", 188, 1..=3, _;
	Value = "VALUE" / "load", 142, 1..=6, STORE | INDIRECT_VAR;
	Verify = "VERIFY" / "verify", 189, 3..=6, BRANCH;
	Winattr = "WINATTR" / "window_style", 274, 6, _;
	Winget = "WINGET" / "get_wind_prop", 275, 6, STORE;
	Winpos = "WINPOS" / "move_window", 272, 6, _;
	Winput = "WINPUT" / "put_wind_prop", 281, 6, _;
	Winsize = "WINSIZE" / "window_size", 273, 6, _;
	Xcall = "XCALL" / "call_vs2", 236, 4..=6, STORE | EXTRA | CALL;
	Xpush = "XPUSH" / "push_stack", 280, 6, BRANCH;
	Zero = "ZERO?" / "jz", 128, 1..=6, BRANCH;
	Zwstr = "ZWSTR" / "encode_text", 252, 5..=6, _;
}

/// Encoding family, determined by the opcode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeForm {
	/// 0..=31, promoted to the variable form when needed.
	Two,
	/// 128..=175, operand type in bits 4-5.
	One,
	/// 176..=191.
	Zero,
	/// 192..=255.
	Variable,
	/// 256 and up, written as 190 followed by `number - 256`.
	Extended,
}

/// Which spelling of opcode names the source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStyle {
	Classic,
	Inform,
}

impl ZOpDescriptor {
	pub fn form(&self) -> OpcodeForm {
		match self.number {
			0..=127 => OpcodeForm::Two,
			128..=175 => OpcodeForm::One,
			176..=191 => OpcodeForm::Zero,
			192..=255 => OpcodeForm::Variable,
			_ => OpcodeForm::Extended,
		}
	}

	pub fn name(&self, style: NameStyle) -> &'static str {
		match style {
			NameStyle::Classic => self.classic_name,
			NameStyle::Inform => self.inform_name,
		}
	}

	pub fn supports(&self, version: u8) -> bool {
		let version = effective_version(version);
		(self.min_version..=self.max_version).contains(&version)
	}

	/// Legal operand counts, not counting store or branch operands.
	pub fn operand_counts(&self) -> RangeInclusive<usize> {
		match self.form() {
			OpcodeForm::Two if self.flags.contains(ZOpFlags::VAR_ARGS) => 2..=4,
			OpcodeForm::Two => 2..=2,
			OpcodeForm::One => 1..=1,
			OpcodeForm::Zero if self.flags.contains(ZOpFlags::STRING) => 1..=1,
			OpcodeForm::Zero => 0..=0,
			OpcodeForm::Variable | OpcodeForm::Extended => {
				if self.flags.contains(ZOpFlags::EXTRA) {
					0..=8
				} else {
					0..=4
				}
			},
		}
	}

	pub fn stores(&self) -> bool {
		self.flags.contains(ZOpFlags::STORE)
	}

	pub fn branches(&self) -> bool {
		self.flags.contains(ZOpFlags::BRANCH)
	}

	pub fn terminates(&self) -> bool {
		self.flags.contains(ZOpFlags::TERMINATES)
	}

	/// Candidate widths of the branch offset in bytes, short form first.
	pub fn branch_widths(&self) -> Option<(usize, usize)> {
		self.branches().then_some((1, 2))
	}

	/// The 8-operand variant used when a call is given more than 4 operands.
	pub fn extra_form(&self) -> Option<ZOp> {
		match self.op {
			ZOp::Call => Some(ZOp::Xcall),
			ZOp::Icall => Some(ZOp::Ixcall),
			_ => None,
		}
	}
}

/// Opcode sets are defined for versions 1 through 6; V7 uses the V6 set
/// and V8 the V5 set.
pub fn effective_version(version: u8) -> u8 {
	match version {
		7 => 6,
		8 => 5,
		v => v,
	}
}

type NameMap = HashMap<&'static str, Vec<&'static ZOpDescriptor>>;

lazy_static! {
	static ref BY_NAME: NameMap = {
		let mut map = NameMap::new();
		for desc in OPCODE_TABLE.iter() {
			map.entry(desc.classic_name).or_default().push(desc);
			map.entry(desc.inform_name).or_default().push(desc);
		}
		map
	};
}

/// Resolves either spelling of an opcode name for the given version.
pub fn lookup(name: &str, version: u8) -> Result<&'static ZOpDescriptor, AsmError> {
	let candidates = BY_NAME
		.get(name)
		.ok_or_else(|| AsmError::UnknownOpcode(name.to_owned()))?;

	candidates
		.iter()
		.copied()
		.find(|desc| desc.supports(version))
		.ok_or_else(|| AsmError::UnsupportedOpcodeForVersion {
			name: name.to_owned(),
			version,
		})
}

/// Whether `name` is an opcode in any version, in the given spelling.
pub fn is_opcode_name(name: &str, style: NameStyle) -> bool {
	BY_NAME
		.get(name)
		.map_or(false, |descs| descs.iter().any(|desc| desc.name(style) == name))
}

pub fn by_op(op: ZOp, version: u8) -> Option<&'static ZOpDescriptor> {
	OPCODE_TABLE
		.iter()
		.find(|desc| desc.op == op && desc.supports(version))
}

/// Name → descriptor table for one version and one naming style.
#[derive(Debug, Clone)]
pub struct OpcodeDict {
	version: u8,
	style: NameStyle,
	by_name: HashMap<&'static str, &'static ZOpDescriptor>,
}

impl OpcodeDict {
	pub fn new(version: u8, style: NameStyle) -> Self {
		let by_name = OPCODE_TABLE
			.iter()
			.filter(|desc| desc.supports(version))
			.map(|desc| (desc.name(style), desc))
			.collect();

		Self {
			version,
			style,
			by_name,
		}
	}

	pub fn version(&self) -> u8 {
		self.version
	}

	pub fn get(&self, name: &str) -> Option<&'static ZOpDescriptor> {
		self.by_name.get(name).copied()
	}

	/// Like [`OpcodeDict::get`], but distinguishes names that exist in some
	/// other version from names that are not opcodes at all.
	pub fn resolve(&self, name: &str) -> Result<&'static ZOpDescriptor, AsmError> {
		if let Some(desc) = self.get(name) {
			return Ok(desc);
		}

		let known = OPCODE_TABLE.iter().any(|desc| desc.name(self.style) == name);
		if known {
			Err(AsmError::UnsupportedOpcodeForVersion {
				name: name.to_owned(),
				version: self.version,
			})
		} else {
			Err(AsmError::UnknownOpcode(name.to_owned()))
		}
	}
}
