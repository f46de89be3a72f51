//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use zapf::{assemble_module, AsmError, AssembleOptions, Assembly, AssemblyFailed, MemorySourceProvider};

fn assemble(source: &str) -> Result<Assembly, AssemblyFailed> {
	let provider = MemorySourceProvider::new().with_file("converge.zap", source);
	assemble_module(&provider, "converge.zap", &AssembleOptions::default(), None)
}

fn padding_words(count: usize) -> String {
	if count == 0 {
		return String::new();
	}
	format!(".WORD 0{}", ",0".repeat(count - 1))
}

/// Collapses sorted numbers into "a-b" ranges for readable failures.
fn ranges(numbers: &[usize]) -> String {
	let mut out: Vec<String> = Vec::new();
	let mut i = 0;
	while i < numbers.len() {
		let start = numbers[i];
		while i + 1 < numbers.len() && numbers[i + 1] == numbers[i] + 1 {
			i += 1;
		}
		if numbers[i] == start {
			out.push(start.to_string());
		} else {
			out.push(format!("{}-{}", start, numbers[i]));
		}
		i += 1;
	}
	out.join(", ")
}

#[test]
fn forward_constant_with_any_padding() {
	let mut failures = Vec::new();
	for i in 0..=256 {
		let source = format!(
			"
	.NEW 5

	TABLE2=MYTABLE

{}

MYTABLE::
	.WORD 0

	.FUNCT TEST-ROUTINE
	COPYT TABLE2,TABLE2,6
	RTRUE

	.FUNCT GO
START::
	CALL1 TEST-ROUTINE >STACK
	PRINTN STACK
	QUIT

	.END
",
			padding_words(i)
		);
		if assemble(&source).is_err() {
			failures.push(i);
		}
	}
	assert!(
		failures.is_empty(),
		"could not assemble with padding word counts: {}",
		ranges(&failures)
	);
}

#[test]
fn forward_constant_table_with_abbreviations() {
	let source = format!(
		"
	.FSTR FSTR?DUMMY,\"\"
WORDS::
{}
	TBL=T?0

GLOBAL:: .TABLE
	.ENDT

OBJECT:: .TABLE
	.ENDT

T?0:: .TABLE 6
	.WORD 12345,123,45
	.ENDT

IMPURE::

VOCAB:: .TABLE
	.ENDT

ENDLOD::

	.FUNCT TEST-IMPLIES,FAILS
	GET TBL,0 >STACK
	EQUAL? STACK,12345 /?L3
	INC 'FAILS
?L3:	GETB TBL,2 >STACK
	EQUAL? STACK,123 /?L6
	INC 'FAILS
?L6:	GETB TBL,3 >STACK
	EQUAL? STACK,45 /?L9
	INC 'FAILS
?L9:	RETURN FAILS

	.FUNCT GO
START::
	CALL TEST-IMPLIES >STACK
	ZERO? STACK \\?L1
?L1:	QUIT

	.END
",
		"\tFSTR?DUMMY\n".repeat(96)
	);

	let asm = assemble(&source).unwrap();
	assert!(asm.warnings.is_empty());

	// TBL ends up pointing at the table, and the table reads back intact
	let tbl = asm.symbols.global("TBL").unwrap().value as usize;
	assert_eq!(tbl, asm.symbols.global("T?0").unwrap().value as usize);
	assert_eq!(&asm.story[tbl..tbl + 6], &[0x30, 0x39, 0, 123, 0, 45]);
}

#[test]
fn forward_constant_used_as_data() {
	let asm = assemble(
		"
	.NEW 5
	.WORD EXTAB

	EXTAB=T?EXTAB

T?EXTAB:: .TABLE
	.WORD 0
	.ENDT

	.END
",
	)
	.unwrap();
	// the first word becomes the version and flags byte pair
	assert_eq!(asm.symbols.global("EXTAB").unwrap().value, 2);
}

#[test]
fn convergence_ceiling() {
	let provider = MemorySourceProvider::new().with_file(
		"converge.zap",
		"
	.NEW 5
	.FUNCT GO
START::
	PRINTN FAR
	QUIT
	FAR=1000
",
	);
	let options = AssembleOptions {
		max_passes: Some(1),
		..Default::default()
	};
	let err = assemble_module(&provider, "converge.zap", &options, None).unwrap_err();
	assert!(err.has(|e| matches!(e, AsmError::ConvergenceFailed(1))));
}

#[test]
fn many_routines_settle() {
	// each routine branches over a block whose size depends on a later constant
	let mut source = String::from(".NEW 5\n");
	for r in 0..20 {
		source.push_str(&format!(
			"\t.FUNCT R{0}\n\tZERO? 0 /?SKIP\n\tPRINTN BIG{0}\n\tPRINTI \"routine {0}\"\n?SKIP:\tRTRUE\n",
			r
		));
	}
	for r in 0..20 {
		source.push_str(&format!("\tBIG{}={}\n", r, r * 100));
	}
	source.push_str("\t.FUNCT GO\nSTART::\n\tQUIT\n");

	let asm = assemble(&source).unwrap();
	assert!(asm.passes <= 3 + 16);
	for r in 0..20 {
		let big = asm.symbols.global(&format!("BIG{}", r)).unwrap().value;
		assert_eq!(big, r * 100);
	}
}

#[test]
fn jump_to_global_labels() {
	let source = format!(
		"
	.NEW 5
	.FUNCT GO
START::
	JUMP DONE
DONE::
	RTRUE

	.FUNCT AGAIN
LOOP::
	JUMP LOOP

	.FUNCT AWAY
HERE::
	JUMP FAR
	RTRUE
{}
	.FUNCT ELSEWHERE
FAR::
	RTRUE
	.END
",
		padding_words(300)
	);
	let asm = assemble(&source).unwrap();
	let label = |name: &str| asm.symbols.global(name).unwrap().value as usize;

	// forward inside the routine: byte form, operand counted from the opcode
	let done = label("DONE");
	assert_eq!(&asm.story[done - 2..done], &[0x9C, 2]);

	// backward: word form
	let jump = label("LOOP");
	assert_eq!(&asm.story[jump..jump + 3], &[0x8C, 0xFF, 0xFF]);

	// forward past the routine and out of byte range: widened
	let jump = label("HERE");
	let offset = (label("FAR") - jump - 1) as u16;
	assert!(offset > 255);
	assert_eq!(asm.story[jump], 0x8C);
	assert_eq!(&asm.story[jump + 1..jump + 3], &offset.to_be_bytes());
}
