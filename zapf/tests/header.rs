//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use zapf::{assemble_module, AssembleOptions, MemorySourceProvider};

const V3_BODY: &str = "
WORDS::
GLOBAL::
OBJECT::
VOCAB::
IMPURE::
ENDLOD::

	.FUNCT GO
START::
	QUIT

	.END
";

fn assemble(source: &str, options: &AssembleOptions) -> Vec<u8> {
	let provider = MemorySourceProvider::new().with_file("test.zap", source);
	assemble_module(&provider, "test.zap", options, None)
		.unwrap()
		.story
}

fn word_at(story: &[u8], offset: usize) -> u16 {
	u16::from_be_bytes([story[offset], story[offset + 1]])
}

#[test]
fn releaseid_sets_the_release_in_v3() {
	let story = assemble(
		&format!("\tRELEASEID=111\n{}", V3_BODY),
		&AssembleOptions::default(),
	);
	assert_eq!(word_at(&story, 2), 111);
}

#[test]
fn zorkid_is_used_without_releaseid() {
	let story = assemble(&format!("\tZORKID=42\n{}", V3_BODY), &AssembleOptions::default());
	assert_eq!(word_at(&story, 2), 42);
}

#[test]
fn releaseid_of_zero_wins_over_zorkid() {
	let story = assemble(
		&format!("\tRELEASEID=0\n\tZORKID=42\n{}", V3_BODY),
		&AssembleOptions::default(),
	);
	assert_eq!(word_at(&story, 2), 0);
}

#[test]
fn release_option_works_without_releaseid() {
	let story = assemble(V3_BODY, &AssembleOptions::default().with_release(222));
	assert_eq!(word_at(&story, 2), 222);
}

#[test]
fn release_option_overrides_releaseid_in_v3() {
	let story = assemble(
		&format!("\tRELEASEID=111\n{}", V3_BODY),
		&AssembleOptions::default().with_release(222),
	);
	assert_eq!(word_at(&story, 2), 222);
}

#[test]
fn release_option_overrides_releaseid_in_v5() {
	let source = "
	.NEW 5

	RELEASEID=111

	; 64 bytes for header
	.WORD 0,RELEASEID,0,0,0,0,0,0,0,0,0,0,0,0,0,0
	.WORD 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0

	.END
";
	let story = assemble(source, &AssembleOptions::default().with_release(222));
	assert_eq!(story[0], 5);
	assert_eq!(word_at(&story, 2), 222);

	let story = assemble(source, &AssembleOptions::default());
	assert_eq!(word_at(&story, 2), 111);
}

#[test]
fn header_fields_come_from_symbols() {
	let options = AssembleOptions {
		serial: Some("240101".into()),
		creator: "TEST".into(),
		..Default::default()
	};
	let story = assemble(V3_BODY, &options);

	assert_eq!(story[0], 3);
	// every table label sits right after the header
	for offset in [4, 8, 10, 12, 14, 0x18] {
		assert_eq!(word_at(&story, offset), 64, "offset {:#x}", offset);
	}
	// START follows the routine's local count byte
	assert_eq!(word_at(&story, 6), 65);
	assert_eq!(&story[0x12..0x18], b"240101");
	assert_eq!(&story[0x3C..0x40], b"TEST");
	assert_eq!(word_at(&story, 0x1A) as usize * 2, story.len());

	let sum = story[64..].iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
	assert_eq!(word_at(&story, 0x1C), sum);
}

#[test]
fn missing_header_symbols_fail() {
	let provider = MemorySourceProvider::new().with_file("test.zap", "\t.FUNCT GO\n\tQUIT\n");
	let err = assemble_module(&provider, "test.zap", &AssembleOptions::default(), None).unwrap_err();
	assert!(err.has(|e| matches!(e, zapf::AsmError::UndefinedSymbol(name) if name == "START")));
}
