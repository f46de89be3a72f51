//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use zapf::{
	assemble_module,
	text::{EncodeMode, StringEncoder},
	AssembleOptions, MemorySourceProvider,
};

const SOURCE: &str = "
	.NEW 6

	; 64 bytes for header
	.WORD 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0
	.WORD 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0

	.VOCBEG 8,6

W?ZEBRA::
	.ZWORD \"zebra\"
	.WORD W?HORSE
W?HORSE::
	.ZWORD \"horse\"
	.WORD W?DONKEY
W?DONKEY::
	.ZWORD \"donkey\"
	.WORD W?ZEBRA
W?MULE::
	.ZWORD \"mule\"
	.WORD W?MULE

	.VOCEND
	.END
";

const FIRST_ENTRY: usize = 64;
const ENTRY_LENGTH: usize = 8;
const ZWORD_LENGTH: usize = 6;

fn word_at(story: &[u8], offset: usize) -> u16 {
	u16::from_be_bytes([story[offset], story[offset + 1]])
}

#[test]
fn pointers_between_words_follow_sorting() {
	let provider = MemorySourceProvider::new().with_file("vocab.zap", SOURCE);
	let asm = assemble_module(&provider, "vocab.zap", &AssembleOptions::default(), None).unwrap();
	let story = &asm.story;

	let donkey = FIRST_ENTRY;
	let horse = FIRST_ENTRY + ENTRY_LENGTH;
	let mule = FIRST_ENTRY + ENTRY_LENGTH * 2;
	let zebra = FIRST_ENTRY + ENTRY_LENGTH * 3;

	let mut encoder = StringEncoder::new();
	for (address, word) in [(donkey, "donkey"), (horse, "horse"), (mule, "mule"), (zebra, "zebra")] {
		let expected = encoder.encode(word, Some(9), EncodeMode::NoAbbreviations);
		assert_eq!(expected.len(), ZWORD_LENGTH);
		assert_eq!(&story[address..address + ZWORD_LENGTH], &expected[..], "{}", word);
	}

	assert_eq!(word_at(story, donkey + ZWORD_LENGTH) as usize, zebra);
	assert_eq!(word_at(story, horse + ZWORD_LENGTH) as usize, donkey);
	assert_eq!(word_at(story, mule + ZWORD_LENGTH) as usize, mule);
	assert_eq!(word_at(story, zebra + ZWORD_LENGTH) as usize, horse);

	// the labels follow their words too
	assert_eq!(asm.symbols.global("W?DONKEY").unwrap().value as usize, donkey);
	assert_eq!(asm.symbols.global("W?ZEBRA").unwrap().value as usize, zebra);
}

#[test]
fn unaligned_labels_are_rejected() {
	let source = "
	.NEW 5
	.VOCBEG 4,2
W?A::
	.ZWORD \"a\"
	.BYTE 0
W?B::
	.BYTE 0
	.VOCEND
";
	let provider = MemorySourceProvider::new().with_file("vocab.zap", source);
	let err = assemble_module(&provider, "vocab.zap", &AssembleOptions::default(), None).unwrap_err();
	assert!(err.has(|e| matches!(e, zapf::AsmError::UnalignedVocabLabel(name) if name == "W?B")));
}
