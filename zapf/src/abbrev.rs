//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

//! Abbreviation discovery.
//!
//! Collects every string the game prints, then repeatedly picks the
//! candidate whose abbreviation would save the most Z-characters and blanks
//! out its occurrences before scoring the rest again.

use std::{collections::HashSet, fmt::Write};

use log::debug;

use crate::text::{EncodeMode, Horspool, StringEncoder, MAX_ABBREVIATIONS};

const WORD_DELIMITERS: &[char] = &[' ', '.', ',', ':', ';', '!', '?', '(', ')', '/'];

/// Separates strings in the accumulated text so no match spans two of them.
const SEPARATOR: char = '\0';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbbrevResult {
	/// Z-characters saved over the whole game.
	pub score: i32,
	pub count: usize,
	pub text: String,
}

#[derive(Debug, Default)]
pub struct AbbrevFinder {
	all_text: Vec<char>,
	/// Candidates in discovery order, with the Z-characters saved per use.
	words: Vec<(String, i32)>,
	seen: HashSet<String>,
	encoder: StringEncoder,
}

impl AbbrevFinder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_text(&mut self, text: &str) {
		self.all_text.extend(text.chars());
		self.all_text.push(SEPARATOR);

		for word in find_words(text) {
			if self.seen.insert(word.clone()) {
				let savings = self.encoder.count_zchars(&word, EncodeMode::NoAbbreviations) as i32 - 2;
				self.words.push((word, savings));
			}
		}
	}

	fn best(&self) -> Option<(usize, AbbrevResult)> {
		let mut best: Option<(usize, AbbrevResult)> = None;

		for (i, (word, savings)) in self.words.iter().enumerate() {
			if *savings <= 0 {
				continue;
			}
			let count = Horspool::new(word).count_in(&self.all_text);
			if count < 2 {
				continue;
			}
			let score = (count as i32 - 1) * savings - 2;
			if score <= 0 {
				continue;
			}
			if best.as_ref().map_or(true, |(_, b)| score > b.score) {
				best = Some((
					i,
					AbbrevResult {
						score,
						count,
						text: word.clone(),
					},
				));
			}
		}

		best
	}

	/// Picks up to `max` abbreviations, best first. Consumes the collected
	/// text.
	pub fn results(mut self, max: usize) -> Vec<AbbrevResult> {
		let mut results = Vec::new();

		while results.len() < max {
			let Some((idx, result)) = self.best() else {
				break;
			};

			let pattern = Horspool::new(&result.text);
			let mut start = 0;
			while let Some(pos) = pattern.find_in(&self.all_text, start) {
				self.all_text.drain(pos + 1..pos + pattern.len());
				self.all_text[pos] = SEPARATOR;
				start = pos + 1;
			}
			self.words.remove(idx);

			debug!("abbreviation {:?}: {} uses, saves {}", result.text, result.count, result.score);
			results.push(result);
		}

		results
	}
}

/// Words along with the delimiters next to them, as candidates.
fn find_words(text: &str) -> Vec<String> {
	let chars: Vec<char> = text.chars().collect();
	let mut out = Vec::new();
	let mut i = 0;

	while i < chars.len() {
		if chars[i] == ' ' {
			i += 1;
			continue;
		}

		let start = i;
		while i < chars.len() && !WORD_DELIMITERS.contains(&chars[i]) {
			i += 1;
		}
		if i == start {
			// a lone delimiter
			i += 1;
			continue;
		}
		let end = i;

		let word: String = chars[start..end].iter().collect();
		let prev = start.checked_sub(1).map(|p| chars[p]);
		let next = chars.get(end).copied();

		out.push(word.clone());
		if let Some(p) = prev {
			out.push(format!("{}{}", p, word));
		}
		if let (Some(p), Some(n)) = (prev, next) {
			out.push(format!("{}{}{}", p, word, n));
		}
		if let Some(n) = next {
			out.push(format!("{}{}", word, n));
		}
	}

	out
}

fn escape(text: &str) -> String {
	text.replace('"', "\"\"")
}

/// Renders results as a source file of `.FSTR` definitions followed by the
/// `WORDS` table, padded out with an empty abbreviation.
pub fn frequent_words_listing(source_name: &str, results: &[AbbrevResult]) -> String {
	let mut out = String::new();
	// writing to a String cannot fail
	let _ = writeln!(out, "        ; Frequent words file for {}", source_name);
	let _ = writeln!(out);

	for (i, r) in results.iter().enumerate() {
		let _ = writeln!(
			out,
			"        .FSTR FSTR?{},\"{}\"\t\t; {}x, saved {}",
			i + 1,
			escape(&r.text),
			r.count,
			r.score
		);
	}
	if results.len() < MAX_ABBREVIATIONS {
		let _ = writeln!(out, "        .FSTR FSTR?DUMMY,\"\"");
	}

	let _ = writeln!(out, "WORDS::");
	for i in 0..results.len() {
		let _ = writeln!(out, "        FSTR?{}", i + 1);
	}
	for _ in results.len()..MAX_ABBREVIATIONS {
		let _ = writeln!(out, "        FSTR?DUMMY");
	}

	let _ = writeln!(out);
	let _ = writeln!(out, "        .ENDI");
	out
}

/// Z-characters saved by all results together.
pub fn total_savings(results: &[AbbrevResult]) -> i32 {
	results.iter().map(|r| r.score).sum()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn words_with_neighbours() {
		assert_eq!(
			find_words("the cat."),
			vec!["the", "the ", "cat", " cat", " cat.", "cat."]
		);
	}

	#[test]
	fn picks_the_biggest_saving_first() {
		let mut finder = AbbrevFinder::new();
		for _ in 0..5 {
			finder.add_text("You can't go that way.");
		}
		finder.add_text("The lamp is on.");

		let results = finder.results(3);
		assert!(!results.is_empty());
		let first = &results[0];
		assert_eq!(first.count, 5);
		assert_eq!(first.text, " can't ");
		assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
	}

	#[test]
	fn picked_text_is_not_counted_again() {
		let mut finder = AbbrevFinder::new();
		finder.add_text("abcdefgh abcdefgh abcdefgh");
		let results = finder.results(10);
		// the bare word wins and leaves nothing for the longer candidates
		let total: usize = results.iter().map(|r| r.count).sum();
		assert!(total <= 4);
	}

	#[test]
	fn nothing_worth_abbreviating() {
		let mut finder = AbbrevFinder::new();
		finder.add_text("a b c");
		assert!(finder.results(MAX_ABBREVIATIONS).is_empty());
	}

	#[test]
	fn listing_shape() {
		let results = vec![AbbrevResult {
			score: 40,
			count: 9,
			text: "say \"hi\"".into(),
		}];
		let listing = frequent_words_listing("game.zap", &results);
		assert!(listing.contains(".FSTR FSTR?1,\"say \"\"hi\"\"\""));
		assert!(listing.contains(".FSTR FSTR?DUMMY,\"\""));
		assert_eq!(listing.matches("        FSTR?DUMMY\n").count(), MAX_ABBREVIATIONS - 1);
		assert!(listing.trim_end().ends_with(".ENDI"));
	}
}
