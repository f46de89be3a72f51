//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::sync::Arc;

use log::debug;
use pest::{
	error::LineColLocation,
	iterators::{Pair, Pairs},
	Parser,
};
use pest_derive::Parser;

use crate::{
	ast::{AsmExpr, AsmLine, Branch, DirectiveKind, Instruction, LineKind},
	error::{AsmError, Located, SourceLocation},
	opcodes::{is_opcode_name, NameStyle},
	source::SourceProvider,
};

#[derive(Parser)]
#[grammar = "zap.pest"]
struct ZapParser;

/// Nested `.INSERT`s deeper than this are assumed to be recursive.
const MAX_INSERT_DEPTH: usize = 32;

type ParseResult<T> = Result<T, Located<AsmError>>;

fn malformed(location: &SourceLocation) -> Located<AsmError> {
	Located::new(
		Some(location.clone()),
		AsmError::Syntax("malformed line".to_owned()),
	)
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, location: &SourceLocation) -> ParseResult<Pair<'i, Rule>> {
	pairs.next().ok_or_else(|| malformed(location))
}

struct LineBuilder<'a> {
	file: &'a Arc<str>,
	style: NameStyle,
}

impl<'a> LineBuilder<'a> {
	fn location(&self, pair: &Pair<Rule>) -> SourceLocation {
		SourceLocation {
			file: self.file.clone(),
			line: pair.as_span().start_pos().line_col().0,
		}
	}

	fn syntax(&self, pair: &Pair<Rule>, message: impl Into<String>) -> Located<AsmError> {
		Located::new(Some(self.location(pair)), AsmError::Syntax(message.into()))
	}

	fn expr(&self, pair: Pair<Rule>) -> ParseResult<AsmExpr> {
		let location = self.location(&pair);

		match pair.as_rule() {
			Rule::expr => {
				let mut terms = pair.into_inner();
				let first = self.expr(next_pair(&mut terms, &location)?)?;
				terms.try_fold(first, |acc, term| {
					Ok(AsmExpr::Plus(Box::new(acc), Box::new(self.expr(term)?)))
				})
			},
			Rule::quote => {
				let inner = next_pair(&mut pair.into_inner(), &location)?;
				Ok(AsmExpr::Quote(Box::new(self.expr(inner)?)))
			},
			Rule::string => Ok(AsmExpr::String(unescape(pair.into_inner().as_str()))),
			Rule::atom => self.atom(pair),
			Rule::assign => {
				let mut inner = pair.into_inner();
				let target = next_pair(&mut inner, &location)?;
				let name = match target.as_rule() {
					Rule::string => unescape(target.into_inner().as_str()),
					_ => target.as_str().to_owned(),
				};
				let value = self.expr(next_pair(&mut inner, &location)?)?;
				Ok(AsmExpr::Assign(name, Box::new(value)))
			},
			_ => Err(malformed(&location)),
		}
	}

	fn atom(&self, pair: Pair<Rule>) -> ParseResult<AsmExpr> {
		let text = pair.as_str();
		if !is_number(text) {
			return Ok(AsmExpr::Symbol(text.to_owned()));
		}

		text.parse::<i32>()
			.map(AsmExpr::Number)
			.map_err(|_| self.syntax(&pair, format!("number out of range: {}", text)))
	}

	fn operation(&self, pair: Pair<Rule>) -> ParseResult<LineKind> {
		let location = self.location(&pair);
		let mut inner = pair.into_inner();
		let head = self.expr(next_pair(&mut inner, &location)?)?;

		let mut head_comma = false;
		let mut args = Vec::new();
		let mut store_target = None;
		let mut branch = None;

		for p in inner {
			match p.as_rule() {
				Rule::head_comma => head_comma = true,
				Rule::store => {
					if store_target.is_some() {
						return Err(self.syntax(&p, "multiple store targets"));
					}
					store_target = Some(p.into_inner().as_str().to_owned());
				},
				Rule::branch_true | Rule::branch_false => {
					if branch.is_some() {
						return Err(self.syntax(&p, "multiple branch targets"));
					}
					branch = Some(Branch {
						polarity: p.as_rule() == Rule::branch_true,
						target: p.into_inner().as_str().to_owned(),
					});
				},
				_ => args.push(self.expr(p)?),
			}
		}

		let has_targets = store_target.is_some() || branch.is_some();
		let located = |error| Located::new(Some(location.clone()), error);

		if let AsmExpr::Symbol(name) = &head {
			if let Some(kind) = DirectiveKind::from_name(name) {
				if has_targets || head_comma {
					return Err(located(AsmError::Syntax(format!(
						"unexpected token after {}",
						name
					))));
				}
				return Ok(LineKind::Directive { kind, args });
			}

			if is_opcode_name(name, self.style) {
				if head_comma {
					return Err(located(AsmError::Syntax(format!(
						"unexpected ',' after {}",
						name
					))));
				}
				return Ok(LineKind::Instruction(Instruction {
					name: name.clone(),
					operands: args,
					store_target,
					branch,
				}));
			}

			if has_targets || !(args.is_empty() || head_comma) {
				return Err(located(AsmError::UnknownOpcode(name.clone())));
			}
		} else if has_targets || !(args.is_empty() || head_comma) {
			return Err(located(AsmError::Syntax(format!(
				"unexpected operands after {}",
				head
			))));
		}

		args.insert(0, head);
		Ok(LineKind::Data(args))
	}

	fn line(&self, pair: Pair<Rule>, out: &mut Vec<AsmLine>) -> ParseResult<()> {
		for p in pair.into_inner() {
			let location = self.location(&p);
			let kind = match p.as_rule() {
				Rule::global_label | Rule::local_label => LineKind::Label {
					global: p.as_rule() == Rule::global_label,
					name: p.into_inner().as_str().to_owned(),
				},
				Rule::equate => {
					let mut inner = p.into_inner();
					let name = next_pair(&mut inner, &location)?.as_str().to_owned();
					let value = self.expr(next_pair(&mut inner, &location)?)?;
					// a trailing type flag is accepted and ignored
					LineKind::Equate { name, value }
				},
				Rule::operation => self.operation(p)?,
				_ => return Err(malformed(&location)),
			};

			out.push(AsmLine { location, kind });
		}

		Ok(())
	}
}

fn is_number(text: &str) -> bool {
	let digits = text.strip_prefix('-').unwrap_or(text);
	!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn unescape(body: &str) -> String {
	body.replace("\"\"", "\"").replace('\r', "")
}

/// Parses one file of ZAP source.
pub fn parse_source(text: &str, file: &str, style: NameStyle) -> ParseResult<Vec<AsmLine>> {
	let file: Arc<str> = Arc::from(file);

	let mut pairs = ZapParser::parse(Rule::file, text).map_err(|err| {
		let line = match err.line_col {
			LineColLocation::Pos((line, _)) | LineColLocation::Span((line, _), _) => line,
		};
		Located::new(
			Some(SourceLocation {
				file: file.clone(),
				line,
			}),
			AsmError::Syntax(err.variant.message().into_owned()),
		)
	})?;

	let builder = LineBuilder { file: &file, style };
	let mut out = Vec::new();

	let root = pairs.next().ok_or_else(|| {
		Located::new(None, AsmError::Syntax("empty parse".to_owned()))
	})?;
	for pair in root.into_inner() {
		if pair.as_rule() == Rule::line {
			builder.line(pair, &mut out)?;
		}
	}

	debug!("parsed {} line(s) from {}", out.len(), file);
	Ok(out)
}

fn is_directive(line: &AsmLine, kind: DirectiveKind) -> bool {
	matches!(&line.kind, LineKind::Directive { kind: k, .. } if *k == kind)
}

/// Reads a module and every file it inserts into one stream of lines.
/// Inserted files run up to their `.ENDI` or `.END`.
pub fn load_module(
	provider: &dyn SourceProvider,
	name: &str,
	style: NameStyle,
) -> ParseResult<Vec<AsmLine>> {
	let mut out = Vec::new();
	load_into(provider, name, style, 0, &mut out)?;
	Ok(out)
}

fn load_into(
	provider: &dyn SourceProvider,
	name: &str,
	style: NameStyle,
	depth: usize,
	out: &mut Vec<AsmLine>,
) -> ParseResult<()> {
	let text = provider.read_source(name).map_err(|source| {
		Located::unlocated(AsmError::Source {
			name: name.to_owned(),
			source,
		})
	})?;

	for line in parse_source(&text, name, style)? {
		if depth > 0 && (is_directive(&line, DirectiveKind::Endi) || is_directive(&line, DirectiveKind::End)) {
			break;
		}

		let LineKind::Directive { kind: DirectiveKind::Insert, args } = &line.kind else {
			out.push(line);
			continue;
		};

		let located = |error| Located::new(Some(line.location.clone()), error);

		let target = match args.as_slice() {
			[AsmExpr::String(target)] | [AsmExpr::Symbol(target)] => target,
			_ => {
				return Err(located(AsmError::BadDirective {
					directive: ".INSERT",
					message: "expected a file name".to_owned(),
				}))
			},
		};
		if depth >= MAX_INSERT_DEPTH {
			return Err(located(AsmError::BadDirective {
				directive: ".INSERT",
				message: format!("inserts nested too deeply at {}", target),
			}));
		}

		let found = provider
			.find_inserted(target)
			.ok_or_else(|| located(AsmError::InsertNotFound(target.clone())))?;
		debug!("inserting {}", found);
		load_into(provider, &found, style, depth + 1, out)?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::MemorySourceProvider;

	fn parse(text: &str) -> Vec<LineKind> {
		parse_source(text, "test.zap", NameStyle::Classic)
			.unwrap()
			.into_iter()
			.map(|line| line.kind)
			.collect()
	}

	fn sym(name: &str) -> AsmExpr {
		AsmExpr::Symbol(name.to_owned())
	}

	#[test]
	fn labels_and_instructions() {
		let lines = parse("START::\t.FUNCT GO,X=5,Y\n?L1:\tADD X,1 >Y ; comment\n\tEQUAL? X,Y \\FALSE\n");
		assert_eq!(
			lines,
			vec![
				LineKind::Label {
					name: "START".into(),
					global: true
				},
				LineKind::Directive {
					kind: DirectiveKind::Funct,
					args: vec![
						sym("GO"),
						AsmExpr::Assign("X".into(), Box::new(AsmExpr::Number(5))),
						sym("Y"),
					],
				},
				LineKind::Label {
					name: "?L1".into(),
					global: false
				},
				LineKind::Instruction(
					Instruction::new("ADD")
						.with_operands(vec![sym("X"), AsmExpr::Number(1)])
						.with_store_target("Y")
				),
				LineKind::Instruction(
					Instruction::new("EQUAL?")
						.with_operands(vec![sym("X"), sym("Y")])
						.with_branch("FALSE", false)
				),
			]
		);
	}

	#[test]
	fn expressions() {
		let lines = parse("FOO=BAR+2\n\t'X,-7,\"say \"\"hi\"\"\"\n");
		assert_eq!(
			lines,
			vec![
				LineKind::Equate {
					name: "FOO".into(),
					value: AsmExpr::Plus(Box::new(sym("BAR")), Box::new(AsmExpr::Number(2))),
				},
				LineKind::Data(vec![
					AsmExpr::Quote(Box::new(sym("X"))),
					AsmExpr::Number(-7),
					AsmExpr::String("say \"hi\"".into()),
				]),
			]
		);
	}

	#[test]
	fn bare_symbols_and_opcodes() {
		assert_eq!(parse("RTRUE"), vec![LineKind::Instruction(Instruction::new("RTRUE"))]);
		assert_eq!(parse("FOO"), vec![LineKind::Data(vec![sym("FOO")])]);
		assert_eq!(parse("FOO,BAR"), vec![LineKind::Data(vec![sym("FOO"), sym("BAR")])]);

		let err = parse_source("FROB X,Y", "t.zap", NameStyle::Classic).unwrap_err();
		assert!(matches!(err.error, AsmError::UnknownOpcode(ref name) if name == "FROB"));
		assert_eq!(err.location.map(|l| l.line), Some(1));
	}

	#[test]
	fn inform_names() {
		let lines = parse_source("print \"hi\"", "t.zap", NameStyle::Inform).unwrap();
		assert!(matches!(&lines[0].kind, LineKind::Instruction(i) if i.name == "print"));
	}

	#[test]
	fn multi_line_strings_keep_line_numbers() {
		let lines = parse_source(".STR \"one\ntwo\"\n\tCRLF\n", "t.zap", NameStyle::Classic).unwrap();
		assert_eq!(lines.len(), 2);
		assert_eq!(
			lines[0].kind,
			LineKind::Directive {
				kind: DirectiveKind::Str,
				args: vec![AsmExpr::String("one\ntwo".into())]
			}
		);
		assert_eq!(lines[1].location.line, 3);
	}

	#[test]
	fn syntax_errors_are_located() {
		let err = parse_source("\tADD X Y\n", "bad.zap", NameStyle::Classic).unwrap_err();
		assert!(matches!(err.error, AsmError::Syntax(_)));
		let loc = err.location.unwrap();
		assert_eq!((&*loc.file, loc.line), ("bad.zap", 1));
	}

	#[test]
	fn inserts_are_spliced() {
		let sources = MemorySourceProvider::new()
			.with_file("main.zap", "A::\n.INSERT \"part\"\nC::\n.END\n")
			.with_file("part.zap", "B::\n.ENDI\nIGNORED::\n");

		let names: Vec<_> = load_module(&sources, "main.zap", NameStyle::Classic)
			.unwrap()
			.into_iter()
			.filter_map(|line| match line.kind {
				LineKind::Label { name, .. } => Some(name),
				_ => None,
			})
			.collect();
		assert_eq!(names, vec!["A", "B", "C"]);
	}

	#[test]
	fn missing_and_recursive_inserts() {
		let sources = MemorySourceProvider::new().with_file("main.zap", ".INSERT \"nope\"\n");
		let err = load_module(&sources, "main.zap", NameStyle::Classic).unwrap_err();
		assert!(matches!(err.error, AsmError::InsertNotFound(_)));

		let sources = MemorySourceProvider::new().with_file("loop.zap", ".INSERT \"loop\"\n");
		let err = load_module(&sources, "loop.zap", NameStyle::Classic).unwrap_err();
		assert!(matches!(err.error, AsmError::BadDirective { .. }));
	}
}
