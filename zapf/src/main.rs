//
// Copyright (C) 2023 Ariel Abreu
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//

use std::{
	ffi::OsString,
	fs,
	path::{Path, PathBuf},
	process::exit,
};

use clap::Parser as ClapParser;
use log::info;
use positioned_io::WriteAt;

use zapf::{
	abbrev::{frequent_words_listing, total_savings, AbbrevFinder},
	assemble_module,
	debug::BinaryDebugFileWriter,
	opcodes::NameStyle,
	AssembleOptions, DebugFileWriter, FsSourceProvider,
};

/// Assembles ZAP source into a Z-machine story file.
#[derive(ClapParser)]
#[command(author, version, about, long_about = None)]
struct Args {
	source: PathBuf,

	/// Defaults to the source name with a `.z#` extension for the final
	/// version.
	output: Option<PathBuf>,

	/// Release number, overriding RELEASEID
	#[arg(short, long)]
	release: Option<u16>,

	/// Six-character serial number (defaults to today's date)
	#[arg(short, long)]
	serial: Option<String>,

	/// Four-character creator ID
	#[arg(short, long, default_value = "ZAPF")]
	creator: String,

	/// Use Inform opcode names
	#[arg(short, long)]
	inform: bool,

	/// Print global label addresses
	#[arg(long)]
	list_labels: bool,

	/// Write a frequent words file for the strings in the source
	#[arg(long)]
	abbreviate: bool,

	#[arg(short, long)]
	quiet: bool,

	/// Write a debug file next to the story file
	#[arg(short, long)]
	debug: bool,

	/// Version assumed until the source says otherwise
	#[arg(short = 'z', long = "zversion", default_value_t = 3)]
	zversion: u8,

	#[arg(long)]
	verbose: bool,
}

fn freq_path(source: &Path) -> PathBuf {
	let mut name = source.file_stem().map(|s| s.to_owned()).unwrap_or_default();
	name.push("_freq.zap");
	source.with_file_name(name)
}

fn debug_path(output: &Path) -> PathBuf {
	let mut name = output.as_os_str().to_owned();
	name.push(".dbg");
	PathBuf::from(name)
}

fn main() {
	let cli = Args::parse();

	let level = if cli.verbose && !cli.quiet { "info" } else { "warn" };
	env_logger::init_from_env(env_logger::Env::default().default_filter_or(level));

	let options = AssembleOptions {
		version: cli.zversion,
		release: cli.release,
		serial: cli.serial.clone(),
		creator: cli.creator.clone(),
		name_style: if cli.inform {
			NameStyle::Inform
		} else {
			NameStyle::Classic
		},
		abbreviate: cli.abbreviate,
		list_labels: cli.list_labels,
		quiet: cli.quiet,
		..Default::default()
	};

	let base = cli
		.source
		.parent()
		.map(Path::to_path_buf)
		.unwrap_or_default();
	let source_name = cli
		.source
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_default();
	let provider = FsSourceProvider::new(base);

	let mut debug_writer = if cli.debug {
		match BinaryDebugFileWriter::new(Vec::new()) {
			Ok(writer) => Some(writer),
			Err(err) => {
				eprintln!("Failed to start debug file: {}", err);
				exit(1);
			},
		}
	} else {
		None
	};

	let result = assemble_module(
		&provider,
		&source_name,
		&options,
		debug_writer.as_mut().map(|w| w as &mut dyn DebugFileWriter),
	);
	let assembly = match result {
		Ok(assembly) => assembly,
		Err(failed) => {
			for warning in &failed.warnings {
				if !options.quiet {
					eprintln!("warning: {}", warning);
				}
			}
			for error in &failed.errors {
				eprintln!("error: {}", error);
			}
			eprintln!("{}", failed);
			exit(1);
		},
	};

	if !options.quiet {
		for warning in &assembly.warnings {
			eprintln!("warning: {}", warning);
		}
	}

	let output_path = cli.output.clone().unwrap_or_else(|| {
		cli.source
			.with_extension(OsString::from(format!("z{}", assembly.version)))
	});

	let mut output_file = match fs::File::create(&output_path) {
		Ok(file) => file,
		Err(err) => {
			eprintln!("Failed to open output file: {}", err);
			exit(1);
		},
	};
	if let Err(err) = output_file.write_all_at(0, &assembly.story) {
		eprintln!("Failed to write to output file: {}", err);
		exit(1);
	}
	info!(
		"wrote {} ({} bytes, version {}, {} passes)",
		output_path.display(),
		assembly.story.len(),
		assembly.version,
		assembly.passes
	);

	if let Some(writer) = debug_writer {
		let path = debug_path(&output_path);
		if let Err(err) = fs::write(&path, writer.into_inner()) {
			eprintln!("Failed to write debug file \"{}\": {}", path.display(), err);
			exit(1);
		}
	}

	if options.list_labels {
		print!("{}", assembly.label_listing());
	}

	if options.abbreviate {
		let mut finder = AbbrevFinder::new();
		for text in &assembly.strings {
			finder.add_text(text);
		}
		let results = finder.results(options.abbreviation_count);
		let path = freq_path(&cli.source);
		if let Err(err) = fs::write(&path, frequent_words_listing(&source_name, &results)) {
			eprintln!("Failed to write \"{}\": {}", path.display(), err);
			exit(1);
		}
		if !options.quiet {
			println!(
				"{} abbreviation(s) saving {} Z-characters written to {}",
				results.len(),
				total_savings(&results),
				path.display()
			);
		}
	}
}
