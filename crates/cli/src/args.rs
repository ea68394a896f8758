use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Supervise a single shell command, controlled over stdin/stdout.
///
/// Reads newline-terminated commands on stdin (`do`, `run`, `stop`, …) and
/// writes event lines on stdout (`state`, `child_pid`, `retval`, …); the
/// child's output is captured to a log file, not forwarded. Diagnostics go
/// to stderr so the protocol stream stays clean.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about)]
pub struct Args {
	/// Identifier for this supervisor, used to namespace the child's log
	/// file
	///
	/// Characters unsafe in file paths are replaced. Defaults to "default".
	#[arg(short, long)]
	pub id: Option<String>,

	/// Directory where the child's log file is written
	///
	/// Created if absent. Defaults to `lunch` under the system temporary
	/// directory; can also be changed per session with the `logdir` command.
	#[arg(short, long)]
	pub log_dir: Option<PathBuf>,

	/// Raise stderr diagnostic verbosity (repeatable)
	#[arg(short, long, action = ArgAction::Count)]
	pub verbose: u8,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_all_optional() {
		let args = Args::parse_from(["lunch-child"]);
		assert_eq!(args.id, None);
		assert_eq!(args.log_dir, None);
		assert_eq!(args.verbose, 0);
	}

	#[test]
	fn flags_parse() {
		let args = Args::parse_from([
			"lunch-child",
			"--id",
			"worker-1",
			"--log-dir",
			"/var/log/lunch",
			"-vv",
		]);
		assert_eq!(args.id.as_deref(), Some("worker-1"));
		assert_eq!(args.log_dir, Some(PathBuf::from("/var/log/lunch")));
		assert_eq!(args.verbose, 2);
	}
}
