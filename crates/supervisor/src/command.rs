//! The child command: a raw shell string and the shell that runs it.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	process::Stdio,
};

use tokio::process::Command as TokioCommand;

/// Shells tried in order when resolving the host shell.
const SHELL_CANDIDATES: &[&str] = &["/bin/sh", "/bin/bash", "/usr/bin/sh", "/usr/bin/bash"];

/// How to call the shell used to run the child command.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shell {
	/// Path of the shell.
	pub prog: PathBuf,

	/// The option which precedes the program string, `-c` for every shell in
	/// the preference list.
	pub program_option: String,
}

impl Shell {
	/// Shorthand for shells using the `-c` convention.
	pub fn new(prog: impl Into<PathBuf>) -> Self {
		Self {
			prog: prog.into(),
			program_option: "-c".into(),
		}
	}

	/// The first shell from the host preference list that exists, or `None`
	/// on a host with none of them.
	#[must_use]
	pub fn resolve() -> Option<Self> {
		SHELL_CANDIDATES
			.iter()
			.find(|prog| Path::new(prog).exists())
			.map(Self::new)
	}
}

/// One shell command plus the environment it runs with.
///
/// The command is a single raw string, not an argument vector: it is handed
/// to the shell as-is, so metacharacters (pipes, globs, variable expansion)
/// in it are significant and intentional.
#[derive(Clone, Debug)]
pub struct ChildCommand {
	/// The shell to run the command through.
	pub shell: Shell,

	/// The raw shell string.
	pub command: String,

	/// Child-specific environment, merged over the supervisor's own process
	/// environment with these entries taking precedence.
	pub env: HashMap<String, String>,
}

impl ChildCommand {
	/// Builds the spawnable `<shell> -c "exec <command>"` invocation.
	///
	/// The `exec` prefix makes the shell replace itself with the command for
	/// the common case, so signals reach the program directly. Stdin is null,
	/// both output streams are piped to the adapter, and kill-on-drop is set
	/// as an orphan backstop should the supervisor itself die.
	#[must_use]
	pub fn to_spawnable(&self) -> TokioCommand {
		let mut command = TokioCommand::new(&self.shell.prog);
		command
			.arg(&self.shell.program_option)
			.arg(format!("exec {}", self.command))
			.envs(&self.env)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		command
	}
}
