//! Error types.

use miette::Diagnostic;
use thiserror::Error;

use crate::events::ChildState;

/// Rejections and failures of supervisor operations, reported to the
/// controller. None of these change the state machine: precondition
/// violations leave it untouched, and OS-level failures resolve only through
/// OS-confirmed events.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum SupervisorError {
	/// A start was requested while a child is already starting or running.
	#[error("already {0}")]
	AlreadyActive(ChildState),

	/// A start was requested while the previous child is still stopping.
	/// Back-pressure, not a hard error: the caller should re-issue later.
	#[error("currently stopping, retry later")]
	StillStopping,

	/// A stop was requested with no child.
	#[error("already stopped")]
	AlreadyStopped,

	/// A start was requested with no (or a blank) command configured.
	#[error("no command set")]
	NoCommand,

	/// No shell from the preference list exists on this host.
	#[error("no usable shell on this host")]
	NoShell,

	/// An environment error aborted the operation.
	#[error("io({about}): {err}")]
	Io {
		/// What the supervisor was doing.
		about: &'static str,
		/// The underlying I/O error.
		#[source]
		err: std::io::Error,
	},
}

/// Errors produced while parsing an inbound control line. Reported as
/// `error` events; never terminate the session.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
	/// The keyword names no known command.
	#[error("unknown command: {0}")]
	UnknownCommand(String),

	/// The command requires an argument that was not given.
	#[error("{command}: missing argument")]
	MissingArgument {
		/// Which command was malformed.
		command: &'static str,
	},

	/// An argument does not parse for this command.
	#[error("{command}: invalid argument: {argument}")]
	InvalidArgument {
		/// Which command was malformed.
		command: &'static str,
		/// The rejected argument.
		argument: String,
	},
}
