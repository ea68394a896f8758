//! Child lifecycle states and the observer seam the supervisor reports through.

use std::{fmt, process::ExitStatus, time::Duration};

/// Lifecycle state of the supervised child.
///
/// `Stopped` is both the initial state and the terminal state of every cycle;
/// a new cycle re-enters through `Starting`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChildState {
	/// No child process exists.
	Stopped,
	/// A spawn has been issued but the OS has not yet confirmed the process.
	Starting,
	/// The process is confirmed alive.
	Running,
	/// A graceful termination has been requested and the process has not yet
	/// ended.
	Stopping,
}

impl ChildState {
	/// Whether a child cycle is in progress (i.e. a process handle exists).
	#[must_use]
	pub const fn is_active(self) -> bool {
		!matches!(self, Self::Stopped)
	}
}

impl fmt::Display for ChildState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Stopped => "STOPPED",
			Self::Starting => "STARTING",
			Self::Running => "RUNNING",
			Self::Stopping => "STOPPING",
		})
	}
}

/// Severity attached to supervisor log messages forwarded to observers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LogLevel {
	/// Detail useful when debugging the supervisor itself.
	Debug,
	/// Normal operational messages.
	Info,
	/// Something unexpected but recoverable.
	Warning,
	/// An operation failed.
	Error,
	/// The supervisor cannot continue.
	Critical,
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Debug => "DEBUG",
			Self::Info => "INFO",
			Self::Warning => "WARNING",
			Self::Error => "ERROR",
			Self::Critical => "CRITICAL",
		})
	}
}

/// The narrow capability through which a supervisor reports to its observer.
///
/// One sink is bound at construction, per supervisor instance. The control
/// protocol implements it by queueing outbound wire lines; tests implement it
/// with a recorder. Decoupling the state machine from any particular wire
/// format happens here.
pub trait EventSink {
	/// The supervisor transitioned into a different state. `running_time` is
	/// present only on the transition to [`ChildState::Stopped`] that follows
	/// a run.
	fn state_changed(&mut self, state: ChildState, running_time: Option<Duration>);

	/// A supervisor log message, mirrored to observers with its severity.
	fn log_line(&mut self, level: LogLevel, text: &str);

	/// The OS assigned a pid to a freshly spawned child.
	fn pid_assigned(&mut self, pid: u32);

	/// The child ended with this effective code.
	fn process_ended(&mut self, code: i64);

	/// The first output line matched the "executable not found" heuristic.
	fn command_not_found(&mut self, command: &str);
}

/// Resolves an [`ExitStatus`] to the single integer carried on the wire: the
/// numeric exit code if the process exited normally, otherwise the number of
/// the terminating signal.
#[cfg(unix)]
#[must_use]
pub fn end_code(status: ExitStatus) -> i64 {
	use std::os::unix::process::ExitStatusExt;

	status
		.code()
		.map_or_else(|| i64::from(status.signal().unwrap_or(0)), i64::from)
}

/// Resolves an [`ExitStatus`] to the single integer carried on the wire.
#[cfg(not(unix))]
#[must_use]
pub fn end_code(status: ExitStatus) -> i64 {
	status.code().map_or(0, i64::from)
}
