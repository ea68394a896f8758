//! The state machine owning one child process's lifecycle.

use std::{
	collections::HashMap,
	env, fs,
	path::PathBuf,
	time::{Duration, Instant},
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::{
	child::{self, ChildEvent},
	command::{ChildCommand, Shell},
	errors::SupervisorError,
	events::{ChildState, EventSink, LogLevel},
	logsink::{sanitize_identifier, LogSink},
	options::Options,
};

/// The log directory used when none is configured: `lunch` under the system
/// temporary directory.
#[must_use]
pub fn default_log_dir() -> PathBuf {
	env::temp_dir().join("lunch")
}

/// First-line heuristic for "the shell could not find the executable".
///
/// This inspects shell error wording and is inherently fragile (shell- and
/// locale-dependent); it lives here as the single replaceable predicate.
/// Checking the shell's 127 exit convention instead would only touch this
/// function and the ended-event classification.
#[must_use]
pub fn looks_like_not_found(line: &str) -> bool {
	line.contains("not found") || line.contains("No such file or directory")
}

/// Supervises one child process: owns the lifecycle state machine, the
/// command and environment to run, the log sink, and the
/// graceful-then-forceful termination escalation.
///
/// All mutation happens on the session loop, so no locking. OS-level
/// failures (spawn, signal delivery) are reported but never change state by
/// themselves; the only authoritative transitions are the OS-confirmed
/// events fed back through [`handle_child_event`](Self::handle_child_event).
#[derive(Debug)]
pub struct Supervisor<S> {
	identifier: String,
	command: String,
	env: HashMap<String, String>,
	log_dir: PathBuf,
	options: Options,

	state: ChildState,
	pid: Option<u32>,
	started_at: Option<Instant>,
	last_running_time: Option<Duration>,
	lines_seen: u64,
	escalation_deadline: Option<tokio::time::Instant>,
	log: Option<LogSink>,

	events: UnboundedSender<ChildEvent>,
	sink: S,
}

impl<S: EventSink> Supervisor<S> {
	/// Constructs a stopped supervisor bound to `sink`, plus the receiving
	/// end of its child-event channel, which the session loop must drain
	/// into [`handle_child_event`](Self::handle_child_event).
	///
	/// The identifier (default `"default"`) namespaces the log file; unsafe
	/// path characters in it are replaced.
	pub fn new(identifier: Option<&str>, sink: S) -> (Self, UnboundedReceiver<ChildEvent>) {
		let (events, receiver) = mpsc::unbounded_channel();
		(
			Self {
				identifier: sanitize_identifier(identifier.unwrap_or("default")),
				command: String::new(),
				env: HashMap::new(),
				log_dir: default_log_dir(),
				options: Options::default(),
				state: ChildState::Stopped,
				pid: None,
				started_at: None,
				last_running_time: None,
				lines_seen: 0,
				escalation_deadline: None,
				log: None,
				events,
				sink,
			},
			receiver,
		)
	}

	/// The current lifecycle state.
	#[must_use]
	pub fn state(&self) -> ChildState {
		self.state
	}

	/// The identifier namespacing this supervisor's log file.
	#[must_use]
	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	/// The configured command.
	#[must_use]
	pub fn command(&self) -> &str {
		&self.command
	}

	/// Current options.
	#[must_use]
	pub fn options(&self) -> &Options {
		&self.options
	}

	/// Mutable options. Changes take effect on the next start or stop.
	pub fn options_mut(&mut self) -> &mut Options {
		&mut self.options
	}

	/// The pid of the active child, while one exists.
	#[must_use]
	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// When the escalation to a forced kill is due, while one is pending.
	#[must_use]
	pub fn escalation_deadline(&self) -> Option<tokio::time::Instant> {
		self.escalation_deadline
	}

	/// Sets the command to run on the next start. Accepted at any time;
	/// a running child is unaffected.
	pub fn set_command(&mut self, command: &str) {
		self.command = command.to_owned();
	}

	/// Merges entries into the child environment, new entries winning.
	pub fn merge_env(&mut self, entries: impl IntoIterator<Item = (String, String)>) {
		self.env.extend(entries);
	}

	/// Sets the log directory, creating it. Takes effect on the next start.
	pub fn set_log_dir(&mut self, path: PathBuf) -> std::io::Result<()> {
		fs::create_dir_all(&path)?;
		self.log_dir = path;
		Ok(())
	}

	/// Starts the child.
	///
	/// Rejected (state unchanged) while a child is active or the command is
	/// blank. Otherwise opens the log file, transitions to `Starting`, and
	/// spawns through the host shell. A spawn failure is reported and then
	/// resolved through a synthetic ended event, so `Starting` always exits
	/// by the same path as a real process end.
	pub fn start(&mut self) -> Result<(), SupervisorError> {
		match self.state {
			ChildState::Starting | ChildState::Running => {
				return Err(SupervisorError::AlreadyActive(self.state));
			}
			ChildState::Stopping => return Err(SupervisorError::StillStopping),
			ChildState::Stopped => {}
		}
		if self.command.trim().is_empty() {
			return Err(SupervisorError::NoCommand);
		}

		fs::create_dir_all(&self.log_dir).map_err(|err| SupervisorError::Io {
			about: "create log directory",
			err,
		})?;
		let log = LogSink::open(&self.log_dir, &self.identifier, self.options.clear_old_logs)
			.map_err(|err| SupervisorError::Io {
				about: "open log file",
				err,
			})?;
		let shell = Shell::resolve().ok_or(SupervisorError::NoShell)?;

		self.log = Some(log);
		self.lines_seen = 0;
		self.set_state(ChildState::Starting);
		self.report(LogLevel::Info, &format!("starting: {}", self.command));

		let spawnable = ChildCommand {
			shell,
			command: self.command.clone(),
			env: self.env.clone(),
		};
		self.started_at = Some(Instant::now());

		match spawnable.to_spawnable().spawn() {
			Ok(child) => {
				if let Some(pid) = child.id() {
					self.pid = Some(pid);
					self.sink.pid_assigned(pid);
				} else {
					self.report(LogLevel::Warning, "spawned child has no pid");
				}
				child::attach(child, self.events.clone());
				Ok(())
			}
			Err(err) => {
				self.report(LogLevel::Error, &format!("cannot spawn child: {err}"));
				// No process exists, so no OS ended-event will arrive;
				// synthesize one so Starting resolves through the one
				// authoritative path.
				let _ = self.events.send(ChildEvent::Ended(-1));
				Ok(())
			}
		}
	}

	/// Stops the child, escalating on repeat.
	///
	/// The first stop (from `Starting` or `Running`) sends the graceful
	/// interrupt and arms the escalation deadline for the configured grace
	/// period. A stop while already `Stopping` (manual, or the deadline
	/// firing) sends the forced kill and disarms the deadline; from there the
	/// ended event is the only path forward. Signal delivery failures are
	/// reported and change nothing.
	pub fn stop(&mut self) -> Result<(), SupervisorError> {
		match self.state {
			ChildState::Running | ChildState::Starting => {
				self.set_state(ChildState::Stopping);
				self.report(LogLevel::Info, "sending interrupt to child");
				self.send_signal(TermSignal::Interrupt);
				self.escalation_deadline =
					Some(tokio::time::Instant::now() + self.options.grace_period());
				Ok(())
			}
			ChildState::Stopping => {
				self.report(LogLevel::Warning, "stop escalated, killing child");
				self.escalation_deadline = None;
				self.send_signal(TermSignal::Kill);
				Ok(())
			}
			ChildState::Stopped => Err(SupervisorError::AlreadyStopped),
		}
	}

	/// Probes the child with a no-op signal. Meaningful only in `Running`;
	/// a probe failure reports an error and returns false but does not
	/// change state (the ended event owns that).
	pub fn is_alive(&mut self) -> bool {
		if self.state != ChildState::Running {
			return false;
		}
		let Some(pid) = self.pid else {
			return false;
		};
		match probe_pid(pid) {
			Ok(()) => true,
			Err(err) => {
				self.report(LogLevel::Error, &format!("liveness probe failed: {err}"));
				false
			}
		}
	}

	/// The OS confirmed the process is up: `Starting` becomes `Running`.
	/// Out of `Starting` this indicates a race; it is logged but the
	/// transition proceeds.
	pub fn on_connection_confirmed(&mut self) {
		if self.state != ChildState::Starting {
			self.report(
				LogLevel::Warning,
				&format!("connection confirmed while {}", self.state),
			);
		}
		self.set_state(ChildState::Running);
	}

	/// The process ended. Invoked exactly once per process lifetime; always
	/// leaves the supervisor `Stopped` with the log file closed, the pid
	/// cleared, and the escalation deadline disarmed.
	pub fn on_process_ended(&mut self, code: i64) {
		self.last_running_time = self.started_at.take().map(|at| at.elapsed());
		self.escalation_deadline = None;

		match self.state {
			ChildState::Stopping => {
				self.report(LogLevel::Info, &format!("child stopped, code {code}"));
			}
			ChildState::Starting => {
				self.report(LogLevel::Error, &format!("child failed to launch, code {code}"));
			}
			ChildState::Running if code == 0 => {
				self.report(LogLevel::Info, "child exited cleanly");
			}
			ChildState::Running => {
				self.report(LogLevel::Error, &format!("child exited with code {code}"));
			}
			ChildState::Stopped => {
				self.report(LogLevel::Warning, "process ended while already stopped");
			}
		}

		self.pid = None;
		self.sink.process_ended(code);
		self.set_state(ChildState::Stopped);
		self.log = None; // flushes and closes, exactly once
	}

	/// One output line arrived from the child: count it, append it to the
	/// log, and run the not-found heuristic on the very first line.
	pub fn on_line_observed(&mut self, text: &str) {
		self.lines_seen += 1;
		let first = self.lines_seen == 1;

		let append = self.log.as_mut().map(|log| log.append_line(text));
		if let Some(Err(err)) = append {
			self.report(LogLevel::Warning, &format!("cannot append to log: {err}"));
		}

		if first && looks_like_not_found(text) {
			self.report(LogLevel::Warning, "child command was not found by the shell");
			let command = self.command.clone();
			self.sink.command_not_found(&command);
		}
	}

	/// Routes one adapter event to the matching handler.
	pub fn handle_child_event(&mut self, event: ChildEvent) {
		match event {
			ChildEvent::Running => self.on_connection_confirmed(),
			ChildEvent::Line(text) => self.on_line_observed(&text),
			ChildEvent::Ended(code) => self.on_process_ended(code),
		}
	}

	/// Pushes buffered log lines out; the session loop calls this on the
	/// flush tick.
	pub fn flush_log(&mut self) {
		if let Some(log) = self.log.as_mut() {
			log.flush();
		}
	}

	fn set_state(&mut self, next: ChildState) {
		if self.state == next {
			self.report(LogLevel::Debug, &format!("already {next}"));
			return;
		}
		debug!(from = %self.state, to = %next, "state transition");
		self.state = next;
		let running_time = if next == ChildState::Stopped {
			self.last_running_time
		} else {
			None
		};
		self.sink.state_changed(next, running_time);
	}

	fn send_signal(&mut self, signal: TermSignal) {
		let Some(pid) = self.pid else {
			self.report(LogLevel::Warning, "no child pid to signal");
			return;
		};
		if let Err(err) = deliver_signal(pid, signal) {
			self.report(
				LogLevel::Error,
				&format!("cannot signal child {pid}: {err}"),
			);
		}
	}

	/// Mirrors a supervisor log message to tracing and to the event sink.
	fn report(&mut self, level: LogLevel, text: &str) {
		match level {
			LogLevel::Debug => debug!("{text}"),
			LogLevel::Info => info!("{text}"),
			LogLevel::Warning => warn!("{text}"),
			LogLevel::Error | LogLevel::Critical => error!("{text}"),
		}
		self.sink.log_line(level, text);
	}
}

#[derive(Clone, Copy, Debug)]
enum TermSignal {
	Interrupt,
	Kill,
}

#[cfg(unix)]
#[allow(clippy::cast_possible_wrap)]
fn deliver_signal(pid: u32, signal: TermSignal) -> Result<(), std::io::Error> {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;

	let signal = match signal {
		TermSignal::Interrupt => Signal::SIGINT,
		TermSignal::Kill => Signal::SIGKILL,
	};
	kill(Pid::from_raw(pid as i32), signal).map_err(std::io::Error::from)
}

#[cfg(unix)]
#[allow(clippy::cast_possible_wrap)]
fn probe_pid(pid: u32) -> Result<(), std::io::Error> {
	use nix::sys::signal::kill;
	use nix::unistd::Pid;

	kill(Pid::from_raw(pid as i32), None).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn deliver_signal(_pid: u32, _signal: TermSignal) -> Result<(), std::io::Error> {
	Err(std::io::Error::new(
		std::io::ErrorKind::Unsupported,
		"signals unsupported on this platform",
	))
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> Result<(), std::io::Error> {
	Err(std::io::Error::new(
		std::io::ErrorKind::Unsupported,
		"signals unsupported on this platform",
	))
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use tokio::time::timeout;

	use super::*;

	#[derive(Clone, Debug, PartialEq)]
	enum Seen {
		State(ChildState, Option<Duration>),
		Log(LogLevel, String),
		Pid(u32),
		Ended(i64),
		NotFound(String),
	}

	#[derive(Clone, Default)]
	struct Recorder(Arc<Mutex<Vec<Seen>>>);

	impl Recorder {
		fn events(&self) -> Vec<Seen> {
			self.0.lock().unwrap().clone()
		}

		fn states(&self) -> Vec<ChildState> {
			self.events()
				.into_iter()
				.filter_map(|seen| match seen {
					Seen::State(state, _) => Some(state),
					_ => None,
				})
				.collect()
		}
	}

	impl EventSink for Recorder {
		fn state_changed(&mut self, state: ChildState, running_time: Option<Duration>) {
			self.0.lock().unwrap().push(Seen::State(state, running_time));
		}
		fn log_line(&mut self, level: LogLevel, text: &str) {
			self.0.lock().unwrap().push(Seen::Log(level, text.to_owned()));
		}
		fn pid_assigned(&mut self, pid: u32) {
			self.0.lock().unwrap().push(Seen::Pid(pid));
		}
		fn process_ended(&mut self, code: i64) {
			self.0.lock().unwrap().push(Seen::Ended(code));
		}
		fn command_not_found(&mut self, command: &str) {
			self.0.lock().unwrap().push(Seen::NotFound(command.to_owned()));
		}
	}

	fn supervisor(
		dir: &tempfile::TempDir,
	) -> (Supervisor<Recorder>, UnboundedReceiver<ChildEvent>, Recorder) {
		let recorder = Recorder::default();
		let (mut supervisor, events) = Supervisor::new(Some("test"), recorder.clone());
		supervisor.set_log_dir(dir.path().to_owned()).unwrap();
		(supervisor, events, recorder)
	}

	/// Feeds adapter events back until (and including) the ended event.
	async fn drain_until_ended(
		supervisor: &mut Supervisor<Recorder>,
		events: &mut UnboundedReceiver<ChildEvent>,
	) {
		loop {
			let event = timeout(Duration::from_secs(10), events.recv())
				.await
				.expect("timed out waiting for child events")
				.expect("child event channel closed");
			let ended = matches!(event, ChildEvent::Ended(_));
			supervisor.handle_child_event(event);
			if ended {
				break;
			}
		}
	}

	#[test]
	fn start_rejects_blank_command() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, _events, recorder) = supervisor(&dir);

		assert!(matches!(supervisor.start(), Err(SupervisorError::NoCommand)));
		supervisor.set_command("   ");
		assert!(matches!(supervisor.start(), Err(SupervisorError::NoCommand)));

		assert_eq!(supervisor.state(), ChildState::Stopped);
		assert!(recorder.states().is_empty());
	}

	#[test]
	fn stop_when_stopped_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, _events, _recorder) = supervisor(&dir);

		assert!(matches!(
			supervisor.stop(),
			Err(SupervisorError::AlreadyStopped)
		));
		assert_eq!(supervisor.state(), ChildState::Stopped);
	}

	#[tokio::test]
	async fn clean_run_reaches_stopped_with_retval() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, mut events, recorder) = supervisor(&dir);

		supervisor.set_command("echo hi");
		supervisor.start().unwrap();
		assert_eq!(supervisor.state(), ChildState::Starting);
		assert!(supervisor.pid().is_some());

		drain_until_ended(&mut supervisor, &mut events).await;

		assert_eq!(supervisor.state(), ChildState::Stopped);
		assert_eq!(supervisor.pid(), None);
		assert_eq!(
			recorder.states(),
			vec![ChildState::Starting, ChildState::Running, ChildState::Stopped]
		);
		assert!(recorder.events().contains(&Seen::Ended(0)));

		// the stopped transition carries the running time
		let stopped = recorder
			.events()
			.into_iter()
			.find_map(|seen| match seen {
				Seen::State(ChildState::Stopped, running_time) => Some(running_time),
				_ => None,
			})
			.unwrap();
		assert!(stopped.is_some());

		// the output landed in the log file
		let log = std::fs::read_to_string(crate::logsink::log_file_path(dir.path(), "test"))
			.unwrap();
		assert_eq!(log, "hi\n");
	}

	#[tokio::test]
	async fn start_while_active_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, mut events, _recorder) = supervisor(&dir);

		supervisor.set_command("sleep 5");
		supervisor.start().unwrap();
		assert!(matches!(
			supervisor.start(),
			Err(SupervisorError::AlreadyActive(ChildState::Starting))
		));

		let confirmed = events.recv().await.unwrap();
		assert_eq!(confirmed, ChildEvent::Running);
		supervisor.handle_child_event(confirmed);
		assert!(matches!(
			supervisor.start(),
			Err(SupervisorError::AlreadyActive(ChildState::Running))
		));
		assert!(supervisor.is_alive());

		supervisor.stop().unwrap();
		assert!(matches!(
			supervisor.start(),
			Err(SupervisorError::StillStopping)
		));

		drain_until_ended(&mut supervisor, &mut events).await;
		assert_eq!(supervisor.state(), ChildState::Stopped);
	}

	#[tokio::test]
	async fn interrupt_stops_a_cooperative_child() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, mut events, recorder) = supervisor(&dir);

		supervisor.set_command("sleep 5");
		supervisor.start().unwrap();
		let confirmed = events.recv().await.unwrap();
		supervisor.handle_child_event(confirmed);

		supervisor.stop().unwrap();
		assert_eq!(supervisor.state(), ChildState::Stopping);
		assert!(supervisor.escalation_deadline().is_some());

		drain_until_ended(&mut supervisor, &mut events).await;
		assert_eq!(supervisor.state(), ChildState::Stopped);
		assert!(supervisor.escalation_deadline().is_none());
		// sleep dies to SIGINT: effective code is the signal number
		assert!(recorder.events().contains(&Seen::Ended(2)));
	}

	#[tokio::test]
	async fn second_stop_escalates_to_kill_and_disarms_the_deadline() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, mut events, recorder) = supervisor(&dir);

		// a child that ignores the interrupt, so only the kill ends it
		let script = dir.path().join("stubborn.sh");
		std::fs::write(&script, "trap '' INT\nsleep 5\n").unwrap();
		supervisor.set_command(&format!("sh {}", script.display()));
		supervisor.options_mut().set("delay_kill", "60").unwrap();

		supervisor.start().unwrap();
		let confirmed = events.recv().await.unwrap();
		supervisor.handle_child_event(confirmed);

		supervisor.stop().unwrap();
		assert!(supervisor.escalation_deadline().is_some());

		// give the interrupt a moment to prove it is ignored
		tokio::time::sleep(Duration::from_millis(200)).await;

		supervisor.stop().unwrap();
		assert!(supervisor.escalation_deadline().is_none());

		drain_until_ended(&mut supervisor, &mut events).await;
		assert_eq!(supervisor.state(), ChildState::Stopped);
		assert!(recorder.events().contains(&Seen::Ended(9)));

		assert!(matches!(
			supervisor.stop(),
			Err(SupervisorError::AlreadyStopped)
		));
	}

	#[tokio::test]
	async fn not_found_fires_on_first_line_before_retval() {
		let dir = tempfile::tempdir().unwrap();
		let (mut supervisor, mut events, recorder) = supervisor(&dir);

		supervisor.set_command("doesnotexist123");
		supervisor.start().unwrap();
		drain_until_ended(&mut supervisor, &mut events).await;

		let seen = recorder.events();
		let not_found = seen
			.iter()
			.position(|event| matches!(event, Seen::NotFound(command) if command == "doesnotexist123"));
		let retval = seen
			.iter()
			.position(|event| matches!(event, Seen::Ended(_)));
		assert!(not_found.expect("no not_found event") < retval.expect("no retval event"));
	}

	#[test]
	fn not_found_heuristic_matches_shell_wording() {
		assert!(looks_like_not_found("sh: 1: doesnotexist123: not found"));
		assert!(looks_like_not_found(
			"bash: line 1: exec: doesnotexist123: not found"
		));
		assert!(looks_like_not_found(
			"sh: 0: cannot open nope: No such file or directory"
		));
		assert!(!looks_like_not_found("hello world"));
	}
}
