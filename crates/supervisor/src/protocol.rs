//! The line-oriented control protocol bound to one supervisor.
//!
//! One command or one event per line, UTF-8, newline-terminated. The
//! [`Session`] owns the supervisor and runs the single event loop
//! multiplexing inbound control lines, child events, outbound replies, the
//! periodic log flush, the escalation deadline, and host termination
//! signals. Loss of the control channel ends the session after a
//! best-effort stop of the child.

use std::{fmt, path::PathBuf, time::Duration};

use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
	sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
	time::{interval, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

use crate::{
	child::ChildEvent,
	errors::{ProtocolError, SupervisorError},
	events::{ChildState, EventSink, LogLevel},
	logsink::FLUSH_INTERVAL,
	supervisor::Supervisor,
};

/// Every command with its one-line help text, in `help` listing order.
const COMMANDS: &[(&str, &str)] = &[
	("help", "help [cmd] - list commands, or show help for one command"),
	("do", "do <command> - set the shell command to run on the next start"),
	("env", "env <k=v> ... - merge entries into the child environment"),
	("logdir", "logdir <path> - set and create the log directory"),
	("opt", "opt <key> <value> - set one option (booleans take 0/1)"),
	("opts", "opts - list current options"),
	("run", "run - start the child"),
	("stop", "stop - stop the child, escalating on repeat"),
	("status", "status - report the current state"),
	("ping", "ping - liveness check"),
	("quit", "quit - stop the child if running and close the session"),
];

fn help_for(command: &str) -> Option<&'static str> {
	COMMANDS
		.iter()
		.find(|(name, _)| *name == command)
		.map(|(_, help)| *help)
}

/// One inbound control line, parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
	/// `help [cmd]`
	Help(Option<String>),
	/// `do <command>` — the raw shell string, untouched.
	Do(String),
	/// `env <k=v> ...`
	Env(Vec<(String, String)>),
	/// `logdir <path>`
	LogDir(PathBuf),
	/// `opt <key> <value>`
	Opt {
		/// Option name.
		key: String,
		/// Protocol representation of the value.
		value: String,
	},
	/// `opts`
	Opts,
	/// `run`
	Run,
	/// `stop`
	Stop,
	/// `status`
	Status,
	/// `ping`
	Ping,
	/// `quit`
	Quit,
}

impl Request {
	/// Parses one line into a keyword and its argument rest. Unknown
	/// keywords are errors, never fatal to the session.
	pub fn parse(line: &str) -> Result<Self, ProtocolError> {
		let line = line.trim();
		let (keyword, rest) = line
			.split_once(char::is_whitespace)
			.map_or((line, ""), |(keyword, rest)| (keyword, rest.trim()));

		match keyword {
			"help" => Ok(Self::Help((!rest.is_empty()).then(|| rest.to_owned()))),
			"do" => {
				if rest.is_empty() {
					Err(ProtocolError::MissingArgument { command: "do" })
				} else {
					Ok(Self::Do(rest.to_owned()))
				}
			}
			"env" => {
				if rest.is_empty() {
					return Err(ProtocolError::MissingArgument { command: "env" });
				}
				let mut entries = Vec::new();
				for word in rest.split_whitespace() {
					match word.split_once('=') {
						Some((key, value)) if !key.is_empty() => {
							entries.push((key.to_owned(), value.to_owned()));
						}
						_ => {
							return Err(ProtocolError::InvalidArgument {
								command: "env",
								argument: word.to_owned(),
							});
						}
					}
				}
				Ok(Self::Env(entries))
			}
			"logdir" => {
				if rest.is_empty() {
					Err(ProtocolError::MissingArgument { command: "logdir" })
				} else {
					Ok(Self::LogDir(PathBuf::from(rest)))
				}
			}
			"opt" => match rest.split_once(char::is_whitespace) {
				Some((key, value)) if !value.trim().is_empty() => Ok(Self::Opt {
					key: key.to_owned(),
					value: value.trim().to_owned(),
				}),
				_ => Err(ProtocolError::MissingArgument { command: "opt" }),
			},
			"opts" => Ok(Self::Opts),
			"run" => Ok(Self::Run),
			"stop" => Ok(Self::Stop),
			"status" => Ok(Self::Status),
			"ping" => Ok(Self::Ping),
			"quit" => Ok(Self::Quit),
			other => Err(ProtocolError::UnknownCommand(other.to_owned())),
		}
	}
}

/// One outbound event line.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
	/// Session initialized.
	Ready,
	/// Last request succeeded.
	Ok,
	/// Last request failed.
	Error(String),
	/// Informational reply.
	Msg(String),
	/// Supervisor log line with severity.
	Log(LogLevel, String),
	/// State transition; seconds of running time only on `STOPPED`.
	State(ChildState, Option<f64>),
	/// Reply to `status`.
	Status(ChildState),
	/// Emitted right after a successful spawn.
	ChildPid(u32),
	/// Exit or signal code after the process ended.
	Retval(i64),
	/// The not-found heuristic fired for this command string.
	NotFound(String),
	/// Reply to `ping`.
	Pong,
	/// Session closing.
	Bye,
}

impl fmt::Display for Reply {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Ready => f.write_str("ready"),
			Self::Ok => f.write_str("ok"),
			Self::Error(message) => write!(f, "error {message}"),
			Self::Msg(text) => write!(f, "msg {text}"),
			Self::Log(level, text) => write!(f, "log {level} {text}"),
			Self::State(state, None) => write!(f, "state {state}"),
			Self::State(state, Some(seconds)) => write!(f, "state {state} {seconds:.3}"),
			Self::Status(state) => write!(f, "status {state}"),
			Self::ChildPid(pid) => write!(f, "child_pid {pid}"),
			Self::Retval(code) => write!(f, "retval {code}"),
			Self::NotFound(command) => write!(f, "not_found {command}"),
			Self::Pong => f.write_str("pong"),
			Self::Bye => f.write_str("bye"),
		}
	}
}

/// Implements the supervisor's [`EventSink`] by queueing wire replies; the
/// session loop drains the queue onto the transport.
#[derive(Clone, Debug)]
pub struct ChannelSink(UnboundedSender<Reply>);

impl EventSink for ChannelSink {
	fn state_changed(&mut self, state: ChildState, running_time: Option<Duration>) {
		let _ = self
			.0
			.send(Reply::State(state, running_time.map(|d| d.as_secs_f64())));
	}

	fn log_line(&mut self, level: LogLevel, text: &str) {
		let _ = self.0.send(Reply::Log(level, text.to_owned()));
	}

	fn pid_assigned(&mut self, pid: u32) {
		let _ = self.0.send(Reply::ChildPid(pid));
	}

	fn process_ended(&mut self, code: i64) {
		let _ = self.0.send(Reply::Retval(code));
	}

	fn command_not_found(&mut self, command: &str) {
		let _ = self.0.send(Reply::NotFound(command.to_owned()));
	}
}

/// A control protocol session: one supervisor bound to one byte-stream pair.
///
/// Generic over the transport so the CLI can hand it stdio and tests can
/// hand it duplex pipes.
#[derive(Debug)]
pub struct Session<R, W> {
	supervisor: Supervisor<ChannelSink>,
	child_events: UnboundedReceiver<ChildEvent>,
	replies: UnboundedReceiver<Reply>,
	reader: R,
	writer: W,
}

impl<R, W> Session<R, W>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	/// Binds a fresh supervisor with this identifier to the transport.
	pub fn new(identifier: Option<&str>, reader: R, writer: W) -> Self {
		let (sender, replies) = mpsc::unbounded_channel();
		let (supervisor, child_events) = Supervisor::new(identifier, ChannelSink(sender));
		Self {
			supervisor,
			child_events,
			replies,
			reader,
			writer,
		}
	}

	/// The supervisor, for pre-session configuration (e.g. the log
	/// directory from command-line options).
	pub fn supervisor_mut(&mut self) -> &mut Supervisor<ChannelSink> {
		&mut self.supervisor
	}

	/// Runs the session until the control channel closes, `quit` arrives,
	/// or the host process is told to terminate. On every exit path a
	/// non-stopped child gets a best-effort stop.
	pub async fn run(self) -> std::io::Result<()> {
		let Self {
			mut supervisor,
			mut child_events,
			mut replies,
			mut reader,
			mut writer,
		} = self;

		send(&mut writer, &Reply::Ready).await?;

		let mut flush_tick = interval(FLUSH_INTERVAL);
		flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut host_signals = HostSignals::new()?;
		let mut line = String::new();

		loop {
			let deadline = supervisor.escalation_deadline();

			tokio::select! {
				biased;

				Some(reply) = replies.recv() => {
					send(&mut writer, &reply).await?;
				}

				Some(event) = child_events.recv() => {
					supervisor.handle_child_event(event);
				}

				() = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
					debug!("grace period elapsed, escalating stop");
					// a stop while already stopping sends the kill
					let _ = supervisor.stop();
				}

				_ = flush_tick.tick() => {
					supervisor.flush_log();
				}

				() = host_signals.recv() => {
					debug!("host termination signal, closing session");
					shutdown(&mut supervisor, &mut replies, &mut writer, false).await?;
					return Ok(());
				}

				read = reader.read_line(&mut line) => {
					if read? == 0 {
						debug!("control channel closed");
						shutdown(&mut supervisor, &mut replies, &mut writer, false).await?;
						return Ok(());
					}
					let text = line.trim().to_owned();
					line.clear();
					if !text.is_empty() && handle_line(&mut supervisor, &mut writer, &text).await? {
						shutdown(&mut supervisor, &mut replies, &mut writer, true).await?;
						return Ok(());
					}
				}
			}
		}
	}
}

/// Dispatches one inbound line; returns true when the session should close.
async fn handle_line<W: AsyncWrite + Unpin>(
	supervisor: &mut Supervisor<ChannelSink>,
	writer: &mut W,
	text: &str,
) -> std::io::Result<bool> {
	trace!(line = text, "control line");

	let request = match Request::parse(text) {
		Ok(request) => request,
		Err(err) => {
			send(writer, &Reply::Error(err.to_string())).await?;
			return Ok(false);
		}
	};

	match request {
		Request::Help(None) => {
			for (_, help) in COMMANDS {
				send(writer, &Reply::Msg((*help).to_owned())).await?;
			}
		}
		Request::Help(Some(command)) => match help_for(&command) {
			Some(help) => send(writer, &Reply::Msg(help.to_owned())).await?,
			None => {
				send(
					writer,
					&Reply::Error(format!("unknown command: {command}")),
				)
				.await?;
			}
		},
		Request::Do(command) => {
			supervisor.set_command(&command);
			send(writer, &Reply::Ok).await?;
		}
		Request::Env(entries) => {
			supervisor.merge_env(entries);
			send(writer, &Reply::Ok).await?;
		}
		Request::LogDir(path) => match supervisor.set_log_dir(path) {
			Ok(()) => send(writer, &Reply::Ok).await?,
			Err(err) => {
				send(
					writer,
					&Reply::Error(format!("cannot create log directory: {err}")),
				)
				.await?;
			}
		},
		Request::Opt { key, value } => match supervisor.options_mut().set(&key, &value) {
			Ok(()) => send(writer, &Reply::Ok).await?,
			Err(err) => send(writer, &Reply::Error(err.to_string())).await?,
		},
		Request::Opts => {
			let listing = supervisor
				.options()
				.pairs()
				.into_iter()
				.map(|(key, value)| format!("{key}={value}"))
				.collect::<Vec<_>>()
				.join(" ");
			send(writer, &Reply::Msg(listing)).await?;
		}
		Request::Run => {
			// success is reported through state/pid events, not a direct reply
			if let Err(err) = supervisor.start() {
				send(writer, &Reply::Error(err.to_string())).await?;
			}
		}
		Request::Stop => match supervisor.stop() {
			Ok(()) => {}
			Err(SupervisorError::AlreadyStopped) => {
				send(writer, &Reply::Msg("already stopped".to_owned())).await?;
			}
			Err(err) => send(writer, &Reply::Error(err.to_string())).await?,
		},
		Request::Status => send(writer, &Reply::Status(supervisor.state())).await?,
		Request::Ping => send(writer, &Reply::Pong).await?,
		Request::Quit => return Ok(true),
	}

	Ok(false)
}

/// Best-effort cleanup on every session exit path: stop a non-stopped child
/// (outcome not awaited), drain replies already queued, optionally say bye.
async fn shutdown<W: AsyncWrite + Unpin>(
	supervisor: &mut Supervisor<ChannelSink>,
	replies: &mut UnboundedReceiver<Reply>,
	writer: &mut W,
	bye: bool,
) -> std::io::Result<()> {
	if supervisor.state().is_active() {
		let _ = supervisor.stop();
	}
	while let Ok(reply) = replies.try_recv() {
		send(writer, &reply).await?;
	}
	if bye {
		send(writer, &Reply::Bye).await?;
	}
	supervisor.flush_log();
	Ok(())
}

/// Writes one event line, keeping the one-event-per-line framing.
async fn send<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) -> std::io::Result<()> {
	let mut rendered = reply.to_string();
	if rendered.contains('\n') {
		rendered = rendered.replace('\n', " ");
	}
	rendered.push('\n');
	writer.write_all(rendered.as_bytes()).await?;
	writer.flush().await
}

/// SIGTERM/SIGINT to the supervisor process itself, folded into the session
/// loop so the shutdown hook shares the control-channel-loss path.
struct HostSignals {
	#[cfg(unix)]
	terminate: tokio::signal::unix::Signal,
	#[cfg(unix)]
	interrupt: tokio::signal::unix::Signal,
}

impl HostSignals {
	fn new() -> std::io::Result<Self> {
		#[cfg(unix)]
		{
			use tokio::signal::unix::{signal, SignalKind};
			Ok(Self {
				terminate: signal(SignalKind::terminate())?,
				interrupt: signal(SignalKind::interrupt())?,
			})
		}
		#[cfg(not(unix))]
		Ok(Self {})
	}

	async fn recv(&mut self) {
		#[cfg(unix)]
		tokio::select! {
			_ = self.terminate.recv() => {}
			_ = self.interrupt.recv() => {}
		}
		#[cfg(not(unix))]
		std::future::pending::<()>().await;
	}
}
