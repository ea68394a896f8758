//! lunch's process supervisor.
//!
//! This crate implements a single-process supervisor: it launches one
//! externally-named shell command as a child process, captures its combined
//! output to a log file, and exposes a line-oriented control protocol over a
//! pair of byte streams so a parent controller (reached, e.g., over an
//! encrypted remote shell) can configure, start, monitor, and terminate the
//! child without direct process-table access.
//!
//! # Theory of Operation
//!
//! A [`Supervisor`](supervisor::Supervisor) owns the lifecycle state machine
//! of one child (`STOPPED → STARTING → RUNNING → STOPPING → STOPPED`), the
//! command and environment to run, and the per-cycle
//! [`LogSink`](logsink::LogSink). It reports everything observable through a
//! narrow [`EventSink`](events::EventSink) capability.
//!
//! The [`child`] adapter bridges one spawned process's OS-level I/O back to
//! the supervisor: it splits arbitrarily-chunked output into lines and
//! resolves the exit status, delivering everything over one ordered channel.
//!
//! A [`Session`](protocol::Session) binds a supervisor to a transport and
//! runs the single event loop: inbound control lines, child events, outbound
//! event lines, the periodic log flush, and the graceful-stop escalation
//! deadline are all multiplexed on one task, so supervisor state needs no
//! locking.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> std::io::Result<()> {
//! use lunch_supervisor::protocol::Session;
//! use tokio::io::BufReader;
//!
//! let session = Session::new(
//!     Some("worker-1"),
//!     BufReader::new(tokio::io::stdin()),
//!     tokio::io::stdout(),
//! );
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::unwrap_used, missing_docs, rustdoc::unescaped_backticks)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(rust_2018_idioms)]

pub mod child;
pub mod command;
pub mod errors;
pub mod events;
pub mod logsink;
pub mod options;
pub mod protocol;
pub mod supervisor;

pub use events::{ChildState, EventSink, LogLevel};
pub use options::Options;
pub use supervisor::Supervisor;
