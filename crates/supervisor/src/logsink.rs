//! The append-only log file owned for one child cycle.

use std::{
	fs::{self, File, OpenOptions},
	io::{self, BufWriter, Write},
	path::{Path, PathBuf},
	time::Duration,
};

use tracing::{debug, warn};

/// Interval between timer-driven flushes of the log buffer. The session loop
/// owns the timer and calls [`LogSink::flush`] on each tick.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Replaces characters unsafe in file paths, so an identifier can never
/// escape the log directory or produce an invalid file name. An empty
/// identifier falls back to `default`.
#[must_use]
pub fn sanitize_identifier(identifier: &str) -> String {
	if identifier.is_empty() {
		return "default".to_owned();
	}
	identifier
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
				c
			} else {
				'_'
			}
		})
		.collect()
}

/// The log file path for an identifier within a log directory.
#[must_use]
pub fn log_file_path(dir: &Path, identifier: &str) -> PathBuf {
	dir.join(format!("lunch-child-{identifier}.log"))
}

/// Owns the log file for one child cycle: opened on start, written a line at
/// a time, flushed on a timer, closed exactly once after the process ends
/// (by dropping the sink).
#[derive(Debug)]
pub struct LogSink {
	path: PathBuf,
	writer: BufWriter<File>,
}

impl LogSink {
	/// Opens the log file for append with owner-only permissions, creating it
	/// if absent. When `clear` is set, a pre-existing file is deleted first;
	/// failure to delete is logged and non-fatal.
	pub fn open(dir: &Path, identifier: &str, clear: bool) -> io::Result<Self> {
		let path = log_file_path(dir, identifier);

		if clear {
			match fs::remove_file(&path) {
				Ok(()) => debug!(path = %path.display(), "cleared previous log file"),
				Err(err) if err.kind() == io::ErrorKind::NotFound => {}
				Err(err) => warn!(path = %path.display(), %err, "cannot clear previous log file"),
			}
		}

		let mut open = OpenOptions::new();
		open.append(true).create(true);
		#[cfg(unix)]
		{
			use std::os::unix::fs::OpenOptionsExt;
			open.mode(0o600);
		}

		let file = open.open(&path)?;
		debug!(path = %path.display(), "log file open");
		Ok(Self {
			path,
			writer: BufWriter::new(file),
		})
	}

	/// Where this sink writes.
	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Appends one line, adding the newline.
	pub fn append_line(&mut self, line: &str) -> io::Result<()> {
		self.writer.write_all(line.as_bytes())?;
		self.writer.write_all(b"\n")
	}

	/// Pushes buffered lines to the file. Failures are logged, not fatal.
	pub fn flush(&mut self) {
		if let Err(err) = self.writer.flush() {
			warn!(path = %self.path.display(), %err, "cannot flush log file");
		}
	}
}

impl Drop for LogSink {
	fn drop(&mut self) {
		self.flush();
	}
}
