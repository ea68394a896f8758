//! The adapter between one spawned child's OS-level I/O and the supervisor.
//!
//! [`attach`] takes a freshly spawned child and translates everything the OS
//! reports about it into [`ChildEvent`]s on one channel, which the session
//! loop feeds back into the supervisor. The channel carries, in order: one
//! `Running` confirmation, zero or more `Line`s, and exactly one `Ended`.

use tokio::{
	io::{AsyncRead, AsyncReadExt},
	process::Child,
	sync::mpsc::UnboundedSender,
	task::JoinSet,
};
use tracing::{trace, warn};

use crate::events::end_code;

const READ_CHUNK: usize = 4096;

/// Events flowing from one child's I/O to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
	/// The OS confirmed the process is up and its pipes are connected.
	Running,

	/// One non-empty output line, stripped of its line ending. Lines from
	/// the two output streams interleave; each stream's own lines stay in
	/// order.
	Line(String),

	/// The process ended with this effective code (exit status if it exited,
	/// otherwise the terminating signal number). Sent exactly once, after
	/// both output streams have drained to EOF.
	Ended(i64),
}

/// Wires a spawned child into the event channel: confirms the connection,
/// forwards output lines, and reaps the exit status.
///
/// Tolerates a child that produces no output at all, output chunked without
/// regard for line boundaries, and the two pipes closing in either order.
pub fn attach(mut child: Child, events: UnboundedSender<ChildEvent>) {
	let stdout = child.stdout.take();
	let stderr = child.stderr.take();

	// Queued before the reader tasks exist, so it precedes every line.
	let _ = events.send(ChildEvent::Running);

	let mut readers = JoinSet::new();
	if let Some(stream) = stdout {
		readers.spawn(forward_lines(stream, events.clone()));
	}
	if let Some(stream) = stderr {
		readers.spawn(forward_lines(stream, events.clone()));
	}

	tokio::spawn(async move {
		let status = child.wait().await;

		// Drain both pipes to EOF first, so no line can arrive after the
		// ended event closes the log file.
		while readers.join_next().await.is_some() {}

		let code = match status {
			Ok(status) => end_code(status),
			Err(err) => {
				warn!(%err, "wait on child failed");
				-1
			}
		};
		trace!(code, "child ended");
		let _ = events.send(ChildEvent::Ended(code));
	});
}

/// Splits an arbitrarily-chunked byte stream on newlines and forwards each
/// non-empty line. Trailing bytes without a final newline are flushed as a
/// last line at EOF.
async fn forward_lines<R: AsyncRead + Unpin>(mut stream: R, events: UnboundedSender<ChildEvent>) {
	let mut chunk = [0_u8; READ_CHUNK];
	let mut pending = Vec::new();

	loop {
		match stream.read(&mut chunk).await {
			Ok(0) => break,
			Ok(n) => {
				pending.extend_from_slice(&chunk[..n]);
				while let Some(pos) = pending.iter().position(|byte| *byte == b'\n') {
					let line: Vec<u8> = pending.drain(..=pos).collect();
					emit_line(&line[..line.len() - 1], &events);
				}
			}
			Err(err) => {
				warn!(%err, "read from child failed");
				break;
			}
		}
	}

	emit_line(&pending, &events);
}

fn emit_line(bytes: &[u8], events: &UnboundedSender<ChildEvent>) {
	let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
	if bytes.is_empty() {
		return;
	}
	let text = String::from_utf8_lossy(bytes).into_owned();
	let _ = events.send(ChildEvent::Line(text));
}

#[cfg(test)]
mod tests {
	use tokio::{io::AsyncWriteExt, sync::mpsc};

	use super::*;

	async fn collect(input: &[&[u8]]) -> Vec<ChildEvent> {
		let (mut write, read) = tokio::io::duplex(64);
		let (tx, mut rx) = mpsc::unbounded_channel();

		let reader = tokio::spawn(forward_lines(read, tx));
		for chunk in input {
			write.write_all(chunk).await.unwrap();
		}
		drop(write);
		reader.await.unwrap();

		let mut seen = Vec::new();
		while let Ok(event) = rx.try_recv() {
			seen.push(event);
		}
		seen
	}

	fn lines(events: &[ChildEvent]) -> Vec<&str> {
		events
			.iter()
			.map(|event| match event {
				ChildEvent::Line(text) => text.as_str(),
				other => panic!("unexpected event: {other:?}"),
			})
			.collect()
	}

	#[tokio::test]
	async fn chunks_not_aligned_to_lines_reassemble() {
		let events = collect(&[b"hel", b"lo\nwor", b"ld\n"]).await;
		assert_eq!(lines(&events), vec!["hello", "world"]);
	}

	#[tokio::test]
	async fn empty_lines_are_dropped() {
		let events = collect(&[b"one\n\n\ntwo\n"]).await;
		assert_eq!(lines(&events), vec!["one", "two"]);
	}

	#[tokio::test]
	async fn trailing_unterminated_line_flushes_at_eof() {
		let events = collect(&[b"done\nno newline"]).await;
		assert_eq!(lines(&events), vec!["done", "no newline"]);
	}

	#[tokio::test]
	async fn carriage_returns_are_stripped() {
		let events = collect(&[b"dos\r\n"]).await;
		assert_eq!(lines(&events), vec!["dos"]);
	}

	#[tokio::test]
	async fn no_output_at_all_is_fine() {
		let events = collect(&[]).await;
		assert!(events.is_empty());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn attach_reports_running_lines_then_one_ended() {
		use std::collections::HashMap;

		use crate::command::{ChildCommand, Shell};

		let (tx, mut rx) = mpsc::unbounded_channel();
		let child = ChildCommand {
			shell: Shell::resolve().unwrap(),
			command: r#"sh -c 'echo out; echo err >&2'"#.into(),
			env: HashMap::new(),
		}
		.to_spawnable()
		.spawn()
		.unwrap();

		attach(child, tx);

		assert_eq!(rx.recv().await, Some(ChildEvent::Running));

		let mut seen_lines = Vec::new();
		loop {
			match rx.recv().await.expect("channel closed early") {
				ChildEvent::Line(text) => seen_lines.push(text),
				ChildEvent::Ended(code) => {
					assert_eq!(code, 0);
					break;
				}
				ChildEvent::Running => panic!("running reported twice"),
			}
		}
		seen_lines.sort();
		assert_eq!(seen_lines, vec!["err", "out"]);
		assert!(rx.recv().await.is_none());
	}
}
