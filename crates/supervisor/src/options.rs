//! The supervisor's mutable knob set.

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Knobs consulted by the supervisor, settable over the control protocol.
///
/// Mutations are accepted at any time but are only consulted on the next
/// start (for `clear_old_logs`) or the next stop (for `delay_kill`).
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
	/// Delete the previous log file for this identifier before starting.
	pub clear_old_logs: bool,

	/// Grace period, in seconds, between the graceful termination signal and
	/// the forced kill. Non-negative; zero means the escalation fires on the
	/// next tick of the session loop.
	pub delay_kill: f64,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			clear_old_logs: false,
			delay_kill: 3.0,
		}
	}
}

impl Options {
	/// Sets one option from its protocol representation. Booleans accept `0`
	/// and `1`; `delay_kill` accepts a non-negative number of seconds that
	/// fits a [`Duration`].
	pub fn set(&mut self, key: &str, value: &str) -> Result<(), OptionsError> {
		match key {
			"clear_old_logs" => {
				self.clear_old_logs = parse_bool(value).ok_or_else(|| OptionsError::InvalidValue {
					key: "clear_old_logs",
					value: value.into(),
				})?;
			}
			"delay_kill" => {
				let seconds: f64 = value.parse().map_err(|_| OptionsError::InvalidValue {
					key: "delay_kill",
					value: value.into(),
				})?;
				// rejects negative, non-finite, and values Duration cannot hold
				if Duration::try_from_secs_f64(seconds).is_err() {
					return Err(OptionsError::InvalidValue {
						key: "delay_kill",
						value: value.into(),
					});
				}
				self.delay_kill = seconds;
			}
			_ => return Err(OptionsError::UnknownKey(key.into())),
		}
		Ok(())
	}

	/// The grace period as a [`Duration`]. A value written directly to the
	/// field that `Duration` cannot hold saturates rather than panicking.
	#[must_use]
	pub fn grace_period(&self) -> Duration {
		Duration::try_from_secs_f64(self.delay_kill).unwrap_or(Duration::MAX)
	}

	/// All options in a stable order, values in their protocol
	/// representation (booleans as `0`/`1`).
	#[must_use]
	pub fn pairs(&self) -> Vec<(&'static str, String)> {
		vec![
			(
				"clear_old_logs",
				if self.clear_old_logs { "1" } else { "0" }.into(),
			),
			("delay_kill", self.delay_kill.to_string()),
		]
	}
}

fn parse_bool(value: &str) -> Option<bool> {
	match value {
		"0" => Some(false),
		"1" => Some(true),
		_ => None,
	}
}

/// Rejections from [`Options::set`].
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum OptionsError {
	/// The key names no known option.
	#[error("unknown option: {0}")]
	UnknownKey(String),

	/// The value does not parse for this key.
	#[error("invalid value for {key}: {value}")]
	InvalidValue {
		/// Which option was being set.
		key: &'static str,
		/// The rejected value.
		value: String,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bools_round_trip_as_zero_one() {
		let mut options = Options::default();
		assert_eq!(options.pairs()[0], ("clear_old_logs", "0".into()));

		options.set("clear_old_logs", "1").unwrap();
		assert!(options.clear_old_logs);
		assert_eq!(options.pairs()[0], ("clear_old_logs", "1".into()));

		options.set("clear_old_logs", "0").unwrap();
		assert!(!options.clear_old_logs);
	}

	#[test]
	fn delay_kill_parses_seconds() {
		let mut options = Options::default();
		options.set("delay_kill", "2").unwrap();
		assert_eq!(options.delay_kill, 2.0);
		assert_eq!(options.grace_period(), Duration::from_secs(2));
		assert_eq!(options.pairs()[1], ("delay_kill", "2".into()));

		options.set("delay_kill", "0.5").unwrap();
		assert_eq!(options.grace_period(), Duration::from_millis(500));
	}

	#[test]
	fn bad_values_are_rejected_without_change() {
		let mut options = Options::default();
		assert!(matches!(
			options.set("clear_old_logs", "yes"),
			Err(OptionsError::InvalidValue { .. })
		));
		assert!(matches!(
			options.set("delay_kill", "-1"),
			Err(OptionsError::InvalidValue { .. })
		));
		assert!(matches!(
			options.set("delay_kill", "NaN"),
			Err(OptionsError::InvalidValue { .. })
		));
		assert!(matches!(
			options.set("bogus", "1"),
			Err(OptionsError::UnknownKey(_))
		));
		assert_eq!(options, Options::default());
	}

	#[test]
	fn delay_kill_beyond_duration_range_is_rejected() {
		let mut options = Options::default();
		assert!(matches!(
			options.set("delay_kill", "1e30"),
			Err(OptionsError::InvalidValue { .. })
		));
		assert!(matches!(
			options.set("delay_kill", "inf"),
			Err(OptionsError::InvalidValue { .. })
		));
		assert_eq!(options, Options::default());

		// a direct field write out of range saturates instead of panicking
		options.delay_kill = 1e30;
		assert_eq!(options.grace_period(), Duration::MAX);
	}
}
