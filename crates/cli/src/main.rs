#![deny(rust_2018_idioms)]

use clap::Parser;
use lunch_supervisor::protocol::Session;
use miette::{IntoDiagnostic, Result};
use tokio::io::BufReader;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod args;

use args::Args;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
	let args = Args::parse();

	// stdout carries the protocol; diagnostics go to stderr
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new(match args.verbose {
			0 => "lunch_supervisor=warn,lunch_child=warn",
			1 => "lunch_supervisor=debug,lunch_child=debug",
			_ => "trace",
		})
	});
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.try_init()
		.ok();

	debug!(version = %env!("CARGO_PKG_VERSION"), ?args, "constructing supervisor session");

	let mut session = Session::new(
		args.id.as_deref(),
		BufReader::new(tokio::io::stdin()),
		tokio::io::stdout(),
	);
	if let Some(log_dir) = args.log_dir {
		session
			.supervisor_mut()
			.set_log_dir(log_dir)
			.into_diagnostic()?;
	}

	session.run().await.into_diagnostic()?;

	Ok(())
}
