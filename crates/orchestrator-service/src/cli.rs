//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(about = "Durable fan-out orchestration service", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
	#[command(subcommand)]
	pub command: Option<Command>,

	/// Path to configuration file
	#[arg(
		short,
		long,
		value_name = "FILE",
		default_value = "config/local.toml",
		global = true
	)]
	pub config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(long, env = "ORCHESTRATOR_LOG_LEVEL", default_value = "info", global = true)]
	pub log_level: String,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
	/// Start the orchestration service
	Start,
	/// Validate the configuration file
	Validate,
	/// Submit one instance in-process and wait for its outcome
	Demo {
		/// Number of events to fan out; defaults to engine.default_event_count
		#[arg(short, long)]
		events: Option<usize>,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let cli = Cli::try_parse_from(["orchestrator"]).unwrap();
		assert_eq!(cli.command, None);
		assert_eq!(cli.config, PathBuf::from("config/local.toml"));
	}

	#[test]
	fn test_demo_with_events() {
		let cli =
			Cli::try_parse_from(["orchestrator", "demo", "--events", "3", "--config", "x.toml"])
				.unwrap();
		assert_eq!(cli.command, Some(Command::Demo { events: Some(3) }));
		assert_eq!(cli.config, PathBuf::from("x.toml"));
	}

	#[test]
	fn test_unknown_command_rejected() {
		assert!(Cli::try_parse_from(["orchestrator", "launch"]).is_err());
	}
}
