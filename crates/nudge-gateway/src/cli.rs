use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "nudge", version, about = "Nudge — reminder delivery gateway")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to nudge.toml (default: ./nudge.toml).
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the gateway: dispatch loop, escalation loop, HTTP API.
    Start,
    /// Validate the configuration and environment without starting.
    Check {
        /// Output format: human (default) or json
        #[arg(long, default_value = "human")]
        format: String,
    },
    Version,
}
