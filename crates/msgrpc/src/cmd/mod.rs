use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod call;
pub mod connect;
pub mod notify;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Act as a peer exposing the demo handlers.
    Serve(ServeArgs),
    /// Call a method on a peer and print the result.
    Call(CallArgs),
    /// Send a notification to a peer.
    Notify(NotifyArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Notify(args) => notify::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Listen on a Unix socket instead of serving stdin/stdout.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,
}

/// Where the peer lives: a listening socket, or a program we launch.
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Socket path of a listening peer.
    #[arg(long, value_name = "PATH", conflicts_with = "program", required_unless_present = "program")]
    pub socket: Option<PathBuf>,
    /// Program to launch with --embed.
    #[arg(long, value_name = "PATH")]
    pub program: Option<PathBuf>,
    /// Extra argument for the launched program (repeatable).
    #[arg(long = "program-arg", value_name = "ARG", allow_hyphen_values = true, requires = "program")]
    pub program_args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Method name.
    pub method: String,
    /// Arguments, each one JSON value.
    #[arg(value_name = "JSON_ARG", allow_negative_numbers = true)]
    pub args: Vec<String>,
    #[command(flatten)]
    pub target: TargetArgs,
    /// Maximum time to wait for the result (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Method name.
    pub method: String,
    /// Arguments, each one JSON value.
    #[arg(value_name = "JSON_ARG", allow_negative_numbers = true)]
    pub args: Vec<String>,
    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
