//! `pairctl` command handling.
//!
//! Provides subcommands for:
//! - Inspecting pairing state (`inspect main`, `inspect sub`)
//! - Administrative cleanup (`detach main`, `detach sub`)

mod sessions;

pub use sessions::{DetachCommand, InspectCommand, run_detach_command, run_inspect_command};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pairctl")]
#[command(about = "Inspect and clean up multi-device session pairing state")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the state of a main or sub session
    #[command(subcommand)]
    Inspect(InspectCommand),

    /// Remove a main or sub session
    #[command(subcommand)]
    Detach(DetachCommand),
}
