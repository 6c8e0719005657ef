//! Command-line interface definitions.
//!
//! The `report` subcommand is the one cmus drives: set
//! `:set status_display_program=encore report` and cmus appends the status
//! as flat `key value` pairs on every player change. The rest are for the
//! user: `auth` to authorize services, `flush` and `pending` to manage the
//! offline queue, `completion` for shells.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Encore: offline-first scrobbler for cmus")]
#[command(version)]
pub struct Args {
    /// Path to the configuration file
    #[arg(long, env = "ENCORE_CONFIG", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the scrobble store, overriding the configured one
    #[arg(long, env = "ENCORE_DB", global = true, value_name = "FILE")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record one player status change (the cmus status_display_program entry)
    ///
    /// Updates the play session for the reported track, queues a scrobble if
    /// the previous session qualified, and attempts delivery of everything
    /// still queued. Exits non-zero only on an unrecoverable store error.
    Report {
        /// Flat `key value` pairs exactly as cmus passes them
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },

    /// Authorize configured services that have no session key yet
    Auth,

    /// Finalize the live session and push everything still queued
    ///
    /// Useful on player exit or before going offline for a while.
    Flush,

    /// Show queued scrobbles and their per-service delivery state
    Pending,

    /// Generate shell completions
    ///
    /// Usage: encore completion bash > ~/.local/share/bash-completion/completions/encore
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}
