//! Shell completion generation.

use clap::Command;
use clap_complete::{generate, Shell};
use std::io;

/// Write the completion script for `shell` to stdout.
pub fn print_completions(shell: Shell, cmd: &mut Command) {
    let name = cmd.get_name().to_string();
    generate(shell, cmd, name, &mut io::stdout());
}
