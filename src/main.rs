//! # Encore - cmus scrobbler
//!
//! Tracks how much of each song was actually listened to, across the many
//! short-lived processes cmus spawns for status changes, and submits
//! qualifying plays to the configured listening-history services. Plays that
//! cannot be delivered right now wait in a durable offline queue.
//!
//! ## Usage
//!
//! ```bash
//! # in cmus
//! :set status_display_program=encore report
//!
//! # one-time service authorization
//! encore auth
//!
//! # inspect and push the offline queue
//! encore pending
//! encore flush
//! ```

use anyhow::Result;
use clap::{CommandFactory, Parser};
use log::debug;

use encore::config::{self, Config};
use encore::event::TrackEvent;
use encore::queue::DeliveryState;
use encore::{auth, cli, completion, db, queue, scrobbler};

/// Route the parsed command. Errors propagate as a non-zero exit with the
/// diagnostic on stderr, which cmus shows in the status line.
fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    match args.command {
        cli::Command::Report { tokens } => {
            let event = TrackEvent::from_status_args(&tokens)?;
            debug!("status event: {event:?}");
            let config = Config::load(&config_path)?;
            let mut conn = db::connect(&config.store_path(args.db_path)?)?;
            scrobbler::handle_event(&mut conn, &config, &event)?;
        }
        cli::Command::Auth => auth::authorize(&config_path)?,
        cli::Command::Flush => {
            let config = Config::load(&config_path)?;
            let mut conn = db::connect(&config.store_path(args.db_path)?)?;
            scrobbler::flush(&mut conn, &config)?;
        }
        cli::Command::Pending => {
            let config = Config::load(&config_path)?;
            let conn = db::connect(&config.store_path(args.db_path)?)?;
            print_pending(&conn)?;
        }
        cli::Command::Completion { shell } => {
            completion::print_completions(shell, &mut cli::Args::command());
        }
    }

    Ok(())
}

fn print_pending(conn: &rusqlite::Connection) -> Result<()> {
    let rows = queue::snapshot(conn)?;
    if rows.is_empty() {
        println!("No scrobbles queued.");
        return Ok(());
    }
    for (record, states) in rows {
        println!(
            "{} - {} [{}] {}s of {}s, started at {}",
            record.artist,
            record.title,
            record.album,
            record.played_secs,
            record.duration,
            record.started_at
        );
        if states.is_empty() {
            println!("    (no delivery attempts yet)");
        }
        for (service, state) in states {
            let note = match state {
                DeliveryState::Pending => "pending",
                DeliveryState::Delivered => "delivered",
                DeliveryState::Failed => "failed permanently",
            };
            println!("    {service}: {note}");
        }
    }
    Ok(())
}
