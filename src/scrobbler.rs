//! Per-invocation orchestration.
//!
//! One process invocation handles exactly one player status change: advance
//! the stored session under the store lock, queue the finished play if it
//! qualifies, commit, and only then go near the network. The delivery
//! attempt is best-effort; anything it cannot deliver now is already durable
//! and will be retried by whichever invocation comes next.

use crate::config::Config;
use crate::db;
use crate::event::TrackEvent;
use crate::queue::{self, ScrobbleRecord};
use crate::session::{self, Advance};
use crate::submit;
use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::Connection;

/// Process one status event end to end.
pub fn handle_event(conn: &mut Connection, config: &Config, event: &TrackEvent) -> Result<()> {
    apply_status_event(conn, event)?;
    let services = submit::clients_from(config)?;
    submit::deliver_pending(conn, &services)?;
    submit::broadcast_now_playing(&services, event);
    Ok(())
}

/// The locked read-modify-write: advance the session by one observation and
/// enqueue the flushed play when it qualifies. Commits atomically; a crash
/// anywhere later (including mid-submission) cannot lose this accounting.
pub fn apply_status_event(conn: &mut Connection, event: &TrackEvent) -> Result<()> {
    let tx = db::lock(conn)?;
    let current = db::load_session(&tx)?;
    let advance = session::advance(current, event);
    settle_flush(&tx, &advance)?;
    db::store_session(&tx, advance.next.as_ref())?;
    tx.commit().context("cannot commit session update")
}

/// Explicit finalization: flush any live session as if the track changed,
/// then push whatever the queue holds.
pub fn flush(conn: &mut Connection, config: &Config) -> Result<()> {
    let tx = db::lock(conn)?;
    let current = db::load_session(&tx)?;
    let advance = session::finalize(current);
    settle_flush(&tx, &advance)?;
    db::store_session(&tx, None)?;
    tx.commit().context("cannot commit session finalization")?;

    let services = submit::clients_from(config)?;
    submit::deliver_pending(conn, &services)
}

fn settle_flush(conn: &Connection, advance: &Advance) -> Result<()> {
    let Some(done) = &advance.flushed else {
        return Ok(());
    };
    if session::eligible(done.played_secs, done.duration) {
        let record = ScrobbleRecord::from_session(done);
        if queue::enqueue(conn, &record)? {
            info!(
                "queued scrobble: {} - {} ({}s of {}s)",
                done.artist, done.title, done.played_secs, done.duration
            );
        }
    } else {
        debug!(
            "dropped session below threshold: {} - {} ({}s of {}s)",
            done.artist, done.title, done.played_secs, done.duration
        );
    }
    Ok(())
}
