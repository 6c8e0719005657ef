//! SQLite-backed persistent store.
//!
//! All state shared between invocations lives here: the single live session
//! slot, the queued scrobbles and their per-service delivery status. Nothing
//! survives a process exit except what is committed through this module.
//!
//! Cross-process exclusion is the database write lock itself: every
//! read-modify-write runs inside a `BEGIN IMMEDIATE` transaction obtained via
//! [`lock`], so two invocations racing on rapid pause/resume serialize
//! instead of both reading the same prior state. Waiting for the lock is
//! bounded; hitting the bound is a fatal store error, not a hang.

use crate::event::PlayerStatus;
use crate::session::Session;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// Bound on waiting for another invocation to release the store lock. The
/// status-display caller expects prompt return, so this fails rather than
/// queueing indefinitely.
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the store, creating the schema on first use.
pub fn connect(db_path: &Path) -> Result<Connection> {
    connect_with_timeout(db_path, LOCK_TIMEOUT)
}

/// Same as [`connect`] with an explicit lock wait bound.
pub fn connect_with_timeout(db_path: &Path, lock_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("cannot open scrobble store at {}", db_path.display()))?;
    conn.busy_timeout(lock_timeout)
        .context("cannot set store lock timeout")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("cannot enable foreign keys")?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS session (
            slot        INTEGER PRIMARY KEY CHECK (slot = 1),
            artist      TEXT    NOT NULL,
            title       TEXT    NOT NULL,
            album       TEXT    NOT NULL,
            albumartist TEXT,
            tracknumber TEXT,
            mbid        TEXT,
            duration    INTEGER NOT NULL,
            position    INTEGER NOT NULL,
            status      TEXT    NOT NULL,
            played_secs INTEGER NOT NULL,
            started_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS scrobble (
            id          INTEGER PRIMARY KEY,
            artist      TEXT    NOT NULL,
            title       TEXT    NOT NULL,
            album       TEXT    NOT NULL,
            albumartist TEXT,
            tracknumber TEXT,
            mbid        TEXT,
            duration    INTEGER NOT NULL,
            played_secs INTEGER NOT NULL,
            started_at  INTEGER NOT NULL,
            UNIQUE (artist, title, album, started_at)
        );
        CREATE TABLE IF NOT EXISTS delivery (
            scrobble_id INTEGER NOT NULL REFERENCES scrobble(id) ON DELETE CASCADE,
            service     TEXT    NOT NULL,
            state       TEXT    NOT NULL,
            detail      TEXT,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (scrobble_id, service)
        );",
    )
    .context("cannot create store schema; the store may be corrupt")
}

/// Enter the exclusive critical section. Every read of session or queue
/// state that leads to a write must happen through the returned transaction;
/// dropping it without commit rolls the invocation's mutation back whole.
pub fn lock(conn: &mut Connection) -> Result<Transaction<'_>> {
    match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
        Ok(tx) => Ok(tx),
        Err(e) if e.sqlite_error_code() == Some(rusqlite::ErrorCode::DatabaseBusy) => {
            Err(anyhow!("timed out waiting for the scrobble store lock; another invocation is holding it"))
        }
        Err(e) => Err(e).context("cannot lock the scrobble store"),
    }
}

pub fn load_session(conn: &Connection) -> Result<Option<Session>> {
    conn.query_row(
        "SELECT artist, title, album, albumartist, tracknumber, mbid,
                duration, position, status, played_secs, started_at, updated_at
         FROM session WHERE slot = 1",
        [],
        |row| {
            Ok(Session {
                artist: row.get(0)?,
                title: row.get(1)?,
                album: row.get(2)?,
                albumartist: row.get(3)?,
                tracknumber: row.get(4)?,
                mbid: row.get(5)?,
                duration: row.get(6)?,
                position: row.get(7)?,
                status: status_from_sql(&row.get::<_, String>(8)?),
                played_secs: row.get(9)?,
                started_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        },
    )
    .optional()
    .context("cannot read the session slot")
}

/// Overwrite the single session slot; `None` clears it.
pub fn store_session(conn: &Connection, session: Option<&Session>) -> Result<()> {
    conn.execute("DELETE FROM session", [])
        .context("cannot clear the session slot")?;
    if let Some(s) = session {
        conn.execute(
            "INSERT INTO session (slot, artist, title, album, albumartist, tracknumber, mbid,
                                  duration, position, status, played_secs, started_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                s.artist,
                s.title,
                s.album,
                s.albumartist,
                s.tracknumber,
                s.mbid,
                s.duration,
                s.position,
                s.status.as_str(),
                s.played_secs,
                s.started_at,
                s.updated_at,
            ],
        )
        .context("cannot write the session slot")?;
    }
    Ok(())
}

fn status_from_sql(value: &str) -> PlayerStatus {
    // A bad row is treated as paused: nothing gets credited off it, and the
    // next observation repairs the slot.
    PlayerStatus::parse(value).unwrap_or(PlayerStatus::Paused)
}

/// In-memory store with the real schema, for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory store");
    conn.pragma_update(None, "foreign_keys", "ON").expect("pragma");
    init(&conn).expect("schema");
    conn
}
