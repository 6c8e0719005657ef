//! Durable offline queue of finalized scrobbles.
//!
//! A flushed, eligible session becomes a [`ScrobbleRecord`] keyed by track
//! identity plus session start. Each record carries an independent delivery
//! state per configured service; a record leaves the queue only once every
//! enabled service has either delivered it or rejected it for good. All
//! mutations here are expected to run on a transaction from [`crate::db::lock`].

use crate::event::unix_now;
use crate::session::Session;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Per-service fate of one queued scrobble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Not yet accepted; retried on future invocations.
    Pending,
    Delivered,
    /// Rejected in a way a retry cannot fix.
    Failed,
}

impl DeliveryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown delivery state {other:?} in store"),
        }
    }

    pub fn is_resolved(self) -> bool {
        self != Self::Pending
    }
}

/// Finalized session snapshot awaiting submission. Immutable once queued;
/// only its per-service delivery states move.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrobbleRecord {
    /// Store rowid; 0 until the record has been enqueued.
    pub id: i64,
    pub artist: String,
    pub title: String,
    pub album: String,
    pub albumartist: Option<String>,
    pub tracknumber: Option<String>,
    pub mbid: Option<String>,
    pub duration: u32,
    pub played_secs: u32,
    pub started_at: i64,
}

impl ScrobbleRecord {
    pub fn from_session(session: &Session) -> Self {
        Self {
            id: 0,
            artist: session.artist.clone(),
            title: session.title.clone(),
            album: session.album.clone(),
            albumartist: session.albumartist.clone(),
            tracknumber: session.tracknumber.clone(),
            mbid: session.mbid.clone(),
            duration: session.duration,
            played_secs: session.played_secs,
            started_at: session.started_at,
        }
    }
}

fn record_from_row(row: &Row) -> rusqlite::Result<ScrobbleRecord> {
    Ok(ScrobbleRecord {
        id: row.get(0)?,
        artist: row.get(1)?,
        title: row.get(2)?,
        album: row.get(3)?,
        albumartist: row.get(4)?,
        tracknumber: row.get(5)?,
        mbid: row.get(6)?,
        duration: row.get(7)?,
        played_secs: row.get(8)?,
        started_at: row.get(9)?,
    })
}

const RECORD_COLUMNS: &str =
    "id, artist, title, album, albumartist, tracknumber, mbid, duration, played_secs, started_at";

/// Insert a finalized scrobble. Idempotent on the natural key (identity +
/// session start): a duplicate flush from a race is a no-op. Returns whether
/// a new row was created.
pub fn enqueue(conn: &Connection, record: &ScrobbleRecord) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO scrobble
                 (artist, title, album, albumartist, tracknumber, mbid,
                  duration, played_secs, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.artist,
                record.title,
                record.album,
                record.albumartist,
                record.tracknumber,
                record.mbid,
                record.duration,
                record.played_secs,
                record.started_at,
            ],
        )
        .context("cannot enqueue scrobble")?;
    Ok(inserted > 0)
}

/// Records still owed to `service`, oldest session first. A record with no
/// delivery row for the service counts as pending.
pub fn pending_for(conn: &Connection, service: &str) -> Result<Vec<ScrobbleRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM scrobble s
             WHERE NOT EXISTS (
                 SELECT 1 FROM delivery d
                 WHERE d.scrobble_id = s.id AND d.service = ?1 AND d.state != 'pending'
             )
             ORDER BY s.started_at ASC"
        ))
        .context("cannot prepare pending query")?;
    let rows = stmt
        .query_map([service], record_from_row)
        .context("cannot query pending scrobbles")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("cannot read pending scrobble row")?);
    }
    Ok(records)
}

/// Record the outcome of a delivery attempt for one service.
pub fn mark(
    conn: &Connection,
    scrobble_id: i64,
    service: &str,
    state: DeliveryState,
    detail: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO delivery (scrobble_id, service, state, detail, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (scrobble_id, service)
         DO UPDATE SET state = excluded.state, detail = excluded.detail,
                       updated_at = excluded.updated_at",
        params![scrobble_id, service, state.as_str(), detail, unix_now()],
    )
    .with_context(|| format!("cannot mark scrobble {scrobble_id} for {service}"))?;
    Ok(())
}

/// Drop every record that all the enabled services have resolved (delivered
/// or permanently failed). A record with any service still pending stays.
/// Returns the number purged.
pub fn purge_resolved(conn: &Connection, enabled_services: &[&str]) -> Result<usize> {
    if enabled_services.is_empty() {
        return Ok(0);
    }

    let mut ids = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT id FROM scrobble")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        for id in rows {
            ids.push(id.context("cannot read scrobble id")?);
        }
    }

    let mut purged = 0;
    for id in ids {
        let mut resolved = true;
        for service in enabled_services {
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM delivery WHERE scrobble_id = ?1 AND service = ?2",
                    params![id, service],
                    |row| row.get(0),
                )
                .optional()
                .context("cannot read delivery state")?;
            match state.as_deref().map(DeliveryState::parse).transpose()? {
                Some(state) if state.is_resolved() => {}
                _ => {
                    resolved = false;
                    break;
                }
            }
        }
        if resolved {
            conn.execute("DELETE FROM scrobble WHERE id = ?1", [id])
                .context("cannot purge delivered scrobble")?;
            purged += 1;
        }
    }
    Ok(purged)
}

/// Everything queued, with whatever delivery states have been recorded so
/// far. For user inspection; services with no row yet are implicitly pending.
pub fn snapshot(conn: &Connection) -> Result<Vec<(ScrobbleRecord, Vec<(String, DeliveryState)>)>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {RECORD_COLUMNS} FROM scrobble ORDER BY started_at ASC"))
        .context("cannot prepare snapshot query")?;
    let rows = stmt.query_map([], record_from_row).context("cannot query queued scrobbles")?;

    let mut out = Vec::new();
    for row in rows {
        let record = row.context("cannot read queued scrobble row")?;
        let mut stmt = conn.prepare(
            "SELECT service, state FROM delivery WHERE scrobble_id = ?1 ORDER BY service",
        )?;
        let states = stmt
            .query_map([record.id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("cannot read delivery states")?;
        let mut parsed = Vec::new();
        for (service, state) in states {
            parsed.push((service, DeliveryState::parse(&state)?));
        }
        out.push((record, parsed));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Connection {
        crate::db::open_in_memory()
    }

    fn record(title: &str, started_at: i64) -> ScrobbleRecord {
        ScrobbleRecord {
            id: 0,
            artist: "Low".to_string(),
            title: title.to_string(),
            album: "Secret Name".to_string(),
            albumartist: None,
            tracknumber: None,
            mbid: None,
            duration: 200,
            played_secs: 150,
            started_at,
        }
    }

    #[test]
    fn enqueue_is_idempotent_on_the_natural_key() {
        let conn = test_store();
        assert!(enqueue(&conn, &record("Soon", 1000)).unwrap());
        assert!(!enqueue(&conn, &record("Soon", 1000)).unwrap());
        assert_eq!(pending_for(&conn, "lastfm").unwrap().len(), 1);

        // Same track, different session start: a separate play.
        assert!(enqueue(&conn, &record("Soon", 2000)).unwrap());
        assert_eq!(pending_for(&conn, "lastfm").unwrap().len(), 2);
    }

    #[test]
    fn pending_is_ordered_and_per_service() {
        let conn = test_store();
        enqueue(&conn, &record("Starfire", 2000)).unwrap();
        enqueue(&conn, &record("Soon", 1000)).unwrap();

        let pending = pending_for(&conn, "lastfm").unwrap();
        assert_eq!(pending[0].title, "Soon");
        assert_eq!(pending[1].title, "Starfire");

        mark(&conn, pending[0].id, "lastfm", DeliveryState::Delivered, None).unwrap();
        assert_eq!(pending_for(&conn, "lastfm").unwrap().len(), 1);
        // The other service still sees both.
        assert_eq!(pending_for(&conn, "librefm").unwrap().len(), 2);
    }

    #[test]
    fn failed_records_are_not_retried() {
        let conn = test_store();
        enqueue(&conn, &record("Soon", 1000)).unwrap();
        let id = pending_for(&conn, "lastfm").unwrap()[0].id;
        mark(&conn, id, "lastfm", DeliveryState::Failed, Some("bad session key")).unwrap();
        assert!(pending_for(&conn, "lastfm").unwrap().is_empty());
    }

    #[test]
    fn purge_waits_for_every_enabled_service() {
        let conn = test_store();
        enqueue(&conn, &record("Soon", 1000)).unwrap();
        let id = pending_for(&conn, "lastfm").unwrap()[0].id;

        mark(&conn, id, "lastfm", DeliveryState::Delivered, None).unwrap();
        assert_eq!(purge_resolved(&conn, &["lastfm", "librefm"]).unwrap(), 0);

        // A permanent failure resolves the record for that service too.
        mark(&conn, id, "librefm", DeliveryState::Failed, Some("rejected")).unwrap();
        assert_eq!(purge_resolved(&conn, &["lastfm", "librefm"]).unwrap(), 1);
        assert!(snapshot(&conn).unwrap().is_empty());
    }

    #[test]
    fn purge_ignores_states_of_disabled_services() {
        let conn = test_store();
        enqueue(&conn, &record("Soon", 1000)).unwrap();
        let id = pending_for(&conn, "lastfm").unwrap()[0].id;
        mark(&conn, id, "lastfm", DeliveryState::Delivered, None).unwrap();

        // librefm was disabled since; only lastfm gates the purge.
        assert_eq!(purge_resolved(&conn, &["lastfm"]).unwrap(), 1);
    }

    #[test]
    fn snapshot_reports_mixed_states() {
        let conn = test_store();
        enqueue(&conn, &record("Soon", 1000)).unwrap();
        let id = pending_for(&conn, "lastfm").unwrap()[0].id;
        mark(&conn, id, "lastfm", DeliveryState::Delivered, None).unwrap();
        mark(&conn, id, "librefm", DeliveryState::Pending, Some("rate limited")).unwrap();

        let rows = snapshot(&conn).unwrap();
        assert_eq!(rows.len(), 1);
        let (rec, states) = &rows[0];
        assert_eq!(rec.title, "Soon");
        assert_eq!(
            states.as_slice(),
            &[
                ("lastfm".to_string(), DeliveryState::Delivered),
                ("librefm".to_string(), DeliveryState::Pending),
            ]
        );
    }
}
