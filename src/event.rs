//! Playback status event model.
//!
//! cmus runs its `status_display_program` once per player status change and
//! passes the status as a flat list of `key value` argument pairs, e.g.
//! `status playing artist Low title Lullaby duration 200 position 0`. This
//! module turns that list into a [`TrackEvent`], the immutable value every
//! other module consumes. One event is produced per process invocation.

use anyhow::{bail, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Positions slightly past the reported duration are tolerated; anything
/// beyond this is clamped back to the duration.
const POSITION_TOLERANCE_SECS: u32 = 5;

/// Player state carried by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Playing,
    Paused,
    Stopped,
}

impl PlayerStatus {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "playing" => Ok(Self::Playing),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => bail!("unknown player status {other:?}"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

/// One parsed status observation. Produced fresh per invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEvent {
    pub artist: String,
    pub title: String,
    pub album: String,
    /// Sent to services only when it differs from the artist.
    pub albumartist: Option<String>,
    pub tracknumber: Option<String>,
    /// MusicBrainz track id, already looked up by the player if at all.
    pub mbid: Option<String>,
    /// Track length in seconds; 0 when the player has no metadata.
    pub duration: u32,
    /// Playback position in seconds at observation time.
    pub position: u32,
    pub status: PlayerStatus,
    /// Unix timestamp of the observation.
    pub observed_at: i64,
}

impl TrackEvent {
    /// Parse the `key value` pairs exactly as cmus passes them. Unknown keys
    /// (`file`, `date`, `discnumber`, ...) are ignored; a trailing key with
    /// no value is an error, as is a missing `status`.
    pub fn from_status_args(tokens: &[String]) -> Result<Self> {
        if tokens.len() % 2 != 0 {
            bail!("status arguments must come in key/value pairs, got {} tokens", tokens.len());
        }

        let mut status = None;
        let mut event = TrackEvent {
            artist: String::new(),
            title: String::new(),
            album: String::new(),
            albumartist: None,
            tracknumber: None,
            mbid: None,
            duration: 0,
            position: 0,
            status: PlayerStatus::Stopped,
            observed_at: unix_now(),
        };

        for pair in tokens.chunks_exact(2) {
            let (key, value) = (pair[0].as_str(), pair[1].as_str());
            match key {
                "status" => status = Some(PlayerStatus::parse(value)?),
                "artist" => event.artist = value.to_string(),
                "title" => event.title = value.to_string(),
                "album" => event.album = value.to_string(),
                "albumartist" => event.albumartist = non_empty(value),
                "tracknumber" => event.tracknumber = non_empty(value),
                "musicbrainz_trackid" => event.mbid = non_empty(value),
                "duration" => event.duration = parse_seconds(value),
                "position" => event.position = parse_seconds(value),
                _ => {}
            }
        }

        let Some(status) = status else {
            bail!("status line carries no `status` key");
        };
        event.status = status;
        event.position = event
            .position
            .min(event.duration.saturating_add(POSITION_TOLERANCE_SECS));
        Ok(event)
    }

    /// Whether the event names a track at all. cmus reports `status stopped`
    /// without any tag data once playback ends.
    pub fn has_track(&self) -> bool {
        !(self.artist.is_empty() && self.title.is_empty() && self.album.is_empty())
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Noisy input tolerance: non-numeric or negative second counts become 0.
fn parse_seconds(value: &str) -> u32 {
    value.parse::<i64>().ok().filter(|n| *n >= 0).map_or(0, |n| n.min(i64::from(u32::MAX)) as u32)
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}
