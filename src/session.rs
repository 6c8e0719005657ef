//! Play-session accounting and scrobble eligibility.
//!
//! A session is the accounting for one track across many short-lived
//! invocations: how many seconds of it were actually heard. The state machine
//! here is a pure function over (stored session, new event) so it can be
//! exercised directly in tests; the caller runs it inside the store lock as a
//! single read-modify-write, which is what keeps overlapping invocations from
//! double-counting or losing an interval.

use crate::event::{PlayerStatus, TrackEvent};
use log::trace;

/// A track scrobbles once half of it has been heard...
const PLAYED_FRACTION: f64 = 0.5;
/// ...or four minutes, whichever is less.
const PLAYED_SECS_CAP: f64 = 240.0;

/// In-progress accounting for one track.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub albumartist: Option<String>,
    pub tracknumber: Option<String>,
    pub mbid: Option<String>,
    pub duration: u32,
    /// Position at the last observation, used to bound the next credit.
    pub position: u32,
    /// Status at the last observation. Time is only credited for intervals
    /// whose *preceding* observation was playing.
    pub status: PlayerStatus,
    pub played_secs: u32,
    pub started_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn begin(event: &TrackEvent) -> Self {
        Self {
            artist: event.artist.clone(),
            title: event.title.clone(),
            album: event.album.clone(),
            albumartist: event.albumartist.clone(),
            tracknumber: event.tracknumber.clone(),
            mbid: event.mbid.clone(),
            duration: event.duration,
            position: event.position,
            status: event.status,
            played_secs: 0,
            started_at: event.observed_at,
            updated_at: event.observed_at,
        }
    }

    /// Track identity is artist + title + album.
    pub fn same_track(&self, event: &TrackEvent) -> bool {
        self.artist == event.artist && self.title == event.title && self.album == event.album
    }

    /// Credit the interval since the last observation. The credit is the
    /// smaller of the position delta and the wall-clock delta: the position
    /// bound stops overlapping invocations from counting the same seconds
    /// twice, the wall-clock bound stops a seek forward from counting time
    /// that never passed. Seeks backwards and clock skew clamp to zero,
    /// never subtract; the total is capped at the track duration.
    fn credit_interval(&mut self, event: &TrackEvent) {
        let by_position = (i64::from(event.position) - i64::from(self.position)).max(0);
        let by_clock = (event.observed_at - self.updated_at).max(0);
        let credit = by_position.min(by_clock) as u32;
        self.played_secs = self.played_secs.saturating_add(credit).min(self.duration);
        trace!(
            "credited {credit}s to {} - {} (total {}s)",
            self.artist,
            self.title,
            self.played_secs
        );
    }

    fn observe(&mut self, event: &TrackEvent) {
        self.position = event.position;
        self.status = event.status;
        self.updated_at = event.observed_at;
    }
}

/// Outcome of advancing the session state by one event.
#[derive(Debug, Default)]
pub struct Advance {
    /// Session to persist for the next invocation, if any.
    pub next: Option<Session>,
    /// Session whose track finished; eligibility is evaluated on it.
    pub flushed: Option<Session>,
}

/// Advance the stored session by one observation.
///
/// Pausing merges into the running session without crediting time and never
/// flushes on its own. A stop for the same track credits the final interval
/// first; a stop without tag data, or any event for a different track,
/// flushes without crediting (a cross-track delta is meaningless).
pub fn advance(current: Option<Session>, event: &TrackEvent) -> Advance {
    match current {
        None => Advance { next: begin_if_playing(event), flushed: None },
        Some(mut session) if event.has_track() && session.same_track(event) => {
            if session.status == PlayerStatus::Playing {
                session.credit_interval(event);
            }
            match event.status {
                PlayerStatus::Playing | PlayerStatus::Paused => {
                    session.observe(event);
                    Advance { next: Some(session), flushed: None }
                }
                PlayerStatus::Stopped => Advance { next: None, flushed: Some(session) },
            }
        }
        Some(session) => Advance { next: begin_if_playing(event), flushed: Some(session) },
    }
}

/// Explicit finalization: flush whatever is live.
pub fn finalize(current: Option<Session>) -> Advance {
    Advance { next: None, flushed: current }
}

fn begin_if_playing(event: &TrackEvent) -> Option<Session> {
    (event.status == PlayerStatus::Playing && event.has_track()).then(|| Session::begin(event))
}

/// Whether an accumulated session qualifies as a scrobble. A zero duration
/// means missing metadata and never qualifies; the played time is capped at
/// the duration before comparison so runaway accounting cannot qualify a
/// track that was barely heard.
pub fn eligible(played_secs: u32, duration_secs: u32) -> bool {
    if duration_secs == 0 {
        return false;
    }
    let played = f64::from(played_secs.min(duration_secs));
    played >= (f64::from(duration_secs) * PLAYED_FRACTION).min(PLAYED_SECS_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: PlayerStatus, title: &str, duration: u32, position: u32, at: i64) -> TrackEvent {
        TrackEvent {
            artist: "Low".to_string(),
            title: title.to_string(),
            album: "Things We Lost in the Fire".to_string(),
            albumartist: None,
            tracknumber: None,
            mbid: None,
            duration,
            position,
            status,
            observed_at: at,
        }
    }

    fn playing(title: &str, duration: u32, position: u32, at: i64) -> TrackEvent {
        event(PlayerStatus::Playing, title, duration, position, at)
    }

    #[test]
    fn playing_event_opens_a_session() {
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let session = adv.next.unwrap();
        assert_eq!(session.played_secs, 0);
        assert_eq!(session.started_at, 1000);
        assert!(adv.flushed.is_none());
    }

    #[test]
    fn paused_or_stopped_without_session_is_a_noop() {
        let adv = advance(None, &event(PlayerStatus::Paused, "Sunflower", 200, 10, 1000));
        assert!(adv.next.is_none() && adv.flushed.is_none());
        let adv = advance(None, &event(PlayerStatus::Stopped, "Sunflower", 200, 10, 1000));
        assert!(adv.next.is_none() && adv.flushed.is_none());
    }

    #[test]
    fn stop_flushes_with_final_interval_credited() {
        // Scenario: duration 200, playing@0 then playing@110, stop right after.
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let adv = advance(adv.next, &playing("Sunflower", 200, 110, 1110));
        let session = adv.next.clone().unwrap();
        assert_eq!(session.played_secs, 110);

        let adv = advance(adv.next, &event(PlayerStatus::Stopped, "Sunflower", 200, 110, 1110));
        let flushed = adv.flushed.unwrap();
        assert!(adv.next.is_none());
        assert_eq!(flushed.played_secs, 110);
        assert!(eligible(flushed.played_secs, flushed.duration));
    }

    #[test]
    fn pause_preserves_total_and_resume_continues_it() {
        // Scenario: duration 300, playing@0, paused@50, resumed@50, playing@90.
        let adv = advance(None, &playing("Dinosaur Act", 300, 0, 1000));
        let adv = advance(adv.next, &event(PlayerStatus::Paused, "Dinosaur Act", 300, 50, 1050));
        assert_eq!(adv.next.as_ref().unwrap().played_secs, 50);

        // Resume after a long pause: no time credited while paused.
        let adv = advance(adv.next, &playing("Dinosaur Act", 300, 50, 1950));
        assert_eq!(adv.next.as_ref().unwrap().played_secs, 50);

        let adv = advance(adv.next, &playing("Dinosaur Act", 300, 90, 1990));
        let session = adv.next.unwrap();
        assert_eq!(session.played_secs, 90);
        assert!(!eligible(session.played_secs, session.duration));
    }

    #[test]
    fn pause_resume_with_no_elapsed_time_changes_nothing() {
        let adv = advance(None, &playing("Whitetail", 240, 0, 1000));
        let adv = advance(adv.next, &playing("Whitetail", 240, 30, 1030));
        let adv = advance(adv.next, &event(PlayerStatus::Paused, "Whitetail", 240, 30, 1030));
        let adv = advance(adv.next, &playing("Whitetail", 240, 30, 1030));
        assert_eq!(adv.next.unwrap().played_secs, 30);
    }

    #[test]
    fn track_change_flushes_without_cross_track_credit() {
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let adv = advance(adv.next, &playing("Sunflower", 200, 110, 1110));
        let adv = advance(adv.next, &playing("Whitetail", 240, 0, 1115));
        let flushed = adv.flushed.unwrap();
        assert_eq!(flushed.title, "Sunflower");
        assert_eq!(flushed.played_secs, 110);
        let next = adv.next.unwrap();
        assert_eq!(next.title, "Whitetail");
        assert_eq!(next.played_secs, 0);
    }

    #[test]
    fn tagless_stop_flushes_without_credit() {
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let adv = advance(adv.next, &playing("Sunflower", 200, 50, 1050));
        let mut stop = event(PlayerStatus::Stopped, "", 0, 0, 1100);
        stop.artist = String::new();
        stop.album = String::new();
        let adv = advance(adv.next, &stop);
        assert!(adv.next.is_none());
        assert_eq!(adv.flushed.unwrap().played_secs, 50);
    }

    #[test]
    fn replayed_event_credits_nothing() {
        // Two overlapping invocations observing the identical status line:
        // the second applies on top of the first's committed state and both
        // deltas are zero.
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let adv = advance(adv.next, &playing("Sunflower", 200, 60, 1060));
        let adv = advance(adv.next, &playing("Sunflower", 200, 60, 1060));
        assert_eq!(adv.next.unwrap().played_secs, 60);
    }

    #[test]
    fn seek_backwards_never_subtracts() {
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let adv = advance(adv.next, &playing("Sunflower", 200, 100, 1100));
        let adv = advance(adv.next, &playing("Sunflower", 200, 20, 1101));
        assert_eq!(adv.next.unwrap().played_secs, 100);
    }

    #[test]
    fn seek_forward_is_bounded_by_wall_clock() {
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        // Position jumped 150s but only 10s passed.
        let adv = advance(adv.next, &playing("Sunflower", 200, 150, 1010));
        assert_eq!(adv.next.unwrap().played_secs, 10);
    }

    #[test]
    fn total_is_capped_at_duration() {
        let mut state = advance(None, &playing("Loop", 100, 0, 1000)).next;
        // A looping player keeps reporting progress long past one pass.
        for i in 1..10 {
            state = advance(state, &playing("Loop", 100, (i * 30) % 100, 1000 + i64::from(i) * 30)).next;
        }
        assert!(state.unwrap().played_secs <= 100);
    }

    #[test]
    fn finalize_flushes_the_live_session() {
        let adv = advance(None, &playing("Sunflower", 200, 0, 1000));
        let adv = finalize(adv.next);
        assert!(adv.next.is_none());
        assert_eq!(adv.flushed.unwrap().title, "Sunflower");
    }

    #[test]
    fn eligibility_thresholds() {
        // Half the track for ordinary lengths.
        assert!(eligible(110, 200));
        assert!(!eligible(99, 200));
        // The 4-minute cap for long tracks.
        assert!(eligible(240, 1200));
        assert!(!eligible(239, 1200));
        // The cap does not bind short tracks: 16 of 30 qualifies.
        assert!(eligible(16, 30));
        assert!(eligible(15, 30));
        assert!(!eligible(14, 30));
        // Missing metadata never qualifies.
        assert!(!eligible(500, 0));
        // Over-accumulated time is capped before comparison.
        assert!(eligible(u32::MAX, 30));
    }
}
