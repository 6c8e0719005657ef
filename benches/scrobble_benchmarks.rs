//! # Encore Performance Benchmarks
//!
//! The `report` path runs once per player status change while cmus waits on
//! it, so the hot pieces are benchmarked here: session accounting and the
//! locked store round-trip.
//!
//! ```bash
//! cargo bench
//! cargo bench session
//! ```

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tempfile::TempDir;

use encore::db;
use encore::event::{PlayerStatus, TrackEvent};
use encore::scrobbler;
use encore::session;

fn playing(position: u32, at: i64) -> TrackEvent {
    TrackEvent {
        artist: "Low".to_string(),
        title: "Sunflower".to_string(),
        album: "Things We Lost in the Fire".to_string(),
        albumartist: None,
        tracknumber: None,
        mbid: None,
        duration: 200,
        position,
        status: PlayerStatus::Playing,
        observed_at: at,
    }
}

fn bench_session_advance(c: &mut Criterion) {
    let events: Vec<TrackEvent> =
        (0..1000).map(|i| playing(i % 200, 1000 + i64::from(i))).collect();

    c.bench_function("session_advance_1000_events", |b| {
        b.iter(|| {
            let mut state = None;
            for event in &events {
                state = session::advance(black_box(state), black_box(event)).next;
            }
            state
        })
    });

    c.bench_function("eligibility", |b| {
        b.iter(|| {
            for played in 0..240u32 {
                black_box(session::eligible(black_box(played), black_box(200)));
            }
        })
    });
}

fn bench_store_round_trip(c: &mut Criterion) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("bench.db");

    c.bench_function("report_locked_update", |b| {
        let mut conn = db::connect(&path).expect("store");
        let mut at = 1000i64;
        b.iter(|| {
            at += 1;
            let event = playing((at % 200) as u32, at);
            scrobbler::apply_status_event(&mut conn, black_box(&event)).expect("apply");
        })
    });
}

criterion_group!(benches, bench_session_advance, bench_store_round_trip);
criterion_main!(benches);
