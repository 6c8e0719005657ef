//! Per-service submission engine.
//!
//! Speaks the Last.fm API 2.0 wire format (Libre.fm and ListenBrainz expose
//! the same surface): form-POSTs carrying an md5 `api_sig` over the sorted
//! parameters, JSON responses. Each configured service gets its own client;
//! delivery outcomes are recorded per service so one unreachable endpoint
//! never blocks another's bookkeeping.
//!
//! There is deliberately no retry loop in here. The process is short-lived
//! and re-invoked on the next player status change, so a transient failure
//! simply leaves the records pending for next time.

use crate::config::Config;
use crate::db;
use crate::event::{PlayerStatus, TrackEvent};
use crate::queue::{self, DeliveryState, ScrobbleRecord};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Last.fm accepts at most 50 scrobbles per `track.scrobble` call.
pub const SCROBBLE_BATCH_SIZE: usize = 50;

const METHOD_SCROBBLE: &str = "track.scrobble";
const METHOD_NOW_PLAYING: &str = "track.updateNowPlaying";
const METHOD_GET_TOKEN: &str = "auth.gettoken";
const METHOD_GET_SESSION: &str = "auth.getsession";

const USER_AGENT: &str = concat!("encore/", env!("CARGO_PKG_VERSION"));

/// How a delivery attempt failed. Transient failures stay pending and are
/// retried by a future invocation; permanent ones are recorded as failed for
/// that service and surfaced to the user.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

/// The per-service surface the delivery engine runs against. Production use
/// is [`AudioscrobblerClient`]; tests substitute stubs.
pub trait ScrobbleService {
    fn name(&self) -> &str;
    /// Submit one batch of finalized scrobbles, oldest first.
    fn submit(&self, batch: &[ScrobbleRecord]) -> Result<(), SubmitError>;
    /// Advisory notification for the track playing right now.
    fn now_playing(&self, event: &TrackEvent) -> Result<(), SubmitError>;
    fn wants_now_playing(&self) -> bool {
        true
    }
}

impl<S: ScrobbleService + ?Sized> ScrobbleService for &S {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn submit(&self, batch: &[ScrobbleRecord]) -> Result<(), SubmitError> {
        (**self).submit(batch)
    }
    fn now_playing(&self, event: &TrackEvent) -> Result<(), SubmitError> {
        (**self).now_playing(event)
    }
    fn wants_now_playing(&self) -> bool {
        (**self).wants_now_playing()
    }
}

/// HTTP client for one Last.fm-compatible service.
pub struct AudioscrobblerClient {
    service: crate::config::ResolvedService,
    agent: ureq::Agent,
}

impl AudioscrobblerClient {
    pub fn new(service: crate::config::ResolvedService) -> Self {
        // Bounded time budget per request: a dead service must not hold up
        // process exit, the status-display caller is waiting on us.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(10))
            .timeout_write(Duration::from_secs(10))
            .build();
        Self { service, agent }
    }

    /// One API call. `signed` adds the md5 `api_sig` over everything but the
    /// `format` parameter, per the Last.fm signing rules.
    fn call(
        &self,
        method: &str,
        mut params: Vec<(String, String)>,
        signed: bool,
    ) -> Result<Value, SubmitError> {
        params.push(("api_key".to_string(), self.service.api_key.clone()));
        params.push(("method".to_string(), method.to_string()));
        if signed {
            let sig = api_sig(&params, &self.service.shared_secret);
            params.push(("api_sig".to_string(), sig));
        }
        params.push(("format".to_string(), "json".to_string()));

        let form: Vec<(&str, &str)> =
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        debug!("{}: {method}", self.service.name);

        let response = self
            .agent
            .post(&self.service.api_url)
            .set("User-Agent", USER_AGENT)
            .send_form(&form);
        match response {
            Ok(resp) => self.parse_body(resp),
            Err(ureq::Error::Status(status, resp)) => {
                // Error bodies still carry the API error code when the
                // service produced them; prefer that over the HTTP status.
                if let Ok(body) = resp.into_json::<Value>() {
                    if let Some(code) = body.get("error").and_then(Value::as_i64) {
                        let message =
                            body.get("message").and_then(Value::as_str).unwrap_or("no message");
                        return Err(classify_api_error(&self.service.name, code, message));
                    }
                }
                Err(classify_http_status(&self.service.name, status))
            }
            Err(err) => Err(SubmitError::Transient(format!("{}: {err}", self.service.name))),
        }
    }

    fn parse_body(&self, resp: ureq::Response) -> Result<Value, SubmitError> {
        let text = resp
            .into_string()
            .map_err(|e| SubmitError::Transient(format!("{}: unreadable response: {e}", self.service.name)))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            SubmitError::Transient(format!("{}: malformed response: {e}", self.service.name))
        })?;
        if let Some(code) = body.get("error").and_then(Value::as_i64) {
            let message = body.get("message").and_then(Value::as_str).unwrap_or("no message");
            return Err(classify_api_error(&self.service.name, code, message));
        }
        Ok(body)
    }

    /// First authorization step: fetch a request token (unsigned call).
    pub fn request_token(&self) -> Result<String, SubmitError> {
        let body = self.call(METHOD_GET_TOKEN, Vec::new(), false)?;
        body.get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SubmitError::Permanent(format!("{}: no token in response", self.service.name))
            })
    }

    /// Final authorization step: trade the user-approved token for a session.
    pub fn request_session(&self, token: &str) -> Result<AuthSession, SubmitError> {
        let body =
            self.call(METHOD_GET_SESSION, vec![("token".to_string(), token.to_string())], true)?;
        let session = body.get("session").ok_or_else(|| {
            SubmitError::Permanent(format!("{}: no session in response", self.service.name))
        })?;
        match (
            session.get("key").and_then(Value::as_str),
            session.get("name").and_then(Value::as_str),
        ) {
            (Some(key), Some(name)) => {
                Ok(AuthSession { key: key.to_string(), username: name.to_string() })
            }
            _ => Err(SubmitError::Permanent(format!(
                "{}: incomplete session in response",
                self.service.name
            ))),
        }
    }
}

impl ScrobbleService for AudioscrobblerClient {
    fn name(&self) -> &str {
        &self.service.name
    }

    fn submit(&self, batch: &[ScrobbleRecord]) -> Result<(), SubmitError> {
        let Some(session_key) = &self.service.session_key else {
            return Err(SubmitError::Permanent(format!(
                "{}: not authorized; run `encore auth`",
                self.service.name
            )));
        };
        let mut params = scrobble_params(batch);
        params.push(("sk".to_string(), session_key.clone()));
        self.call(METHOD_SCROBBLE, params, true).map(drop)
    }

    fn now_playing(&self, event: &TrackEvent) -> Result<(), SubmitError> {
        let Some(session_key) = &self.service.session_key else {
            return Err(SubmitError::Permanent(format!(
                "{}: not authorized; run `encore auth`",
                self.service.name
            )));
        };
        let mut params = vec![
            ("artist".to_string(), event.artist.clone()),
            ("track".to_string(), event.title.clone()),
            ("sk".to_string(), session_key.clone()),
        ];
        if !event.album.is_empty() {
            params.push(("album".to_string(), event.album.clone()));
        }
        if event.duration > 0 {
            params.push(("duration".to_string(), event.duration.to_string()));
        }
        if let Some(albumartist) = event.albumartist.as_ref().filter(|a| **a != event.artist) {
            params.push(("albumArtist".to_string(), albumartist.clone()));
        }
        if let Some(tracknumber) = &event.tracknumber {
            params.push(("trackNumber".to_string(), tracknumber.clone()));
        }
        if let Some(mbid) = &event.mbid {
            params.push(("mbid".to_string(), mbid.clone()));
        }
        self.call(METHOD_NOW_PLAYING, params, true).map(drop)
    }

    fn wants_now_playing(&self) -> bool {
        self.service.now_playing
    }
}

/// Session obtained at the end of the authorization flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub key: String,
    pub username: String,
}

/// Indexed `track.scrobble` parameters for one batch.
fn scrobble_params(batch: &[ScrobbleRecord]) -> Vec<(String, String)> {
    let mut params = Vec::new();
    for (i, record) in batch.iter().enumerate() {
        params.push((format!("artist[{i}]"), record.artist.clone()));
        params.push((format!("track[{i}]"), record.title.clone()));
        params.push((format!("timestamp[{i}]"), record.started_at.to_string()));
        params.push((format!("duration[{i}]"), record.duration.to_string()));
        if !record.album.is_empty() {
            params.push((format!("album[{i}]"), record.album.clone()));
        }
        if let Some(albumartist) = record.albumartist.as_ref().filter(|a| **a != record.artist) {
            params.push((format!("albumArtist[{i}]"), albumartist.clone()));
        }
        if let Some(tracknumber) = &record.tracknumber {
            params.push((format!("trackNumber[{i}]"), tracknumber.clone()));
        }
        if let Some(mbid) = &record.mbid {
            params.push((format!("mbid[{i}]"), mbid.clone()));
        }
    }
    params
}

/// md5 over the parameters sorted by name, keys and values concatenated,
/// with the shared secret appended.
fn api_sig(params: &[(String, String)], secret: &str) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut buf = String::new();
    for (key, value) in sorted {
        buf.push_str(key);
        buf.push_str(value);
    }
    buf.push_str(secret);
    format!("{:x}", md5::compute(buf.as_bytes()))
}

/// API error codes that are worth retrying: 11 service offline, 16
/// temporarily unavailable, 29 rate limit exceeded. Everything else (bad
/// auth, bad key, bad signature, suspended key, ...) needs the operator.
fn classify_api_error(service: &str, code: i64, message: &str) -> SubmitError {
    let text = format!("{service}: API error {code}: {message}");
    match code {
        11 | 16 | 29 => SubmitError::Transient(text),
        _ => SubmitError::Permanent(text),
    }
}

fn classify_http_status(service: &str, status: u16) -> SubmitError {
    let text = format!("{service}: HTTP {status}");
    if status == 429 || status >= 500 {
        SubmitError::Transient(text)
    } else {
        SubmitError::Permanent(text)
    }
}

/// Clients for every enabled service that finished authorization. Services
/// still missing a session key are skipped with a hint.
pub fn clients_from(config: &Config) -> Result<Vec<AudioscrobblerClient>> {
    let mut clients = Vec::new();
    for service in config.resolve_services()? {
        if service.session_key.is_none() {
            warn!("{}: no session key yet; run `encore auth`", service.name);
            continue;
        }
        clients.push(AudioscrobblerClient::new(service));
    }
    if clients.is_empty() {
        warn!("no authorized services; scrobbles will wait in the offline queue");
    }
    Ok(clients)
}

/// Attempt delivery of everything pending, per service, oldest first.
///
/// Runs outside the store lock so a slow service never blocks another
/// invocation's session update; outcomes are recorded afterwards under a
/// fresh lock, and fully resolved records are purged in the same
/// transaction. Scrobbles must reach a service in play order, so the first
/// transient failure parks the rest of that service's queue until the next
/// invocation. A permanent rejection marks the attempted batch as failed for
/// that service and is surfaced on stderr; other services continue.
pub fn deliver_pending<S: ScrobbleService>(
    conn: &mut rusqlite::Connection,
    services: &[S],
) -> Result<()> {
    let enabled: Vec<&str> = services.iter().map(ScrobbleService::name).collect();
    let mut outcomes: Vec<(i64, &str, DeliveryState, Option<String>)> = Vec::new();

    for service in services {
        let pending = queue::pending_for(conn, service.name())?;
        if pending.is_empty() {
            continue;
        }
        info!("{}: submitting {} queued scrobble(s)", service.name(), pending.len());
        for batch in pending.chunks(SCROBBLE_BATCH_SIZE) {
            match service.submit(batch) {
                Ok(()) => {
                    for record in batch {
                        outcomes.push((record.id, service.name(), DeliveryState::Delivered, None));
                    }
                }
                Err(SubmitError::Transient(message)) => {
                    info!("{}: delivery postponed: {message}", service.name());
                    break;
                }
                Err(SubmitError::Permanent(message)) => {
                    eprintln!("encore: {}: scrobble rejected permanently: {message}", service.name());
                    for record in batch {
                        outcomes.push((
                            record.id,
                            service.name(),
                            DeliveryState::Failed,
                            Some(message.clone()),
                        ));
                    }
                    break;
                }
            }
        }
    }

    let tx = db::lock(conn)?;
    for (id, service, state, detail) in &outcomes {
        queue::mark(&tx, *id, service, *state, detail.as_deref())?;
    }
    let purged = queue::purge_resolved(&tx, &enabled)?;
    tx.commit().context("cannot commit delivery outcomes")?;
    if purged > 0 {
        debug!("purged {purged} fully resolved scrobble(s)");
    }
    Ok(())
}

/// Advisory "now playing" broadcast for an actively playing track. Failures
/// are logged and otherwise ignored; nothing durable depends on this.
pub fn broadcast_now_playing<S: ScrobbleService>(services: &[S], event: &TrackEvent) {
    if event.status != PlayerStatus::Playing || !event.has_track() {
        return;
    }
    for service in services.iter().filter(|s| s.wants_now_playing()) {
        match service.now_playing(event) {
            Ok(()) => debug!("{}: now playing {} - {}", service.name(), event.artist, event.title),
            Err(err) => debug!("{}: now-playing notification failed: {err}", service.name()),
        }
    }
}
