//! Interactive service authorization.
//!
//! Walks the Last.fm desktop flow for every configured service that does not
//! hold a session key yet: fetch a request token, send the user to the
//! authorization page, then trade the approved token for a session key with
//! unlimited lifetime. Obtained keys are written back into the configuration
//! file in place, keeping the user's comments and formatting intact.

use crate::config::{Config, ResolvedService};
use crate::submit::AudioscrobblerClient;
use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use toml_edit::DocumentMut;

pub fn authorize(config_path: &Path) -> Result<()> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("cannot read configuration at {}", config_path.display()))?;
    let config = Config::parse(&raw)
        .with_context(|| format!("invalid configuration at {}", config_path.display()))?;
    let mut doc: DocumentMut = raw.parse().context("configuration is not valid TOML")?;

    let services = config.resolve_services()?;
    if services.is_empty() {
        println!("No enabled services configured; add a [[services]] table first.");
        return Ok(());
    }

    let mut updated = false;
    for service in services {
        if service.session_key.is_some() {
            println!("Session key already active for {}. Skipping...", service.name);
            continue;
        }
        if service.auth_url.is_none() {
            eprintln!("encore: {}: no auth_url configured, cannot authorize", service.name);
            continue;
        }
        match run_flow(&service, &mut io::stdin().lock()) {
            Ok((key, username)) => {
                write_session_key(&mut doc, &service.name, &key)?;
                updated = true;
                println!("Authorized {} as {username}", service.name);
            }
            Err(err) => eprintln!("encore: {}: authorization failed: {err}", service.name),
        }
    }

    if updated {
        fs::write(config_path, doc.to_string())
            .with_context(|| format!("cannot update configuration at {}", config_path.display()))?;
    }
    Ok(())
}

/// One service's token dance. Reads the confirmation keypress from `input`
/// so the flow is drivable in tests.
fn run_flow(service: &ResolvedService, input: &mut impl BufRead) -> Result<(String, String)> {
    let client = AudioscrobblerClient::new(service.clone());
    let token = client.request_token()?;
    println!("{}", auth_request_url(service, &token)?);
    print!("Press <Enter> after visiting the link and allowing access...");
    io::stdout().flush().ok();
    input.read_line(&mut String::new()).context("cannot read confirmation")?;

    let session = client.request_session(&token)?;
    Ok((session.key, session.username))
}

fn auth_request_url(service: &ResolvedService, token: &str) -> Result<String> {
    let Some(auth_url) = &service.auth_url else {
        bail!("{}: no auth_url configured", service.name);
    };
    Ok(format!(
        "{auth_url}?api_key={}&token={}",
        urlencoding::encode(&service.api_key),
        urlencoding::encode(token)
    ))
}

/// Set `session_key` on the matching `[[services]]` table, leaving the rest
/// of the document untouched.
fn write_session_key(doc: &mut DocumentMut, service: &str, key: &str) -> Result<()> {
    let tables = doc
        .get_mut("services")
        .and_then(|item| item.as_array_of_tables_mut())
        .context("no [[services]] tables in configuration")?;
    for table in tables.iter_mut() {
        if table.get("name").and_then(|item| item.as_str()) == Some(service) {
            table["session_key"] = toml_edit::value(key);
            return Ok(());
        }
    }
    bail!("service {service} not found in configuration");
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# my scrobblers
api_key = "k"
shared_secret = "s"

[[services]]
name = "lastfm" # the big one
api_url = "https://ws.audioscrobbler.com/2.0/"
auth_url = "https://www.last.fm/api/auth/"
"#;

    #[test]
    fn session_key_is_written_in_place() {
        let mut doc: DocumentMut = SAMPLE.parse().unwrap();
        write_session_key(&mut doc, "lastfm", "TEST_SK").unwrap();
        let out = doc.to_string();
        assert!(out.contains("session_key = \"TEST_SK\""));
        // Comments and existing layout survive the edit.
        assert!(out.contains("# my scrobblers"));
        assert!(out.contains("# the big one"));
        // And the result still parses as a valid configuration.
        let config = Config::parse(&out).unwrap();
        assert_eq!(
            config.services[0].session_key.as_deref(),
            Some("TEST_SK")
        );
    }

    #[test]
    fn unknown_service_is_an_error() {
        let mut doc: DocumentMut = SAMPLE.parse().unwrap();
        assert!(write_session_key(&mut doc, "librefm", "x").is_err());
    }

    #[test]
    fn auth_url_is_escaped() {
        let service = ResolvedService {
            name: "lastfm".to_string(),
            api_url: "https://ws.audioscrobbler.com/2.0/".to_string(),
            auth_url: Some("https://www.last.fm/api/auth/".to_string()),
            api_key: "a key".to_string(),
            shared_secret: "s".to_string(),
            session_key: None,
            now_playing: true,
        };
        let url = auth_request_url(&service, "t/ok").unwrap();
        assert_eq!(
            url,
            "https://www.last.fm/api/auth/?api_key=a%20key&token=t%2Fok"
        );
    }
}
