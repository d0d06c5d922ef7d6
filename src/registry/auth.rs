//! Registry authentication
//!
//! Parses `WWW-Authenticate` challenges from the `/v2/` endpoint and builds
//! the token scopes and `Authorization` values the client sends.

use crate::config::Credentials;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An authentication scheme offered by a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Bearer { realm: String, service: Option<String> },
    Basic { realm: Option<String> },
}

/// Repository action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pull,
    Push,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
        }
    }
}

/// `repository:<name>:<actions>`
pub fn scope(repository: &str, actions: &[Action]) -> String {
    let actions: Vec<&str> = actions.iter().map(|a| a.as_str()).collect();
    format!("repository:{}:{}", repository, actions.join(","))
}

/// Token endpoint response
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub issued_at: Option<String>,
}

impl TokenResponse {
    /// `token` wins; OAuth servers only set `access_token`
    pub fn into_token(self) -> Option<String> {
        [self.token, self.access_token]
            .into_iter()
            .find(|t| !t.is_empty())
    }
}

/// Parse every challenge of a `WWW-Authenticate` header value
pub fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges = Vec::new();
    let mut rest = header.trim();
    while !rest.is_empty() {
        let (scheme, after) = match rest.find(char::is_whitespace) {
            Some(i) => (&rest[..i], rest[i..].trim_start()),
            None => (rest, ""),
        };
        let (params, remaining) = parse_params(after);
        rest = remaining.trim_start_matches([',', ' ']);

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => {
                if let Some(realm) = params.get("realm") {
                    challenges.push(Challenge::Bearer {
                        realm: realm.clone(),
                        service: params.get("service").cloned(),
                    });
                }
            }
            "basic" => challenges.push(Challenge::Basic {
                realm: params.get("realm").cloned(),
            }),
            _ => {}
        }
    }
    challenges
}

/// Read `key=value` pairs until the next scheme token
fn parse_params(input: &str) -> (BTreeMap<String, String>, &str) {
    let mut params = BTreeMap::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches([',', ' ']);
        let Some(eq) = rest.find('=') else {
            return (params, rest);
        };
        let key = &rest[..eq];
        if key.contains(char::is_whitespace) || key.is_empty() {
            return (params, rest);
        }
        let after = &rest[eq + 1..];
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"').unwrap_or(quoted.len());
                (&quoted[..end], quoted.get(end + 1..).unwrap_or(""))
            }
            None => {
                let end = after.find([',', ' ']).unwrap_or(after.len());
                (&after[..end], &after[end..])
            }
        };
        params.insert(key.to_ascii_lowercase(), value.to_string());
        rest = remaining;
    }
}

/// `Basic` header value when a username is configured
pub fn basic_authorization(creds: &Credentials) -> Option<String> {
    if creds.username.is_empty() {
        return None;
    }
    let encoded = STANDARD.encode(format!("{}:{}", creds.username, creds.password));
    Some(format!("Basic {}", encoded))
}
