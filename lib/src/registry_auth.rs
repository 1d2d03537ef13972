//! Registry authentication: WWW-Authenticate challenge parsing and a shared,
//! thread-safe bearer-token cache keyed by (service, scope).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::{Context, ContextCompat};
use color_eyre::Result;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Authentication;

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The token endpoint to request a bearer token from.
    pub realm: String,
    /// The service the token is scoped to.
    pub service: String,
    /// The resource scope the token is requested for (e.g. `repository:lib/ubuntu:pull`).
    pub scope: Option<String>,
}

/// Parse a `WWW-Authenticate` header value of the form
/// `Bearer realm="...",service="...",scope="..."`.
pub fn parse_challenge(header: &str) -> Result<Challenge> {
    let rest = header
        .strip_prefix("Bearer ")
        .with_context(|| format!("not a Bearer challenge: {header}"))?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    for part in split_challenge_params(rest) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match key {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(Challenge {
        realm: realm.with_context(|| format!("missing realm in challenge: {header}"))?,
        service: service.with_context(|| format!("missing service in challenge: {header}"))?,
        scope,
    })
}

/// Split `key="value with, commas",key2=val2` on top-level commas, respecting
/// quoted substrings so a scope like `repository:a,b:pull` cannot split a
/// quoted value in half (registries do not quote unquoted scopes, but being
/// defensive here costs nothing).
fn split_challenge_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token)
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Default token lifetime assumed when a registry does not report `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Shared bearer/basic auth for one host: caches tokens per (service, scope)
/// behind a lock so concurrent layer fetches/uploads reuse a single token
/// request instead of each re-authenticating.
pub struct RegistryAuth {
    client: Client,
    authentication: Authentication,
    cache: Mutex<HashMap<(String, String), CachedToken>>,
}

impl RegistryAuth {
    /// Build a new cache for the given client and credentials.
    pub fn new(client: Client, authentication: Authentication) -> Arc<Self> {
        Arc::new(Self {
            client,
            authentication,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a bearer token for the given challenge, using the cache if a
    /// non-expired token for the same (service, scope) pair is already held.
    pub async fn token_for(&self, challenge: &Challenge) -> Result<String> {
        let scope = challenge.scope.clone().unwrap_or_default();
        let key = (challenge.service.clone(), scope.clone());

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.expires_at > Instant::now() {
                    debug!(service = %challenge.service, %scope, "reusing cached registry token");
                    return Ok(cached.token.clone());
                }
            }
        }

        let (token, ttl) = self.request_token(challenge).await?;

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(token)
    }

    async fn request_token(&self, challenge: &Challenge) -> Result<(String, Duration)> {
        let mut req = self
            .client
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str())]);
        if let Some(scope) = &challenge.scope {
            req = req.query(&[("scope", scope.as_str())]);
        }
        if let Authentication::Basic { username, password } = &self.authentication {
            req = req.basic_auth(username, Some(password));
        }

        let response = req
            .send()
            .await
            .context("send token request")?
            .error_for_status()
            .context("token request returned an error status")?;

        let parsed: TokenResponse = response.json().await.context("parse token response")?;
        let ttl = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        let token = parsed
            .into_token()
            .context("token response had neither `token` nor `access_token`")?;
        Ok((token, ttl))
    }

    /// Authorization header value to use for a direct (non-bearer) request,
    /// when basic auth was configured and no challenge has been seen yet.
    pub fn basic_auth_header(&self) -> Option<(String, String)> {
        match &self.authentication {
            Authentication::Basic { username, password } => {
                Some((username.clone(), password.clone()))
            }
            Authentication::None => None,
        }
    }
}
