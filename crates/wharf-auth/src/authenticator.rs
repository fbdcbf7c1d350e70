//! Challenge-driven token acquisition and request authorization.
//!
//! One [`Authenticator`] owns the auth state for every registry host the
//! process talks to: cached access tokens with their granted scopes, the
//! current refresh token, basic credentials, and the last challenge seen.
//! Requests flow through [`Authenticator::execute`], which injects the best
//! available `Authorization` header, reacts to 401 challenges by acquiring
//! a token from the challenge realm, and retries exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::challenge::{parse_challenge, Challenge};
use crate::config::CredentialSource;
use crate::context::ambient_scope;
use crate::errors::{Error, Result};
use crate::scope::Scope;

// https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
// gives the default as 60 seconds
const DEFAULT_TOKEN_EXPIRY: u64 = 60;
// treat anything expiring within this window as already expired
const EXPIRY_SLACK: Duration = Duration::from_secs(1);
// pre-seeded access tokens from configuration never expire on our side
const STATIC_TOKEN_LIFETIME: u64 = 10 * 365 * 24 * 60 * 60;

const CLIENT_ID: &str = "wharf";

struct ScopedToken {
    token: String,
    scope: Scope,
    expires_at: Instant,
}

#[derive(Default)]
struct HostAuth {
    loaded: bool,
    basic: Option<(String, String)>,
    refresh_token: Option<String>,
    access_tokens: Vec<ScopedToken>,
    challenge: Option<Challenge>,
}

impl HostAuth {
    fn evict_expired(&mut self) {
        let deadline = Instant::now() + EXPIRY_SLACK;
        self.access_tokens.retain(|t| t.expires_at > deadline);
    }

    fn find_token(&self, required: &Scope) -> Option<String> {
        self.access_tokens
            .iter()
            .find(|t| t.scope.contains(required))
            .map(|t| t.token.clone())
    }

    fn bearer_challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref().filter(|c| c.is_bearer())
    }

    fn basic_challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref().filter(|c| !c.is_bearer())
    }
}

enum AuthChoice {
    Bearer(String),
    Basic(String, String),
    None,
}

pub struct Authenticator {
    http: reqwest::Client,
    creds: Arc<dyn CredentialSource>,
    hosts: StdMutex<HashMap<String, Arc<Mutex<HostAuth>>>>,
}

impl Authenticator {
    pub fn new(http: reqwest::Client, creds: Arc<dyn CredentialSource>) -> Self {
        Self {
            http,
            creds,
            hosts: StdMutex::new(HashMap::new()),
        }
    }

    /// Send `req`, authorizing it for `required` scope. The ambient scope of
    /// the current task widens the scope tokens are requested for, without
    /// widening what a cached token must already satisfy.
    ///
    /// A 401 carrying a parseable challenge triggers token acquisition (or
    /// basic auth) and a single resend. A second 401 right after a fresh
    /// token was granted means the credentials are good but the access is
    /// not: it surfaces as a denied error so callers can tell authorization
    /// failures from authentication ones.
    pub async fn execute(
        &self,
        mut req: reqwest::Request,
        required: &Scope,
    ) -> Result<reqwest::Response> {
        let host = host_key(req.url());
        let desired = required.union(&ambient_scope());
        let state = self.host_state(&host);

        let choice = {
            let mut st = state.lock().await;
            self.ensure_loaded(&mut st, &host).await?;
            st.evict_expired();
            if let Some(token) = st.find_token(required) {
                AuthChoice::Bearer(token)
            } else if st.bearer_challenge().is_some() && st.refresh_token.is_some() {
                let token = self.acquire(&mut st, &desired, required).await?;
                AuthChoice::Bearer(token)
            } else if let (Some(_), Some((user, pass))) = (st.basic_challenge(), &st.basic) {
                AuthChoice::Basic(user.clone(), pass.clone())
            } else {
                AuthChoice::None
            }
        };

        let retry_req = req.try_clone();
        match &choice {
            AuthChoice::Bearer(token) => set_bearer(&mut req, token),
            AuthChoice::Basic(user, pass) => set_basic(&mut req, user, pass),
            AuthChoice::None => {}
        }

        let resp = self.http.execute(req).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);
        let Some(challenge) = challenge else {
            tracing::debug!(host = %host, "401 without a parseable Www-Authenticate challenge");
            return Ok(resp);
        };
        let Some(mut retry) = retry_req else {
            // the body was not replayable; surface the 401 as-is
            return Ok(resp);
        };

        if challenge.is_bearer() {
            let challenge_scope = challenge
                .scope
                .as_deref()
                .map(Scope::parse)
                .unwrap_or_default();
            let acquire_scope = required.union(&desired).union(&challenge_scope);
            let token = {
                let mut st = state.lock().await;
                st.challenge = Some(challenge);
                self.acquire(&mut st, &acquire_scope, required).await?
            };
            set_bearer(&mut retry, &token);
            let resp = self.http.execute(retry).await?;
            if resp.status() == StatusCode::UNAUTHORIZED {
                // the token is fresh, so this 401 is really an authorization
                // failure; some servers misuse 401 for it
                return Err(Error::Denied { host });
            }
            return Ok(resp);
        }

        let basic = {
            let mut st = state.lock().await;
            st.challenge = Some(challenge);
            st.basic.clone()
        };
        if let Some((user, pass)) = basic {
            set_basic(&mut retry, &user, &pass);
            return Ok(self.http.execute(retry).await?);
        }
        Ok(resp)
    }

    fn host_state(&self, host: &str) -> Arc<Mutex<HostAuth>> {
        let mut hosts = self.hosts.lock().expect("host map lock is never poisoned");
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostAuth::default())))
            .clone()
    }

    /// Populate credentials for a host, at most once per process lifetime.
    async fn ensure_loaded(&self, st: &mut HostAuth, host: &str) -> Result<()> {
        if st.loaded {
            return Ok(());
        }
        let creds = self.creds.credentials(host).await?;
        if let (Some(user), Some(pass)) = (&creds.username, &creds.password) {
            st.basic = Some((user.clone(), pass.clone()));
        }
        st.refresh_token = creds.refresh_token;
        if let Some(token) = creds.access_token {
            st.access_tokens.push(ScopedToken {
                token,
                scope: Scope::unlimited(),
                expires_at: Instant::now() + Duration::from_secs(STATIC_TOKEN_LIFETIME),
            });
        }
        st.loaded = true;
        Ok(())
    }

    /// Acquire a token for `scope` from the challenge realm, retrying with
    /// exactly `required` when the server refuses the wider grant.
    async fn acquire(
        &self,
        st: &mut HostAuth,
        scope: &Scope,
        required: &Scope,
    ) -> Result<String> {
        match self.acquire_scoped(st, scope).await {
            Err(Error::TokenEndpoint { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16() && scope != required =>
            {
                // some servers refuse scopes exceeding the authenticated
                // user's grant instead of narrowing them
                tracing::debug!(%scope, %required, "token server refused superset scope, retrying with required scope");
                self.acquire_scoped(st, required).await
            }
            other => other,
        }
    }

    async fn acquire_scoped(&self, st: &mut HostAuth, scope: &Scope) -> Result<String> {
        let challenge = st.challenge.clone().ok_or(Error::MissingRealm)?;
        let realm = challenge.realm.clone().ok_or(Error::MissingRealm)?;

        let resp = if let Some(refresh_token) = &st.refresh_token {
            let resp = self
                .oauth_post(&realm, challenge.service.as_deref(), refresh_token, scope)
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                // older token servers only implement the GET flow
                self.token_get(&realm, challenge.service.as_deref(), st, scope)
                    .await?
            } else {
                resp
            }
        } else {
            self.token_get(&realm, challenge.service.as_deref(), st, scope)
                .await?
        };

        if !resp.status().is_success() {
            return Err(Error::TokenEndpoint {
                realm,
                status: resp.status().as_u16(),
            });
        }

        let parsed: TokenResponse = resp.json().await?;
        let token = match (parsed.token, parsed.access_token) {
            (Some(t), _) if !t.is_empty() => t,
            (_, Some(t)) if !t.is_empty() => t,
            _ => return Err(Error::MissingToken),
        };
        if let Some(refresh) = parsed.refresh_token {
            if !refresh.is_empty() {
                st.refresh_token = Some(refresh);
            }
        }
        let expires_in = parsed.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY);
        st.access_tokens.push(ScopedToken {
            token: token.clone(),
            scope: scope.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        tracing::debug!(%scope, expires_in, "acquired registry token");
        Ok(token)
    }

    async fn oauth_post(
        &self,
        realm: &str,
        service: Option<&str>,
        refresh_token: &str,
        scope: &Scope,
    ) -> Result<reqwest::Response> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", CLIENT_ID.to_string()),
        ];
        if let Some(service) = service {
            form.push(("service", service.to_string()));
        }
        if !scope.is_empty() {
            form.push(("scope", scope.to_string()));
        }
        Ok(self.http.post(realm).form(&form).send().await?)
    }

    async fn token_get(
        &self,
        realm: &str,
        service: Option<&str>,
        st: &HostAuth,
        scope: &Scope,
    ) -> Result<reqwest::Response> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(service) = service {
            query.push(("service", service.to_string()));
        }
        // one scope parameter per whitespace-separated token
        for token in scope.to_string().split_whitespace() {
            query.push(("scope", token.to_string()));
        }
        let mut req = self.http.get(realm).query(&query);
        if let Some((user, pass)) = &st.basic {
            req = req.basic_auth(user, Some(pass.clone()));
        }
        Ok(req.send().await?)
    }
}

fn host_key(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn set_bearer(req: &mut reqwest::Request, token: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        req.headers_mut().insert(AUTHORIZATION, value);
    }
}

fn set_basic(req: &mut reqwest::Request, user: &str, pass: &str) {
    let encoded = BASE64.encode(format!("{user}:{pass}"));
    if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
        req.headers_mut().insert(AUTHORIZATION, value);
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_response_accepts_either_field() {
        let t: TokenResponse =
            serde_json::from_str(r#"{"token": "T", "expires_in": 300}"#).unwrap();
        assert_eq!(t.token.as_deref(), Some("T"));
        assert_eq!(t.expires_in, Some(300));

        let t: TokenResponse = serde_json::from_str(r#"{"access_token": "A"}"#).unwrap();
        assert_eq!(t.access_token.as_deref(), Some("A"));
        assert_eq!(t.expires_in, None);
    }

    #[test]
    fn host_keys_carry_explicit_ports() {
        let url = reqwest::Url::parse("http://registry.example.com:5000/v2/").unwrap();
        assert_eq!(host_key(&url), "registry.example.com:5000");
        let url = reqwest::Url::parse("https://registry.example.com/v2/").unwrap();
        assert_eq!(host_key(&url), "registry.example.com");
    }

    #[test]
    fn expired_tokens_are_evicted_conservatively() {
        let mut st = HostAuth::default();
        st.access_tokens.push(ScopedToken {
            token: "soon".into(),
            scope: Scope::empty(),
            expires_at: Instant::now() + Duration::from_millis(500),
        });
        st.access_tokens.push(ScopedToken {
            token: "later".into(),
            scope: Scope::empty(),
            expires_at: Instant::now() + Duration::from_secs(30),
        });
        st.evict_expired();
        assert_eq!(st.access_tokens.len(), 1);
        assert_eq!(st.access_tokens[0].token, "later");
    }

    #[test]
    fn token_lookup_is_first_match_by_scope() {
        let mut st = HostAuth::default();
        st.access_tokens.push(ScopedToken {
            token: "narrow".into(),
            scope: Scope::parse("repository:foo:pull"),
            expires_at: Instant::now() + Duration::from_secs(30),
        });
        st.access_tokens.push(ScopedToken {
            token: "wide".into(),
            scope: Scope::parse("repository:foo:pull,push"),
            expires_at: Instant::now() + Duration::from_secs(30),
        });
        assert_eq!(
            st.find_token(&Scope::parse("repository:foo:pull")),
            Some("narrow".into())
        );
        assert_eq!(
            st.find_token(&Scope::parse("repository:foo:push")),
            Some("wide".into())
        );
        assert_eq!(st.find_token(&Scope::parse("repository:bar:pull")), None);
    }
}
