//! Per-host credential resolution from docker-style configuration.
//!
//! Lookup covers the `auths` map of the first configuration file found
//! (`$DOCKER_CONFIG/config.json`, then `$HOME/.docker/config.json`, then
//! `$XDG_RUNTIME_DIR/containers/auth.json`), plus `credsStore` /
//! `credHelpers` external helper programs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::{Error, Result};

/// Credentials resolved for a registry host. Either a refresh token, or a
/// username/password pair, or nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.refresh_token.is_none()
            && self.access_token.is_none()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }
}

/// Anything that can resolve credentials for a host. The authenticator
/// consults this at most once per host per process.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self, host: &str) -> Result<Credentials>;
}

/// A source with no credentials for any host.
#[derive(Clone, Copy, Debug, Default)]
pub struct Anonymous;

#[async_trait]
impl CredentialSource for Anonymous {
    async fn credentials(&self, _host: &str) -> Result<Credentials> {
        Ok(Credentials::default())
    }
}

/// Fixed per-host credentials, mostly for tests and embedded use.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    hosts: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: impl Into<String>, creds: Credentials) -> Self {
        self.hosts.insert(host.into(), creds);
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credentials(&self, host: &str) -> Result<Credentials> {
        Ok(self.hosts.get(host).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

impl AuthEntry {
    fn resolve(&self) -> Result<Credentials> {
        let mut creds = Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            refresh_token: self.identity_token.clone(),
            access_token: None,
        };
        if let Some(auth) = &self.auth {
            let decoded = BASE64
                .decode(auth.trim())
                .map_err(|e| Error::InvalidConfig(format!("invalid auth field: {e}")))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| Error::InvalidConfig("auth field is not UTF-8".into()))?;
            let (user, pass) = decoded
                .split_once(':')
                .ok_or_else(|| Error::InvalidConfig("auth field has no colon".into()))?;
            creds.username = Some(user.to_string());
            // some tooling pads the password with trailing NULs
            creds.password = Some(pass.trim_end_matches('\0').to_string());
        }
        if creds.refresh_token.is_some() && creds.username.is_some() {
            return Err(Error::InvalidConfig(
                "auth entry carries both an identity token and a username".into(),
            ));
        }
        Ok(creds)
    }
}

enum HostEntry {
    /// The host appeared literally as an `auths` key.
    Explicit(AuthEntry),
    /// The host was derived from one or more URL-shaped keys. More than one
    /// distinct source makes lookups for the host ambiguous.
    ByUrl(Vec<(String, AuthEntry)>),
}

/// Resolves credentials the way docker-compatible tooling does.
pub struct DockerConfig {
    hosts: HashMap<String, HostEntry>,
    creds_store: Option<String>,
    cred_helpers: HashMap<String, String>,
    helper: Arc<dyn CredentialHelper>,
}

impl DockerConfig {
    /// Load the first configuration file present in the standard location
    /// chain. Absence of any file yields an empty configuration.
    pub fn load() -> Result<Self> {
        Self::load_with_helper(Arc::new(ExecHelper))
    }

    pub fn load_with_helper(helper: Arc<dyn CredentialHelper>) -> Result<Self> {
        for path in Self::candidate_paths() {
            match std::fs::read(&path) {
                Ok(contents) => {
                    tracing::debug!(path = %path.display(), "loading registry auth config");
                    return Self::from_slice(&contents, helper);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self::empty(helper))
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            if !dir.is_empty() {
                paths.push(PathBuf::from(dir).join("config.json"));
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            if !home.is_empty() {
                paths.push(PathBuf::from(home).join(".docker").join("config.json"));
            }
        }
        if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
            if !dir.is_empty() {
                paths.push(PathBuf::from(dir).join("containers").join("auth.json"));
            }
        }
        paths
    }

    fn empty(helper: Arc<dyn CredentialHelper>) -> Self {
        Self {
            hosts: HashMap::new(),
            creds_store: None,
            cred_helpers: HashMap::new(),
            helper,
        }
    }

    pub fn from_slice(contents: &[u8], helper: Arc<dyn CredentialHelper>) -> Result<Self> {
        let file: ConfigFile = serde_json::from_slice(contents)?;
        let mut hosts: HashMap<String, HostEntry> = HashMap::new();

        for (key, entry) in &file.auths {
            if let Some(host) = url_key_host(key) {
                match hosts.entry(host) {
                    std::collections::hash_map::Entry::Occupied(mut o) => {
                        if let HostEntry::ByUrl(sources) = o.get_mut() {
                            sources.push((key.clone(), entry.clone()));
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(v) => {
                        v.insert(HostEntry::ByUrl(vec![(key.clone(), entry.clone())]));
                    }
                }
            }
        }
        // explicit host keys shadow URL-derived ones
        for (key, entry) in &file.auths {
            if url_key_host(key).is_none() {
                hosts.insert(key.clone(), HostEntry::Explicit(entry.clone()));
            }
        }

        Ok(Self {
            hosts,
            creds_store: file.creds_store,
            cred_helpers: file.cred_helpers,
            helper,
        })
    }

    fn auths_lookup(&self, host: &str) -> Result<Credentials> {
        match self.hosts.get(host) {
            None => Ok(Credentials::default()),
            Some(HostEntry::Explicit(entry)) => entry.resolve(),
            Some(HostEntry::ByUrl(sources)) => {
                if sources.len() > 1 {
                    return Err(Error::AmbiguousConfig {
                        host: host.to_string(),
                        sources: sources.iter().map(|(k, _)| k.clone()).collect(),
                    });
                }
                sources[0].1.resolve()
            }
        }
    }
}

#[async_trait]
impl CredentialSource for DockerConfig {
    async fn credentials(&self, host: &str) -> Result<Credentials> {
        // a helper configured for this specific host is authoritative
        if let Some(helper_name) = self.cred_helpers.get(host) {
            return match self.helper.get(helper_name, host).await? {
                HelperOutcome::Found(creds) => Ok(creds),
                HelperOutcome::NotFound => Ok(Credentials::default()),
                HelperOutcome::NotInstalled => {
                    Err(Error::HelperNotInstalled(helper_name.clone()))
                }
            };
        }
        // the default store falls through to `auths` when it has nothing
        if let Some(store) = &self.creds_store {
            match self.helper.get(store, host).await? {
                HelperOutcome::Found(creds) => return Ok(creds),
                HelperOutcome::NotFound | HelperOutcome::NotInstalled => {}
            }
        }
        self.auths_lookup(host)
    }
}

/// Host component of a `scheme://host/path` shaped key, if it is one.
fn url_key_host(key: &str) -> Option<String> {
    let rest = key.strip_prefix("https://").or_else(|| key.strip_prefix("http://"))?;
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return None;
    }
    Some(host.to_string())
}

pub enum HelperOutcome {
    Found(Credentials),
    NotFound,
    NotInstalled,
}

/// Seam for invoking `docker-credential-<name>` helper programs.
#[async_trait]
pub trait CredentialHelper: Send + Sync {
    async fn get(&self, helper: &str, host: &str) -> Result<HelperOutcome>;
}

/// Invokes helpers as subprocesses: `docker-credential-<name> get` with the
/// host on stdin and JSON `{Username, Secret}` on stdout.
pub struct ExecHelper;

#[derive(Deserialize)]
struct HelperReply {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

#[async_trait]
impl CredentialHelper for ExecHelper {
    async fn get(&self, helper: &str, host: &str) -> Result<HelperOutcome> {
        let program = format!("docker-credential-{helper}");
        let mut child = match Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HelperOutcome::NotInstalled);
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(host.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stdout);
            if message.to_lowercase().contains("not found") {
                return Ok(HelperOutcome::NotFound);
            }
            return Err(Error::Helper {
                helper: helper.to_string(),
                message: message.trim().to_string(),
            });
        }
        let reply: HelperReply = serde_json::from_slice(&output.stdout)?;
        let creds = if reply.username == "<token>" {
            Credentials {
                refresh_token: Some(reply.secret),
                ..Default::default()
            }
        } else {
            Credentials::basic(reply.username, reply.secret)
        };
        Ok(HelperOutcome::Found(creds))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(json: &str) -> DockerConfig {
        DockerConfig::from_slice(json.as_bytes(), Arc::new(NoHelper)).unwrap()
    }

    struct NoHelper;

    #[async_trait]
    impl CredentialHelper for NoHelper {
        async fn get(&self, _helper: &str, _host: &str) -> Result<HelperOutcome> {
            Ok(HelperOutcome::NotInstalled)
        }
    }

    #[tokio::test]
    async fn explicit_host_entry() {
        let cfg = config(
            r#"{"auths": {"registry.example.com": {"username": "u", "password": "p"}}}"#,
        );
        let creds = cfg.credentials("registry.example.com").await.unwrap();
        assert_eq!(creds, Credentials::basic("u", "p"));
        assert!(cfg.credentials("other.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auth_field_expands_and_trims_nuls() {
        let auth = BASE64.encode("user:pass\0\0");
        let cfg = config(&format!(
            r#"{{"auths": {{"registry.example.com": {{"auth": "{auth}"}}}}}}"#
        ));
        let creds = cfg.credentials("registry.example.com").await.unwrap();
        assert_eq!(creds, Credentials::basic("user", "pass"));
    }

    #[tokio::test]
    async fn url_shaped_key_registers_under_host() {
        let cfg = config(
            r#"{"auths": {"https://registry.example.com/v1/": {"username": "u", "password": "p"}}}"#,
        );
        let creds = cfg.credentials("registry.example.com").await.unwrap();
        assert_eq!(creds.username.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn explicit_key_shadows_url_key() {
        let cfg = config(
            r#"{"auths": {
                "https://registry.example.com/v1/": {"username": "from-url", "password": "p"},
                "registry.example.com": {"username": "explicit", "password": "p"}
            }}"#,
        );
        let creds = cfg.credentials("registry.example.com").await.unwrap();
        assert_eq!(creds.username.as_deref(), Some("explicit"));
    }

    #[tokio::test]
    async fn conflicting_url_keys_are_ambiguous() {
        let cfg = config(
            r#"{"auths": {
                "https://registry.example.com/v1/": {"username": "a", "password": "p"},
                "http://registry.example.com/v2/": {"username": "b", "password": "p"}
            }}"#,
        );
        match cfg.credentials("registry.example.com").await {
            Err(Error::AmbiguousConfig { host, sources }) => {
                assert_eq!(host, "registry.example.com");
                assert_eq!(sources.len(), 2);
            }
            other => panic!("expected ambiguity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identity_token_with_username_is_rejected() {
        let cfg = config(
            r#"{"auths": {"r.example.com": {"username": "u", "password": "p", "identitytoken": "t"}}}"#,
        );
        assert!(matches!(
            cfg.credentials("r.example.com").await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn per_host_helper_not_installed_is_fatal() {
        let cfg = config(
            r#"{"credHelpers": {"r.example.com": "missing"},
                "auths": {"r.example.com": {"username": "u", "password": "p"}}}"#,
        );
        assert!(matches!(
            cfg.credentials("r.example.com").await,
            Err(Error::HelperNotInstalled(_))
        ));
    }

    #[tokio::test]
    async fn default_store_falls_through_to_auths() {
        let cfg = config(
            r#"{"credsStore": "missing",
                "auths": {"r.example.com": {"username": "u", "password": "p"}}}"#,
        );
        let creds = cfg.credentials("r.example.com").await.unwrap();
        assert_eq!(creds.username.as_deref(), Some("u"));
    }

    #[test]
    fn load_respects_docker_config_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"auths": {"r.example.com": {"username": "u", "password": "p"}}}"#,
        )
        .unwrap();
        // environment mutation is process-wide; this test restores it
        let prev = std::env::var("DOCKER_CONFIG").ok();
        std::env::set_var("DOCKER_CONFIG", dir.path());
        let cfg = DockerConfig::load().unwrap();
        match prev {
            Some(v) => std::env::set_var("DOCKER_CONFIG", v),
            None => std::env::remove_var("DOCKER_CONFIG"),
        }
        assert!(cfg.hosts.contains_key("r.example.com"));
    }
}
