//! # Wharf Auth
//!
//! Authorization for OCI distribution registries: the scope algebra used by
//! token grants, per-host credential resolution from docker-style
//! configuration, `Www-Authenticate` challenge parsing, and the
//! token-exchange authenticator that drives the 401 → token → retry flow.

pub mod errors;
pub use errors::{Error, Result};

pub mod scope;
pub use scope::{ResourceScope, Scope};

pub mod challenge;
pub use challenge::{parse_challenge, Challenge};

pub mod config;
pub use config::{Anonymous, CredentialSource, Credentials, DockerConfig, StaticCredentials};

pub mod context;
pub use context::{ambient_scope, with_ambient_scope, with_ambient_scope_sync};

mod authenticator;
pub use authenticator::Authenticator;
