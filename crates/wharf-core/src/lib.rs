//! # Wharf Core
//!
//! `wharf_core` defines the registry interface shared by every
//! implementation in this workspace — the remote HTTP client, the in-memory
//! store, the HTTP server, and the composing adapters — together with the
//! identifier grammar, the wire request taxonomy, and the error taxonomy of
//! the [OCI distribution
//! spec](https://github.com/opencontainers/distribution-spec).
//!
//! The primary set of interoperability types can be found in the
//! [`crate::registry`] module.
pub mod errors;
pub use errors::{DistributionErrorCode, Error, ErrorInfo, ErrorResponse, RegistryError, Result};

mod oci_digest;
pub use oci_digest::{Digester, OciDigest};

pub mod model;
pub use model::{Descriptor, Index, Manifest, RepositoryList, TagList};

pub mod reference;
pub use reference::{ManifestRef, Reference};

pub mod registry;
pub use registry::{Blob, BlobWriter, ByteStream, EntryStream, Registry};

mod stream;
pub use stream::{verify_stream, VerifyingStream};

pub mod wire;
