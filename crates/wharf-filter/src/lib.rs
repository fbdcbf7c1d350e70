//! # Wharf Filter
//!
//! Adapters that compose registries through the registry interface alone:
//!
//! * [`Sub`] exposes a registry under a repository prefix,
//! * [`ReadOnly`] strips write and delete capabilities,
//! * [`Immutable`] allows pushes but forbids overwriting anything,
//! * [`Unify`] presents two registries as one.
//!
//! Each adapter holds an `Arc<dyn Registry>` and delegates what it supports;
//! everything else falls through to the interface's default unsupported
//! bodies.

mod immutable;
mod read_only;
mod sub;
mod unify;

pub use immutable::Immutable;
pub use read_only::ReadOnly;
pub use sub::Sub;
pub use unify::Unify;
