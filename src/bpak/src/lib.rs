//! BPAK ("Bit Packer"): a container format and toolkit for producing,
//! transporting, and verifying firmware-update archives.
//!
//! An archive bundles one or more opaque binary parts together with typed
//! metadata (keys, salts, version strings, hashes) and a signature over
//! the whole. See [`package::Package`] for the primary entry point.

pub mod error;
pub mod hash;
pub mod header;
pub mod id;
pub mod io;
pub mod limits;
pub mod merkle;
pub mod package;
pub mod transport;

pub use error::{Error, Result};
pub use header::{Header, HeaderLocation};
pub use id::stable_hash;
pub use limits::{HashKind, Limits, PartFlags, SignatureKind};
pub use package::Package;
