//! Content digests for the ark object store.
//!
//! Digests identify content (the manifest key of a stored file) and provide
//! fixity values for cross-checking integrity. All digests are rendered as
//! lowercase hex.
//!
//! - [`DigestAlgorithm`] -- the supported algorithms and their names
//! - [`Digester`] -- one incremental hasher
//! - [`MultiDigester`] -- several hashers fed from a single pass over the data
//!
//! All crypto operations wrap established libraries.

pub mod algorithm;
pub mod digester;

pub use algorithm::{DigestAlgorithm, DigestError};
pub use digester::{digest_hex, DigestSet, Digester, MultiDigester};
