//! Blob storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Implementations: local disk, in-memory, and S3.

pub mod backend;
pub mod local;
pub mod memory;
pub mod s3;
pub mod signing;

#[cfg(test)]
pub(crate) mod testing;
