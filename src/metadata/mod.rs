//! Metadata storage layer.
//!
//! The metadata store is the source of truth for which resources exist and
//! which blob keys they reference.  The [`store::MetadataStore`] trait
//! defines the interface; [`sqlite::SqliteMetadataStore`] is the default
//! implementation.

pub mod sqlite;
pub mod store;
