//! Durable storage for finished batch artifacts.
//!
//! The dispatch engine only sees the [`ArtifactStore`] trait
//! (`store(local file, key) -> locator`). Two backends are provided:
//!
//! - [`S3ArtifactStore`] -- Amazon S3 or any S3-compatible endpoint.
//! - [`LocalArtifactStore`] -- a directory tree, for development and tests.

pub mod config;
pub mod key;
pub mod local;
pub mod s3;
pub mod store;

pub use config::{build_store, StorageConfig};
pub use key::object_key;
pub use local::LocalArtifactStore;
pub use s3::S3ArtifactStore;
pub use store::{ArtifactStore, StorageError};
