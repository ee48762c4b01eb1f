//! Tideline Migration Library
//!
//! Filesystem and process collaborators for the Tideline lifecycle engine.
//! The CLI tool (main.rs) uses this library.

pub mod error;
pub mod render;
pub mod runner;
pub mod source;
pub mod store;

pub use error::FileError;
pub use runner::{CommandRunner, UnconfiguredRunner};
pub use source::DirectoryArtifactSource;
pub use store::JsonFileRecordStore;
