#![warn(missing_docs)]

//! The s3fuse filesystem layer: the object model, the caches between the
//! POSIX surface and the store, and the facade the FUSE binding drives.

/// Path → object cache with TTL and single-flight fetch.
pub mod cache;
/// Read-only per-process context (config, provider, volume key).
pub mod context;
/// Directory listing over the paged bucket-listing API.
pub mod directory;
/// Chunked upload/download between scratch files and the store.
pub mod file_transfer;
/// The filesystem facade.
pub mod fs;
/// Custom header names and reserved attribute names.
pub mod metadata;
/// Remote objects and the metadata-commit protocol.
pub mod object;
/// Open-file table and the write-back cache state machine.
pub mod open_file;
/// Extended-attribute model.
pub mod xattr;

pub use context::FsContext;
pub use fs::{FileSystem, Hints};
pub use object::{Object, ObjectStat, ObjectType};
