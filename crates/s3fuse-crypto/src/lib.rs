#![warn(missing_docs)]

//! Cryptographic helpers for s3fuse: digests, request signing, and the
//! AES-CTR file encryption layer.

/// AES-256-CTR with random access into the keystream.
pub mod aes_ctr;
/// MD5 digests in the encodings the store API wants.
pub mod digest;
/// Volume key derivation and data-key wrapping.
pub mod keys;
/// Files that must be private to the owner (credentials, passwords).
pub mod private_file;
/// HMAC-SHA1 request signing.
pub mod sign;

pub use aes_ctr::AesCtr256;
pub use keys::VolumeKey;
