//! Names of the custom headers that carry POSIX metadata, and the related
//! reserved xattr names.
//!
//! On the wire every name below is prefixed with the provider's metadata
//! prefix (`x-amz-meta-` or `x-goog-meta-`).

/// Prefix reserved for the daemon's own keys; never writable through the
/// xattr interface.
pub const RESERVED_PREFIX: &str = "s3fuse-";

/// POSIX mode bits, octal with a leading `0`, file-type bits excluded.
pub const MODE: &str = "s3fuse-mode";
/// Owner uid, decimal.
pub const UID: &str = "s3fuse-uid";
/// Owner gid, decimal.
pub const GID: &str = "s3fuse-gid";
/// Modification time, seconds since the epoch, decimal.
pub const MTIME: &str = "s3fuse-mtime";
/// The etag observed when the mtime was last written.
pub const MTIME_ETAG: &str = "s3fuse-mtime-etag";
/// Quoted lowercase hex MD5 of the body.
pub const MD5: &str = "s3fuse-md5";
/// The etag observed when the MD5 was last written.
pub const MD5_ETAG: &str = "s3fuse-md5-etag";
/// Base64 AES-CTR IV; present only on encrypted files.
pub const ENCRYPTION_IV: &str = "s3fuse-encryption-iv";
/// Base64 wrapped data key; present only on encrypted files.
pub const ENCRYPTION_KEY: &str = "s3fuse-encryption-key";

/// Read-only xattr surfacing the object's content type.
pub const XATTR_CONTENT_TYPE: &str = "__content_type__";
/// Read-only xattr surfacing the object's etag.
pub const XATTR_ETAG: &str = "__etag__";
/// Read-only xattr surfacing the object's body MD5.
pub const XATTR_MD5: &str = "__md5__";

/// The xattr namespace callers use; stripped on ingress, prepended on egress.
pub const XATTR_USER_PREFIX: &str = "user.";

/// Content type marking symlink objects; the body holds the target.
pub const SYMLINK_CONTENT_TYPE: &str = "text/symlink";
/// Content type marking (fake) fifo objects.
pub const FIFO_CONTENT_TYPE: &str = "application/x-s3fuse-fifo";

/// Stat block size; `st_blocks` counts units of this.
pub const BLOCK_SIZE: u64 = 512;
