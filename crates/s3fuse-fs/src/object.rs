use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};

use s3fuse_base::error::{Error, Result};
use s3fuse_base::request::{HeaderMap, HttpMethod, Request};
use s3fuse_base::{url, xml};
use s3fuse_crypto::aes_ctr::{AesCtr256, IV_LEN, KEY_LEN};
use s3fuse_crypto::digest;

use crate::context::FsContext;
use crate::metadata;
use crate::xattr::{SetMode, Xattr};

/// What kind of entity an object represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// Plain file.
    File,
    /// Directory (URL carries a trailing slash).
    Directory,
    /// Symbolic link; the body holds the target.
    Symlink,
    /// Fake fifo; open fails with `ENODEV`.
    Fifo,
    /// File whose body is AES-CTR encrypted under a wrapped data key.
    EncryptedFile,
}

impl ObjectType {
    /// The `S_IFMT` bits for this type.
    pub fn mode_bits(self) -> u32 {
        match self {
            ObjectType::File | ObjectType::EncryptedFile => libc::S_IFREG as u32,
            ObjectType::Directory => libc::S_IFDIR as u32,
            ObjectType::Symlink => libc::S_IFLNK as u32,
            ObjectType::Fifo => libc::S_IFIFO as u32,
        }
    }

    /// Whether the body behaves like a regular file's.
    pub fn is_file_like(self) -> bool {
        matches!(self, ObjectType::File | ObjectType::EncryptedFile)
    }
}

/// POSIX-ish attributes, copied out atomically.
#[derive(Debug, Clone, Copy)]
pub struct ObjectStat {
    /// Full mode, file-type bits included.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Link count; always 1 (`find` relies on it).
    pub nlink: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// 512-byte blocks used.
    pub blocks: u64,
}

/// Encryption material for an encrypted file.
struct Encryption {
    iv: [u8; IV_LEN],
    wrapped_key: Vec<u8>,
    /// Present when the volume key could unwrap the data key.
    cipher: Option<AesCtr256>,
}

struct ObjectState {
    stat: ObjectStat,
    content_type: String,
    etag: String,
    mtime_etag: String,
    md5: String,
    md5_etag: String,
    metadata: BTreeMap<String, Xattr>,
    expiry: Option<Instant>,
    intact: bool,
    encryption: Option<Encryption>,
    symlink_target: Option<String>,
}

/// A remote object and its POSIX view.
///
/// Shared behind `Arc` by the cache and any in-flight task; `path`, `url`
/// and the type are immutable, everything else sits behind one mutex.
pub struct Object {
    ctx: Arc<FsContext>,
    path: String,
    url: String,
    object_type: ObjectType,
    state: Mutex<ObjectState>,
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Case-insensitive response-header lookup: the transport hands keys back
/// lowercased, while the documented names are mixed case.
fn header<'a>(headers: &'a HeaderMap, key: &str) -> &'a str {
    if let Some(v) = headers.get(key) {
        return v;
    }
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
        .unwrap_or("")
}

/// `strtol(s, NULL, 0)` semantics: a leading `0` means octal.
fn parse_c_int(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('0') {
        if rest.is_empty() {
            return Some(0);
        }
        u32::from_str_radix(rest, 8).ok()
    } else {
        s.parse().ok()
    }
}

/// `%#o` shape: octal with a leading `0`.
fn format_octal(bits: u32) -> String {
    if bits == 0 {
        "0".to_string()
    } else {
        format!("0{bits:o}")
    }
}

fn file_type_mask() -> u32 {
    libc::S_IFMT as u32
}

fn block_count(size: u64) -> u64 {
    size.div_ceil(metadata::BLOCK_SIZE)
}

impl Object {
    /// Bucket-relative URL for a path; directories carry a trailing slash.
    pub fn build_url(ctx: &FsContext, path: &str, object_type: ObjectType) -> String {
        let mut out = format!("{}/{}", ctx.service.bucket_url(), url::encode(path));
        if object_type == ObjectType::Directory {
            out.push('/');
        }
        out
    }

    /// Creates a local object that does not yet exist in the store.
    ///
    /// The object stays invalid (no expiry) until it has been committed and
    /// refetched; encrypted files get a fresh data key wrapped under the
    /// volume key.
    pub fn create(
        ctx: Arc<FsContext>,
        path: &str,
        object_type: ObjectType,
        mode: Option<u32>,
    ) -> Result<Arc<Self>> {
        let requested = mode.unwrap_or(0) & !file_type_mask();
        let mode_bits = if requested == 0 {
            match object_type {
                ObjectType::Symlink => 0o777,
                _ => ctx.config.default_mode & !file_type_mask(),
            }
        } else {
            requested
        };

        let content_type = match object_type {
            ObjectType::Symlink => metadata::SYMLINK_CONTENT_TYPE.to_string(),
            ObjectType::Fifo => metadata::FIFO_CONTENT_TYPE.to_string(),
            _ => ctx.config.default_content_type.clone(),
        };

        let encryption = if object_type == ObjectType::EncryptedFile {
            let Some(volume_key) = ctx.volume_key.as_ref() else {
                return Err(Error::Denied);
            };
            let (data_key, iv) = s3fuse_crypto::VolumeKey::generate_data_key();
            Some(Encryption {
                iv,
                wrapped_key: volume_key.wrap(&data_key, &iv),
                cipher: Some(AesCtr256::new(data_key, iv)),
            })
        } else {
            None
        };

        let mut state = ObjectState {
            stat: ObjectStat {
                mode: object_type.mode_bits() | mode_bits,
                uid: ctx.config.resolved_uid(),
                gid: ctx.config.resolved_gid(),
                size: 0,
                mtime: now_epoch(),
                nlink: 1,
                blksize: metadata::BLOCK_SIZE as u32,
                blocks: 0,
            },
            content_type,
            etag: String::new(),
            mtime_etag: String::new(),
            md5: String::new(),
            md5_etag: String::new(),
            metadata: BTreeMap::new(),
            expiry: None,
            intact: true,
            encryption,
            symlink_target: None,
        };
        Self::install_reserved_xattrs(&mut state);

        Ok(Arc::new(Self {
            url: Self::build_url(&ctx, path, object_type),
            ctx,
            path: path.to_string(),
            object_type,
            state: Mutex::new(state),
        }))
    }

    /// Builds an object from a HEAD (or GET) response.
    ///
    /// `is_directory_url` records which candidate URL answered: the
    /// directory form (trailing slash) or the file form.
    pub fn from_head(
        ctx: Arc<FsContext>,
        path: &str,
        is_directory_url: bool,
        headers: &HeaderMap,
        last_modified: i64,
    ) -> Result<Arc<Self>> {
        let meta_prefix = ctx.service.header_meta_prefix();
        let meta = |suffix: &str| -> String {
            header(headers, &format!("{meta_prefix}{suffix}")).to_string()
        };

        let mut content_type = header(headers, "Content-Type").to_string();
        if content_type.is_empty() {
            content_type = ctx.config.default_content_type.clone();
        }

        let iv_header = meta(metadata::ENCRYPTION_IV);
        let object_type = if is_directory_url {
            ObjectType::Directory
        } else if content_type == metadata::SYMLINK_CONTENT_TYPE {
            ObjectType::Symlink
        } else if content_type == metadata::FIFO_CONTENT_TYPE {
            ObjectType::Fifo
        } else if !iv_header.is_empty() {
            ObjectType::EncryptedFile
        } else {
            ObjectType::File
        };

        let etag = header(headers, "ETag").to_string();
        let mtime_etag = meta(metadata::MTIME_ETAG);
        let intact = !etag.is_empty() && mtime_etag == etag;

        let size: u64 = header(headers, "Content-Length").parse().unwrap_or(0);

        let mode_bits = parse_c_int(&meta(metadata::MODE))
            .map(|m| m & !file_type_mask())
            .unwrap_or(ctx.config.default_mode & !file_type_mask());
        let uid = parse_c_int(&meta(metadata::UID)).unwrap_or_else(|| ctx.config.resolved_uid());
        let gid = parse_c_int(&meta(metadata::GID)).unwrap_or_else(|| ctx.config.resolved_gid());

        let mut mtime: i64 = meta(metadata::MTIME).trim().parse().unwrap_or(0);
        // if someone else rewrote the object, the stored mtime predates the
        // change; trust the server clock instead
        if !intact && last_modified > mtime {
            mtime = last_modified;
        }

        let mut md5 = meta(metadata::MD5);
        let mut md5_etag = meta(metadata::MD5_ETAG);
        if md5_etag != etag || md5.is_empty() {
            if digest::is_quoted_md5(&etag) {
                // single-part upload: the etag is the body MD5
                md5 = etag.clone();
                md5_etag = etag.clone();
            } else {
                // multipart etag; the body digest is unknown
                md5.clear();
            }
        }

        let encryption = if object_type == ObjectType::EncryptedFile {
            Some(Self::parse_encryption(&ctx, &iv_header, &meta(metadata::ENCRYPTION_KEY))?)
        } else {
            None
        };

        let mut user_metadata = BTreeMap::new();
        let reserved = format!("{meta_prefix}{}", metadata::RESERVED_PREFIX);
        for (key, value) in headers {
            let lower = key.to_ascii_lowercase();
            if let Some(name) = lower.strip_prefix(meta_prefix) {
                if !lower.starts_with(&reserved) {
                    user_metadata
                        .insert(name.to_string(), Xattr::user(value.clone().into_bytes()));
                }
            }
        }

        let (size, blocks) = if object_type == ObjectType::Directory {
            (0, 0)
        } else {
            (size, block_count(size))
        };

        let mut state = ObjectState {
            stat: ObjectStat {
                mode: object_type.mode_bits() | mode_bits,
                uid,
                gid,
                size,
                mtime,
                nlink: 1,
                blksize: metadata::BLOCK_SIZE as u32,
                blocks,
            },
            content_type,
            etag,
            mtime_etag,
            md5,
            md5_etag,
            metadata: user_metadata,
            expiry: Some(Instant::now() + Duration::from_secs(ctx.config.cache_expiry_in_s)),
            intact,
            encryption,
            symlink_target: None,
        };
        Self::install_reserved_xattrs(&mut state);

        Ok(Arc::new(Self {
            url: Self::build_url(&ctx, path, object_type),
            ctx,
            path: path.to_string(),
            object_type,
            state: Mutex::new(state),
        }))
    }

    fn parse_encryption(ctx: &FsContext, iv_b64: &str, key_b64: &str) -> Result<Encryption> {
        let iv_bytes = BASE64
            .decode(iv_b64)
            .map_err(|_| Error::InvalidArgument("bad encryption IV".to_string()))?;
        let iv: [u8; IV_LEN] = iv_bytes
            .try_into()
            .map_err(|_| Error::InvalidArgument("bad encryption IV length".to_string()))?;
        let wrapped_key = BASE64
            .decode(key_b64)
            .map_err(|_| Error::InvalidArgument("bad wrapped key".to_string()))?;

        let cipher = match ctx.volume_key.as_ref() {
            Some(volume_key) if wrapped_key.len() == KEY_LEN => {
                Some(AesCtr256::new(volume_key.unwrap(&wrapped_key, &iv)?, iv))
            }
            _ => None,
        };

        Ok(Encryption {
            iv,
            wrapped_key,
            cipher,
        })
    }

    fn install_reserved_xattrs(state: &mut ObjectState) {
        state.metadata.insert(
            metadata::XATTR_CONTENT_TYPE.to_string(),
            Xattr::read_only(state.content_type.clone()),
        );
        state
            .metadata
            .insert(metadata::XATTR_ETAG.to_string(), Xattr::read_only(state.etag.clone()));
        state
            .metadata
            .insert(metadata::XATTR_MD5.to_string(), Xattr::read_only(state.md5.clone()));
    }

    /// Bucket-relative path, no leading or trailing slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request URL; directories end in `/`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The object's type.
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// True for directories.
    pub fn is_directory(&self) -> bool {
        self.object_type == ObjectType::Directory
    }

    /// Atomic copy of the stat block.
    pub fn stat(&self) -> ObjectStat {
        self.state.lock().unwrap().stat
    }

    /// Current content type.
    pub fn content_type(&self) -> String {
        self.state.lock().unwrap().content_type.clone()
    }

    /// Current etag; empty until the object has been persisted.
    pub fn etag(&self) -> String {
        self.state.lock().unwrap().etag.clone()
    }

    /// Stored body MD5 (quoted hex); empty when unknown.
    pub fn md5(&self) -> String {
        self.state.lock().unwrap().md5.clone()
    }

    /// True when the stored metadata can be trusted (no out-of-band writes
    /// observed).
    pub fn is_intact(&self) -> bool {
        self.state.lock().unwrap().intact
    }

    /// True while the cached entry may be served without a refetch.
    pub fn is_valid(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .expiry
            .map(|e| Instant::now() < e)
            .unwrap_or(false)
    }

    /// Marks the entry stale; the next lookup re-issues a HEAD.
    pub fn expire(&self) {
        self.state.lock().unwrap().expiry = None;
    }

    /// Extends validity; used after a fetch and by tests.
    pub fn refresh_expiry(&self) {
        self.state.lock().unwrap().expiry =
            Some(Instant::now() + Duration::from_secs(self.ctx.config.cache_expiry_in_s));
    }

    /// Sets permission bits; file-type bits are preserved, a zero mode
    /// falls back to the configured default.
    pub fn set_mode(&self, mode: u32) {
        let mut bits = mode & !file_type_mask();
        if bits == 0 {
            bits = self.ctx.config.default_mode & !file_type_mask();
        }

        let mut state = self.state.lock().unwrap();
        state.stat.mode = (state.stat.mode & file_type_mask()) | bits;
    }

    /// Sets the owner uid.
    pub fn set_uid(&self, uid: u32) {
        self.state.lock().unwrap().stat.uid = uid;
    }

    /// Sets the owner gid.
    pub fn set_gid(&self, gid: u32) {
        self.state.lock().unwrap().stat.gid = gid;
    }

    /// Sets the modification time.
    pub fn set_mtime(&self, mtime: i64) {
        self.state.lock().unwrap().stat.mtime = mtime;
    }

    /// Records the size after a flush; block count follows.
    pub fn set_size(&self, size: u64) {
        let mut state = self.state.lock().unwrap();
        state.stat.size = size;
        state.stat.blocks = block_count(size);
    }

    pub(crate) fn set_etag(&self, etag: String) {
        self.state.lock().unwrap().etag = etag;
    }

    pub(crate) fn set_md5(&self, md5: String) {
        let mut state = self.state.lock().unwrap();
        state.md5 = md5;
    }

    /// Target of a local symlink awaiting its first commit.
    pub fn set_symlink_target(&self, target: &str) {
        self.state.lock().unwrap().symlink_target = Some(target.to_string());
    }

    /// Cipher for the body, when this is an encrypted file the volume key
    /// could unlock.
    pub fn cipher(&self) -> Option<AesCtr256> {
        self.state
            .lock()
            .unwrap()
            .encryption
            .as_ref()
            .and_then(|e| e.cipher.clone())
    }

    /// True when this is an encrypted file whose data key could not be
    /// unwrapped (wrong or missing volume key).
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock().unwrap();
        match &state.encryption {
            Some(e) => e.cipher.is_none(),
            None => false,
        }
    }

    /// Sets a user xattr. `key` carries the `user.` namespace prefix.
    ///
    /// Returns whether the change requires a metadata commit. Reserved
    /// `s3fuse-` names are rejected; non-writable entries are silent no-ops.
    pub fn set_metadata(&self, key: &str, value: &[u8], mode: SetMode) -> Result<bool> {
        let name = key
            .strip_prefix(metadata::XATTR_USER_PREFIX)
            .ok_or_else(|| Error::InvalidArgument(format!("xattr outside user namespace: {key}")))?;

        if name.starts_with(metadata::RESERVED_PREFIX) {
            return Err(Error::InvalidArgument(format!("reserved xattr name: {name}")));
        }

        let mut state = self.state.lock().unwrap();
        let exists = state.metadata.contains_key(name);

        if exists && mode == SetMode::Create {
            return Err(Error::AlreadyExists);
        }
        if !exists && mode == SetMode::Replace {
            return Err(Error::NoData);
        }

        let entry = state
            .metadata
            .entry(name.to_string())
            .or_insert_with(|| Xattr::user(Vec::new()));

        // read-only keys are listed, so a caller may reasonably try to set
        // them; failing would break tools that copy all attributes
        if !entry.flags.writable {
            return Ok(false);
        }

        entry.value = value.to_vec();
        Ok(entry.flags.commit_required)
    }

    /// Reads an xattr. Reserved read-only names surface the object fields.
    pub fn get_metadata(&self, key: &str) -> Result<Vec<u8>> {
        let name = key
            .strip_prefix(metadata::XATTR_USER_PREFIX)
            .ok_or(Error::NoData)?;

        let state = self.state.lock().unwrap();
        match name {
            metadata::XATTR_CONTENT_TYPE => Ok(state.content_type.clone().into_bytes()),
            metadata::XATTR_ETAG => Ok(state.etag.clone().into_bytes()),
            metadata::XATTR_MD5 => Ok(state.md5.clone().into_bytes()),
            _ => state
                .metadata
                .get(name)
                .map(|x| x.value.clone())
                .ok_or(Error::NoData),
        }
    }

    /// Visible xattr names, `user.` prefix applied.
    pub fn metadata_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .metadata
            .iter()
            .filter(|(_, x)| x.flags.visible)
            .map(|(name, _)| format!("{}{name}", metadata::XATTR_USER_PREFIX))
            .collect()
    }

    /// Removes an xattr; non-removable entries report `ENODATA`, like
    /// absent ones.
    pub fn remove_metadata(&self, key: &str) -> Result<()> {
        let name = key
            .strip_prefix(metadata::XATTR_USER_PREFIX)
            .ok_or(Error::NoData)?;

        let mut state = self.state.lock().unwrap();
        match state.metadata.get(name) {
            Some(x) if x.flags.removable => {
                state.metadata.remove(name);
                Ok(())
            }
            _ => Err(Error::NoData),
        }
    }

    /// Writes the metadata headers for a PUT of this object: serializable
    /// xattrs, the POSIX attribute headers, etag trailers, encryption
    /// material, and `Content-Type`.
    pub fn write_request_headers(&self, req: &mut Request) {
        let state = self.state.lock().unwrap();
        let prefix = self.ctx.service.header_meta_prefix();

        for (name, x) in &state.metadata {
            if x.flags.serializable {
                req.set_header(
                    &format!("{prefix}{name}"),
                    &String::from_utf8_lossy(&x.value),
                );
            }
        }

        req.set_header(
            &format!("{prefix}{}", metadata::MODE),
            &format_octal(state.stat.mode & !file_type_mask()),
        );
        req.set_header(&format!("{prefix}{}", metadata::UID), &state.stat.uid.to_string());
        req.set_header(&format!("{prefix}{}", metadata::GID), &state.stat.gid.to_string());
        req.set_header(
            &format!("{prefix}{}", metadata::MTIME),
            &state.stat.mtime.to_string(),
        );
        req.set_header(&format!("{prefix}{}", metadata::MTIME_ETAG), &state.etag);

        if !state.md5.is_empty() {
            req.set_header(&format!("{prefix}{}", metadata::MD5), &state.md5);
            req.set_header(&format!("{prefix}{}", metadata::MD5_ETAG), &state.etag);
        }

        if let Some(enc) = &state.encryption {
            req.set_header(
                &format!("{prefix}{}", metadata::ENCRYPTION_IV),
                &BASE64.encode(enc.iv),
            );
            req.set_header(
                &format!("{prefix}{}", metadata::ENCRYPTION_KEY),
                &BASE64.encode(&enc.wrapped_key),
            );
        }

        req.set_header("Content-Type", &state.content_type);
    }

    fn commit_body(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        match (&self.object_type, &state.symlink_target) {
            (ObjectType::Symlink, Some(target)) => target.clone().into_bytes(),
            _ => Vec::new(),
        }
    }

    fn refresh_etag(&self, req: &mut Request) -> Result<()> {
        req.init(HttpMethod::Head)?;
        req.set_url(&self.url, "");
        req.run(None)?;

        match req.response_code() {
            200 => {
                self.set_etag(req.response_header("ETag").to_string());
                Ok(())
            }
            404 => Err(Error::NotFound),
            status => Err(Error::RequestFailed { status }),
        }
    }

    /// Commits metadata to the store.
    ///
    /// For a persisted object this is a zero-byte copy-to-self guarded with
    /// `copy-source-if-match`; for a fresh local object it is the creating
    /// PUT. A copy can mint a new etag, in which case the commit runs once
    /// more so the stored etag trailers match the final etag; a 412 means
    /// the object changed under us, so the etag is refetched and the commit
    /// replayed once on top of it.
    pub fn commit(&self, req: &mut Request) -> Result<()> {
        let header_prefix = self.ctx.service.header_prefix();

        for pass in 0..2 {
            req.init(HttpMethod::Put)?;
            req.set_url(&self.url, "");

            let etag = self.etag();
            if etag.is_empty() {
                req.set_input_buffer(self.commit_body());
            } else {
                req.set_header(&format!("{header_prefix}copy-source"), &self.url);
                req.set_header(&format!("{header_prefix}copy-source-if-match"), &etag);
                req.set_header(&format!("{header_prefix}metadata-directive"), "REPLACE");
            }

            self.write_request_headers(req);
            req.run(None)?;

            match req.response_code() {
                200 => {}
                412 if pass == 0 && !etag.is_empty() => {
                    debug!(url = %self.url, "commit etag mismatch; refetching");
                    self.refresh_etag(req)?;
                    continue;
                }
                status => {
                    warn!(url = %self.url, status, "metadata commit failed");
                    return Err(Error::RequestFailed { status });
                }
            }

            // a copy answers with a CopyObjectResult body; a plain creating
            // PUT answers with an ETag header and no body
            let body = req.response_string();
            let new_etag = if body.is_empty() {
                req.response_header("ETag").to_string()
            } else {
                xml::find_first(&body, "ETag").unwrap_or_default()
            };

            // a copy may mint a new etag; if it did, run once more so the
            // stored etag trailers line up with the final etag
            if !etag.is_empty() && !new_etag.is_empty() && new_etag != etag {
                debug!(url = %self.url, "commit produced new etag; recommitting");
                self.set_etag(new_etag);
                if pass == 0 {
                    continue;
                }
            } else if etag.is_empty() && !new_etag.is_empty() {
                self.set_etag(new_etag);
            }

            break;
        }

        let mut state = self.state.lock().unwrap();
        let etag = state.etag.clone();
        state.mtime_etag = etag.clone();
        if !state.md5.is_empty() {
            state.md5_etag = etag;
        }
        state.intact = true;
        Self::install_reserved_xattrs(&mut state);

        Ok(())
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("path", &self.path)
            .field("type", &self.object_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{test_context, test_context_with};

    fn head_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn hello_object() -> Arc<Object> {
        // scenario: object "hello" with body "hello world" and full
        // attribute headers
        Object::from_head(
            test_context(),
            "hello",
            false,
            &head_headers(&[
                ("Content-Type", "text/plain"),
                ("Content-Length", "11"),
                ("ETag", "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""),
                ("x-amz-meta-s3fuse-mode", "0100644"),
                ("x-amz-meta-s3fuse-uid", "1000"),
                ("x-amz-meta-s3fuse-gid", "1000"),
                ("x-amz-meta-s3fuse-mtime", "1700000000"),
                (
                    "x-amz-meta-s3fuse-mtime-etag",
                    "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"",
                ),
            ]),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_stat_from_head() {
        let obj = hello_object();
        let stat = obj.stat();

        assert_eq!(obj.object_type(), ObjectType::File);
        assert_eq!(stat.mode, libc::S_IFREG as u32 | 0o644);
        assert_eq!(stat.uid, 1000);
        assert_eq!(stat.gid, 1000);
        assert_eq!(stat.size, 11);
        assert_eq!(stat.mtime, 1_700_000_000);
        assert_eq!(stat.nlink, 1);
        assert_eq!(stat.blocks, 1);
        assert!(obj.is_intact());
        assert!(obj.is_valid());
    }

    #[test]
    fn test_type_inference() {
        let ctx = test_context();

        let dir = Object::from_head(ctx.clone(), "d", true, &head_headers(&[]), 0).unwrap();
        assert!(dir.is_directory());
        assert!(dir.url().ends_with('/'));

        let link = Object::from_head(
            ctx.clone(),
            "l",
            false,
            &head_headers(&[("Content-Type", "text/symlink")]),
            0,
        )
        .unwrap();
        assert_eq!(link.object_type(), ObjectType::Symlink);

        let fifo = Object::from_head(
            ctx.clone(),
            "p",
            false,
            &head_headers(&[("Content-Type", "application/x-s3fuse-fifo")]),
            0,
        )
        .unwrap();
        assert_eq!(fifo.object_type(), ObjectType::Fifo);

        let plain = Object::from_head(ctx, "f", false, &head_headers(&[]), 0).unwrap();
        assert_eq!(plain.object_type(), ObjectType::File);
        assert!(!plain.url().ends_with('/'));
    }

    #[test]
    fn test_out_of_band_mutation_adopts_server_mtime() {
        let obj = Object::from_head(
            test_context(),
            "f",
            false,
            &head_headers(&[
                ("ETag", "\"00000000000000000000000000000001\""),
                ("x-amz-meta-s3fuse-mtime", "100"),
                ("x-amz-meta-s3fuse-mtime-etag", "\"00000000000000000000000000000000\""),
            ]),
            5000,
        )
        .unwrap();

        assert!(!obj.is_intact());
        assert_eq!(obj.stat().mtime, 5000);
    }

    #[test]
    fn test_md5_adopted_from_single_part_etag() {
        let obj = Object::from_head(
            test_context(),
            "f",
            false,
            &head_headers(&[("ETag", "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"")]),
            0,
        )
        .unwrap();
        assert_eq!(obj.md5(), "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"");
    }

    #[test]
    fn test_md5_blank_for_multipart_etag() {
        let obj = Object::from_head(
            test_context(),
            "f",
            false,
            &head_headers(&[("ETag", "\"0123456789abcdef0123456789abcdef-3\"")]),
            0,
        )
        .unwrap();
        assert_eq!(obj.md5(), "");
    }

    #[test]
    fn test_user_xattrs_parsed_from_headers() {
        let obj = Object::from_head(
            test_context(),
            "f",
            false,
            &head_headers(&[
                ("x-amz-meta-color", "blue"),
                ("x-amz-meta-s3fuse-mode", "0644"),
            ]),
            0,
        )
        .unwrap();

        assert_eq!(obj.get_metadata("user.color").unwrap(), b"blue");
        // reserved headers never show up as user attributes
        assert!(matches!(
            obj.get_metadata("user.s3fuse-mode"),
            Err(Error::NoData)
        ));
    }

    #[test]
    fn test_set_metadata_flags() {
        let obj = hello_object();

        assert!(obj
            .set_metadata("user.color", b"blue", SetMode::Create)
            .unwrap());
        assert!(matches!(
            obj.set_metadata("user.color", b"red", SetMode::Create),
            Err(Error::AlreadyExists)
        ));
        assert!(matches!(
            obj.set_metadata("user.missing", b"x", SetMode::Replace),
            Err(Error::NoData)
        ));

        obj.set_metadata("user.color", b"red", SetMode::Replace).unwrap();
        assert_eq!(obj.get_metadata("user.color").unwrap(), b"red");
    }

    #[test]
    fn test_reserved_names_rejected_or_ignored() {
        let obj = hello_object();

        assert!(matches!(
            obj.set_metadata("user.s3fuse-mtime", b"0", SetMode::Any),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            obj.set_metadata("color", b"blue", SetMode::Any),
            Err(Error::InvalidArgument(_))
        ));

        // visible read-only names accept writes silently, without commit
        let needs_commit = obj
            .set_metadata("user.__etag__", b"fake", SetMode::Any)
            .unwrap();
        assert!(!needs_commit);
        assert_eq!(
            obj.get_metadata("user.__etag__").unwrap(),
            obj.etag().into_bytes()
        );
    }

    #[test]
    fn test_metadata_keys_visible_with_prefix() {
        let obj = hello_object();
        obj.set_metadata("user.color", b"blue", SetMode::Any).unwrap();

        let keys = obj.metadata_keys();
        assert!(keys.contains(&"user.color".to_string()));
        assert!(keys.contains(&"user.__etag__".to_string()));
        assert!(keys.iter().all(|k| k.starts_with("user.")));
    }

    #[test]
    fn test_remove_metadata() {
        let obj = hello_object();
        obj.set_metadata("user.color", b"blue", SetMode::Any).unwrap();

        obj.remove_metadata("user.color").unwrap();
        assert!(matches!(
            obj.get_metadata("user.color"),
            Err(Error::NoData)
        ));
        assert!(matches!(
            obj.remove_metadata("user.color"),
            Err(Error::NoData)
        ));
        // read-only entries cannot be removed
        assert!(matches!(
            obj.remove_metadata("user.__md5__"),
            Err(Error::NoData)
        ));
    }

    #[test]
    fn test_set_mode_preserves_file_type() {
        let obj = hello_object();
        obj.set_mode(0o100640);
        assert_eq!(obj.stat().mode, libc::S_IFREG as u32 | 0o640);

        obj.set_mode(0);
        assert_eq!(obj.stat().mode, libc::S_IFREG as u32 | 0o644);
    }

    #[test]
    fn test_expiry_lifecycle() {
        let obj = hello_object();
        assert!(obj.is_valid());
        obj.expire();
        assert!(!obj.is_valid());
        obj.refresh_expiry();
        assert!(obj.is_valid());
    }

    #[test]
    fn test_local_create_is_invalid_until_fetched() {
        let ctx = test_context();
        let obj = Object::create(ctx, "new-file", ObjectType::File, Some(0o600)).unwrap();

        assert!(!obj.is_valid());
        assert_eq!(obj.etag(), "");
        assert_eq!(obj.stat().mode, libc::S_IFREG as u32 | 0o600);
        assert_eq!(obj.stat().size, 0);
    }

    #[test]
    fn test_encrypted_create_requires_volume_key() {
        assert!(matches!(
            Object::create(test_context(), "f", ObjectType::EncryptedFile, None),
            Err(Error::Denied)
        ));

        let ctx = test_context_with(|c| c.use_encryption = true);
        let obj = Object::create(ctx, "f", ObjectType::EncryptedFile, None).unwrap();
        assert!(obj.cipher().is_some());
        assert!(!obj.is_locked());
    }

    #[test]
    fn test_encrypted_round_trip_through_headers() {
        let ctx = test_context_with(|c| c.use_encryption = true);
        let obj = Object::create(ctx.clone(), "f", ObjectType::EncryptedFile, None).unwrap();

        // serialise the encryption material the way a commit would
        let mut req = s3fuse_base::Request::new(
            "test",
            ctx.config.clone(),
            None,
            std::sync::Arc::new(s3fuse_base::statistics::Statistics::new()),
        )
        .unwrap();
        obj.write_request_headers(&mut req);

        let iv = req.header("x-amz-meta-s3fuse-encryption-iv").to_string();
        let key = req.header("x-amz-meta-s3fuse-encryption-key").to_string();
        assert!(!iv.is_empty() && !key.is_empty());

        let remote = Object::from_head(
            ctx,
            "f",
            false,
            &head_headers(&[
                ("x-amz-meta-s3fuse-encryption-iv", &iv),
                ("x-amz-meta-s3fuse-encryption-key", &key),
            ]),
            0,
        )
        .unwrap();
        assert_eq!(remote.object_type(), ObjectType::EncryptedFile);

        // both ends must produce the same keystream
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        obj.cipher().unwrap().apply(0, &mut a);
        remote.cipher().unwrap().apply(0, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_request_headers_shape() {
        let ctx = test_context();
        let obj = hello_object();
        obj.set_metadata("user.color", b"blue", SetMode::Any).unwrap();

        let mut req = s3fuse_base::Request::new(
            "test",
            ctx.config.clone(),
            None,
            std::sync::Arc::new(s3fuse_base::statistics::Statistics::new()),
        )
        .unwrap();
        obj.write_request_headers(&mut req);

        assert_eq!(req.header("x-amz-meta-s3fuse-mode"), "0644");
        assert_eq!(req.header("x-amz-meta-s3fuse-uid"), "1000");
        assert_eq!(req.header("x-amz-meta-s3fuse-mtime"), "1700000000");
        assert_eq!(
            req.header("x-amz-meta-s3fuse-mtime-etag"),
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""
        );
        assert_eq!(
            req.header("x-amz-meta-s3fuse-md5"),
            "\"5eb63bbbe01eeed093cb22bb8f5acdc3\""
        );
        assert_eq!(req.header("x-amz-meta-color"), "blue");
        assert_eq!(req.header("Content-Type"), "text/plain");
        // read-only entries never serialise
        assert_eq!(req.header("x-amz-meta-__etag__"), "");
    }

    #[test]
    fn test_parse_c_int() {
        assert_eq!(parse_c_int("0644"), Some(0o644));
        assert_eq!(parse_c_int("0100644"), Some(0o100644));
        assert_eq!(parse_c_int("1000"), Some(1000));
        assert_eq!(parse_c_int("0"), Some(0));
        assert_eq!(parse_c_int("x"), None);
        assert_eq!(parse_c_int(""), None);
    }

    #[test]
    fn test_format_octal() {
        assert_eq!(format_octal(0o644), "0644");
        assert_eq!(format_octal(0), "0");
    }
}
