use std::fs::File;
use std::os::unix::fs::FileExt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Raw MD5 of a buffer.
pub fn md5(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

/// Lowercase hex MD5.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5(data))
}

/// Quoted lowercase hex MD5, the shape the store uses for single-part etags.
pub fn quoted_hex(digest: &[u8; 16]) -> String {
    format!("\"{}\"", hex::encode(digest))
}

/// Base64 MD5, the shape `Content-MD5` wants.
pub fn base64_md5(digest: &[u8; 16]) -> String {
    BASE64.encode(digest)
}

/// MD5 of a window of a file, read without touching the file cursor.
///
/// `len` of `None` digests from `offset` to end of file.
pub fn md5_file(file: &File, offset: u64, len: Option<u64>) -> std::io::Result<[u8; 16]> {
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut pos = offset;
    let mut remaining = len;

    loop {
        let want = match remaining {
            Some(0) => break,
            Some(r) => buf.len().min(r as usize),
            None => buf.len(),
        };

        let n = file.read_at(&mut buf[..want], pos)?;
        if n == 0 {
            break;
        }

        context.consume(&buf[..n]);
        pos += n as u64;
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
        }
    }

    Ok(context.compute().0)
}

/// True when a string has the shape of a quoted single-part etag
/// (32 hex digits in quotes). Multipart etags fail this check.
pub fn is_quoted_md5(s: &str) -> bool {
    let Some(inner) = s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) else {
        return false;
    };
    inner.len() == 32 && inner.bytes().all(|b| b.is_ascii_hexdigit())
}
