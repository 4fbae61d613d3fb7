use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use s3fuse_base::error::{result_of, status_of, Error, Result};
use s3fuse_base::pool::{Queue, WorkerPool};
use s3fuse_base::request::{HttpMethod, Request};
use s3fuse_base::xml::{self, XmlBuilder};
use s3fuse_crypto::aes_ctr::AesCtr256;
use s3fuse_crypto::digest;

use crate::context::FsContext;
use crate::object::{now_epoch, Object};
use crate::open_file::FileStore;

/// Splits `size` bytes into `(offset, len)` windows of at most `chunk_size`.
fn chunks(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = chunk_size.min(size - offset);
        out.push((offset, len));
        offset += len;
    }
    out
}

/// XORs a whole file with the keystream, in place.
fn apply_cipher_file(file: &File, size: u64, cipher: &AesCtr256) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0;

    while offset < size {
        let want = buf.len().min((size - offset) as usize);
        let n = file.read_at(&mut buf[..want], offset)?;
        if n == 0 {
            break;
        }
        cipher.apply(offset, &mut buf[..n]);
        file.write_all_at(&buf[..n], offset)?;
        offset += n as u64;
    }

    Ok(())
}

/// Reads `(offset, len)` of a file, applying the cipher when present.
fn read_window(file: &File, offset: u64, len: u64, cipher: Option<&AesCtr256>) -> Result<Vec<u8>> {
    let mut body = vec![0u8; len as usize];
    let mut read = 0usize;
    while read < body.len() {
        let n = file.read_at(&mut body[read..], offset + read as u64)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "scratch file shrank during upload",
            )));
        }
        read += n;
    }

    if let Some(cipher) = cipher {
        cipher.apply(offset, &mut body);
    }
    Ok(body)
}

/// MD5 of the body as it will appear in the store: the scratch bytes,
/// run through the cipher for encrypted files.
fn body_digest(file: &File, size: u64, cipher: Option<&AesCtr256>) -> Result<[u8; 16]> {
    match cipher {
        None => Ok(digest::md5_file(file, 0, Some(size))?),
        Some(cipher) => {
            let mut context = md5::Context::new();
            let mut offset = 0;
            while offset < size {
                let len = (64 * 1024).min(size - offset);
                let window = read_window(file, offset, len, Some(cipher))?;
                context.consume(&window);
                offset += len;
            }
            Ok(context.compute().0)
        }
    }
}

/// The request document for completing a multipart upload.
fn complete_multipart_body(part_etags: &[String]) -> Vec<u8> {
    let mut xb = XmlBuilder::new();
    xb.open("CompleteMultipartUpload");
    for (index, etag) in part_etags.iter().enumerate() {
        xb.open("Part");
        xb.elem("PartNumber", &(index + 1).to_string());
        xb.elem("ETag", etag);
        xb.close("Part");
    }
    xb.close("CompleteMultipartUpload");
    xb.finish().into_bytes()
}

/// Chunked movement of file bodies between scratch files and the store.
///
/// Single-shot transfers run as one task on the foreground pool; bodies
/// larger than the configured chunk size fan out into one task per chunk
/// when the provider supports it.
pub struct FileTransfer {
    ctx: Arc<FsContext>,
    pools: Arc<WorkerPool>,
}

impl FileTransfer {
    /// Binds the transfer layer to its context and worker pools.
    pub fn new(ctx: Arc<FsContext>, pools: Arc<WorkerPool>) -> Self {
        Self { ctx, pools }
    }

    fn download_single(&self, object: &Arc<Object>, scratch: &File, size: u64) -> Result<()> {
        let url = object.url().to_string();
        let out = scratch.try_clone()?;

        let status = self.pools.call(Queue::Foreground, move |req| {
            status_of((|| {
                req.init(HttpMethod::Get)?;
                req.set_url(&url, "");
                req.set_output_file(out, 0);
                req.run(None)?;
                match req.response_code() {
                    200 => Ok(()),
                    404 => Err(Error::NotFound),
                    status => Err(Error::RequestFailed { status }),
                }
            })())
        });
        result_of(status)?;

        scratch.set_len(size)?;

        // a store that rewrote the body under us would fail this check
        if object.is_intact() && !object.md5().is_empty() {
            let digest = digest::md5_file(scratch, 0, Some(size))?;
            if digest::quoted_hex(&digest) != object.md5() {
                warn!(path = object.path(), "download digest mismatch");
                return Err(Error::DigestMismatch);
            }
        }

        Ok(())
    }

    fn download_multi(&self, object: &Arc<Object>, scratch: &File, size: u64) -> Result<()> {
        let windows = chunks(size, self.ctx.config.download_chunk_size);
        let aborted = Arc::new(AtomicBool::new(false));
        debug!(path = object.path(), parts = windows.len(), "ranged download");

        let handles: Vec<_> = windows
            .into_iter()
            .map(|(offset, len)| {
                let url = object.url().to_string();
                let aborted = aborted.clone();
                let out = scratch.try_clone();

                self.pools.post(Queue::Foreground, move |req| {
                    status_of((|| {
                        if aborted.load(Ordering::SeqCst) {
                            return Err(Error::Interrupted);
                        }

                        req.init(HttpMethod::Get)?;
                        req.set_url(&url, "");
                        req.set_header("Range", &format!("bytes={offset}-{}", offset + len - 1));
                        req.set_output_file(out.map_err(Error::Io)?, offset);
                        req.run(None)?;
                        match req.response_code() {
                            200 | 206 => Ok(()),
                            status => Err(Error::RequestFailed { status }),
                        }
                    })())
                })
            })
            .collect();

        let mut first_error = 0;
        for handle in handles {
            let status = handle.wait();
            if status != 0 {
                // stop chunks that have not started yet
                aborted.store(true, Ordering::SeqCst);
                if first_error == 0 && status != -libc::EINTR {
                    first_error = status;
                }
            }
        }

        if first_error != 0 {
            return result_of(first_error);
        }
        if aborted.load(Ordering::SeqCst) {
            return Err(Error::RequestFailed { status: 0 });
        }

        scratch.set_len(size)?;
        Ok(())
    }

    fn upload_single(&self, object: &Arc<Object>, scratch: &File, size: u64) -> Result<()> {
        let cipher = object.cipher();
        let digest = body_digest(scratch, size, cipher.as_ref())?;
        object.set_md5(digest::quoted_hex(&digest));

        let object = object.clone();
        let url = object.url().to_string();
        let content_md5 = digest::base64_md5(&digest);

        // encrypted bodies are produced in memory; plain ones stream from
        // the scratch file
        let body: Option<Vec<u8>> = match &cipher {
            Some(cipher) => Some(read_window(scratch, 0, size, Some(cipher))?),
            None => None,
        };
        let input = scratch.try_clone()?;

        let status = self.pools.call(Queue::Foreground, move |req| {
            status_of((|| {
                req.init(HttpMethod::Put)?;
                req.set_url(&url, "");
                object.write_request_headers(req);
                req.set_header("Content-MD5", &content_md5);
                match body {
                    Some(body) => req.set_input_buffer(body),
                    None => req.set_input_file(input, 0, size),
                }

                req.run(None)?;
                if req.response_code() != 200 {
                    return Err(Error::RequestFailed {
                        status: req.response_code(),
                    });
                }

                object.set_etag(req.response_header("ETag").to_string());
                object.set_size(size);
                object.commit(req)
            })())
        });
        result_of(status)
    }

    fn initiate_multipart(&self, object: &Arc<Object>) -> Result<String> {
        let object = object.clone();
        let url = object.url().to_string();
        let upload_id = Arc::new(Mutex::new(String::new()));
        let upload_id_out = upload_id.clone();

        let status = self.pools.call(Queue::Foreground, move |req| {
            status_of((|| {
                req.init(HttpMethod::Post)?;
                req.set_url(&url, "uploads");
                // metadata sent here lands on the completed object
                object.write_request_headers(req);
                req.run(None)?;
                if req.response_code() != 200 {
                    return Err(Error::RequestFailed {
                        status: req.response_code(),
                    });
                }

                let id = xml::find_first(&req.response_string(), "UploadId")
                    .filter(|id| !id.is_empty())
                    .ok_or(Error::RequestFailed { status: 0 })?;
                *upload_id_out.lock().unwrap() = id;
                Ok(())
            })())
        });
        result_of(status)?;

        let id = upload_id.lock().unwrap().clone();
        Ok(id)
    }

    fn abort_multipart(&self, object: &Arc<Object>, upload_id: &str) {
        let url = object.url().to_string();
        let query = format!("uploadId={upload_id}");

        let status = self.pools.call(Queue::Foreground, move |req| {
            status_of((|| {
                req.init(HttpMethod::Delete)?;
                req.set_url(&url, &query);
                req.run(None)?;
                Ok(())
            })())
        });
        if status != 0 {
            warn!(url = %object.url(), "could not abort multipart upload");
        }
    }

    fn upload_multi(&self, object: &Arc<Object>, scratch: &File, size: u64) -> Result<()> {
        let cipher = object.cipher();
        let digest = body_digest(scratch, size, cipher.as_ref())?;
        object.set_md5(digest::quoted_hex(&digest));

        let upload_id = self.initiate_multipart(object)?;
        let windows = chunks(size, self.ctx.config.upload_chunk_size);
        let part_etags = Arc::new(Mutex::new(vec![String::new(); windows.len()]));
        let retries = self.ctx.config.max_transfer_retries;
        debug!(path = object.path(), parts = windows.len(), upload_id = %upload_id, "multipart upload");

        let handles: Vec<_> = windows
            .into_iter()
            .enumerate()
            .map(|(index, (offset, len))| {
                let url = object.url().to_string();
                let query = format!("partNumber={}&uploadId={upload_id}", index + 1);
                let cipher = cipher.clone();
                let input = scratch.try_clone();
                let part_etags = part_etags.clone();

                self.pools.post(Queue::Foreground, move |req| {
                    status_of((|| {
                        let input = input.map_err(Error::Io)?;
                        let mut last = Error::RequestFailed { status: 0 };

                        // each part owns its retry budget; transport-level
                        // retries happen one layer down
                        for _ in 0..retries {
                            req.init(HttpMethod::Put)?;
                            req.set_url(&url, &query);
                            match &cipher {
                                Some(cipher) => req.set_input_buffer(read_window(
                                    &input,
                                    offset,
                                    len,
                                    Some(cipher),
                                )?),
                                None => {
                                    req.set_input_file(input.try_clone()?, offset, len);
                                }
                            }

                            req.run(None)?;
                            if req.response_code() == 200 {
                                let etag = req.response_header("ETag").to_string();
                                part_etags.lock().unwrap()[index] = etag;
                                return Ok(());
                            }
                            last = Error::RequestFailed {
                                status: req.response_code(),
                            };
                        }
                        Err(last)
                    })())
                })
            })
            .collect();

        let mut first_error = 0;
        for handle in handles {
            let status = handle.wait();
            if status != 0 && first_error == 0 {
                first_error = status;
            }
        }
        if first_error != 0 {
            self.abort_multipart(object, &upload_id);
            return result_of(first_error);
        }

        let etags = part_etags.lock().unwrap().clone();
        if etags.iter().any(String::is_empty) {
            self.abort_multipart(object, &upload_id);
            return Err(Error::RequestFailed { status: 0 });
        }

        let completing = object.clone();
        let url = object.url().to_string();
        let query = format!("uploadId={upload_id}");
        let status = self.pools.call(Queue::Foreground, move |req| {
            status_of((|| {
                req.init(HttpMethod::Post)?;
                req.set_url(&url, &query);
                req.set_input_buffer(complete_multipart_body(&etags));
                req.run(None)?;
                if req.response_code() != 200 {
                    return Err(Error::RequestFailed {
                        status: req.response_code(),
                    });
                }

                // the composite etag ties the stored md5 to this body
                let composite = xml::find_first(&req.response_string(), "ETag")
                    .filter(|e| !e.is_empty())
                    .ok_or(Error::RequestFailed { status: 0 })?;
                completing.set_etag(composite);
                completing.set_size(size);
                completing.commit(req)
            })())
        });

        let result = result_of(status);
        if result.is_err() {
            self.abort_multipart(object, &upload_id);
        }
        result
    }
}

impl FileStore for FileTransfer {
    fn download(&self, object: &Arc<Object>, scratch: &File) -> Result<()> {
        if object.is_locked() {
            // encrypted file, but the volume key cannot unwrap its data key
            return Err(Error::Denied);
        }

        let size = object.stat().size;
        let multi = size > self.ctx.config.download_chunk_size
            && self.ctx.service.is_multipart_download_supported();

        if multi {
            self.download_multi(object, scratch, size)?;
        } else {
            self.download_single(object, scratch, size)?;
        }

        if let Some(cipher) = object.cipher() {
            apply_cipher_file(scratch, size, &cipher)?;
        }
        Ok(())
    }

    fn upload(&self, object: &Arc<Object>, scratch: &File) -> Result<()> {
        if object.is_locked() {
            return Err(Error::Denied);
        }

        let size = scratch.metadata()?.len();
        object.set_mtime(now_epoch());

        let multi = size > self.ctx.config.upload_chunk_size
            && self.ctx.service.is_multipart_upload_supported();

        if multi {
            self.upload_multi(object, scratch, size)
        } else {
            self.upload_single(object, scratch, size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_chunks_split_evenly() {
        assert_eq!(chunks(0, 128), Vec::<(u64, u64)>::new());
        assert_eq!(chunks(100, 128), vec![(0, 100)]);
        assert_eq!(chunks(256, 128), vec![(0, 128), (128, 128)]);
        // 300 MiB at 128 MiB chunks: two full parts and a remainder
        let mib = 1024 * 1024;
        assert_eq!(
            chunks(300 * mib, 128 * mib),
            vec![
                (0, 128 * mib),
                (128 * mib, 128 * mib),
                (256 * mib, 44 * mib)
            ]
        );
    }

    #[test]
    fn test_apply_cipher_file_round_trips() {
        let mut f = tempfile::tempfile().unwrap();
        let plain = b"scratch file contents that span multiple words".to_vec();
        f.write_all(&plain).unwrap();

        let cipher = AesCtr256::new([1u8; 32], [2u8; 16]);
        apply_cipher_file(&f, plain.len() as u64, &cipher).unwrap();

        let mut encrypted = vec![0u8; plain.len()];
        f.read_at(&mut encrypted, 0).unwrap();
        assert_ne!(encrypted, plain);

        apply_cipher_file(&f, plain.len() as u64, &cipher).unwrap();
        let mut decrypted = vec![0u8; plain.len()];
        f.read_at(&mut decrypted, 0).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn test_body_digest_matches_ciphertext() {
        let mut f = tempfile::tempfile().unwrap();
        let plain = vec![0x42u8; 200_000];
        f.write_all(&plain).unwrap();

        let cipher = AesCtr256::new([1u8; 32], [2u8; 16]);
        let digest_streamed = body_digest(&f, plain.len() as u64, Some(&cipher)).unwrap();

        let mut ciphertext = plain.clone();
        cipher.apply(0, &mut ciphertext);
        assert_eq!(digest_streamed, digest::md5(&ciphertext));

        // without a cipher the digest covers the plain bytes
        let digest_plain = body_digest(&f, plain.len() as u64, None).unwrap();
        assert_eq!(digest_plain, digest::md5(&plain));
    }

    #[test]
    fn test_read_window_applies_offsets() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(b"0123456789").unwrap();

        assert_eq!(read_window(&f, 2, 5, None).unwrap(), b"23456");
        assert!(read_window(&f, 8, 5, None).is_err());
    }

    #[test]
    fn test_complete_multipart_body_orders_parts() {
        let body = complete_multipart_body(&[
            "\"etag-one\"".to_string(),
            "\"etag-two\"".to_string(),
        ]);
        let body = String::from_utf8(body).unwrap();

        assert!(body.contains("<CompleteMultipartUpload>"));
        let one = body.find("<PartNumber>1</PartNumber>").unwrap();
        let two = body.find("<PartNumber>2</PartNumber>").unwrap();
        assert!(one < two);
        assert_eq!(xml::find_all(&body, "ETag").len(), 2);
    }
}
