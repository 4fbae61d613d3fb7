use std::sync::Arc;

use tracing::{debug, info};

use s3fuse_base::config::Config;
use s3fuse_base::error::{status_of, Error, Result};
use s3fuse_base::pool::{Queue, WorkerPool};
use s3fuse_base::request::{HttpMethod, Request, RequestHook};
use s3fuse_base::statistics::Statistics;

use crate::cache::ObjectCache;
use crate::context::FsContext;
use crate::directory::{self, DirEntry};
use crate::file_transfer::FileTransfer;
use crate::metadata;
use crate::object::{Object, ObjectStat, ObjectType};
use crate::open_file::OpenFileTable;
use crate::xattr::SetMode;

/// What the caller already knows about a path, used to skip the directory
/// probe (`HEAD <path>/`) when possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hints {
    /// Nothing known; probe the directory form first.
    Unknown,
    /// Known to be a file, symlink, or fifo.
    File,
    /// Known to be a directory.
    Directory,
}

/// The filesystem facade: owns every subsystem and exposes the POSIX-shaped
/// operations the FUSE binding calls.
///
/// Paths are bucket-relative, without leading or trailing slashes; the
/// empty string names the bucket root.
pub struct FileSystem {
    ctx: Arc<FsContext>,
    pools: Arc<WorkerPool>,
    statistics: Arc<Statistics>,
    cache: Arc<ObjectCache>,
    open_files: OpenFileTable,
    transfer: Arc<FileTransfer>,
}

impl FileSystem {
    /// Builds the filesystem from configuration, loading credentials and
    /// starting the worker pools.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(FsContext::new(Arc::new(config))?);
        Self::with_context(ctx)
    }

    /// Builds the filesystem around an existing context.
    pub fn with_context(ctx: Arc<FsContext>) -> Result<Self> {
        let statistics = Arc::new(Statistics::new());
        let hook: Arc<dyn RequestHook> = ctx.service.clone();

        let factory = {
            let config = ctx.config.clone();
            let statistics = statistics.clone();
            Arc::new(move |tag: &str| {
                Request::new(tag, config.clone(), Some(hook.clone()), statistics.clone())
            })
        };
        let pools = Arc::new(WorkerPool::new(
            ctx.config.fg_worker_count,
            ctx.config.bg_worker_count,
            factory,
        )?);

        let transfer = Arc::new(FileTransfer::new(ctx.clone(), pools.clone()));
        let cache = Arc::new(ObjectCache::new(ctx.config.cache_capacity));

        info!(bucket = %ctx.config.bucket_name, "filesystem ready");

        Ok(Self {
            ctx,
            pools,
            statistics,
            cache,
            open_files: OpenFileTable::new(),
            transfer,
        })
    }

    /// Drains the worker pools and logs transfer statistics.
    pub fn terminate(&self) {
        self.pools.terminate();
        let summary = self.statistics.summary();
        if !summary.is_empty() {
            info!(statistics = %summary, "transfer statistics");
        }
    }

    fn validate_path(path: &str) -> Result<()> {
        if path.ends_with('/') || path.starts_with('/') {
            return Err(Error::InvalidArgument(format!("bad object path: {path}")));
        }
        Ok(())
    }

    /// Runs a task body on the foreground pool with a borrowed request,
    /// re-hydrating the typed result on this side of the status boundary.
    fn with_request<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Request) -> Result<T> + Send + 'static,
    {
        let slot = Arc::new(std::sync::Mutex::new(None));
        let out = slot.clone();

        let status = self.pools.call(Queue::Foreground, move |req| {
            status_of(f(req).map(|value| {
                *out.lock().unwrap() = Some(value);
            }))
        });

        s3fuse_base::error::result_of(status)?;
        let value = slot.lock().unwrap().take();
        value.ok_or(Error::Interrupted)
    }

    /// HEAD probe for a path, directory form first unless hinted otherwise.
    fn fetch_object(
        req: &mut Request,
        ctx: &Arc<FsContext>,
        path: &str,
        hints: Hints,
    ) -> Result<Arc<Object>> {
        let file_url = Object::build_url(ctx, path, ObjectType::File);

        if hints != Hints::File {
            req.init(HttpMethod::Head)?;
            req.set_url(&format!("{file_url}/"), "");
            req.run(None)?;
            if req.response_code() == 200 {
                return Object::from_head(
                    ctx.clone(),
                    path,
                    true,
                    req.response_headers(),
                    req.last_modified(),
                );
            }
        }

        req.init(HttpMethod::Head)?;
        req.set_url(&file_url, "");
        req.run(None)?;
        match req.response_code() {
            200 => Object::from_head(
                ctx.clone(),
                path,
                false,
                req.response_headers(),
                req.last_modified(),
            ),
            403 => Err(Error::Denied),
            _ => Err(Error::NotFound),
        }
    }

    fn get_object(
        req: &mut Request,
        ctx: &Arc<FsContext>,
        cache: &ObjectCache,
        path: &str,
        hints: Hints,
    ) -> Result<Arc<Object>> {
        cache.get(path, || Self::fetch_object(req, ctx, path, hints))
    }

    fn root_stat(&self) -> ObjectStat {
        ObjectStat {
            mode: libc::S_IFDIR as u32 | 0o755,
            uid: self.ctx.config.resolved_uid(),
            gid: self.ctx.config.resolved_gid(),
            size: 0,
            mtime: 0,
            nlink: 1,
            blksize: metadata::BLOCK_SIZE as u32,
            blocks: 0,
        }
    }

    /// Stats a path.
    pub fn get_stats(&self, path: &str) -> Result<ObjectStat> {
        Self::validate_path(path)?;
        if path.is_empty() {
            return Ok(self.root_stat());
        }

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let path = path.to_string();
        self.with_request(move |req| {
            Ok(Self::get_object(req, &ctx, &cache, &path, Hints::Unknown)?.stat())
        })
    }

    /// Applies chmod/chown/utimens-style changes and commits them.
    pub fn change_metadata(
        &self,
        path: &str,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        mtime: Option<i64>,
    ) -> Result<()> {
        Self::validate_path(path)?;
        if path.is_empty() {
            return Err(Error::InvalidArgument("cannot change the root".to_string()));
        }

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let result = self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &owned, Hints::Unknown)?;
            if let Some(mode) = mode {
                obj.set_mode(mode);
            }
            if let Some(uid) = uid {
                obj.set_uid(uid);
            }
            if let Some(gid) = gid {
                obj.set_gid(gid);
            }
            if let Some(mtime) = mtime {
                obj.set_mtime(mtime);
            }
            obj.commit(req)
        });

        self.cache.remove(path);
        result
    }

    fn create_object(&self, path: &str, object_type: ObjectType, mode: Option<u32>, target: Option<String>) -> Result<()> {
        Self::validate_path(path)?;
        if path.is_empty() {
            return Err(Error::AlreadyExists);
        }

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let result = self.with_request(move |req| {
            match Self::get_object(req, &ctx, &cache, &owned, Hints::Unknown) {
                Ok(_) => return Err(Error::AlreadyExists),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }

            let obj = Object::create(ctx.clone(), &owned, object_type, mode)?;
            if let Some(target) = &target {
                obj.set_symlink_target(target);
            }
            // with no prior etag this commit is the creating PUT
            obj.commit(req)
        });

        self.cache.remove(path);
        result
    }

    /// Creates an empty file (encrypted when the volume is).
    pub fn create_file(&self, path: &str, mode: u32) -> Result<()> {
        let object_type = if self.ctx.config.use_encryption {
            ObjectType::EncryptedFile
        } else {
            ObjectType::File
        };
        self.create_object(path, object_type, Some(mode), None)
    }

    /// Creates a directory marker object.
    pub fn create_directory(&self, path: &str, mode: u32) -> Result<()> {
        self.create_object(path, ObjectType::Directory, Some(mode), None)
    }

    /// Creates a symlink whose body is the target path.
    pub fn create_symlink(&self, path: &str, target: &str) -> Result<()> {
        self.create_object(path, ObjectType::Symlink, None, Some(target.to_string()))
    }

    /// Creates a fake fifo marker object.
    pub fn create_fifo(&self, path: &str, mode: u32) -> Result<()> {
        self.create_object(path, ObjectType::Fifo, Some(mode), None)
    }

    /// Reads a symlink target.
    pub fn read_symlink(&self, path: &str) -> Result<String> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let path = path.to_string();
        self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &path, Hints::File)?;
            if obj.object_type() != ObjectType::Symlink {
                return Err(Error::InvalidArgument(format!("not a symlink: {path}")));
            }

            req.init(HttpMethod::Get)?;
            req.set_url(obj.url(), "");
            req.run(None)?;
            if req.response_code() != 200 {
                return Err(Error::RequestFailed {
                    status: req.response_code(),
                });
            }

            Ok(req.response_string().trim().to_string())
        })
    }

    fn delete_url(req: &mut Request, url: &str) -> Result<()> {
        req.init(HttpMethod::Delete)?;
        req.set_url(url, "");
        req.run(None)?;
        match req.response_code() {
            200 | 204 => Ok(()),
            404 => Err(Error::NotFound),
            status => Err(Error::RequestFailed { status }),
        }
    }

    /// Unlinks a non-directory object.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let result = self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &owned, Hints::File)?;
            if obj.is_directory() {
                return Err(Error::IsDirectory);
            }
            Self::delete_url(req, obj.url())
        });

        self.cache.remove(path);
        result
    }

    /// Removes an empty directory.
    pub fn remove_directory(&self, path: &str) -> Result<()> {
        Self::validate_path(path)?;
        if path.is_empty() {
            return Err(Error::Busy);
        }

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let result = self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &owned, Hints::Directory)?;
            if !obj.is_directory() {
                return Err(Error::NotDirectory);
            }

            if !directory::read_directory(req, &ctx, &owned)?.is_empty() {
                return Err(Error::NotEmpty);
            }
            Self::delete_url(req, obj.url())
        });

        self.cache.remove(path);
        result
    }

    /// Renames a non-directory object. Fails with `EEXIST` when the target
    /// exists; the copy+delete pair is not atomic.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        Self::validate_path(from)?;
        Self::validate_path(to)?;
        if from.is_empty() || to.is_empty() {
            return Err(Error::InvalidArgument("cannot rename the root".to_string()));
        }

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let from_owned = from.to_string();
        let to_owned = to.to_string();
        let result = self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &from_owned, Hints::Unknown)?;
            if obj.is_directory() {
                return Err(Error::InvalidArgument(
                    "directory rename is not supported".to_string(),
                ));
            }

            match Self::get_object(req, &ctx, &cache, &to_owned, Hints::Unknown) {
                Ok(_) => return Err(Error::AlreadyExists),
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }

            let to_url = Object::build_url(&ctx, &to_owned, ObjectType::File);
            let prefix = ctx.service.header_prefix();

            req.init(HttpMethod::Put)?;
            req.set_url(&to_url, "");
            req.set_header("Content-Type", &obj.content_type());
            req.set_header(&format!("{prefix}copy-source"), obj.url());
            req.set_header(&format!("{prefix}copy-source-if-match"), &obj.etag());
            req.set_header(&format!("{prefix}metadata-directive"), "COPY");
            req.run(None)?;
            if req.response_code() != 200 {
                return Err(Error::RequestFailed {
                    status: req.response_code(),
                });
            }

            Self::delete_url(req, obj.url())
        });

        self.cache.remove(from);
        self.cache.remove(to);
        result
    }

    /// Lists a directory, `.` and `..` included; the listed children are
    /// queued for background stat prefetch.
    pub fn read_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let owned = path.to_string();
        let children = self.with_request(move |req| directory::read_directory(req, &ctx, &owned))?;

        for child in &children {
            let ctx = self.ctx.clone();
            let cache = self.cache.clone();
            let child_path = if path.is_empty() {
                child.name.clone()
            } else {
                format!("{path}/{}", child.name)
            };
            let hint = if child.is_directory {
                Hints::Directory
            } else {
                Hints::File
            };

            // warm the cache; a miss here is not the caller's problem
            self.pools.call_async(Queue::Background, move |req| {
                status_of(
                    Self::get_object(req, &ctx, &cache, &child_path, hint).map(|_| ()),
                )
            });
        }

        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                is_directory: true,
            },
            DirEntry {
                name: "..".to_string(),
                is_directory: true,
            },
        ];
        entries.extend(children);
        Ok(entries)
    }

    /// Opens a file, downloading its body into the write-back cache.
    pub fn open(&self, path: &str) -> Result<u64> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let obj =
            self.with_request(move |req| Self::get_object(req, &ctx, &cache, &owned, Hints::Unknown))?;

        match obj.object_type() {
            ObjectType::Directory => Err(Error::IsDirectory),
            ObjectType::Fifo => Err(Error::NoDevice),
            ObjectType::Symlink => Err(Error::InvalidArgument(format!("cannot open symlink: {path}"))),
            ObjectType::File | ObjectType::EncryptedFile => {
                self.open_files.open(obj, self.transfer.as_ref())
            }
        }
    }

    /// Reads from an open file.
    pub fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.open_files.read(handle, buf, offset)
    }

    /// Writes to an open file; data reaches the store on flush or release.
    pub fn write(&self, handle: u64, data: &[u8], offset: u64) -> Result<usize> {
        self.open_files.write(handle, data, offset)
    }

    /// Flushes dirty data for an open file.
    pub fn flush(&self, handle: u64) -> Result<()> {
        let result = self.open_files.flush(handle, self.transfer.as_ref());
        if result.is_ok() {
            if let Ok(obj) = self.open_files.object(handle) {
                self.cache.remove(obj.path());
            }
        }
        result
    }

    /// Closes one descriptor; the last close flushes and drops the entry.
    pub fn release(&self, handle: u64) -> Result<()> {
        let path = self.open_files.object(handle)?.path().to_string();
        let result = self.open_files.release(handle, self.transfer.as_ref());
        // force a fresh stat on next access
        self.cache.remove(&path);
        debug!(path = %path, "released");
        result
    }

    /// Reads one extended attribute.
    pub fn get_xattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let path = path.to_string();
        let name = name.to_string();
        self.with_request(move |req| {
            Self::get_object(req, &ctx, &cache, &path, Hints::Unknown)?.get_metadata(&name)
        })
    }

    /// Lists extended attribute names.
    pub fn list_xattrs(&self, path: &str) -> Result<Vec<String>> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let path = path.to_string();
        self.with_request(move |req| {
            Ok(Self::get_object(req, &ctx, &cache, &path, Hints::Unknown)?.metadata_keys())
        })
    }

    /// Sets one extended attribute, committing when the store must see it.
    pub fn set_xattr(&self, path: &str, name: &str, value: &[u8], mode: SetMode) -> Result<()> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let name = name.to_string();
        let value = value.to_vec();
        let committed = self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &owned, Hints::Unknown)?;
            if obj.set_metadata(&name, &value, mode)? {
                obj.commit(req)?;
                return Ok(true);
            }
            Ok(false)
        })?;

        if committed {
            self.cache.remove(path);
        }
        Ok(())
    }

    /// Removes one extended attribute and commits the change.
    pub fn remove_xattr(&self, path: &str, name: &str) -> Result<()> {
        Self::validate_path(path)?;

        let ctx = self.ctx.clone();
        let cache = self.cache.clone();
        let owned = path.to_string();
        let name = name.to_string();
        let result = self.with_request(move |req| {
            let obj = Self::get_object(req, &ctx, &cache, &owned, Hints::Unknown)?;
            obj.remove_metadata(&name)?;
            obj.commit(req)
        });

        self.cache.remove(path);
        result
    }

    /// Transfer statistics, one line per tag.
    pub fn statistics_summary(&self) -> String {
        self.statistics.summary()
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.terminate();
    }
}
