use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use s3fuse_base::error::{Error, Result};

use crate::object::Object;

/// Moves file bodies between the store and a local scratch file.
///
/// Implemented by the transfer layer; tests substitute their own.
pub trait FileStore: Send + Sync {
    /// Fills `scratch` with the object's body.
    fn download(&self, object: &Arc<Object>, scratch: &File) -> Result<()>;
    /// Writes `scratch` back as the object's body and commits metadata.
    fn upload(&self, object: &Arc<Object>, scratch: &File) -> Result<()>;
}

struct FileState {
    refs: u32,
    /// Reads/writes currently touching the scratch file.
    active_io: u32,
    dirty: bool,
    flushing: bool,
    /// Errno from a failed flush; reported until the last descriptor closes.
    async_error: i32,
}

/// One open file: the object, its scratch file, and the status machine.
///
/// All descriptors for a path share one entry; the scratch file holds the
/// authoritative body while the file is open.
pub struct OpenFile {
    object: Arc<Object>,
    scratch: File,
    state: Mutex<FileState>,
    cond: Condvar,
}

impl OpenFile {
    /// The object backing this open file.
    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    /// Current size of the scratch file.
    pub fn scratch_size(&self) -> Result<u64> {
        Ok(self.scratch.metadata()?.len())
    }
}

struct TableInner {
    entries: HashMap<u64, Arc<OpenFile>>,
    by_path: HashMap<String, u64>,
    /// Paths whose first open is still downloading.
    opening: HashSet<String>,
    next_handle: u64,
}

/// Handle → open-file map.
pub struct OpenFileTable {
    inner: Mutex<TableInner>,
    cond: Condvar,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    /// Builds an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                by_path: HashMap::new(),
                opening: HashSet::new(),
                next_handle: 1,
            }),
            cond: Condvar::new(),
        }
    }

    fn entry(&self, handle: u64) -> Result<Arc<OpenFile>> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("bad file handle {handle}")))
    }

    /// Opens `object`, downloading its body into a fresh scratch file, or
    /// shares the existing entry when the path is already open.
    pub fn open(&self, object: Arc<Object>, store: &dyn FileStore) -> Result<u64> {
        let path = object.path().to_string();

        loop {
            let mut inner = self.inner.lock().unwrap();

            if inner.opening.contains(&path) {
                // first open of this path is still downloading
                let _unused = self.cond.wait(inner).unwrap();
                continue;
            }

            if let Some(&handle) = inner.by_path.get(&path) {
                let entry = inner.entries[&handle].clone();
                entry.state.lock().unwrap().refs += 1;
                debug!(path = %path, handle, "sharing open file");
                return Ok(handle);
            }

            inner.opening.insert(path.clone());
            break;
        }

        // no table lock across the download
        let downloaded = tempfile::tempfile().map_err(Error::Io).and_then(|scratch| {
            store.download(&object, &scratch)?;
            Ok(scratch)
        });

        let mut inner = self.inner.lock().unwrap();
        inner.opening.remove(&path);
        self.cond.notify_all();

        let scratch = downloaded?;
        let handle = inner.next_handle;
        inner.next_handle += 1;

        inner.entries.insert(
            handle,
            Arc::new(OpenFile {
                object,
                scratch,
                state: Mutex::new(FileState {
                    refs: 1,
                    active_io: 0,
                    dirty: false,
                    flushing: false,
                    async_error: 0,
                }),
                cond: Condvar::new(),
            }),
        );
        inner.by_path.insert(path.clone(), handle);

        debug!(path = %path, handle, "opened");
        Ok(handle)
    }

    /// Reads from the scratch file. `EBUSY` while a flush is running.
    pub fn read(&self, handle: u64, buf: &mut [u8], offset: u64) -> Result<usize> {
        let entry = self.entry(handle)?;
        Self::begin_io(&entry)?;

        let result = entry.scratch.read_at(buf, offset);

        Self::end_io(&entry, false);
        Ok(result?)
    }

    /// Writes into the scratch file and marks the entry dirty. `EBUSY`
    /// while a flush is running.
    pub fn write(&self, handle: u64, data: &[u8], offset: u64) -> Result<usize> {
        let entry = self.entry(handle)?;
        Self::begin_io(&entry)?;

        let result = entry.scratch.write_all_at(data, offset);

        Self::end_io(&entry, result.is_ok());
        result?;
        Ok(data.len())
    }

    fn begin_io(entry: &OpenFile) -> Result<()> {
        let mut state = entry.state.lock().unwrap();
        if state.flushing {
            return Err(Error::Busy);
        }
        state.active_io += 1;
        Ok(())
    }

    fn end_io(entry: &OpenFile, wrote: bool) {
        let mut state = entry.state.lock().unwrap();
        state.active_io -= 1;
        if wrote {
            state.dirty = true;
        }
        entry.cond.notify_all();
    }

    /// Uploads the scratch file if the entry is dirty.
    ///
    /// `EBUSY` while reads/writes are in flight or another flush is running;
    /// a failed flush leaves a sticky error that every later flush reports.
    pub fn flush(&self, handle: u64, store: &dyn FileStore) -> Result<()> {
        let entry = self.entry(handle)?;

        {
            let mut state = entry.state.lock().unwrap();
            if state.async_error != 0 {
                return Err(Error::from_errno(state.async_error));
            }
            if state.active_io > 0 || state.flushing {
                return Err(Error::Busy);
            }
            if !state.dirty {
                return Ok(());
            }
            state.flushing = true;
        }

        let result = store.upload(&entry.object, &entry.scratch);

        let mut state = entry.state.lock().unwrap();
        state.flushing = false;
        match &result {
            Ok(()) => state.dirty = false,
            Err(e) => {
                warn!(path = entry.object.path(), error = %e, "flush failed");
                state.async_error = e.to_errno();
            }
        }
        entry.cond.notify_all();

        result
    }

    /// Drops one reference; the last close flushes dirty data and destroys
    /// the entry (the scratch file goes with it).
    pub fn release(&self, handle: u64, store: &dyn FileStore) -> Result<()> {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .entries
                .get(&handle)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("bad file handle {handle}")))?;

            let refs = {
                let mut state = entry.state.lock().unwrap();
                state.refs -= 1;
                state.refs
            };
            if refs > 0 {
                return Ok(());
            }

            inner.entries.remove(&handle);
            inner.by_path.remove(entry.object.path());
            entry
        };

        // last descriptor: drain in-flight I/O, then flush
        {
            let mut state = entry.state.lock().unwrap();
            while state.active_io > 0 || state.flushing {
                state = entry.cond.wait(state).unwrap();
            }
            if state.async_error != 0 {
                let sticky = state.async_error;
                debug!(path = entry.object.path(), "close reports earlier flush error");
                return Err(Error::from_errno(sticky));
            }
            if !state.dirty {
                return Ok(());
            }
            state.flushing = true;
        }

        let result = store.upload(&entry.object, &entry.scratch);

        let mut state = entry.state.lock().unwrap();
        state.flushing = false;
        if result.is_ok() {
            state.dirty = false;
        }
        entry.cond.notify_all();

        result
    }

    /// The object behind a handle.
    pub fn object(&self, handle: u64) -> Result<Arc<Object>> {
        Ok(self.entry(handle)?.object.clone())
    }

    /// Number of open entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// True when nothing is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::object::ObjectType;
    use std::time::Duration;

    struct MockStore {
        content: Vec<u8>,
        uploads: Mutex<Vec<Vec<u8>>>,
        upload_delay: Duration,
        fail_uploads: bool,
    }

    impl MockStore {
        fn with_content(content: &[u8]) -> Self {
            Self {
                content: content.to_vec(),
                uploads: Mutex::new(Vec::new()),
                upload_delay: Duration::ZERO,
                fail_uploads: false,
            }
        }

        fn uploads(&self) -> Vec<Vec<u8>> {
            self.uploads.lock().unwrap().clone()
        }
    }

    impl FileStore for MockStore {
        fn download(&self, _object: &Arc<Object>, scratch: &File) -> Result<()> {
            scratch.write_all_at(&self.content, 0)?;
            Ok(())
        }

        fn upload(&self, object: &Arc<Object>, scratch: &File) -> Result<()> {
            std::thread::sleep(self.upload_delay);
            if self.fail_uploads {
                return Err(Error::RequestFailed { status: 500 });
            }

            let len = scratch.metadata()?.len();
            let mut body = vec![0u8; len as usize];
            scratch.read_at(&mut body, 0)?;
            object.set_size(len);
            self.uploads.lock().unwrap().push(body);
            Ok(())
        }
    }

    fn file_object(path: &str) -> Arc<Object> {
        Object::create(test_context(), path, ObjectType::File, None).unwrap()
    }

    #[test]
    fn test_open_downloads_and_read_returns_body() {
        let table = OpenFileTable::new();
        let store = MockStore::with_content(b"hello world");

        let handle = table.open(file_object("hello"), &store).unwrap();
        let mut buf = [0u8; 11];
        assert_eq!(table.read(handle, &mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello world");

        table.release(handle, &store).unwrap();
        assert!(table.is_empty());
        assert!(store.uploads().is_empty());
    }

    #[test]
    fn test_second_open_shares_entry() {
        let table = OpenFileTable::new();
        let store = MockStore::with_content(b"data");

        let h1 = table.open(file_object("f"), &store).unwrap();
        let h2 = table.open(file_object("f"), &store).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(table.len(), 1);

        table.release(h1, &store).unwrap();
        assert_eq!(table.len(), 1);
        table.release(h2, &store).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_write_then_release_uploads() {
        let table = OpenFileTable::new();
        let store = MockStore::with_content(b"old");

        let handle = table.open(file_object("f"), &store).unwrap();
        assert_eq!(table.write(handle, b"new content", 0).unwrap(), 11);
        table.release(handle, &store).unwrap();

        assert_eq!(store.uploads(), vec![b"new content".to_vec()]);
    }

    #[test]
    fn test_flush_clears_dirty_once() {
        let table = OpenFileTable::new();
        let store = MockStore::with_content(b"");

        let handle = table.open(file_object("f"), &store).unwrap();
        table.write(handle, b"x", 0).unwrap();

        table.flush(handle, &store).unwrap();
        table.flush(handle, &store).unwrap();
        assert_eq!(store.uploads().len(), 1);

        table.release(handle, &store).unwrap();
        assert_eq!(store.uploads().len(), 1);
    }

    #[test]
    fn test_write_rejected_while_flushing() {
        let table = Arc::new(OpenFileTable::new());
        let store = Arc::new(MockStore {
            upload_delay: Duration::from_millis(100),
            ..MockStore::with_content(b"")
        });

        let handle = table.open(file_object("f"), store.as_ref()).unwrap();
        table.write(handle, b"dirty", 0).unwrap();

        let flusher = {
            let table = table.clone();
            let store = store.clone();
            std::thread::spawn(move || table.flush(handle, store.as_ref()))
        };

        // let the flusher take the flushing bit, then try to write
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(
            table.write(handle, b"late", 0),
            Err(Error::Busy)
        ));
        assert!(matches!(table.flush(handle, store.as_ref()), Err(Error::Busy)));

        flusher.join().unwrap().unwrap();
        // after the flush completes, writes are accepted again
        table.write(handle, b"late", 0).unwrap();
    }

    #[test]
    fn test_flush_error_is_sticky_until_close() {
        let table = OpenFileTable::new();
        let store = MockStore {
            fail_uploads: true,
            ..MockStore::with_content(b"")
        };

        let handle = table.open(file_object("f"), &store).unwrap();
        table.write(handle, b"x", 0).unwrap();

        assert!(table.flush(handle, &store).is_err());
        // the sticky error keeps reporting, even though nothing new failed
        assert!(table.flush(handle, &store).is_err());
        assert!(table.release(handle, &store).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_bad_handle_is_invalid_argument() {
        let table = OpenFileTable::new();
        let store = MockStore::with_content(b"");
        let mut buf = [0u8; 1];

        assert!(matches!(
            table.read(99, &mut buf, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.flush(99, &store),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.release(99, &store),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_interleaved_writes_last_wins() {
        let table = OpenFileTable::new();
        let store = MockStore::with_content(b"");

        let h1 = table.open(file_object("f"), &store).unwrap();
        let h2 = table.open(file_object("f"), &store).unwrap();

        table.write(h1, b"aaaa", 0).unwrap();
        table.write(h2, b"bb", 0).unwrap();
        table.release(h1, &store).unwrap();
        table.release(h2, &store).unwrap();

        assert_eq!(store.uploads(), vec![b"bbaa".to_vec()]);
    }
}
