//! The mount and its per-open file handles.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::{BufferPool, ClusterCache};
use crate::cluster::{load_layout, Layout};
use crate::compression::Codecs;
use crate::config::MountOptions;
use crate::error::{Error, Result};
use crate::footer::{page_offset, PAGE_SIZE};
use crate::inode::Inode;
use crate::lower::{DirLowerFs, LowerFile, LowerFs, Opener};
use crate::read::read_span;
use crate::readahead::{read_pages, Page, ReadAhead};
use crate::write;

/// Mount-wide state the I/O paths and read-ahead workers share.
#[derive(Debug)]
pub(crate) struct Engine {
    pub options: MountOptions,
    pub codecs: Codecs,
    pub cache: ClusterCache,
    pub pool: BufferPool,
}

impl Engine {
    pub fn new(options: MountOptions) -> Engine {
        Engine {
            options,
            codecs: Codecs::new(),
            cache: ClusterCache::default(),
            pool: BufferPool::default(),
        }
    }
}

struct Mount {
    engine: Arc<Engine>,
    readahead: Option<ReadAhead>,
    opener: Opener,
    inodes: Mutex<HashMap<PathBuf, Weak<Inode>>>,
    next_id: AtomicU64,
}

impl Mount {
    /// The inode for `path`, shared with every handle already open on it.
    fn inode(&self, path: &Path) -> Arc<Inode> {
        let mut inodes = self.inodes.lock();
        if let Some(inode) = inodes.get(path).and_then(Weak::upgrade) {
            return inode;
        }

        inodes.retain(|_, inode| inode.strong_count() > 0);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inode = Arc::new(Inode::new(id, path, &self.engine.options));
        inodes.insert(path.to_path_buf(), Arc::downgrade(&inode));
        inode
    }
}

/// Options for [`Scfs::open`], in the manner of [`std::fs::OpenOptions`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    write: bool,
    create: bool,
    truncate: bool,
}

impl OpenOptions {
    pub fn new() -> OpenOptions {
        OpenOptions::default()
    }

    pub fn write(&mut self, write: bool) -> &mut OpenOptions {
        self.write = write;
        self
    }

    /// Create the lower file if it does not exist.
    pub fn create(&mut self, create: bool) -> &mut OpenOptions {
        self.create = create;
        self
    }

    /// Truncate to zero on open, without reading the existing metadata.
    pub fn truncate(&mut self, truncate: bool) -> &mut OpenOptions {
        self.truncate = truncate;
        self
    }
}

/// A compressing file system stacked on a [`LowerFs`].
#[derive(Clone)]
pub struct Scfs {
    mount: Arc<Mount>,
}

impl std::fmt::Debug for Scfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scfs")
            .field("options", &self.mount.engine.options)
            .finish()
    }
}

impl Scfs {
    pub fn new(lower: Arc<dyn LowerFs>, options: MountOptions) -> Result<Scfs> {
        let engine = Arc::new(Engine::new(options));
        let opener = Opener::new(lower)?;

        let workers = engine.options.readahead_workers;
        let readahead = if workers > 0 {
            Some(ReadAhead::new(Arc::clone(&engine), workers)?)
        } else {
            None
        };

        tracing::debug!(options = %engine.options, "mounted");

        Ok(Scfs {
            mount: Arc::new(Mount {
                engine,
                readahead,
                opener,
                inodes: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Mounts on top of a directory of the host file system.
    pub fn with_dir<P: AsRef<Path>>(root: P, options: MountOptions) -> Result<Scfs> {
        Scfs::new(Arc::new(DirLowerFs::new(root)), options)
    }

    #[inline(always)]
    pub fn options(&self) -> &MountOptions {
        &self.mount.engine.options
    }

    pub fn open<P: AsRef<Path>>(&self, path: P, options: &OpenOptions) -> Result<ScfsFile> {
        let path = path.as_ref();
        let inode = self.mount.inode(path);
        let lower = inode.acquire(
            &self.mount.opener,
            options.create,
            self.mount.engine.options.defer_open,
        )?;

        let file = ScfsFile {
            mount: Arc::clone(&self.mount),
            inode,
            lower,
            writable: options.write || options.truncate,
            released: false,
        };

        if options.truncate {
            file.truncate(0)?;
        } else {
            file.inode
                .meta
                .lock()
                .ensure_valid(&*file.lower, &self.mount.engine.options)?;
        }

        Ok(file)
    }

    /// Opens `path` for writing, creating it or truncating it to zero.
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Result<ScfsFile> {
        self.open(path, OpenOptions::new().write(true).create(true).truncate(true))
    }

    /// Opens an existing file for reading.
    pub fn open_read<P: AsRef<Path>>(&self, path: P) -> Result<ScfsFile> {
        self.open(path, &OpenOptions::new())
    }

    /// Stops the deferred-open worker; opens still waiting on it fail.
    pub fn shutdown(&self) {
        self.mount.opener.shutdown();
    }
}

/// An open file. Metadata is flushed when the last handle on a file is closed or dropped.
pub struct ScfsFile {
    mount: Arc<Mount>,
    inode: Arc<Inode>,
    lower: Arc<dyn LowerFile>,
    writable: bool,
    released: bool,
}

impl std::fmt::Debug for ScfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScfsFile")
            .field("inode", &self.inode)
            .field("writable", &self.writable)
            .finish()
    }
}

impl ScfsFile {
    #[inline(always)]
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Logical size, including data not yet flushed to the lower file.
    pub fn size(&self) -> u64 {
        self.inode.size()
    }

    pub fn cluster_size(&self) -> u32 {
        self.inode.cluster_size()
    }

    pub fn is_compressed(&self) -> bool {
        self.inode.is_compressed()
    }

    fn engine(&self) -> &Engine {
        &self.mount.engine
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::unsupported("handle is not open for writing"));
        }
        Ok(())
    }

    /// Reads page `index`: [`PAGE_SIZE`] bytes, zero past the end of the file.
    pub fn read_page(&self, index: u64) -> Result<Vec<u8>> {
        let mut page = vec![0u8; PAGE_SIZE];
        if let Some(pos) = page_offset(index) {
            read_span(self.engine(), &self.inode, &*self.lower, pos, &mut page)?;
        }
        Ok(page)
    }

    /// Reads `count` pages from page `first` in one batch, handing all but the
    /// first cluster's pages to the read-ahead workers.
    pub fn read_pages(&self, first: u64, count: usize) -> Vec<Arc<Page>> {
        read_pages(
            self.engine(),
            self.mount.readahead.as_ref(),
            &self.inode,
            &self.lower,
            first,
            count,
        )
    }

    /// Reads up to `buf.len()` bytes at `pos`, returning how many lie inside the file.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> Result<usize> {
        let cluster_size = self.cluster_size() as u64;
        let mut done = 0;

        while done < buf.len() {
            let at = match pos.checked_add(done as u64) {
                Some(at) => at,
                None => break,
            };
            let span = ((cluster_size - at % cluster_size) as usize).min(buf.len() - done);
            let n = read_span(
                self.engine(),
                &self.inode,
                &*self.lower,
                at,
                &mut buf[done..done + span],
            )?;
            done += n;
            if n < span {
                break;
            }
        }

        Ok(done)
    }

    /// A [`Read`] implementation starting at offset zero.
    pub fn reader(&self) -> Reader<'_> {
        Reader { file: self, pos: 0 }
    }

    /// Prepares a write of `len` bytes at `pos`, which must equal the current size.
    pub fn write_begin(&self, pos: u64, len: usize) -> Result<()> {
        self.check_writable()?;
        let mut meta = self.inode.meta.lock();
        write::write_begin(self.engine(), self.inode.id, &mut meta, &*self.lower, pos, len)
    }

    /// Completes a write started with [`ScfsFile::write_begin`].
    pub fn write_end(&self, pos: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let mut meta = self.inode.meta.lock();
        write::write_end(self.engine(), self.inode.id, &mut meta, &*self.lower, pos, data)
    }

    /// Appends `data` at the end of the file, one cluster at a time.
    pub fn append(&self, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let engine = self.engine();
        let mut done = 0;

        while done < data.len() {
            let mut meta = self.inode.meta.lock();
            meta.ensure_valid(&*self.lower, &engine.options)?;

            let pos = meta.size;
            let cluster_size = meta.cluster_size as u64;
            let n = ((cluster_size - pos % cluster_size) as usize).min(data.len() - done);

            write::write_begin(engine, self.inode.id, &mut meta, &*self.lower, pos, n)?;
            done += write::write_end(
                engine,
                self.inode.id,
                &mut meta,
                &*self.lower,
                pos,
                &data[done..done + n],
            )?;
        }

        Ok(done)
    }

    /// Truncates the file; only `size == 0` is supported.
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.check_writable()?;
        let mut meta = self.inode.meta.lock();
        write::truncate(self.engine(), self.inode.id, &mut meta, &*self.lower, size)
    }

    /// Closes the handle, reporting any error from flushing metadata.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let engine = &self.mount.engine;
        let id = self.inode.id;
        self.inode
            .release(|meta, lower| write::write_meta(engine, id, meta, lower))
    }
}

impl Drop for ScfsFile {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::error!(
                path = %self.inode.path.display(),
                error = %err,
                "failed to flush metadata"
            );
        }
    }
}

impl Write for ScfsFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.append(buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Sequential reader over an [`ScfsFile`].
#[derive(Debug)]
pub struct Reader<'a> {
    file: &'a ScfsFile,
    pos: u64,
}

impl Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.file.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// Reads the footer and full cluster table of a lower file without mounting it.
///
/// Returns `None` for an empty lower file.
pub fn inspect(lower: &dyn LowerFile) -> Result<Option<Layout>> {
    load_layout(lower)
}
