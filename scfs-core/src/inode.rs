//! Per-file state shared by every open handle on the same file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::{load_layout, ClusterTable, MetaState};
use crate::compression::CompressionType;
use crate::config::MountOptions;
use crate::error::Result;
use crate::lower::{LowerFile, OpenMode, Opener};

/// The cluster being assembled from incoming writes.
#[derive(Debug)]
pub(crate) struct Accumulator {
    /// Raw bytes of the cluster, `len` of them valid.
    pub raw: Vec<u8>,
    /// Compressed output of the last flush.
    pub scratch: Vec<u8>,
    pub len: usize,
    pub cluster: u64,
}

#[derive(Debug)]
pub(crate) struct FileMeta {
    /// Logical size of the file.
    pub size: u64,
    pub cluster_size: u32,
    pub comp_type: CompressionType,
    pub compressed: bool,
    pub table: ClusterTable,
    pub accum: Option<Accumulator>,
    /// Written since the footer was last rewritten at close.
    pub dirty: bool,
}

impl FileMeta {
    fn new(options: &MountOptions) -> FileMeta {
        FileMeta {
            size: 0,
            cluster_size: options.cluster_size,
            comp_type: options.comp_type,
            compressed: !options.nocomp,
            table: ClusterTable::new(),
            accum: None,
            dirty: false,
        }
    }

    fn adopt_mount(&mut self, options: &MountOptions) {
        self.size = 0;
        self.cluster_size = options.cluster_size;
        self.comp_type = options.comp_type;
        self.compressed = !options.nocomp;
    }

    /// Re-reads footer and cluster table from the end of `lower`.
    ///
    /// While the file is dirty the in-memory size and tail list stay authoritative;
    /// only the committed array is replaced. A file holding no data takes the
    /// mount's settings, as its footer cannot tell the two layouts apart.
    pub fn reload(&mut self, lower: &dyn LowerFile, options: &MountOptions) -> Result<()> {
        let layout = load_layout(lower)?;

        match layout {
            None => {
                if !self.dirty {
                    self.adopt_mount(options);
                }
                self.table.install(Vec::new());
            }
            Some(layout) => {
                if self.dirty {
                    // Size and tail stay as written.
                } else if layout.footer.original_size() == 0 && layout.clusters.is_empty() {
                    self.adopt_mount(options);
                } else {
                    self.size = layout.footer.original_size();
                    self.cluster_size = layout.footer.cluster_size;
                    self.comp_type = layout.footer.comp_type;
                    self.compressed = layout.footer.is_compressed();
                }
                if self.compressed {
                    self.table.install(layout.clusters);
                } else {
                    self.table.install(Vec::new());
                }
            }
        }

        tracing::debug!(
            size = self.size,
            cluster_size = self.cluster_size,
            compressed = self.compressed,
            committed = self.table.committed_len(),
            tail = self.table.tail().len(),
            "reloaded metadata"
        );
        Ok(())
    }

    /// Reloads the cluster table if it was marked stale.
    #[inline]
    pub fn ensure_valid(&mut self, lower: &dyn LowerFile, options: &MountOptions) -> Result<()> {
        if self.table.state() == MetaState::Invalid {
            self.reload(lower, options)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct LowerHandle {
    pub refs: usize,
    pub file: Option<Arc<dyn LowerFile>>,
}

/// One file of the mount.
///
/// Lock order is `lower` before `meta`.
pub struct Inode {
    pub(crate) id: u64,
    pub(crate) path: PathBuf,
    pub(crate) lower: Mutex<LowerHandle>,
    pub(crate) meta: Mutex<FileMeta>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Inode {
    pub(crate) fn new(id: u64, path: &Path, options: &MountOptions) -> Inode {
        Inode {
            id,
            path: path.to_path_buf(),
            lower: Mutex::new(LowerHandle::default()),
            meta: Mutex::new(FileMeta::new(options)),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical size of the file, including data not yet flushed.
    pub fn size(&self) -> u64 {
        self.meta.lock().size
    }

    pub fn cluster_size(&self) -> u32 {
        self.meta.lock().cluster_size
    }

    pub fn is_compressed(&self) -> bool {
        self.meta.lock().compressed
    }

    /// Takes a reference on the lower file, opening it on the first one.
    pub(crate) fn acquire(
        &self,
        opener: &Opener,
        create: bool,
        defer: bool,
    ) -> Result<Arc<dyn LowerFile>> {
        let mut lower = self.lower.lock();

        if let Some(file) = lower.file.clone() {
            lower.refs += 1;
            return Ok(file);
        }

        let mode = OpenMode {
            write: true,
            create,
        };
        let file = opener.open(&self.path, mode, defer)?.wait()?;

        tracing::debug!(inode = self.id, path = %self.path.display(), "opened lower file");
        lower.file = Some(Arc::clone(&file));
        lower.refs = 1;
        Ok(file)
    }

    /// Drops a reference on the lower file. The last one flushes metadata and closes it.
    pub(crate) fn release(
        &self,
        flush: impl FnOnce(&mut FileMeta, &dyn LowerFile) -> Result<()>,
    ) -> Result<()> {
        let mut lower = self.lower.lock();
        lower.refs = lower.refs.saturating_sub(1);
        if lower.refs > 0 {
            return Ok(());
        }

        let file = match lower.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };

        let mut meta = self.meta.lock();
        let result = flush(&mut meta, &*file);
        meta.accum = None;
        meta.dirty = false;
        meta.table.invalidate();

        tracing::debug!(inode = self.id, path = %self.path.display(), "closed lower file");
        result
    }
}
