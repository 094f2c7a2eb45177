//! Access to the file system SCFS is stacked on.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Consecutive interrupted or would-block calls [`read_exact`] and [`write_exact`]
/// tolerate without progress before giving up.
pub const MAX_RETRIES: usize = 10;

/// One open file on the lower file system.
pub trait LowerFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<usize>;
    fn write_at(&self, buf: &[u8], pos: u64) -> std::io::Result<usize>;
    fn truncate(&self, size: u64) -> std::io::Result<()>;
    fn size(&self) -> std::io::Result<u64>;

    /// Hint that `len` bytes from `pos` will be read soon.
    fn readahead(&self, _pos: u64, _len: u64) {}
}

/// The lower file system itself.
pub trait LowerFs: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> std::io::Result<Arc<dyn LowerFile>>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct OpenMode {
    pub write: bool,
    pub create: bool,
}

impl OpenMode {
    pub fn read_only() -> OpenMode {
        OpenMode::default()
    }
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    )
}

/// Reads exactly `buf.len()` bytes at `pos`, continuing after short reads and
/// retrying interrupted ones.
pub fn read_exact(lower: &dyn LowerFile, buf: &mut [u8], pos: u64) -> Result<usize> {
    let mut done = 0;
    let mut attempts = 0;

    while done < buf.len() {
        match lower.read_at(&mut buf[done..], pos + done as u64) {
            Ok(0) => {
                return Err(Error::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "short read at {:#x}: {} of {} bytes",
                            pos,
                            done,
                            buf.len()
                        ),
                    ),
                })
            }
            Ok(n) => {
                done += n;
                attempts = 0;
            }
            Err(e) if is_retryable(&e) => {
                attempts += 1;
                if attempts == MAX_RETRIES {
                    return Err(Error::TooManyRetries {
                        attempts,
                        pos: pos + done as u64,
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(done)
}

/// Writes all of `buf` at `pos`, continuing after short writes and retrying
/// interrupted ones.
pub fn write_exact(lower: &dyn LowerFile, buf: &[u8], pos: u64) -> Result<usize> {
    let mut done = 0;
    let mut attempts = 0;

    while done < buf.len() {
        match lower.write_at(&buf[done..], pos + done as u64) {
            Ok(0) => {
                return Err(Error::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("lower file accepted no bytes at {:#x}", pos + done as u64),
                    ),
                })
            }
            Ok(n) => {
                done += n;
                attempts = 0;
            }
            Err(e) if is_retryable(&e) => {
                attempts += 1;
                if attempts == MAX_RETRIES {
                    return Err(Error::TooManyRetries {
                        attempts,
                        pos: pos + done as u64,
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(done)
}

impl LowerFile for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, pos)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, pos)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], pos: u64) -> std::io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, pos)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], pos: u64) -> std::io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, pos)
    }

    fn truncate(&self, size: u64) -> std::io::Result<()> {
        self.set_len(size)
    }

    fn size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// A directory of the host file system used as the lower file system.
#[derive(Debug, Clone)]
pub struct DirLowerFs {
    root: PathBuf,
}

impl DirLowerFs {
    pub fn new<P: AsRef<Path>>(root: P) -> DirLowerFs {
        DirLowerFs {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[inline(always)]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LowerFs for DirLowerFs {
    fn open(&self, path: &Path, mode: OpenMode) -> std::io::Result<Arc<dyn LowerFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode.write)
            .create(mode.create)
            .open(self.root.join(path))?;
        Ok(Arc::new(file))
    }
}

/// Opens read-write when `mode` asks for it and the lower file system permits it,
/// otherwise falls back to read-only.
fn open_privileged(
    lower: &dyn LowerFs,
    path: &Path,
    mode: OpenMode,
) -> std::io::Result<Arc<dyn LowerFile>> {
    if !mode.write {
        return lower.open(path, mode);
    }

    match lower.open(path, mode) {
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::debug!(path = %path.display(), "read-write open denied, opening read-only");
            lower.open(path, OpenMode::read_only())
        }
        other => other,
    }
}

struct OpenRequest {
    path: PathBuf,
    mode: OpenMode,
    reply: mpsc::SyncSender<Result<Arc<dyn LowerFile>>>,
}

/// An open handed to the opener thread; [`PendingOpen::wait`] blocks until it completes.
pub struct PendingOpen {
    rx: mpsc::Receiver<Result<Arc<dyn LowerFile>>>,
}

impl PendingOpen {
    pub fn wait(self) -> Result<Arc<dyn LowerFile>> {
        // A dropped sender means the opener went away with this request still queued.
        self.rx.recv().unwrap_or(Err(Error::ShuttingDown))
    }
}

pub enum OpenOutcome {
    Ready(Arc<dyn LowerFile>),
    Deferred(PendingOpen),
}

impl OpenOutcome {
    pub fn wait(self) -> Result<Arc<dyn LowerFile>> {
        match self {
            OpenOutcome::Ready(file) => Ok(file),
            OpenOutcome::Deferred(pending) => pending.wait(),
        }
    }
}

/// Opens lower files, either on the calling thread or on a dedicated helper thread
/// for callers that must not block on the lower file system themselves.
pub struct Opener {
    lower: Arc<dyn LowerFs>,
    tx: Mutex<Option<mpsc::Sender<OpenRequest>>>,
    shutting_down: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Opener {
    pub fn new(lower: Arc<dyn LowerFs>) -> std::io::Result<Opener> {
        let (tx, rx) = mpsc::channel::<OpenRequest>();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let worker = {
            let lower = Arc::clone(&lower);
            let shutting_down = Arc::clone(&shutting_down);

            std::thread::Builder::new()
                .name("scfs-opener".into())
                .spawn(move || {
                    tracing::debug!("opener started");
                    for request in rx {
                        let result = if shutting_down.load(Ordering::Acquire) {
                            Err(Error::ShuttingDown)
                        } else {
                            open_privileged(&*lower, &request.path, request.mode)
                                .map_err(Error::from)
                        };
                        let _ = request.reply.send(result);
                    }
                    tracing::debug!("opener stopped");
                })?
        };

        Ok(Opener {
            lower,
            tx: Mutex::new(Some(tx)),
            shutting_down,
            worker: Some(worker),
        })
    }

    /// Opens `path`, deferring the open to the helper thread when `defer` is set.
    pub fn open(&self, path: &Path, mode: OpenMode, defer: bool) -> Result<OpenOutcome> {
        if !defer {
            return Ok(OpenOutcome::Ready(open_privileged(&*self.lower, path, mode)?));
        }

        let (reply, rx) = mpsc::sync_channel(1);
        let request = OpenRequest {
            path: path.to_path_buf(),
            mode,
            reply,
        };

        match &*self.tx.lock() {
            Some(tx) => tx.send(request).map_err(|_| Error::ShuttingDown)?,
            None => return Err(Error::ShuttingDown),
        }

        tracing::trace!(path = %path.display(), "deferred lower open");
        Ok(OpenOutcome::Deferred(PendingOpen { rx }))
    }

    /// Stops accepting requests. Queued requests fail with [`Error::ShuttingDown`];
    /// an open already in progress runs to completion.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.tx.lock().take();
    }
}

impl Drop for Opener {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Hands out at most `step` bytes per call and fails every other call with `Interrupted`.
    struct Flaky {
        data: Mutex<Vec<u8>>,
        step: usize,
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new(len: usize, step: usize) -> Flaky {
            Flaky {
                data: Mutex::new((0..len).map(|i| i as u8).collect()),
                step,
                calls: AtomicUsize::new(0),
            }
        }

        fn interrupted(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1
        }
    }

    impl LowerFile for Flaky {
        fn read_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
            if self.interrupted() {
                return Err(std::io::ErrorKind::Interrupted.into());
            }
            let data = self.data.lock();
            let start = (pos as usize).min(data.len());
            let n = buf.len().min(self.step).min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }

        fn write_at(&self, buf: &[u8], pos: u64) -> std::io::Result<usize> {
            if self.interrupted() {
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            let mut data = self.data.lock();
            let n = buf.len().min(self.step);
            let end = pos as usize + n;
            if data.len() < end {
                data.resize(end, 0);
            }
            data[pos as usize..end].copy_from_slice(&buf[..n]);
            Ok(n)
        }

        fn truncate(&self, size: u64) -> std::io::Result<()> {
            self.data.lock().truncate(size as usize);
            Ok(())
        }

        fn size(&self) -> std::io::Result<u64> {
            Ok(self.data.lock().len() as u64)
        }
    }

    #[test]
    fn read_exact_retries_partial_reads() {
        let file = Flaky::new(64, 8);
        let mut buf = [0u8; 32];
        assert_eq!(read_exact(&file, &mut buf, 16).unwrap(), 32);
        assert_eq!(buf[0], 16);
        assert_eq!(buf[31], 47);
    }

    /// Never makes progress.
    struct Stalled;

    impl LowerFile for Stalled {
        fn read_at(&self, _buf: &mut [u8], _pos: u64) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::Interrupted.into())
        }

        fn write_at(&self, _buf: &[u8], _pos: u64) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::WouldBlock.into())
        }

        fn truncate(&self, _size: u64) -> std::io::Result<()> {
            Ok(())
        }

        fn size(&self) -> std::io::Result<u64> {
            Ok(64)
        }
    }

    #[test]
    fn read_exact_gives_up() {
        let mut buf = [0u8; 32];
        let err = read_exact(&Stalled, &mut buf, 0).unwrap_err();
        assert!(matches!(err, Error::TooManyRetries { attempts: MAX_RETRIES, .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Io);

        let err = write_exact(&Stalled, b"abc", 0).unwrap_err();
        assert!(matches!(err, Error::TooManyRetries { attempts: MAX_RETRIES, .. }));
    }

    #[test]
    fn many_short_reads_and_writes_complete() {
        let file = Flaky::new(16384, 1024);
        let mut buf = vec![0u8; 16384];
        assert_eq!(read_exact(&file, &mut buf, 0).unwrap(), 16384);
        assert_eq!(buf[10_000], (10_000 % 256) as u8);

        let data = vec![0x5au8; 16384];
        assert_eq!(write_exact(&file, &data, 16384).unwrap(), 16384);
        assert_eq!(&file.data.lock()[16384..], &data[..]);
    }

    #[test]
    fn read_exact_short_file() {
        let file = Flaky::new(10, 64);
        let mut buf = [0u8; 32];
        assert_eq!(
            read_exact(&file, &mut buf, 0).unwrap_err().kind(),
            crate::ErrorKind::Io
        );
    }

    #[test]
    fn write_exact_retries() {
        let file = Flaky::new(0, 4);
        assert_eq!(write_exact(&file, b"0123456789", 2).unwrap(), 10);
        assert_eq!(&file.data.lock()[2..], b"0123456789");
    }

    #[test]
    fn direct_and_deferred_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hello").unwrap();
        let opener = Opener::new(Arc::new(DirLowerFs::new(dir.path()))).unwrap();

        let mode = OpenMode {
            write: true,
            create: false,
        };
        let direct = opener.open(Path::new("a"), mode, false).unwrap();
        assert!(matches!(direct, OpenOutcome::Ready(_)));
        assert_eq!(direct.wait().unwrap().size().unwrap(), 5);

        let deferred = opener.open(Path::new("a"), mode, true).unwrap();
        assert!(matches!(deferred, OpenOutcome::Deferred(_)));
        assert_eq!(deferred.wait().unwrap().size().unwrap(), 5);

        let missing = opener.open(Path::new("nope"), mode, true).unwrap();
        assert_eq!(missing.wait().err().unwrap().kind(), crate::ErrorKind::Io);
    }

    /// Blocks every open until the test lets it through.
    struct Gated {
        inner: DirLowerFs,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl LowerFs for Gated {
        fn open(&self, path: &Path, mode: OpenMode) -> std::io::Result<Arc<dyn LowerFile>> {
            let _ = self.gate.lock().recv();
            self.inner.open(path, mode)
        }
    }

    #[test]
    fn shutdown_wakes_waiters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hello").unwrap();
        let (release, gate) = mpsc::channel();
        let opener = Opener::new(Arc::new(Gated {
            inner: DirLowerFs::new(dir.path()),
            gate: Mutex::new(gate),
        }))
        .unwrap();

        let first = opener
            .open(Path::new("a"), OpenMode::read_only(), true)
            .unwrap();
        let second = opener
            .open(Path::new("a"), OpenMode::read_only(), true)
            .unwrap();

        opener.shutdown();
        assert!(opener
            .open(Path::new("a"), OpenMode::read_only(), true)
            .is_err());

        release.send(()).unwrap();
        drop(release);

        // The first request may already be in flight; the second is still queued.
        let _ = first.wait();
        let err = second.wait().err().unwrap();
        assert!(matches!(err, Error::ShuttingDown));
    }
}
