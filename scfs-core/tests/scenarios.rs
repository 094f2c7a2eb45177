use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use rand::RngCore;
use scfs_core::{
    inspect, DirLowerFs, ErrorKind, Layout, LowerFile, LowerFs, MountOptions, OpenMode,
    OpenOptions, Scfs, FOOTER_SIZE, PAGE_SIZE,
};

fn layout(path: &Path) -> Layout {
    let file = std::fs::File::open(path).unwrap();
    inspect(&file).unwrap().expect("lower file is empty")
}

fn read_all(scfs: &Scfs, path: &str) -> Vec<u8> {
    let file = scfs.open_read(path).unwrap();
    let mut buf = vec![0u8; file.size() as usize];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), buf.len());
    file.close().unwrap();
    buf
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i / 3) % 251) as u8).collect()
}

struct CountingFile {
    inner: Arc<dyn LowerFile>,
    reads: Arc<AtomicUsize>,
}

impl LowerFile for CountingFile {
    fn read_at(&self, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_at(buf, pos)
    }

    fn write_at(&self, buf: &[u8], pos: u64) -> std::io::Result<usize> {
        self.inner.write_at(buf, pos)
    }

    fn truncate(&self, size: u64) -> std::io::Result<()> {
        self.inner.truncate(size)
    }

    fn size(&self) -> std::io::Result<u64> {
        self.inner.size()
    }
}

/// Counts every read issued against files it opens.
struct CountingFs {
    inner: DirLowerFs,
    reads: Arc<AtomicUsize>,
}

impl LowerFs for CountingFs {
    fn open(&self, path: &Path, mode: OpenMode) -> std::io::Result<Arc<dyn LowerFile>> {
        Ok(Arc::new(CountingFile {
            inner: self.inner.open(path, mode)?,
            reads: Arc::clone(&self.reads),
        }))
    }
}

#[test]
fn zero_cluster_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();
    let cluster_size = scfs.options().cluster_size as usize;
    let zeros = vec![0u8; cluster_size];

    let file = scfs.create("zeros").unwrap();
    file.write_begin(0, zeros.len()).unwrap();
    assert_eq!(file.write_end(0, &zeros).unwrap(), zeros.len());
    file.close().unwrap();

    assert_eq!(read_all(&scfs, "zeros"), zeros);

    let layout = layout(&dir.path().join("zeros"));
    assert_eq!(layout.clusters.len(), 1);
    assert!((layout.clusters[0].size as usize) < cluster_size);
}

#[test]
fn two_clusters_in_two_writes() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();
    let cluster_size = scfs.options().cluster_size as usize;
    let data = patterned(cluster_size + 100);

    let file = scfs.create("two").unwrap();
    file.write_begin(0, cluster_size).unwrap();
    file.write_end(0, &data[..cluster_size]).unwrap();
    file.write_begin(cluster_size as u64, 100).unwrap();
    file.write_end(cluster_size as u64, &data[cluster_size..]).unwrap();
    assert_eq!(file.size(), data.len() as u64);
    file.close().unwrap();

    assert_eq!(read_all(&scfs, "two"), data);

    let layout = layout(&dir.path().join("two"));
    assert_eq!(layout.footer.original_size(), data.len() as u64);
    assert_eq!(layout.clusters.len(), 2);
    assert!(layout.clusters[1].size <= 100);
}

#[test]
fn random_write_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let file = scfs.create("empty").unwrap();
    let err = file.write_begin(50, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    assert_eq!(file.size(), 0);
}

#[test]
fn corrupt_magic_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let mut file = scfs.create("victim").unwrap();
    std::io::Write::write_all(&mut file, &patterned(40_000)).unwrap();
    file.close().unwrap();

    let path = dir.path().join("victim");
    let mut bytes = std::fs::read(&path).unwrap();
    let end = bytes.len();
    bytes[end - 4..].copy_from_slice(b"XXXX");
    std::fs::write(&path, &bytes).unwrap();

    let err = scfs.open_read("victim").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptMetadata);
    assert_eq!(
        std::io::Error::from(err).kind(),
        std::io::ErrorKind::InvalidData
    );
}

#[test]
fn readahead_amortizes_lower_reads() {
    let dir = tempfile::tempdir().unwrap();
    let reads = Arc::new(AtomicUsize::new(0));
    let lower = Arc::new(CountingFs {
        inner: DirLowerFs::new(dir.path()),
        reads: Arc::clone(&reads),
    });
    let options = MountOptions::new().cluster_size(4 * PAGE_SIZE as u32).unwrap();
    let scfs = Scfs::new(lower, options).unwrap();

    let data = patterned(20 * PAGE_SIZE);
    let mut file = scfs.create("pages").unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();
    file.close().unwrap();

    let file = scfs.open_read("pages").unwrap();
    reads.store(0, Ordering::SeqCst);

    let pages = file.read_pages(0, 20);
    assert_eq!(pages.len(), 20);
    for (i, page) in pages.iter().enumerate() {
        assert_eq!(page.index(), i as u64);
        assert_eq!(page.wait().unwrap(), &data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
    }

    // Five clusters back the twenty pages.
    let issued = reads.load(Ordering::SeqCst);
    assert!(issued >= 5, "only {} reads", issued);
    assert!(issued <= 6, "{} reads for 5 clusters", issued);
}

#[test]
fn readahead_without_workers() {
    let dir = tempfile::tempdir().unwrap();
    let options = MountOptions::new()
        .cluster_size(8192)
        .unwrap()
        .readahead_workers(0);
    let scfs = Scfs::with_dir(dir.path(), options).unwrap();

    let data = patterned(7 * PAGE_SIZE + 123);
    let mut file = scfs.create("sync").unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();
    file.close().unwrap();

    let file = scfs.open_read("sync").unwrap();
    let pages = file.read_pages(2, 8);
    for page in &pages {
        assert!(!page.is_locked());
    }

    for page in pages {
        let start = page.index() as usize * PAGE_SIZE;
        let contents = page.wait().unwrap();
        if start >= data.len() {
            assert!(contents.iter().all(|&b| b == 0));
            continue;
        }
        let end = (start + PAGE_SIZE).min(data.len());
        assert_eq!(&contents[..end - start], &data[start..end]);
        assert!(contents[end - start..].iter().all(|&b| b == 0));
    }
}

#[test]
fn truncate_then_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let mut file = scfs.create("shrink").unwrap();
    std::io::Write::write_all(&mut file, &patterned(100_000)).unwrap();
    file.close().unwrap();
    assert!(layout(&dir.path().join("shrink")).clusters.len() > 1);

    let file = scfs
        .open("shrink", OpenOptions::new().write(true))
        .unwrap();
    assert_eq!(file.size(), 100_000);
    file.truncate(0).unwrap();
    assert_eq!(file.size(), 0);
    assert_eq!(
        file.truncate(10).unwrap_err().kind(),
        ErrorKind::UnsupportedOperation
    );

    let fresh = b"a much smaller file".to_vec();
    file.append(&fresh).unwrap();
    file.close().unwrap();

    assert_eq!(read_all(&scfs, "shrink"), fresh);
    let layout = layout(&dir.path().join("shrink"));
    assert_eq!(layout.clusters.len(), 1);
    assert_eq!(layout.footer.original_size(), fresh.len() as u64);
}

#[test]
fn incompressible_clusters_stored_raw() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();
    let cluster_size = scfs.options().cluster_size as usize;

    let mut data = vec![0u8; 3 * cluster_size];
    rand::thread_rng().fill_bytes(&mut data);

    let mut file = scfs.create("noise").unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();
    file.close().unwrap();

    let layout = layout(&dir.path().join("noise"));
    assert!(layout
        .clusters
        .iter()
        .all(|desc| desc.size as usize == cluster_size));
    assert_eq!(read_all(&scfs, "noise"), data);
}

#[test]
fn nocomp_files_are_stored_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let options = MountOptions::new().nocomp(true);
    let scfs = Scfs::with_dir(dir.path(), options).unwrap();

    let data = patterned(30_000);
    let mut file = scfs.create("plain").unwrap();
    std::io::Write::write_all(&mut file, &data).unwrap();
    file.close().unwrap();

    let bytes = std::fs::read(dir.path().join("plain")).unwrap();
    assert_eq!(bytes.len(), data.len() + FOOTER_SIZE);
    assert_eq!(&bytes[..data.len()], &data[..]);

    let layout = layout(&dir.path().join("plain"));
    assert!(!layout.footer.is_compressed());
    assert!(layout.clusters.is_empty());

    // A compressing mount still reads files written without compression.
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();
    assert_eq!(read_all(&scfs, "plain"), data);
}

#[test]
fn empty_nocomp_file_stays_uncompressed() {
    let dir = tempfile::tempdir().unwrap();
    let options = MountOptions::new().nocomp(true);
    let scfs = Scfs::with_dir(dir.path(), options).unwrap();

    scfs.create("empty").unwrap().close().unwrap();

    let file = scfs.open_read("empty").unwrap();
    assert!(!file.is_compressed());
    assert_eq!(file.size(), 0);
    file.close().unwrap();

    let mut file = scfs.open("empty", OpenOptions::new().write(true)).unwrap();
    std::io::Write::write_all(&mut file, b"plain text").unwrap();
    file.close().unwrap();

    let bytes = std::fs::read(dir.path().join("empty")).unwrap();
    assert_eq!(&bytes[..10], b"plain text");
    assert_eq!(bytes.len(), 10 + FOOTER_SIZE);
}

#[test]
fn append_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let options = MountOptions::new().cluster_size(4096).unwrap();
    let scfs = Scfs::with_dir(dir.path(), options).unwrap();
    let data = patterned(23_000);

    let mut file = scfs.create("grow").unwrap();
    std::io::Write::write_all(&mut file, &data[..6_000]).unwrap();
    file.close().unwrap();

    let file = scfs
        .open("grow", OpenOptions::new().write(true))
        .unwrap();
    file.append(&data[6_000..]).unwrap();

    // Data still accumulating is visible before close.
    let mut tail = vec![0u8; 500];
    file.read_at(&mut tail, 22_500).unwrap();
    assert_eq!(tail, &data[22_500..]);
    file.close().unwrap();

    assert_eq!(read_all(&scfs, "grow"), data);
    assert_eq!(layout(&dir.path().join("grow")).clusters.len(), 6);
}

#[test]
fn periodic_footer_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let options = MountOptions::new()
        .cluster_size(4096)
        .unwrap()
        .meta_sync_interval(2);
    let scfs = Scfs::with_dir(dir.path(), options).unwrap();
    let data = patterned(8 * 4096);

    let file = scfs.create("synced").unwrap();
    file.append(&data[..4 * 4096]).unwrap();
    file.append(&data[4 * 4096..4 * 4096 + 1]).unwrap();

    // Starting the fifth cluster rewrote the footer, so the lower file already parses.
    let mid = layout(&dir.path().join("synced"));
    assert_eq!(mid.clusters.len(), 4);
    assert_eq!(mid.footer.original_size(), 4 * 4096);

    file.append(&data[4 * 4096 + 1..]).unwrap();
    file.close().unwrap();

    assert_eq!(read_all(&scfs, "synced"), data);
    assert_eq!(layout(&dir.path().join("synced")).clusters.len(), 8);
}

#[test]
fn read_only_close_leaves_lower_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let mut file = scfs.create("ro").unwrap();
    std::io::Write::write_all(&mut file, &patterned(50_000)).unwrap();
    file.close().unwrap();

    let before = std::fs::read(dir.path().join("ro")).unwrap();
    let file = scfs.open_read("ro").unwrap();
    let mut buf = vec![0u8; 1000];
    file.read_at(&mut buf, 20_000).unwrap();
    assert_eq!(
        file.append(b"nope").unwrap_err().kind(),
        ErrorKind::UnsupportedOperation
    );
    file.close().unwrap();

    assert_eq!(std::fs::read(dir.path().join("ro")).unwrap(), before);
}

#[test]
fn reads_past_end_are_short() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let mut file = scfs.create("short").unwrap();
    std::io::Write::write_all(&mut file, b"0123456789").unwrap();
    file.close().unwrap();

    let file = scfs.open_read("short").unwrap();
    let mut buf = [0xffu8; 16];
    assert_eq!(file.read_at(&mut buf, 4).unwrap(), 6);
    assert_eq!(&buf[..6], b"456789");
    assert_eq!(file.read_at(&mut buf, 10).unwrap(), 0);

    let page = file.read_page(0).unwrap();
    assert_eq!(&page[..10], b"0123456789");
    assert!(page[10..].iter().all(|&b| b == 0));
}

#[test]
fn pages_beyond_addressable_range_are_zero() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let mut file = scfs.create("tiny").unwrap();
    std::io::Write::write_all(&mut file, b"abc").unwrap();
    file.close().unwrap();

    let file = scfs.open_read("tiny").unwrap();
    let page = file.read_page(u64::MAX / 2).unwrap();
    assert_eq!(page.len(), PAGE_SIZE);
    assert!(page.iter().all(|&b| b == 0));

    let pages = file.read_pages(u64::MAX - 1, 4);
    assert_eq!(pages.len(), 1);
    for page in pages {
        assert!(page.wait().unwrap().iter().all(|&b| b == 0));
    }

    let mut buf = [0xffu8; 8];
    assert_eq!(file.read_at(&mut buf, u64::MAX - 2).unwrap(), 0);
    file.close().unwrap();
}

#[test]
fn deferred_open() {
    let dir = tempfile::tempdir().unwrap();
    let options = MountOptions::new().defer_open(true);
    let scfs = Scfs::with_dir(dir.path(), options).unwrap();

    let mut file = scfs.create("deferred").unwrap();
    std::io::Write::write_all(&mut file, b"opened elsewhere").unwrap();
    file.close().unwrap();
    assert_eq!(read_all(&scfs, "deferred"), b"opened elsewhere");

    scfs.shutdown();
    assert_eq!(scfs.create("late").unwrap_err().kind(), ErrorKind::Io);
}

#[test]
fn shared_handles_flush_on_last_close() {
    let dir = tempfile::tempdir().unwrap();
    let scfs = Scfs::with_dir(dir.path(), MountOptions::default()).unwrap();

    let writer = scfs.create("shared").unwrap();
    let reader = scfs.open_read("shared").unwrap();
    writer.append(b"visible through both handles").unwrap();
    assert_eq!(reader.size(), 28);
    writer.close().unwrap();

    // The reader still holds the inode, so nothing was flushed yet.
    assert_eq!(std::fs::metadata(dir.path().join("shared")).unwrap().len(), 0);
    reader.close().unwrap();

    assert_eq!(read_all(&scfs, "shared"), b"visible through both handles");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn sequential_writes_round_trip(
        chunks in prop::collection::vec(prop::collection::vec(0u8..4, 0..9000), 1..6),
        cluster_size in prop::sample::select(vec![4096u32, 8192, 16384]),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let options = MountOptions::new().cluster_size(cluster_size).unwrap();
        let scfs = Scfs::with_dir(dir.path(), options).unwrap();

        let file = scfs.create("prop").unwrap();
        let mut expected = Vec::new();
        for chunk in &chunks {
            let pos = file.size();
            if pos > 0 {
                let err = file.write_begin(pos - 1, chunk.len()).unwrap_err();
                prop_assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
            }
            file.append(chunk).unwrap();
            expected.extend_from_slice(chunk);
            prop_assert_eq!(file.size(), expected.len() as u64);
        }
        file.close().unwrap();

        prop_assert_eq!(read_all(&scfs, "prop"), expected.clone());

        let layout = layout(&dir.path().join("prop"));
        let count = scfs_core::total_cluster_count(expected.len() as u64, cluster_size);
        prop_assert_eq!(layout.clusters.len() as u64, count);
        for desc in &layout.clusters {
            prop_assert!(desc.size > 0);
            prop_assert!(desc.size <= cluster_size);
            prop_assert_eq!(desc.offset % 4, 0);
        }
    }
}
