//! Where each cluster of a file lives on the lower file.
//!
//! A table has two parts: the descriptors committed to the lower file when the
//! footer was last read, and a tail list of clusters appended since. The last
//! tail entry may still be in flight (its cluster is being accumulated, so its
//! size is unknown yet).

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::footer::{
    decode_descriptors, decode_footer, total_cluster_count, ClusterDescriptor, Footer,
    FOOTER_SIZE,
};
use crate::lower::{read_exact, LowerFile};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MetaState {
    /// The lower file holds no cluster data.
    Fresh,
    /// The committed array matches the lower file.
    Valid,
    /// The committed array is stale and must be reloaded before use.
    Invalid,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TailEntry {
    pub index: u64,
    pub descriptor: ClusterDescriptor,
    pub in_flight: bool,
}

/// Footer and descriptors read from a lower file.
#[derive(Debug, Clone)]
pub struct Layout {
    pub footer: Footer,
    pub clusters: Vec<ClusterDescriptor>,
}

/// Reads and validates the footer and descriptor array at the end of `lower`.
///
/// Returns `None` for an empty lower file.
pub fn load_layout(lower: &dyn LowerFile) -> Result<Option<Layout>> {
    let lower_size = lower.size()?;
    if lower_size == 0 {
        return Ok(None);
    }

    if lower_size < FOOTER_SIZE as u64 {
        return Err(Error::corrupt(format!(
            "lower file of {} bytes cannot hold a footer",
            lower_size
        )));
    }

    let mut buf = [0u8; FOOTER_SIZE];
    read_exact(lower, &mut buf, lower_size - FOOTER_SIZE as u64)?;
    let footer = decode_footer(&buf)?;

    if footer.footer_size as u64 > lower_size {
        return Err(Error::corrupt(format!(
            "footer size {} exceeds lower file size {}",
            footer.footer_size, lower_size
        )));
    }

    let data_end = lower_size - footer.footer_size as u64;
    let array_len = footer.footer_size as usize - FOOTER_SIZE;
    let mut array = vec![0u8; array_len];
    read_exact(lower, &mut array, data_end)?;
    let clusters = decode_descriptors(&array)?;

    if footer.is_compressed() {
        let expected = total_cluster_count(footer.original_size(), footer.cluster_size);
        if clusters.len() as u64 != expected {
            return Err(Error::corrupt(format!(
                "{} cluster descriptors for {} bytes, expected {}",
                clusters.len(),
                footer.original_size(),
                expected
            )));
        }
    } else if footer.original_size() > data_end {
        return Err(Error::corrupt(format!(
            "uncompressed file of {} bytes overlaps its footer at {:#x}",
            footer.original_size(),
            data_end
        )));
    }

    for (index, descriptor) in clusters.iter().enumerate() {
        if descriptor.size == 0
            || descriptor.size > footer.cluster_size
            || descriptor.offset as u64 + descriptor.size as u64 > data_end
        {
            return Err(Error::corrupt(format!(
                "cluster {} descriptor {:?} out of bounds",
                index, descriptor
            )));
        }
    }

    tracing::debug!(
        footer_size = footer.footer_size,
        cluster_size = footer.cluster_size,
        original_size = footer.original_file_size,
        compression = %footer.comp_type,
        clusters = clusters.len(),
        data_end = format_args!("{:#x}", data_end),
        "loaded footer"
    );

    Ok(Some(Layout { footer, clusters }))
}

#[derive(Debug)]
pub struct ClusterTable {
    state: MetaState,
    committed: Arc<[ClusterDescriptor]>,
    /// Leading entries of `committed` still authoritative; the rest were reopened into the tail.
    committed_len: usize,
    tail: Vec<TailEntry>,
}

impl Default for ClusterTable {
    fn default() -> Self {
        ClusterTable {
            state: MetaState::Invalid,
            committed: Arc::from(Vec::new()),
            committed_len: 0,
            tail: Vec::new(),
        }
    }
}

impl ClusterTable {
    pub fn new() -> ClusterTable {
        ClusterTable::default()
    }

    #[inline(always)]
    pub fn state(&self) -> MetaState {
        self.state
    }

    #[inline(always)]
    pub fn invalidate(&mut self) {
        self.state = MetaState::Invalid;
    }

    #[inline(always)]
    pub fn committed_len(&self) -> usize {
        self.committed_len
    }

    #[inline(always)]
    pub fn tail(&self) -> &[TailEntry] {
        &self.tail
    }

    /// Tail entries whose clusters are already on the lower file.
    pub fn flushed_tail_len(&self) -> usize {
        self.tail.iter().filter(|e| !e.in_flight).count()
    }

    /// Forgets every cluster, as after a truncate to zero.
    pub fn clear(&mut self) {
        self.committed = Arc::from(Vec::new());
        self.committed_len = 0;
        self.tail.clear();
        self.state = MetaState::Invalid;
    }

    /// Installs a freshly loaded committed array, keeping tail entries it does not cover.
    pub fn install(&mut self, clusters: Vec<ClusterDescriptor>) {
        self.committed_len = clusters.len();
        self.committed = Arc::from(clusters);
        let committed_len = self.committed_len as u64;
        self.tail.retain(|e| e.index >= committed_len);
        self.state = if self.committed_len == 0 && self.tail.is_empty() {
            MetaState::Fresh
        } else {
            MetaState::Valid
        };
    }

    /// Number of clusters with a finalized descriptor.
    pub fn flushed_count(&self) -> u64 {
        self.committed_len as u64 + self.flushed_tail_len() as u64
    }

    /// Looks up cluster `index` of a file `file_size` bytes long.
    ///
    /// The table must not be [`MetaState::Invalid`].
    pub fn get(&self, index: u64, file_size: u64, cluster_size: u32) -> Result<ClusterDescriptor> {
        if self.state == MetaState::Invalid {
            return Err(Error::corrupt("cluster table used while invalid"));
        }

        let count = total_cluster_count(file_size, cluster_size);
        if index >= count {
            return Err(Error::OutOfRange { index, count });
        }

        if index < self.committed_len as u64 {
            return Ok(self.committed[index as usize]);
        }

        match self.tail.iter().find(|e| e.index == index) {
            Some(entry) if !entry.in_flight => Ok(entry.descriptor),
            Some(_) => Err(Error::corrupt(format!(
                "cluster {} is still being accumulated",
                index
            ))),
            None => Err(Error::corrupt(format!(
                "no descriptor for cluster {} ({} committed, {} in tail)",
                index,
                self.committed_len,
                self.tail.len()
            ))),
        }
    }

    /// Last finalized descriptor, committed or in the tail.
    pub fn last_flushed(&self) -> Option<ClusterDescriptor> {
        self.tail
            .iter()
            .rev()
            .find(|e| !e.in_flight)
            .map(|e| e.descriptor)
            .or_else(|| self.committed[..self.committed_len].last().copied())
    }

    /// First lower offset after the last finalized cluster.
    pub fn data_end(&self) -> u64 {
        self.last_flushed().map(|d| d.next_offset()).unwrap_or(0)
    }

    /// Appends an in-flight entry for the next cluster, placed right after the previous one.
    pub fn append_new_cluster(&mut self) -> &mut TailEntry {
        let index = self.flushed_count();
        let offset = self.data_end();

        tracing::trace!(index, offset = format_args!("{:#x}", offset), "new tail cluster");

        if self.state == MetaState::Fresh {
            self.state = MetaState::Valid;
        }

        let slot = self.tail.len();
        self.tail.push(TailEntry {
            index,
            descriptor: ClusterDescriptor {
                offset: offset as u32,
                size: 0,
            },
            in_flight: true,
        });
        &mut self.tail[slot]
    }

    /// Moves the last committed cluster back into the tail so it can be rewritten in place.
    pub fn reopen_last(&mut self) -> Option<&mut TailEntry> {
        if !self.tail.is_empty() || self.committed_len == 0 {
            return None;
        }

        self.committed_len -= 1;
        self.tail.push(TailEntry {
            index: self.committed_len as u64,
            descriptor: self.committed[self.committed_len],
            in_flight: true,
        });
        self.tail.last_mut()
    }

    #[inline(always)]
    pub fn in_flight_mut(&mut self) -> Option<&mut TailEntry> {
        self.tail.last_mut().filter(|e| e.in_flight)
    }

    /// Drops an in-flight entry that never received data.
    pub fn discard_in_flight(&mut self) {
        if self.tail.last().map(|e| e.in_flight).unwrap_or(false) {
            self.tail.pop();
        }
    }

    /// Every finalized descriptor in cluster order.
    pub fn flushed_descriptors(&self) -> Vec<ClusterDescriptor> {
        self.committed[..self.committed_len]
            .iter()
            .copied()
            .chain(self.tail.iter().filter(|e| !e.in_flight).map(|e| e.descriptor))
            .collect()
    }
}

/// Number of bytes in cluster `index` of a `file_size` byte file.
#[inline(always)]
pub fn cluster_len(index: u64, file_size: u64, cluster_size: u32) -> usize {
    let start = index * cluster_size as u64;
    file_size.saturating_sub(start).min(cluster_size as u64) as usize
}

/// Whether a payload of `descriptor.size` bytes holds compressed data for a cluster of `len` bytes.
#[inline(always)]
pub fn is_compressed(descriptor: &ClusterDescriptor, len: usize) -> bool {
    (descriptor.size as usize) < len
}

pub(crate) fn check_payload(descriptor: &ClusterDescriptor, len: usize, index: u64) -> Result<()> {
    if descriptor.size as usize > len {
        return Err(Error::corrupt(format!(
            "cluster {} payload of {} bytes exceeds its {} byte length",
            index, descriptor.size, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(offset: u32, size: u32) -> ClusterDescriptor {
        ClusterDescriptor { offset, size }
    }

    #[test]
    fn starts_invalid() {
        let table = ClusterTable::new();
        assert_eq!(table.state(), MetaState::Invalid);
        assert!(table.get(0, 100, 4096).is_err());
    }

    #[test]
    fn committed_then_tail() {
        let mut table = ClusterTable::new();
        table.install(vec![d(0, 100), d(100, 4096)]);
        assert_eq!(table.state(), MetaState::Valid);

        let entry = table.append_new_cluster();
        assert_eq!(entry.index, 2);
        assert_eq!(entry.descriptor.offset, 4196);
        entry.descriptor.size = 10;
        entry.in_flight = false;

        let file_size = 2 * 4096 + 50;
        assert_eq!(table.get(0, file_size, 4096).unwrap(), d(0, 100));
        assert_eq!(table.get(1, file_size, 4096).unwrap(), d(100, 4096));
        assert_eq!(table.get(2, file_size, 4096).unwrap(), d(4196, 10));
        assert!(matches!(
            table.get(3, file_size, 4096),
            Err(Error::OutOfRange { index: 3, count: 3 })
        ));

        assert_eq!(table.data_end(), 4208);
        assert_eq!(table.flushed_descriptors().len(), 3);
    }

    #[test]
    fn in_flight_is_not_a_descriptor() {
        let mut table = ClusterTable::new();
        table.install(Vec::new());
        assert_eq!(table.state(), MetaState::Fresh);

        table.append_new_cluster();
        assert_eq!(table.state(), MetaState::Valid);
        assert_eq!(
            table.get(0, 10, 4096).unwrap_err().kind(),
            crate::ErrorKind::CorruptMetadata
        );

        table.discard_in_flight();
        assert!(table.tail().is_empty());
    }

    #[test]
    fn missing_tail_entry_is_corrupt() {
        let mut table = ClusterTable::new();
        table.install(vec![d(0, 100)]);
        assert_eq!(
            table.get(1, 8000, 4096).unwrap_err().kind(),
            crate::ErrorKind::CorruptMetadata
        );
    }

    #[test]
    fn reopen_last() {
        let mut table = ClusterTable::new();
        table.install(vec![d(0, 4096), d(4096, 30)]);

        let entry = table.reopen_last().unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(entry.descriptor, d(4096, 30));
        assert_eq!(table.committed_len(), 1);
        assert_eq!(table.data_end(), 4096);
        assert!(table.reopen_last().is_none());
    }

    #[test]
    fn install_keeps_uncovered_tail() {
        let mut table = ClusterTable::new();
        table.install(Vec::new());
        for _ in 0..3 {
            let e = table.append_new_cluster();
            e.descriptor.size = 40;
            e.in_flight = false;
        }
        table.append_new_cluster();

        table.invalidate();
        table.install(table.flushed_descriptors());
        assert_eq!(table.committed_len(), 3);
        assert_eq!(table.tail().len(), 1);
        assert_eq!(table.tail()[0].index, 3);
        assert_eq!(table.tail()[0].descriptor.offset, 120);
    }

    #[test]
    fn lengths() {
        assert_eq!(cluster_len(0, 100, 4096), 100);
        assert_eq!(cluster_len(1, 4196, 4096), 100);
        assert_eq!(cluster_len(0, 8192, 4096), 4096);
        assert!(is_compressed(&d(0, 99), 100));
        assert!(!is_compressed(&d(0, 100), 100));
        assert!(check_payload(&d(0, 101), 100, 0).is_err());
    }
}
