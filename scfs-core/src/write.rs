//! Append-only writes: raw bytes are gathered into a cluster-sized buffer that is
//! compressed and written to the lower file once full, and the cluster table and
//! footer are rewritten when the last handle closes.

use crate::cluster::MetaState;
use crate::error::{Error, Result};
use crate::footer::{
    align_up, encode_descriptors, encode_footer, total_cluster_count, ClusterDescriptor, Footer,
    CLUSTER_DESCRIPTOR_SIZE, CLUSTER_SIZE_MAX, FOOTER_SIZE,
};
use crate::fs::Engine;
use crate::inode::{Accumulator, FileMeta};
use crate::lower::{write_exact, LowerFile};
use crate::read::load_cluster;

/// Descriptors encoded per lower write when rewriting the cluster table.
pub const DESCRIPTOR_CHUNK: usize = 512;

/// Checks that a write of `len` bytes at `pos` appends to the file and readies the
/// accumulation buffer for it.
pub(crate) fn write_begin(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
    pos: u64,
    len: usize,
) -> Result<()> {
    meta.ensure_valid(lower, &engine.options)?;

    if pos != meta.size {
        return Err(Error::unsupported(format!(
            "write at {} but file size is {}, only appending is supported",
            pos, meta.size
        )));
    }

    if len == 0 || !meta.compressed {
        return Ok(());
    }

    let interval = engine.options.meta_sync_interval;
    if interval > 0 && meta.table.flushed_tail_len() >= interval {
        sync_meta(engine, meta, lower)?;
    }

    if meta.accum.is_none() {
        start_accumulation(engine, inode, meta, lower)?;
    }

    Ok(())
}

/// Appends `data` at `pos`, flushing every cluster it fills.
///
/// Bytes only become part of the file once the cluster holding them is accepted.
/// When a flush fails, the bytes of clusters already written are reported as a
/// short count, or the error is returned if there are none.
pub(crate) fn write_end(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
    pos: u64,
    data: &[u8],
) -> Result<usize> {
    if pos != meta.size {
        return Err(Error::unsupported(format!(
            "write at {} but file size is {}, concurrent writers are not supported",
            pos, meta.size
        )));
    }

    if data.is_empty() {
        return Ok(0);
    }

    if !meta.compressed {
        write_exact(lower, data, pos)?;
        meta.size += data.len() as u64;
        meta.dirty = true;
        return Ok(data.len());
    }

    let cluster_size = meta.cluster_size as usize;
    let mut done = 0;

    while done < data.len() {
        if meta.accum.is_none() {
            start_accumulation(engine, inode, meta, lower)?;
        }
        let accum = meta
            .accum
            .as_mut()
            .ok_or_else(|| Error::corrupt("no accumulation buffer"))?;

        let n = (cluster_size - accum.len).min(data.len() - done);
        accum.raw[accum.len..accum.len + n].copy_from_slice(&data[done..done + n]);
        accum.len += n;

        if accum.len == cluster_size {
            if let Err(err) = flush_cluster(engine, inode, meta, lower) {
                // The bytes of this call stay out of the file.
                if let Some(accum) = meta.accum.as_mut() {
                    accum.len -= n;
                }
                if done > 0 {
                    tracing::debug!(inode, written = done, error = %err, "short write");
                    return Ok(done);
                }
                return Err(err);
            }
            if let Some(accum) = meta.accum.as_mut() {
                accum.len = 0;
                accum.cluster += 1;
            }
            meta.table.append_new_cluster();
        }

        done += n;
        meta.size += n as u64;
        meta.dirty = true;
    }

    Ok(done)
}

/// Readies the accumulation buffer for the cluster that holds offset `meta.size`.
///
/// A partial last cluster already on the lower file is read back first and its
/// descriptor reopened so it can be rewritten in place.
fn start_accumulation(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
) -> Result<()> {
    let cluster_size = meta.cluster_size;
    let cluster = meta.size / cluster_size as u64;
    let partial = (meta.size % cluster_size as u64) as usize;

    let mut raw = engine.pool.get()?;
    let mut scratch = engine.pool.get()?;

    if partial > 0 {
        let descriptor = meta.table.get(cluster, meta.size, cluster_size)?;
        let loaded = load_cluster(
            engine,
            meta.comp_type,
            lower,
            &descriptor,
            partial,
            cluster,
            &mut scratch,
            &mut raw,
        );
        if let Err(e) = loaded {
            engine.pool.put(raw);
            engine.pool.put(scratch);
            return Err(e);
        }
        raw.resize(CLUSTER_SIZE_MAX as usize, 0);

        if meta.table.reopen_last().is_none() {
            engine.pool.put(raw);
            engine.pool.put(scratch);
            return Err(Error::corrupt(format!(
                "cluster {} is not the last committed cluster",
                cluster
            )));
        }
        engine.cache.invalidate((inode, cluster));

        tracing::debug!(
            inode,
            cluster,
            len = partial,
            offset = format_args!("{:#x}", descriptor.offset),
            "reopened partial cluster"
        );
    } else {
        meta.table.append_new_cluster();
    }

    meta.accum = Some(Accumulator {
        raw,
        scratch,
        len: partial,
        cluster,
    });
    Ok(())
}

/// Compresses the accumulated cluster and writes it, padded to the next aligned
/// offset, at its in-flight descriptor.
fn flush_cluster(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
) -> Result<()> {
    let accum = match meta.accum.as_mut() {
        Some(accum) if accum.len > 0 => accum,
        _ => return Ok(()),
    };

    let entry = meta
        .table
        .in_flight_mut()
        .ok_or_else(|| Error::corrupt(format!("cluster {} has no descriptor", accum.cluster)))?;
    if entry.index != accum.cluster {
        return Err(Error::corrupt(format!(
            "accumulating cluster {} but descriptor is for cluster {}",
            accum.cluster, entry.index
        )));
    }

    let codec = engine.codecs.get(meta.comp_type)?;
    let len = accum.len;
    let compressed =
        codec.compress_into(&accum.raw[..len], &mut accum.scratch, engine.options.comp_threshold)?;

    let offset = entry.descriptor.offset as u64;
    let size = if compressed { accum.scratch.len() } else { len };
    let padded = (align_up(offset + size as u64) - offset) as usize;

    if offset + padded as u64 > u32::MAX as u64 {
        return Err(Error::unsupported(format!(
            "cluster {} would end at {:#x}, beyond the 4 GiB descriptor range",
            accum.cluster,
            offset + padded as u64
        )));
    }

    let payload = if compressed {
        accum.scratch.resize(padded, 0);
        &accum.scratch[..]
    } else {
        accum.raw[len..padded].iter_mut().for_each(|b| *b = 0);
        &accum.raw[..padded]
    };
    write_exact(lower, payload, offset)?;

    entry.descriptor.size = size as u32;
    entry.in_flight = false;
    engine.cache.invalidate((inode, accum.cluster));

    tracing::debug!(
        inode,
        cluster = accum.cluster,
        offset = format_args!("{:#x}", offset),
        size,
        len,
        compressed,
        "flushed cluster"
    );
    Ok(())
}

/// Writes `descriptors` followed by `footer` at `pos`, returning the end offset.
fn write_footer(
    lower: &dyn LowerFile,
    descriptors: &[ClusterDescriptor],
    footer: &Footer,
    pos: u64,
) -> Result<u64> {
    let mut pos = pos;
    let mut buf =
        Vec::with_capacity(DESCRIPTOR_CHUNK.min(descriptors.len()) * CLUSTER_DESCRIPTOR_SIZE);

    for chunk in descriptors.chunks(DESCRIPTOR_CHUNK) {
        buf.clear();
        encode_descriptors(chunk, &mut buf);
        write_exact(lower, &buf, pos)?;
        pos += buf.len() as u64;
    }

    write_exact(lower, &encode_footer(footer), pos)?;
    Ok(pos + FOOTER_SIZE as u64)
}

fn truncate_tail(lower: &dyn LowerFile, end: u64) -> Result<()> {
    if lower.size()? > end {
        lower.truncate(end)?;
    }
    Ok(())
}

/// Rewrites the footer after the clusters flushed so far, so the tail list can be
/// folded into the committed array.
fn sync_meta(engine: &Engine, meta: &mut FileMeta, lower: &dyn LowerFile) -> Result<()> {
    let descriptors = meta.table.flushed_descriptors();
    let data_end = meta.table.data_end();
    let covered = (descriptors.len() as u64 * meta.cluster_size as u64).min(meta.size);

    let footer = Footer::new(descriptors.len(), meta.cluster_size, covered, meta.comp_type);
    let end = write_footer(lower, &descriptors, &footer, data_end)?;
    truncate_tail(lower, end)?;

    tracing::debug!(
        clusters = descriptors.len(),
        data_end = format_args!("{:#x}", data_end),
        end = format_args!("{:#x}", end),
        "rewrote footer"
    );

    meta.table.invalidate();
    meta.reload(lower, &engine.options)
}

/// Flushes the trailing partial cluster and rewrites the cluster table and footer.
///
/// Runs when the last handle on a file closes. The accumulation buffers go back
/// to the pool whether or not the flush succeeds.
pub(crate) fn write_meta(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
) -> Result<()> {
    let result = if meta.dirty {
        write_meta_inner(engine, inode, meta, lower)
    } else {
        Ok(())
    };

    if let Some(accum) = meta.accum.take() {
        engine.pool.put(accum.raw);
        engine.pool.put(accum.scratch);
    }
    result
}

fn write_meta_inner(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
) -> Result<()> {
    if !meta.compressed {
        let footer = Footer::new(0, meta.cluster_size, meta.size, meta.comp_type);
        let end = write_footer(lower, &[], &footer, meta.size)?;
        truncate_tail(lower, end)?;
        meta.table.invalidate();
        tracing::debug!(inode, size = meta.size, "wrote footer for uncompressed file");
        return Ok(());
    }

    flush_cluster(engine, inode, meta, lower)?;
    meta.table.discard_in_flight();

    let descriptors = meta.table.flushed_descriptors();
    let expected = total_cluster_count(meta.size, meta.cluster_size);
    if descriptors.len() as u64 != expected {
        return Err(Error::corrupt(format!(
            "{} cluster descriptors for {} bytes, expected {}",
            descriptors.len(),
            meta.size,
            expected
        )));
    }

    let data_end = meta.table.data_end();
    let footer = Footer::new(descriptors.len(), meta.cluster_size, meta.size, meta.comp_type);
    let end = write_footer(lower, &descriptors, &footer, data_end)?;
    truncate_tail(lower, end)?;

    meta.table.invalidate();
    meta.dirty = false;

    tracing::debug!(
        inode,
        size = meta.size,
        clusters = descriptors.len(),
        data_end = format_args!("{:#x}", data_end),
        end = format_args!("{:#x}", end),
        "wrote cluster table"
    );
    Ok(())
}

/// Truncates the file. Only truncation to zero is supported.
pub(crate) fn truncate(
    engine: &Engine,
    inode: u64,
    meta: &mut FileMeta,
    lower: &dyn LowerFile,
    size: u64,
) -> Result<()> {
    if size != 0 {
        return Err(Error::unsupported(format!(
            "truncate to {} bytes, only truncation to zero is supported",
            size
        )));
    }

    if let Some(accum) = meta.accum.take() {
        engine.pool.put(accum.raw);
        engine.pool.put(accum.scratch);
    }

    lower.truncate(0)?;
    meta.table.clear();
    engine.cache.invalidate_inode(inode);

    let options = &engine.options;
    meta.size = 0;
    meta.cluster_size = options.cluster_size;
    meta.comp_type = options.comp_type;
    meta.compressed = !options.nocomp;
    meta.dirty = true;

    debug_assert_eq!(meta.table.state(), MetaState::Invalid);
    tracing::debug!(inode, "truncated to zero");
    Ok(())
}
