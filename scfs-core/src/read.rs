//! Fetching logical bytes: from the cluster being accumulated, the cluster cache,
//! or the lower file.

use crate::cache::try_resize;
use crate::cluster::{check_payload, cluster_len, is_compressed};
use crate::compression::CompressionType;
use crate::error::{ErrorKind, Result};
use crate::footer::ClusterDescriptor;
use crate::fs::Engine;
use crate::inode::Inode;
use crate::lower::{read_exact, LowerFile};

/// Reads cluster `index` into `u_buf`, decompressing through `c_buf` when its
/// payload is compressed. `len` is the logical length of the cluster.
pub(crate) fn load_cluster(
    engine: &Engine,
    comp_type: CompressionType,
    lower: &dyn LowerFile,
    descriptor: &ClusterDescriptor,
    len: usize,
    index: u64,
    c_buf: &mut Vec<u8>,
    u_buf: &mut Vec<u8>,
) -> Result<()> {
    check_payload(descriptor, len, index)?;
    let size = descriptor.size as usize;

    if is_compressed(descriptor, len) {
        try_resize(c_buf, size)?;
        read_exact(lower, &mut c_buf[..size], descriptor.offset as u64)?;
        let codec = engine.codecs.get(comp_type)?;
        codec.decompress_into(&c_buf[..size], len, u_buf)?;
    } else {
        try_resize(u_buf, len)?;
        read_exact(lower, &mut u_buf[..len], descriptor.offset as u64)?;
    }

    tracing::trace!(
        cluster = index,
        offset = format_args!("{:#x}", descriptor.offset),
        size = descriptor.size,
        len,
        "loaded cluster"
    );
    Ok(())
}

/// Reads the logical bytes at `pos` into `buf`, zero-filling whatever lies past
/// the end of the file. `buf` must not cross a cluster boundary.
///
/// Returns the number of bytes that lie inside the file. A read that fails on
/// corrupt metadata is retried once after reloading it, unless the file holds
/// unflushed writes.
pub(crate) fn read_span(
    engine: &Engine,
    inode: &Inode,
    lower: &dyn LowerFile,
    pos: u64,
    buf: &mut [u8],
) -> Result<usize> {
    match read_span_once(engine, inode, lower, pos, buf) {
        Err(err) if err.kind() == ErrorKind::CorruptMetadata => {
            {
                let mut meta = inode.meta.lock();
                if meta.dirty {
                    return Err(err);
                }
                tracing::warn!(
                    inode = inode.id,
                    error = %err,
                    "reloading metadata and retrying read"
                );
                meta.table.invalidate();
            }
            engine.cache.invalidate_inode(inode.id);
            read_span_once(engine, inode, lower, pos, buf)
        }
        other => other,
    }
}

fn read_span_once(
    engine: &Engine,
    inode: &Inode,
    lower: &dyn LowerFile,
    pos: u64,
    buf: &mut [u8],
) -> Result<usize> {
    buf.iter_mut().for_each(|b| *b = 0);

    let mut meta = inode.meta.lock();
    meta.ensure_valid(lower, &engine.options)?;

    if pos >= meta.size {
        return Ok(0);
    }
    let avail = (meta.size - pos).min(buf.len() as u64) as usize;

    if !meta.compressed {
        drop(meta);
        read_exact(lower, &mut buf[..avail], pos)?;
        return Ok(avail);
    }

    let cluster_size = meta.cluster_size as u64;
    let cluster = pos / cluster_size;
    let start = (pos % cluster_size) as usize;
    let avail = avail.min(cluster_size as usize - start);

    if let Some(accum) = meta.accum.as_ref().filter(|a| a.cluster == cluster) {
        let end = (start + avail).min(accum.len);
        if end > start {
            buf[..end - start].copy_from_slice(&accum.raw[start..end]);
        }
        tracing::trace!(inode = inode.id, cluster, "served from accumulating cluster");
        return Ok(avail);
    }

    let key = (inode.id, cluster);
    if let Some(hit) = engine.cache.lookup(key) {
        drop(meta);
        copy_out(hit.data(), start, &mut buf[..avail]);
        return Ok(avail);
    }

    let descriptor = meta.table.get(cluster, meta.size, meta.cluster_size)?;
    let len = cluster_len(cluster, meta.size, meta.cluster_size);
    let comp_type = meta.comp_type;
    drop(meta);

    tracing::trace!(inode = inode.id, cluster, "cache miss");

    let mut buffers = engine.cache.claim(key);
    load_cluster(
        engine,
        comp_type,
        lower,
        &descriptor,
        len,
        cluster,
        &mut buffers.c_buf,
        &mut buffers.u_buf,
    )?;
    buffers.fill(len);

    copy_out(buffers.data(), start, &mut buf[..avail]);
    Ok(avail)
}

#[inline]
fn copy_out(cluster: &[u8], start: usize, out: &mut [u8]) {
    let end = (start + out.len()).min(cluster.len());
    if end > start {
        out[..end - start].copy_from_slice(&cluster[start..end]);
    }
}
