//! A stackable compressing file system.
//!
//! Files are split into fixed-size clusters which are compressed one by one and
//! written back to back into a file on a lower file system, followed by a table
//! of where each cluster landed and a fixed footer. Files can only be appended
//! to; reads decompress whole clusters through a small shared cache.
//!
//! ```no_run
//! use std::io::Write;
//! use scfs_core::{MountOptions, Scfs};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scfs = Scfs::with_dir("/var/lower", MountOptions::default())?;
//! let mut file = scfs.create("notes.txt")?;
//! file.write_all(b"hello")?;
//! file.close()?;
//!
//! let file = scfs.open_read("notes.txt")?;
//! let mut buf = [0u8; 5];
//! file.read_at(&mut buf, 0)?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod cluster;
mod compression;
mod config;
mod error;
mod footer;
mod fs;
mod inode;
mod lower;
mod read;
mod readahead;
mod write;

pub use cache::{ClusterBuffers, ClusterCache, BufferPool, CACHE_SLOTS};
pub use cluster::{
    cluster_len, is_compressed, load_layout, ClusterTable, Layout, MetaState, TailEntry,
};
pub use compression::{constants, Codec, Codecs, Compressed, CompressionType, ParseCompressionError};
pub use config::{MountOptions, OptionsError};
pub use error::{Error, ErrorKind, Result};
pub use footer::{
    cluster_descriptor_at, decode_descriptors, decode_footer, encode_descriptors, encode_footer,
    total_cluster_count, ClusterDescriptor, Footer, CLUSTER_SIZE_MAX, CLUSTER_SIZE_MIN,
    FOOTER_SIZE, PAGE_SIZE, SCFS_MAGIC,
};
pub use fs::{inspect, OpenOptions, Reader, Scfs, ScfsFile};
pub use inode::Inode;
pub use lower::{
    read_exact, write_exact, DirLowerFs, LowerFile, LowerFs, OpenMode, OpenOutcome, Opener,
    PendingOpen, MAX_RETRIES,
};
pub use readahead::Page;

#[doc(hidden)]
pub use comde;
