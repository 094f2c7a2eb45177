use std::fmt;
use std::str::FromStr;

use crate::compression::{constants::DEFAULT_COMP_THRESHOLD, CompressionType};
use crate::footer::{CLUSTER_SIZE_MAX, CLUSTER_SIZE_MIN, DEFAULT_CLUSTER_SIZE};

/// Newly flushed clusters after which the footer is rewritten in place.
pub const DEFAULT_META_SYNC_INTERVAL: usize = 256;

/// Upper bound on the default number of read-ahead workers.
pub const MAX_DEFAULT_READAHEAD_WORKERS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("Unknown mount option `{0}`")]
    Unknown(String),

    #[error("Mount option `{0}` needs a value")]
    MissingValue(String),

    #[error("Invalid value `{value}` for mount option `{key}`")]
    InvalidValue { key: String, value: String },

    #[error(
        "Cluster size {0} must be a power of two between {min} and {max}",
        min = CLUSTER_SIZE_MIN,
        max = CLUSTER_SIZE_MAX
    )]
    ClusterSize(u32),

    #[error("Compression threshold {0} must be a percentage (0-100)")]
    Threshold(u32),
}

/// Per-mount settings, parsed from a comma-separated option string such as
/// `nocomp,cluster_size=8192,comp_threshold=40,comp_type=zlib`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MountOptions {
    /// Create new files uncompressed.
    pub nocomp: bool,
    pub cluster_size: u32,
    pub comp_threshold: u32,
    pub comp_type: CompressionType,
    /// `0` disables mid-life footer rewrites.
    pub meta_sync_interval: usize,
    /// `0` services every read on the calling thread.
    pub readahead_workers: usize,
    /// Route lower opens through the opener thread.
    pub defer_open: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            nocomp: false,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            comp_threshold: DEFAULT_COMP_THRESHOLD,
            comp_type: CompressionType::default(),
            meta_sync_interval: DEFAULT_META_SYNC_INTERVAL,
            readahead_workers: num_cpus::get().clamp(1, MAX_DEFAULT_READAHEAD_WORKERS),
            defer_open: false,
        }
    }
}

impl MountOptions {
    pub fn new() -> MountOptions {
        MountOptions::default()
    }

    pub fn nocomp(mut self, nocomp: bool) -> Self {
        self.nocomp = nocomp;
        self
    }

    pub fn cluster_size(mut self, cluster_size: u32) -> Result<Self, OptionsError> {
        if !valid_cluster_size(cluster_size) {
            return Err(OptionsError::ClusterSize(cluster_size));
        }
        self.cluster_size = cluster_size;
        Ok(self)
    }

    pub fn comp_threshold(mut self, comp_threshold: u32) -> Result<Self, OptionsError> {
        if comp_threshold > 100 {
            return Err(OptionsError::Threshold(comp_threshold));
        }
        self.comp_threshold = comp_threshold;
        Ok(self)
    }

    pub fn comp_type(mut self, comp_type: CompressionType) -> Self {
        self.comp_type = comp_type;
        self
    }

    pub fn meta_sync_interval(mut self, clusters: usize) -> Self {
        self.meta_sync_interval = clusters;
        self
    }

    pub fn readahead_workers(mut self, workers: usize) -> Self {
        self.readahead_workers = workers;
        self
    }

    pub fn defer_open(mut self, defer_open: bool) -> Self {
        self.defer_open = defer_open;
        self
    }

    pub fn parse(s: &str) -> Result<MountOptions, OptionsError> {
        let mut options = MountOptions::default();

        for option in s.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option, None),
            };

            let required = || value.ok_or_else(|| OptionsError::MissingValue(key.to_string()));
            let invalid = |value: &str| OptionsError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };

            match key {
                "nocomp" => options.nocomp = true,
                "defer_open" => options.defer_open = true,
                "cluster_size" => {
                    let v = required()?;
                    options = options.cluster_size(v.parse().map_err(|_| invalid(v))?)?;
                }
                "comp_threshold" => {
                    let v = required()?;
                    options = options.comp_threshold(v.parse().map_err(|_| invalid(v))?)?;
                }
                "comp_type" => {
                    let v = required()?;
                    options.comp_type = v.parse().map_err(|_| invalid(v))?;
                }
                "meta_sync" => {
                    let v = required()?;
                    options.meta_sync_interval = v.parse().map_err(|_| invalid(v))?;
                }
                "readahead_workers" => {
                    let v = required()?;
                    options.readahead_workers = v.parse().map_err(|_| invalid(v))?;
                }
                _ => return Err(OptionsError::Unknown(key.to_string())),
            }
        }

        Ok(options)
    }
}

#[inline(always)]
pub fn valid_cluster_size(cluster_size: u32) -> bool {
    cluster_size.is_power_of_two()
        && (CLUSTER_SIZE_MIN..=CLUSTER_SIZE_MAX).contains(&cluster_size)
}

impl FromStr for MountOptions {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MountOptions::parse(s)
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nocomp {
            f.write_str("nocomp,")?;
        }
        write!(
            f,
            "cluster_size={},comp_threshold={},comp_type={},meta_sync={},readahead_workers={}",
            self.cluster_size,
            self.comp_threshold,
            self.comp_type,
            self.meta_sync_interval,
            self.readahead_workers
        )?;
        if self.defer_open {
            f.write_str(",defer_open")?;
        }
        Ok(())
    }
}
