pub mod cat;
pub mod compress;
pub mod extract;
pub mod info;

pub use cat::run as cat;
pub use compress::run as compress;
pub use extract::run as extract;
pub use info::run as info;

use std::path::Path;

use scfs_core::{MountOptions, Scfs};

use crate::error::{Error, Result};

pub(crate) fn parse_options(options: &str) -> Result<MountOptions> {
    options
        .parse::<MountOptions>()
        .map_err(|source| Error::InvalidOptions {
            options: options.to_string(),
            source,
        })
}

pub(crate) fn mount(lower: &Path, options: MountOptions) -> Result<Scfs> {
    Scfs::with_dir(lower, options).map_err(|source| Error::Mount {
        path: lower.to_path_buf(),
        source,
    })
}
