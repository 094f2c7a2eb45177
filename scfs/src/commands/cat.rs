use std::path::Path;

use super::{mount, parse_options};
use crate::error::{Error, Result};

pub fn run(lower: &Path, path: &Path, options: &str) -> Result<()> {
    let scfs = mount(lower, parse_options(options)?)?;
    let file = scfs.open_read(path).map_err(|source| Error::OpenScfsFile {
        path: path.to_path_buf(),
        source,
    })?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    std::io::copy(&mut file.reader(), &mut out).map_err(|source| Error::WriteOutput { source })?;

    file.close().map_err(|source| Error::FinishFile {
        path: path.to_path_buf(),
        source,
    })
}
