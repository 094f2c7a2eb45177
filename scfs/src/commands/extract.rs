use std::path::{Path, PathBuf};

use rayon::prelude::*;
use scfs_core::Scfs;

use super::{mount, parse_options};
use crate::error::{Error, Result};

/// Every regular file under `lower`, relative to it.
fn lower_files(lower: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in jwalk::WalkDir::new(lower).sort(true) {
        let entry = entry.map_err(|source| Error::ProcessDirEntry { source })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(lower) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

fn extract_file(scfs: &Scfs, path: &Path, dest: &Path, verbose: bool) -> Result<u64> {
    let file = scfs.open_read(path).map_err(|source| Error::OpenScfsFile {
        path: path.to_path_buf(),
        source,
    })?;

    let target = dest.join(path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|source| Error::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut out = std::fs::File::create(&target).map_err(|source| Error::CreateFile {
        path: target.clone(),
        source,
    })?;

    let copied = std::io::copy(&mut file.reader(), &mut out).map_err(|source| Error::CopyFile {
        path: path.to_path_buf(),
        source,
    })?;

    file.close().map_err(|source| Error::FinishFile {
        path: path.to_path_buf(),
        source,
    })?;

    if verbose {
        println!("{}", path.display());
    }
    Ok(copied)
}

pub fn run(
    lower: &Path,
    files: Vec<PathBuf>,
    dest: &Path,
    options: &str,
    verbose: bool,
) -> Result<()> {
    let scfs = mount(lower, parse_options(options)?)?;

    let files = if files.is_empty() {
        lower_files(lower)?
    } else {
        files
    };

    let copied: u64 = files
        .par_iter()
        .map(|path| extract_file(&scfs, path, dest, verbose))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum();

    tracing::debug!(files = files.len(), bytes = copied, "extracted files");
    Ok(())
}
