use std::path::{Path, PathBuf};

use rayon::prelude::*;
use scfs_core::{CompressionType, Scfs};

use super::{mount, parse_options};
use crate::error::{Error, Result};

/// A plain file to copy in, and where it lands relative to the lower directory.
#[derive(Debug, PartialEq)]
struct Job {
    source: PathBuf,
    target: PathBuf,
}

fn collect_jobs(files: Vec<PathBuf>, recursive: bool) -> Result<Vec<Job>> {
    let mut jobs = vec![];

    for path in files {
        if !path.is_dir() {
            match path.file_name() {
                Some(name) => jobs.push(Job {
                    target: PathBuf::from(name),
                    source: path,
                }),
                None => tracing::warn!(path = %path.display(), "skipping path without a file name"),
            }
            continue;
        }

        if !recursive {
            tracing::warn!(path = %path.display(), "skipping directory, use -r to recurse");
            continue;
        }

        let prefix = path.file_name().map(PathBuf::from).unwrap_or_default();
        for entry in jwalk::WalkDir::new(&path).sort(true) {
            let entry = entry.map_err(|source| Error::ProcessDirEntry { source })?;
            let entry_path = entry.path();
            if !entry_path.is_file() {
                continue;
            }

            if let Ok(relative) = entry_path.strip_prefix(&path) {
                jobs.push(Job {
                    target: prefix.join(relative),
                    source: entry_path.clone(),
                });
            }
        }
    }

    Ok(jobs)
}

fn compress_file(scfs: &Scfs, lower: &Path, job: &Job, verbose: bool) -> Result<u64> {
    if let Some(parent) = job.target.parent() {
        let dir = lower.join(parent);
        std::fs::create_dir_all(&dir)
            .map_err(|source| Error::CreateDirectory { path: dir, source })?;
    }

    let mut input = std::fs::File::open(&job.source).map_err(|source| Error::OpenFile {
        path: job.source.clone(),
        source,
    })?;

    let mut file = scfs
        .create(&job.target)
        .map_err(|source| Error::OpenScfsFile {
            path: job.target.clone(),
            source,
        })?;

    let copied = std::io::copy(&mut input, &mut file).map_err(|source| Error::CopyFile {
        path: job.source.clone(),
        source,
    })?;

    file.close().map_err(|source| Error::FinishFile {
        path: job.target.clone(),
        source,
    })?;

    if verbose {
        println!("{}", job.target.display());
    }
    Ok(copied)
}

pub fn run(
    lower: &Path,
    files: Vec<PathBuf>,
    options: &str,
    compression: Option<CompressionType>,
    recursive: bool,
    verbose: bool,
) -> Result<()> {
    if files.is_empty() {
        return Err(Error::NoFilesSpecified);
    }

    let mut options = parse_options(options)?;
    if let Some(compression) = compression {
        options = options.comp_type(compression);
    }

    std::fs::create_dir_all(lower).map_err(|source| Error::CreateDirectory {
        path: lower.to_path_buf(),
        source,
    })?;
    let scfs = mount(lower, options)?;

    let jobs = collect_jobs(files, recursive)?;
    let copied: u64 = jobs
        .par_iter()
        .map(|job| compress_file(&scfs, lower, job, verbose))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .sum();

    tracing::debug!(files = jobs.len(), bytes = copied, "compressed files");
    Ok(())
}
