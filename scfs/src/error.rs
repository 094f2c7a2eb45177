use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid mount options `{options}`")]
    InvalidOptions {
        options: String,
        #[source]
        source: scfs_core::OptionsError,
    },

    #[error("Cannot mount lower directory `{}`", path.display())]
    Mount {
        path: PathBuf,
        #[source]
        source: scfs_core::Error,
    },

    #[error("Cannot open file `{}`", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open SCFS file `{}`", path.display())]
    OpenScfsFile {
        path: PathBuf,
        #[source]
        source: scfs_core::Error,
    },

    #[error("Cannot create file `{}`", path.display())]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot create directory `{}`", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot copy data for `{}`", path.display())]
    CopyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot finish SCFS file `{}`", path.display())]
    FinishFile {
        path: PathBuf,
        #[source]
        source: scfs_core::Error,
    },

    #[error("Cannot process directory entry")]
    ProcessDirEntry {
        #[source]
        source: jwalk::Error,
    },

    #[error("Cannot read layout of `{}`", path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: scfs_core::Error,
    },

    #[error("`{}` is empty, not an SCFS file", path.display())]
    EmptyLowerFile { path: PathBuf },

    #[error("Cannot write output")]
    WriteOutput {
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot serialize JSON")]
    Json {
        #[source]
        source: serde_json::Error,
    },

    #[error("No files specified to compress")]
    NoFilesSpecified,
}
