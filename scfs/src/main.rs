mod commands;
mod error;

use std::path::PathBuf;

use scfs_core::CompressionType;
use structopt::clap::AppSettings::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
enum Commands {
    #[structopt(
        name = "c",
        visible_alias = "compress",
        about = "Copy files into a lower directory as compressed SCFS files"
    )]
    Compress {
        #[structopt(
            short = "C",
            long,
            help = "Codec for new files: lzo, bzip2, zlib or fastlzo [default: lzo]"
        )]
        compression: Option<CompressionType>,

        #[structopt(short, long, help = "Recursively handle provided directories")]
        recursive: bool,

        #[structopt(
            name = "lowerdir",
            parse(from_os_str),
            help = "Lower directory to write SCFS files into"
        )]
        lower: PathBuf,

        #[structopt(
            name = "files",
            parse(from_os_str),
            help = "Files or directories to compress"
        )]
        files: Vec<PathBuf>,
    },

    #[structopt(
        name = "x",
        visible_alias = "extract",
        about = "Decompress SCFS files out of a lower directory"
    )]
    Extract {
        #[structopt(
            short = "d",
            long = "dest",
            parse(from_os_str),
            default_value = ".",
            help = "Directory to extract into"
        )]
        dest: PathBuf,

        #[structopt(
            name = "lowerdir",
            parse(from_os_str),
            help = "Lower directory holding SCFS files"
        )]
        lower: PathBuf,

        #[structopt(
            name = "files",
            parse(from_os_str),
            help = "Files to extract, relative to the lower directory [default: all]"
        )]
        files: Vec<PathBuf>,
    },

    #[structopt(name = "cat", about = "Write the contents of an SCFS file to stdout")]
    Cat {
        #[structopt(
            name = "lowerdir",
            parse(from_os_str),
            help = "Lower directory holding SCFS files"
        )]
        lower: PathBuf,

        #[structopt(
            name = "file",
            parse(from_os_str),
            help = "File to print, relative to the lower directory"
        )]
        file: PathBuf,
    },

    #[structopt(
        name = "i",
        visible_alias = "info",
        about = "Show the footer and cluster table of a lower file"
    )]
    Info {
        #[structopt(long, help = "Print as JSON")]
        json: bool,

        #[structopt(name = "lowerfile", parse(from_os_str), help = "Path to the lower file")]
        path: PathBuf,
    },
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "scfs",
    about = "Create, inspect and extract stackable compressing file system lower files.",
    settings = &[SubcommandRequiredElseHelp, DisableHelpSubcommand, VersionlessSubcommands],
)]
struct CliOpts {
    #[structopt(short, long, help = "Show verbose output", global = true)]
    verbose: bool,

    #[structopt(
        short = "o",
        long = "options",
        default_value = "",
        hide_default_value = true,
        help = "Mount options, e.g. cluster_size=8192,comp_threshold=40",
        global = true
    )]
    options: String,

    #[structopt(subcommand)]
    cmd: Commands,
}

fn main() {
    let opts = CliOpts::from_iter(wild::args_os());

    tracing_subscriber::fmt()
        .with_max_level(if opts.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();

    let result = match opts.cmd {
        Commands::Compress {
            compression,
            recursive,
            lower,
            files,
        } => commands::compress(
            &lower,
            files,
            &opts.options,
            compression,
            recursive,
            opts.verbose,
        ),
        Commands::Extract { dest, lower, files } => {
            commands::extract(&lower, files, &dest, &opts.options, opts.verbose)
        }
        Commands::Cat { lower, file } => commands::cat(&lower, &file, &opts.options),
        Commands::Info { json, path } => commands::info(&path, json),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}
