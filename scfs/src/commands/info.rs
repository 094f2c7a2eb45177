use std::path::Path;

use humansize::{file_size_opts as options, FileSize};
use scfs_core::{cluster_len, is_compressed, Layout};

use crate::error::{Error, Result};

#[inline(always)]
fn human(bytes: u64) -> String {
    bytes
        .file_size(options::BINARY)
        .unwrap_or_else(|_| format!("{} B", bytes))
}

fn print_json(path: &Path, lower_size: u64, layout: &Layout) -> Result<()> {
    let footer = &layout.footer;
    let size = footer.original_size();

    let clusters: Vec<_> = layout
        .clusters
        .iter()
        .enumerate()
        .map(|(index, desc)| {
            let len = cluster_len(index as u64, size, footer.cluster_size);
            serde_json::json!({
                "offset": desc.offset,
                "size": desc.size,
                "length": len,
                "compressed": is_compressed(desc, len),
            })
        })
        .collect();

    let value = serde_json::json!({
        "path": path.display().to_string(),
        "lower_size": lower_size,
        "original_size": size,
        "cluster_size": footer.cluster_size,
        "compression": footer.comp_type.name(),
        "compressed": footer.is_compressed(),
        "footer_size": footer.footer_size,
        "clusters": clusters,
    });

    let out = serde_json::to_string_pretty(&value).map_err(|source| Error::Json { source })?;
    println!("{}", out);
    Ok(())
}

fn print_table(path: &Path, lower_size: u64, layout: &Layout) {
    let footer = &layout.footer;
    let size = footer.original_size();

    println!("Path:           {}", path.display());
    println!("Original size:  {} ({} bytes)", human(size), size);
    println!("Stored size:    {} ({} bytes)", human(lower_size), lower_size);
    println!("Cluster size:   {}", human(footer.cluster_size as u64));
    println!("Compression:    {}", footer.comp_type);
    println!("Footer size:    {} bytes", footer.footer_size);

    if !footer.is_compressed() {
        println!("Layout:         stored verbatim");
        return;
    }

    println!("Layout:         {} clusters", layout.clusters.len());
    println!();
    println!("Index     Offset        Stored         Length         Method");
    println!("--------  ------------  -------------  -------------  ----------");
    for (index, desc) in layout.clusters.iter().enumerate() {
        let len = cluster_len(index as u64, size, footer.cluster_size);
        let method = if is_compressed(desc, len) {
            "compressed"
        } else {
            "raw"
        };
        println!(
            "{:<8}  {:>#12x}  {:>13}  {:>13}  {}",
            index,
            desc.offset,
            human(desc.size as u64),
            human(len as u64),
            method,
        );
    }
}

pub fn run(path: &Path, json: bool) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|source| Error::OpenFile {
        path: path.to_path_buf(),
        source,
    })?;

    let lower_size = file
        .metadata()
        .map_err(|source| Error::OpenFile {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let layout = scfs_core::inspect(&file)
        .map_err(|source| Error::Inspect {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| Error::EmptyLowerFile {
            path: path.to_path_buf(),
        })?;

    if json {
        print_json(path, lower_size, &layout)
    } else {
        print_table(path, lower_size, &layout);
        Ok(())
    }
}
