//! Recursive scan for ADIOS BP output (files named `*.bp`, directories named
//! `*.bp.dir`) under a pipeline's working directory, written as a flat
//! relative-path → byte-size map.
//!
//! Grounded in `codar.workflow.consumer.PipelineRunner._get_adios_file_sizes`.
//! That recursion discards sizes found below the top level — the recursive
//! call's return value is never merged into the caller's map. Per spec.md
//! §9 this is treated as a bug, not intended behavior: this version walks
//! all descendants and accumulates them into one flat map.

use std::collections::HashMap;
use std::path::Path;

/// Scan `working_dir` and write `.codar.adios_file_sizes.out.json`
/// (relative path → size in bytes) directly under it.
pub fn write_adios_file_sizes(working_dir: &Path) -> std::io::Result<()> {
    let sizes = scan(working_dir, working_dir)?;
    let out_path = working_dir.join(".codar.adios_file_sizes.out.json");
    let json = serde_json::to_string(&sizes)?;
    std::fs::write(out_path, json)
}

fn scan(root: &Path, dir: &Path) -> std::io::Result<HashMap<String, u64>> {
    let mut sizes = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sizes),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name.ends_with(".bp") || name.ends_with(".bp.dir") {
            let size = entry_size(&path)?;
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            sizes.insert(relative, size);
        } else if path.is_dir() {
            sizes.extend(scan(root, &path)?);
        }
    }
    Ok(sizes)
}

/// Size of a file, or the total size of all files under a directory (an
/// ADIOS `.bp.dir` is itself a directory of shards).
fn entry_size(path: &Path) -> std::io::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        total += entry_size(&entry.path())?;
    }
    Ok(total)
}
