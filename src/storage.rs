//! Local persistence for downloaded job files.

use crate::model::DownloadedFile;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// The user's download directory, or the current directory when there is none.
pub fn default_output_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Reduce a server-supplied name to a plain file name that cannot escape `dir`.
fn safe_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "download".to_string()
    } else {
        base.to_string()
    }
}

/// First path in `dir` for `name` that does not exist yet: `out.csv`, `out_1.csv`, ...
fn unused_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}_{n}.{ext}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Write a downloaded file into `dir` under its suggested name. Never overwrites.
pub fn save_download(dir: &Path, file: &DownloadedFile) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = unused_path(dir, &safe_file_name(&file.suggested_name));
    std::fs::write(&path, &file.bytes).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), bytes = file.bytes.len(), "saved download");
    Ok(path)
}
