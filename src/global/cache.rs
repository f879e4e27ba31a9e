use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use tracing::debug;
use walkdir::WalkDir;

/// Cache file name for a formula's source archive: `<name>--<version>--<file name>`.
///
/// Upstream archive names such as `v0.1.2.tar.gz` are not unique across
/// projects, so the formula name and version are part of the key.
pub fn cache_key(name: &str, version: &str, url: &str) -> Result<String> {
    let file_name = archive_file_name(url)?;
    Ok(format!("{name}--{version}--{file_name}"))
}

/// Upstream file name of the archive at `url`, e.g. `v0.1.2.tar.gz`.
pub fn archive_file_name(url: &str) -> Result<&str> {
    url.trim_end_matches('/')
        .split('/')
        .next_back()
        .filter(|s| !s.is_empty())
        .ok_or(anyhow!("Could not determine archive name from {url}"))
}

pub fn get_cached_archive(cache_dir: &Path, key: &str) -> Option<PathBuf> {
    let archive_path = cache_dir.join(key);
    if archive_path.is_file() {
        Some(archive_path)
    } else {
        None
    }
}

/// Stores verified archive bytes under `key` and returns the cached path.
pub fn cache_archive(cache_dir: &Path, key: &str, bytes: &[u8]) -> Result<PathBuf> {
    if !cache_dir.exists() {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("Could not create cache dir {:?}", cache_dir))?;
        debug!("cache directory created: {}", cache_dir.display());
    }
    let path = cache_dir.join(key);
    // write to a sibling first so a crash never leaves a truncated archive under the key
    let partial = cache_dir.join(format!("{key}.incomplete"));
    std::fs::write(&partial, bytes)
        .with_context(|| format!("Could not write cache file {:?}", partial))?;
    std::fs::rename(&partial, &path)
        .with_context(|| format!("Could not move cache file into place {:?}", path))?;
    Ok(path)
}

/// Removes every cached archive. Returns the number of files removed.
pub fn clean_cache(cache_dir: &Path) -> Result<usize> {
    if !cache_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(cache_dir).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Removes cached archives belonging to the named formula.
pub fn remove_cached_archive(cache_dir: &Path, name: &str) -> Result<usize> {
    if !cache_dir.exists() {
        return Ok(0);
    }
    let prefix = format!("{name}--");
    let mut removed = 0;
    for entry in WalkDir::new(cache_dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && file_name.starts_with(&prefix) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
