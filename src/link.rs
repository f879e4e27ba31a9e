use std::path::{Path, PathBuf};
use anyhow::Result;
use tracing::debug;
use crate::util::find_executables;

/// Creates a platform-specific link that forwards execution to `target`.
///
/// On Unix systems, this creates a symbolic link at `link_path` pointing to `target`.
/// On Windows, it creates a `.bat` script at `link_path` (with a `.bat` extension) that calls the `target`.
///
/// An existing link at `link_path` is replaced.
///
/// # Errors
///
/// Returns an error if the symlink (on Unix) or file write (on Windows) fails.
pub fn create_link<P: AsRef<Path>>(
    target: P,
    link_path: P
) -> Result<PathBuf> {
    #[cfg(unix)]
    let link_path = {
        use std::os::unix::fs::symlink;
        let link_path = link_path.as_ref();
        if link_path.symlink_metadata().is_ok() {
            std::fs::remove_file(link_path)?;
        }
        symlink(target, link_path)?;
        link_path.to_path_buf()
    };
    #[cfg(windows)]
    let link_path = {
        let script = format!(
            "@echo off\r\ncall \"{}\" %*\r\n",
            target.as_ref().display()
        );
        let link_path = link_path.as_ref().with_extension("bat");
        std::fs::write(&link_path, script)?;
        link_path
    };
    Ok(link_path)
}

/// Links every executable in `<keg>/bin` into `bin_dir`.
///
/// Returns the created links.
pub fn link_keg(keg: &Path, bin_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(bin_dir)?;
    let mut links = Vec::new();
    for exe in find_executables(keg.join("bin"))? {
        let Some(file_name) = exe.file_name() else {
            continue;
        };
        let link = create_link(exe.clone(), bin_dir.join(file_name))?;
        debug!("linked {} -> {}", link.display(), exe.display());
        links.push(link);
    }
    Ok(links)
}

/// Removes links in `bin_dir` that point into `keg`. Returns how many were removed.
pub fn unlink_keg(keg: &Path, bin_dir: &Path) -> Result<usize> {
    if !bin_dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(bin_dir)? {
        let path = entry?.path();
        if points_into(&path, keg) {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(unix)]
fn points_into(link: &Path, keg: &Path) -> bool {
    std::fs::read_link(link)
        .map(|target| target.starts_with(keg))
        .unwrap_or(false)
}

#[cfg(windows)]
fn points_into(link: &Path, keg: &Path) -> bool {
    std::fs::read_to_string(link)
        .map(|script| script.contains(&keg.display().to_string()))
        .unwrap_or(false)
}
