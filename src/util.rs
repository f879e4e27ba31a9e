use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use anyhow::Result;
use regex::Regex;
use semver::Version;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Length of a hex encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Strips the `sha256:` prefix from a hash if present and lowercases it.
/// This is useful for comparing hashes uniformly.
pub fn format_hash(hash: &str) -> String {
    let hash = hash.trim();
    match hash.strip_prefix("sha256:") {
        Some(hash) => hash.to_ascii_lowercase(),
        None => hash.to_ascii_lowercase(),
    }
}

/// Checks that a hash is exactly 64 hexadecimal characters.
pub fn is_valid_sha256(hash: &str) -> bool {
    hash.len() == SHA256_HEX_LEN && hash.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hex encoded SHA-256 of a byte slice.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex encoded SHA-256 of a file's contents, read in chunks.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns the host operating system as used in platform requirements
/// (`macos`, `linux`, `windows`, ...).
pub fn current_os() -> &'static str {
    std::env::consts::OS
}

/// Validates whether a version string is a valid SemVer version.
/// Ignores a leading `v`.
pub fn is_valid_version(version: &str) -> bool {
    Version::parse(version.trim_start_matches('v')).is_ok()
}

/// `MAJOR.MINOR.PATCH` with an optional pre-release part.
static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"v?(\d+\.\d+\.\d+)(-[0-9A-Za-z.]+)?").expect("VERSION_REGEX must compile")
});

/// Infers a version from a source URL, e.g. `.../tags/v0.1.2.tar.gz` gives `0.1.2`.
///
/// Only the first `MAJOR.MINOR.PATCH` group is considered. A pre-release part
/// counts only when the archive extension follows it directly, so
/// `tool-1.0.0-x86_64.tar.gz` gives `1.0.0`.
pub fn infer_version(url: &str) -> Option<String> {
    let file_name = url.rsplit('/').next().unwrap_or(url);
    let stem = [".tar.gz", ".tgz", ".tar", ".zip"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(file_name);
    let (caps, text) = match VERSION_REGEX.captures(stem) {
        Some(caps) => (caps, stem),
        None => (VERSION_REGEX.captures(url)?, url),
    };
    let core = caps.get(1)?.as_str();
    let version = match caps.get(2) {
        Some(pre) if pre.end() == text.len() => format!("{core}{}", pre.as_str()),
        _ => core.to_string(),
    };
    if is_valid_version(&version) {
        Some(version)
    } else {
        None
    }
}

/// Parses the system `PATH` environment variable into a list of directories.
pub fn parse_system_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default()
}

/// Looks up an executable by name in the given directories.
pub fn find_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.is_file() && is_executable(&candidate) {
            return Some(candidate);
        }
        #[cfg(windows)]
        for ext in ["exe", "bat", "cmd"] {
            let candidate = dir.join(name).with_extension(ext);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Looks up an executable by name on the host `PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    find_in_dirs(name, &parse_system_path())
}

/// Collects every executable file below `dir`, sorted by path.
///
/// Returns an empty list if `dir` does not exist.
pub fn find_executables<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        let path = entry.path();
        if (entry.file_type().is_file() || entry.file_type().is_symlink()) && is_executable(path) {
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

/// Returns true if the directory is missing or holds no entries.
pub fn is_empty_dir<P: AsRef<Path>>(dir: P) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Checks if a given path is an executable file on Unix.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
/// Checks if a given path has a Windows executable extension (.exe, .bat, .cmd).
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        let ext = ext.to_ascii_lowercase();
        matches!(ext.as_str(), "exe" | "bat" | "cmd")
    } else {
        false
    }
}
