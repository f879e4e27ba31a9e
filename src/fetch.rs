//! Source download, SHA-256 verification and archive extraction.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use tracing::{debug, info, warn};
use crate::error::{FormaError, Result};
use crate::global::cache::{cache_archive, cache_key, get_cached_archive};
use crate::util::{format_hash, sha256_bytes, sha256_file};

/// Downloads `url` into memory.
///
/// `http://` and `https://` go through a blocking HTTP client; `file://` URLs
/// and plain paths are read from disk.
///
/// # Errors
/// Returns [`FormaError::Network`] if the bytes cannot be obtained.
pub fn download(url: &str) -> Result<Vec<u8>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return download_http(url);
    }
    let path = url.strip_prefix("file://").unwrap_or(url);
    std::fs::read(path).map_err(|e| FormaError::Network {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn download_http(url: &str) -> Result<Vec<u8>> {
    let network = |e: reqwest::Error| FormaError::Network {
        url: url.to_string(),
        reason: e.to_string(),
    };
    // no overall deadline: a download runs until the body is complete
    let client = Client::builder()
        .user_agent(concat!("forma/", env!("CARGO_PKG_VERSION")))
        .timeout(None::<Duration>)
        .build()
        .map_err(network)?;
    let response = client
        .get(url)
        .send()
        .map_err(network)?
        .error_for_status()
        .map_err(network)?;
    let bytes = response.bytes().map_err(network)?;
    Ok(bytes.to_vec())
}

/// Compares the SHA-256 of `bytes` against `expected`.
///
/// # Errors
/// Returns [`FormaError::IntegrityMismatch`] with both digests on mismatch.
pub fn verify(url: &str, expected: &str, bytes: &[u8]) -> Result<()> {
    let expected = format_hash(expected);
    let actual = sha256_bytes(bytes);
    if actual == expected {
        Ok(())
    } else {
        Err(FormaError::IntegrityMismatch {
            url: url.to_string(),
            expected,
            actual,
        })
    }
}

/// Returns a local, verified copy of the archive at `url`.
///
/// A cached archive is re-hashed before reuse and dropped if it no longer
/// matches. Downloaded bytes are cached only after they verify.
pub fn fetch_verified(
    name: &str,
    version: &str,
    url: &str,
    sha256: &str,
    cache_dir: &Path,
) -> Result<PathBuf> {
    let key = cache_key(name, version, url)?;
    if let Some(cached) = get_cached_archive(cache_dir, &key) {
        let actual = sha256_file(&cached)?;
        if actual == format_hash(sha256) {
            debug!("using cached {}", cached.display());
            return Ok(cached);
        }
        warn!("discarding cached {} (checksum changed)", cached.display());
        std::fs::remove_file(&cached)?;
    }

    info!("downloading {url}");
    let bytes = download(url)?;
    verify(url, sha256, &bytes)?;
    let path = cache_archive(cache_dir, &key, &bytes)?;
    debug!("verified and cached {}", path.display());
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Tar,
    Zip,
    Plain,
}

fn archive_kind(file_name: &str) -> ArchiveKind {
    let name = file_name.to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArchiveKind::TarGz
    } else if name.ends_with(".tar") {
        ArchiveKind::Tar
    } else if name.ends_with(".zip") {
        ArchiveKind::Zip
    } else {
        ArchiveKind::Plain
    }
}

/// Unpacks `archive` into `dest` and returns the source directory.
///
/// `file_name` is the upstream file name; it selects the archive format. When
/// the archive holds exactly one top-level directory, that directory is
/// returned. Files that are not a recognised archive are copied into `dest`
/// under `file_name`.
pub fn extract(archive: &Path, file_name: &str, dest: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest)?;
    match archive_kind(file_name) {
        ArchiveKind::TarGz => {
            let file = File::open(archive)?;
            tar::Archive::new(GzDecoder::new(file)).unpack(dest)?;
        }
        ArchiveKind::Tar => {
            let file = File::open(archive)?;
            tar::Archive::new(file).unpack(dest)?;
        }
        ArchiveKind::Zip => {
            let file = File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file).map_err(anyhow::Error::from)?;
            zip.extract(dest).map_err(anyhow::Error::from)?;
        }
        ArchiveKind::Plain => {
            if Path::new(file_name).file_name().is_none_or(|n| n != file_name) {
                return Err(anyhow::anyhow!("Invalid archive name '{file_name}'").into());
            }
            std::fs::copy(archive, dest.join(file_name))?;
        }
    }
    source_root(dest)
}

fn source_root(dest: &Path) -> Result<PathBuf> {
    let entries: Vec<_> = std::fs::read_dir(dest)?.collect::<std::io::Result<_>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    /// Answers one HTTP request on a local port, writing `body` in `chunks`
    /// pieces with `pause` after each. Returns the URL to fetch.
    fn serve_once(status: &'static str, body: &'static [u8], chunks: usize, pause: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            if stream.write_all(head.as_bytes()).is_err() {
                return;
            }
            for chunk in body.chunks(body.len().div_ceil(chunks.max(1)).max(1)) {
                if stream.write_all(chunk).and_then(|_| stream.flush()).is_err() {
                    return;
                }
                std::thread::sleep(pause);
            }
        });
        format!("http://{addr}/v0.1.2.tar.gz")
    }

    fn tarball(dir: &Path, top: &str) -> PathBuf {
        let src = dir.join("src-tree").join(top);
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("main.rs"), "fn main() {}").unwrap();
        let path = dir.join("v0.1.2.tar.gz");
        let file = File::create(&path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append_dir_all(top, &src).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_verify() {
        let bytes = b"abc";
        let good = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify("file:///x", good, bytes).is_ok());
        assert!(verify("file:///x", &format!("sha256:{good}"), bytes).is_ok());

        let err = verify("file:///x", good, b"abd").unwrap_err();
        match err {
            FormaError::IntegrityMismatch { expected, actual, .. } => {
                assert_eq!(expected, good);
                assert_ne!(actual, good);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_download_missing_file_is_network_error() {
        let err = download("file:///definitely/not/here.tar.gz").unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
    }

    #[test]
    fn test_extract_single_top_level_dir() {
        let dir = tempdir().unwrap();
        let archive = tarball(dir.path(), "white-dragon-0.1.2");
        let source = extract(&archive, "v0.1.2.tar.gz", &dir.path().join("out")).unwrap();
        assert!(source.ends_with("white-dragon-0.1.2"));
        assert!(source.join("main.rs").exists());
    }

    #[test]
    fn test_extract_plain_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tool--1.0.0--install--local.sh");
        std::fs::write(&file, "echo hi").unwrap();
        let source = extract(&file, "install--local.sh", &dir.path().join("out")).unwrap();
        assert_eq!(source, dir.path().join("out"));
        assert!(source.join("install--local.sh").exists());

        let err = extract(&file, "../escape.sh", &dir.path().join("out2")).unwrap_err();
        assert!(err.to_string().contains("Invalid archive name"), "{err}");
    }

    #[test]
    fn test_extract_plain_tar() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src-tree").join("pkg-1.0.0");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("Makefile"), "all:\n").unwrap();
        let path = dir.path().join("pkg-1.0.0.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        builder.append_dir_all("pkg-1.0.0", &src).unwrap();
        builder.finish().unwrap();

        let source = extract(&path, "pkg-1.0.0.tar", &dir.path().join("out")).unwrap();
        assert!(source.ends_with("pkg-1.0.0"));
        assert!(source.join("Makefile").exists());
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tool-2.0.0.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = SimpleFileOptions::default();
        writer.add_directory("tool-2.0.0/", options).unwrap();
        writer.start_file("tool-2.0.0/main.rs", options).unwrap();
        writer.write_all(b"fn main() {}").unwrap();
        writer.finish().unwrap();

        let source = extract(&path, "tool-2.0.0.zip", &dir.path().join("out")).unwrap();
        assert!(source.ends_with("tool-2.0.0"));
        assert_eq!(std::fs::read_to_string(source.join("main.rs")).unwrap(), "fn main() {}");

        // several top-level entries: the extraction root is the source
        let path = dir.path().join("flat.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        writer.start_file("a.txt", options).unwrap();
        writer.write_all(b"a").unwrap();
        writer.start_file("b.txt", options).unwrap();
        writer.write_all(b"b").unwrap();
        writer.finish().unwrap();

        let out = dir.path().join("flat");
        assert_eq!(extract(&path, "flat.zip", &out).unwrap(), out);
        assert!(out.join("a.txt").exists());
    }

    #[test]
    fn test_download_http() {
        let url = serve_once("200 OK", b"archive bytes", 1, Duration::ZERO);
        assert_eq!(download(&url).unwrap(), b"archive bytes");
    }

    #[test]
    fn test_download_http_error_status_is_network_error() {
        let url = serve_once("404 Not Found", b"not found", 1, Duration::ZERO);
        let err = download(&url).unwrap_err();
        assert_eq!(err.kind(), "NetworkError");
        assert!(err.to_string().contains(&url), "{err}");
    }

    #[test]
    fn test_download_slow_body_is_not_cut_off() {
        // four bytes, the last one arriving after more than 30 seconds
        let url = serve_once("200 OK", b"slow", 4, Duration::from_secs(11));
        let started = Instant::now();
        assert_eq!(download(&url).unwrap(), b"slow");
        assert!(started.elapsed() > Duration::from_secs(30));
    }

    #[test]
    fn test_fetch_caches_only_verified_bytes() {
        let dir = tempdir().unwrap();
        let archive = tarball(dir.path(), "pkg");
        let url = format!("file://{}", archive.display());
        let sha = sha256_file(&archive).unwrap();
        let cache = dir.path().join("cache");

        let wrong = "0".repeat(64);
        let err = fetch_verified("pkg", "0.1.2", &url, &wrong, &cache).unwrap_err();
        assert_eq!(err.kind(), "IntegrityMismatchError");
        assert!(get_cached_archive(&cache, "pkg--0.1.2--v0.1.2.tar.gz").is_none());

        let path = fetch_verified("pkg", "0.1.2", &url, &sha, &cache).unwrap();
        assert_eq!(path, cache.join("pkg--0.1.2--v0.1.2.tar.gz"));

        // a tampered cache entry is discarded and fetched again
        std::fs::write(&path, b"tampered").unwrap();
        let again = fetch_verified("pkg", "0.1.2", &url, &sha, &cache).unwrap();
        assert_eq!(sha256_file(&again).unwrap(), sha);
    }
}
