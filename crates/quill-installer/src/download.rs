//! Streaming download with optional archive extraction
//!
//! Fetches a URL into a destination directory, optionally piping the body
//! through a decompression/extraction pipeline:
//! - Tarballs stream straight into the extractor through a bounded channel,
//!   so the body is never buffered whole.
//! - Zip archives stage to a temporary file first (the central directory
//!   lives at the end of the archive and extraction needs `Seek`).
//! - Percent progress is reported through a callback when the response
//!   carries a `Content-Length`.
//! - Cancellation is cooperative via a `CancellationToken`.

use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use quill_core::{Error, Result};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::time::Duration;
use tar::Archive;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zip::ZipArchive;

/// Grace window after a connection reset; some proxies reset completed
/// connections before the client observes end-of-stream
const RESET_GRACE: Duration = Duration::from_millis(500);

/// Bounded channel depth between the network loop and the tar extractor
const PIPE_DEPTH: usize = 16;

/// Progress callback receiving fractional percent (0.0 - 100.0)
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// How the response body should be materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractMode {
    /// Write the body to a uniquely-named file under the destination
    #[default]
    None,

    /// Decide tar-gzip vs zip from content-type and URL extension
    Auto,

    /// Treat the body as a gzipped tarball
    Untar,

    /// Treat the body as a zip archive
    Unzip,
}

/// Download options
#[derive(Clone, Default)]
pub struct DownloadOptions {
    /// Extraction mode (default: plain file)
    pub extract: ExtractMode,

    /// Leading path segments stripped from tar entries; `None` strips one,
    /// unwrapping the single top-level folder of a registry tarball
    pub strip: Option<usize>,

    /// Total request timeout; `None` uses the client default
    pub timeout: Option<Duration>,

    /// Percent progress callback
    pub on_progress: Option<ProgressFn>,
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("extract", &self.extract)
            .field("strip", &self.strip)
            .field("timeout", &self.timeout)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// HTTP downloader with archive extraction support
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    /// Create a downloader with a default client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::other(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Reuse an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Download `url` into `dest`, which must be an absolute directory path
    ///
    /// Resolves with the destination directory for extraction modes, or the
    /// written file path otherwise.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        options: DownloadOptions,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        if !dest.is_absolute() {
            return Err(Error::InvalidDestination {
                path: dest.to_path_buf(),
            });
        }
        if dest.exists() && !dest.is_dir() {
            return Err(Error::InvalidDestination {
                path: dest.to_path_buf(),
            });
        }
        std::fs::create_dir_all(dest)?;

        let mut request = self.client.get(url);
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = request.send() => r.map_err(|e| Error::other(format!("Request to {url} failed: {e}")))?,
        };

        let status = response.status();
        if !status.is_success() && status.as_u16() != 1223 {
            return Err(Error::HttpStatus {
                code: status.as_u16(),
                url: url.to_string(),
            });
        }

        let total = response.content_length();
        let content_type = header_str(&response, CONTENT_TYPE);
        let disposition = header_str(&response, CONTENT_DISPOSITION);

        let mode = resolve_mode(options.extract, content_type.as_deref(), url)?;
        debug!("Downloading {url} -> {:?} ({:?})", dest, mode);

        match mode {
            ResolvedMode::File => {
                let file_name = file_name_hint(disposition.as_deref(), url);
                self.stream_to_file(response, dest, &file_name, &options, total, cancel)
                    .await
            }
            ResolvedMode::Tar => {
                let strip = options.strip.unwrap_or(1);
                self.stream_to_tar(response, dest, strip, &options, total, cancel)
                    .await?;
                Ok(dest.to_path_buf())
            }
            ResolvedMode::Zip => {
                self.stream_to_zip(response, dest, &options, total, cancel)
                    .await?;
                Ok(dest.to_path_buf())
            }
        }
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        dest: &Path,
        file_name: &str,
        options: &DownloadOptions,
        total: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let (stem, suffix) = split_file_name(file_name);
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{stem}-"))
            .suffix(&suffix)
            .tempfile_in(dest)?;
        let (mut file, path) = tmp.keep().map_err(|e| Error::Io(e.error))?;

        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = std::fs::remove_file(&path);
                    return Err(Error::Cancelled);
                }
                c = stream.next() => c,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes)?;
                    received += bytes.len() as u64;
                    report_progress(options, received, total);
                }
                Some(Err(e)) => {
                    if transfer_complete(received, total) {
                        break;
                    }
                    tokio::time::sleep(RESET_GRACE).await;
                    let _ = std::fs::remove_file(&path);
                    return Err(Error::other(format!("Download interrupted: {e}")));
                }
                None => break,
            }
        }
        file.sync_all()?;
        info!("Downloaded {} bytes to {:?}", received, path);
        Ok(path)
    }

    async fn stream_to_tar(
        &self,
        response: reqwest::Response,
        dest: &Path,
        strip: usize,
        options: &DownloadOptions,
        total: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Bytes>(PIPE_DEPTH);
        let dest_owned = dest.to_path_buf();
        let extractor = tokio::task::spawn_blocking(move || -> Result<()> {
            extract_tar(ChannelReader::new(rx), &dest_owned, strip)
        });

        let pump = self
            .pump_stream(response, tx, options, total, cancel)
            .await;

        let extract_result = extractor
            .await
            .map_err(|e| Error::other(format!("Extractor task failed: {e}")))?;

        // A pump failure usually surfaces as a truncated-archive error in the
        // extractor; prefer the network error when both are present.
        pump?;
        extract_result
    }

    async fn stream_to_zip(
        &self,
        response: reqwest::Response,
        dest: &Path,
        options: &DownloadOptions,
        total: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let staged = tempfile::Builder::new()
            .prefix(".zip-")
            .tempfile_in(dest)?;
        let (tx, rx) = std::sync::mpsc::sync_channel::<Bytes>(PIPE_DEPTH);

        let mut writer = staged.reopen()?;
        let sink = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut reader = ChannelReader::new(rx);
            io::copy(&mut reader, &mut writer)?;
            writer.sync_all()?;
            Ok(())
        });

        let pump = self
            .pump_stream(response, tx, options, total, cancel)
            .await;
        sink.await
            .map_err(|e| Error::other(format!("Staging task failed: {e}")))??;
        pump?;

        let file = staged.reopen()?;
        let dest_owned = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(file, &dest_owned))
            .await
            .map_err(|e| Error::other(format!("Extractor task failed: {e}")))?
    }

    async fn pump_stream(
        &self,
        response: reqwest::Response,
        tx: SyncSender<Bytes>,
        options: &DownloadOptions,
        total: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                c = stream.next() => c,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    received += bytes.len() as u64;
                    if tx.send(bytes).is_err() {
                        // extractor bailed; its error is reported by the caller
                        return Ok(());
                    }
                    report_progress(options, received, total);
                }
                Some(Err(e)) => {
                    if transfer_complete(received, total) {
                        return Ok(());
                    }
                    tokio::time::sleep(RESET_GRACE).await;
                    return Err(Error::other(format!("Download interrupted: {e}")));
                }
                None => return Ok(()),
            }
        }
    }
}

#[derive(Debug)]
enum ResolvedMode {
    File,
    Tar,
    Zip,
}

fn resolve_mode(
    requested: ExtractMode,
    content_type: Option<&str>,
    url: &str,
) -> Result<ResolvedMode> {
    match requested {
        ExtractMode::None => Ok(ResolvedMode::File),
        ExtractMode::Untar => Ok(ResolvedMode::Tar),
        ExtractMode::Unzip => Ok(ResolvedMode::Zip),
        ExtractMode::Auto => {
            let path = url.split(['?', '#']).next().unwrap_or(url);
            let ct = content_type.unwrap_or("").to_ascii_lowercase();
            if ct.contains("zip") || path.ends_with(".zip") {
                Ok(ResolvedMode::Zip)
            } else if ct.contains("gzip")
                || ct.contains("tar")
                || path.ends_with(".tgz")
                || path.ends_with(".tar.gz")
            {
                Ok(ResolvedMode::Tar)
            } else {
                Err(Error::UnsupportedArchive {
                    hint: if ct.is_empty() { path.to_string() } else { ct },
                })
            }
        }
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Derive the output file name from a Content-Disposition hint or the URL
fn file_name_hint(disposition: Option<&str>, url: &str) -> String {
    if let Some(value) = disposition {
        if let Some(raw) = value
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix("filename="))
        {
            let name = raw.trim_matches('"').trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

fn split_file_name(name: &str) -> (String, String) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (name[..idx].to_string(), name[idx..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

fn report_progress(options: &DownloadOptions, received: u64, total: Option<u64>) {
    if let (Some(cb), Some(total)) = (&options.on_progress, total) {
        if total > 0 {
            cb(received as f64 / total as f64 * 100.0);
        }
    }
}

fn transfer_complete(received: u64, total: Option<u64>) -> bool {
    total.is_some_and(|t| received >= t)
}

/// Blocking reader fed by the async network loop
struct ChannelReader {
    rx: Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.current = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

/// Reject archive entries that would escape the destination
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(Error::other(format!(
                    "Archive entry escapes destination: {}",
                    path.display()
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
        }
    }
    Ok(cleaned)
}

fn strip_components(path: &Path, strip: usize) -> Option<PathBuf> {
    let stripped: PathBuf = path.components().skip(strip).collect();
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

fn extract_tar(reader: impl Read, dest: &Path, strip: usize) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.to_path_buf();
        let cleaned = sanitize_entry_path(&raw)?;
        let Some(rel) = strip_components(&cleaned, strip) else {
            continue;
        };
        let out = dest.join(rel);
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&out)?;
        }
    }
    Ok(())
}

fn extract_zip(file: File, dest: &Path) -> Result<()> {
    let mut archive =
        ZipArchive::new(file).map_err(|e| Error::UnsupportedArchive { hint: e.to_string() })?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::other(format!("Failed to read zip entry: {e}")))?;
        let raw = entry.name().replace('\\', "/");
        let cleaned = sanitize_entry_path(Path::new(&raw))?;
        if cleaned.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(cleaned);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out)?;
        io::copy(&mut entry, &mut out_file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_resolve_mode_auto_by_content_type() {
        assert!(matches!(
            resolve_mode(ExtractMode::Auto, Some("application/gzip"), "https://x/pkg"),
            Ok(ResolvedMode::Tar)
        ));
        assert!(matches!(
            resolve_mode(ExtractMode::Auto, Some("application/zip"), "https://x/pkg"),
            Ok(ResolvedMode::Zip)
        ));
    }

    #[test]
    fn test_resolve_mode_auto_by_extension() {
        assert!(matches!(
            resolve_mode(ExtractMode::Auto, None, "https://x/a.tgz?token=1"),
            Ok(ResolvedMode::Tar)
        ));
        assert!(matches!(
            resolve_mode(ExtractMode::Auto, None, "https://x/a.zip"),
            Ok(ResolvedMode::Zip)
        ));
    }

    #[test]
    fn test_resolve_mode_auto_unsupported() {
        let err = resolve_mode(ExtractMode::Auto, Some("text/html"), "https://x/a").unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchive { .. }));
    }

    #[test]
    fn test_file_name_hint_prefers_disposition() {
        assert_eq!(
            file_name_hint(
                Some(r#"attachment; filename="bundle.tgz""#),
                "https://x/other"
            ),
            "bundle.tgz"
        );
        assert_eq!(file_name_hint(None, "https://x/pkg-1.0.0.tgz?a=1"), "pkg-1.0.0.tgz");
        assert_eq!(file_name_hint(None, "https://x/"), "download");
    }

    #[test]
    fn test_sanitize_entry_path_rejects_escape() {
        assert!(sanitize_entry_path(Path::new("../evil")).is_err());
        assert!(sanitize_entry_path(Path::new("/abs/evil")).is_err());
        assert_eq!(
            sanitize_entry_path(Path::new("./a/b")).unwrap(),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn test_strip_components() {
        assert_eq!(
            strip_components(Path::new("package/index.js"), 1),
            Some(PathBuf::from("index.js"))
        );
        assert_eq!(strip_components(Path::new("package"), 1), None);
        assert_eq!(
            strip_components(Path::new("a/b/c"), 0),
            Some(PathBuf::from("a/b/c"))
        );
    }

    #[test]
    fn test_extract_tar_strips_top_level_folder() {
        let dir = tempfile::tempdir().unwrap();

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let content = b"{\"name\": \"demo\"}";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "package/package.json", content.as_slice())
            .unwrap();
        let gz = builder.into_inner().unwrap().finish().unwrap();

        extract_tar(io::Cursor::new(gz), dir.path(), 1).unwrap();
        assert!(dir.path().join("package.json").exists());
        assert!(!dir.path().join("package").exists());
    }

    #[test]
    fn test_extract_zip_sanitizes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");

        let file = File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let opts = zip::write::SimpleFileOptions::default();
        writer.start_file("inner/data.txt", opts).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        extract_zip(File::open(&zip_path).unwrap(), &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(out.join("inner/data.txt")).unwrap(),
            "hello"
        );
    }
}
