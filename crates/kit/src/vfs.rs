//! Uniform read access over install media
//!
//! A locator can be an ISO9660 image, an HTTP/FTP endpoint or a local
//! directory; [`VirtualFilesystem::open`] probes the backends in that
//! fixed order and returns a [`MediaHandle`] either way. Handles own
//! their backing bytes: ISO entries and HTTP downloads land in a
//! private temporary file that is removed when the handle is dropped.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::hostexec::{ExecError, HostExec};

/// Media access failure, including catalog-level resolution errors.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("unsupported location {0:?}")]
    UnsupportedLocation(String),
    #[error("don't know how to bootstrap media {0:?}")]
    UnknownMedia(String),
    #[error("{path:?} not found in {locator}")]
    NotFound { locator: String, path: String },
    #[error("server returned {status} for {url}")]
    Remote { url: String, status: u16 },
    #[error("{url} unreachable: {source}")]
    Unreachable {
        url: String,
        source: reqwest::Error,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl MediaError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Progress callback: (bytes transferred, total bytes).
pub type Progress<'a> = &'a dyn Fn(u64, u64);

/// An opened media file. Readable and seekable; any backing temporary
/// file is removed on drop.
#[derive(Debug)]
pub struct MediaHandle {
    file: File,
    path: PathBuf,
    _temp: Option<tempfile::TempPath>,
}

impl MediaHandle {
    fn plain(file: File, path: PathBuf) -> Self {
        Self {
            file,
            path,
            _temp: None,
        }
    }

    fn temp(tmp: NamedTempFile) -> Self {
        let (file, temp) = tmp.into_parts();
        Self {
            file,
            path: temp.to_path_buf(),
            _temp: Some(temp),
        }
    }

    /// Filesystem path of the handle, e.g. to hand to the hypervisor
    /// as a kernel or initrd. Valid only while the handle lives.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for MediaHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for MediaHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Offset of the primary volume descriptor magic in an ISO9660 image.
const ISO_MAGIC_OFFSET: u64 = 0x8001;
const ISO_MAGIC: &[u8; 5] = b"CD001";
const ISO_SCHEME: &str = "iso://";

/// ISO9660 image backend, listing and extracting through isoinfo.
pub struct IsoFs {
    image: PathBuf,
    exec: Arc<dyn HostExec>,
}

impl IsoFs {
    /// Whether the locator is a regular file carrying the ISO9660
    /// primary volume descriptor. `iso://` URLs are accepted too.
    pub fn accepts(locator: &str) -> bool {
        let path = locator.strip_prefix(ISO_SCHEME).unwrap_or(locator);
        let path = path.split('?').next().unwrap_or(path);
        let Ok(mut f) = File::open(path) else {
            return false;
        };
        if !f.metadata().map(|m| m.is_file()).unwrap_or(false) {
            return false;
        }
        let mut magic = [0u8; 5];
        if f.seek(SeekFrom::Start(ISO_MAGIC_OFFSET)).is_err() {
            return false;
        }
        f.read_exact(&mut magic).is_ok() && &magic == ISO_MAGIC
    }

    pub fn new(locator: &str, exec: Arc<dyn HostExec>) -> Result<Self, MediaError> {
        if !Self::accepts(locator) {
            return Err(MediaError::UnsupportedLocation(locator.to_string()));
        }
        let path = locator.strip_prefix(ISO_SCHEME).unwrap_or(locator);
        let path = path.split('?').next().unwrap_or(path);
        Ok(Self {
            image: PathBuf::from(path),
            exec,
        })
    }

    fn image_str(&self) -> String {
        self.image.to_string_lossy().into_owned()
    }

    /// All file paths in the volume, Rock Ridge names.
    fn list(&self) -> Result<Vec<String>, MediaError> {
        let image = self.image_str();
        let index = self
            .exec
            .run_get_string(&["isoinfo", "-f", "-R", "-i", &image])?;
        Ok(index.lines().map(|l| l.trim().to_string()).collect())
    }

    /// Extract one entry to a private temporary file.
    pub fn open(&self, path: &str) -> Result<MediaHandle, MediaError> {
        if !self.list()?.iter().any(|entry| entry == path) {
            return Err(MediaError::NotFound {
                locator: self.image.display().to_string(),
                path: path.to_string(),
            });
        }
        let image = self.image_str();
        let data = self
            .exec
            .run_get_output(&["isoinfo", "-R", "-i", &image, "-x", path])?;
        let mut tmp = NamedTempFile::with_prefix("vmkit-vfs-iso-")
            .map_err(|e| MediaError::io(&self.image, e))?;
        tmp.write_all(&data)
            .map_err(|e| MediaError::io(tmp.path().to_owned(), e))?;
        tmp.rewind()
            .map_err(|e| MediaError::io(tmp.path().to_owned(), e))?;
        Ok(MediaHandle::temp(tmp))
    }

    /// One-shot form encoding image and entry together:
    /// `iso://<image>?path=<entry>`.
    pub fn open_location(locator: &str, exec: Arc<dyn HostExec>) -> Result<MediaHandle, MediaError> {
        let Some(rest) = locator.strip_prefix(ISO_SCHEME) else {
            return Err(MediaError::UnsupportedLocation(locator.to_string()));
        };
        let (image, query) = rest
            .split_once('?')
            .ok_or_else(|| MediaError::UnsupportedLocation(locator.to_string()))?;
        let entry = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("path="))
            .ok_or_else(|| MediaError::UnsupportedLocation(locator.to_string()))?;
        Self::new(image, exec)?.open(entry)
    }
}

/// HTTP/FTP endpoint backend; streaming retrieval into a temp file.
#[derive(Debug, Clone)]
pub struct HttpFs {
    base: Url,
}

impl HttpFs {
    /// Whether the locator parses as an absolute http/https/ftp URL.
    pub fn accepts(locator: &str) -> bool {
        Url::parse(locator)
            .map(|u| matches!(u.scheme(), "http" | "https" | "ftp"))
            .unwrap_or(false)
    }

    pub fn new(locator: &str) -> Result<Self, MediaError> {
        // Retrieval goes through the HTTP client; ftp locations are
        // recognized but cannot be fetched.
        let base = Url::parse(locator)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https" | "ftp"))
            .ok_or_else(|| MediaError::UnsupportedLocation(locator.to_string()))?;
        Ok(Self { base })
    }

    fn join(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }

    /// Fetch a path relative to the base URL. The progress callback is
    /// invoked per chunk when the server reports a content length.
    pub fn open(&self, path: &str, progress: Option<Progress>) -> Result<MediaHandle, MediaError> {
        let url = self.join(path);
        if url.scheme() == "ftp" {
            return Err(MediaError::UnsupportedLocation(url.to_string()));
        }
        debug!("fetching {url}");
        let mut response = reqwest::blocking::Client::new()
            .get(url.clone())
            .send()
            .map_err(|e| MediaError::Unreachable {
                url: url.to_string(),
                source: e,
            })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MediaError::NotFound {
                locator: self.base.to_string(),
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(MediaError::Remote {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total = response.content_length();
        let mut tmp = NamedTempFile::with_prefix("vmkit-vfs-http-")
            .map_err(|e| MediaError::io(url.to_string(), e))?;
        let mut transferred = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| MediaError::io(url.to_string(), e))?;
            if n == 0 {
                break;
            }
            tmp.write_all(&buf[..n])
                .map_err(|e| MediaError::io(tmp.path().to_owned(), e))?;
            transferred += n as u64;
            if let (Some(total), Some(progress)) = (total, progress) {
                progress(transferred, total);
            }
        }
        tmp.rewind()
            .map_err(|e| MediaError::io(tmp.path().to_owned(), e))?;
        Ok(MediaHandle::temp(tmp))
    }
}

/// Local directory backend.
#[derive(Debug, Clone)]
pub struct LocalFs {
    base: PathBuf,
}

impl LocalFs {
    pub fn accepts(locator: &str) -> bool {
        Path::new(locator).is_dir()
    }

    pub fn new(locator: &str) -> Result<Self, MediaError> {
        if !Self::accepts(locator) {
            return Err(MediaError::UnsupportedLocation(locator.to_string()));
        }
        Ok(Self {
            base: PathBuf::from(locator),
        })
    }

    pub fn open(&self, path: &str) -> Result<MediaHandle, MediaError> {
        let full = self.base.join(path.trim_start_matches('/'));
        let file = File::open(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MediaError::NotFound {
                    locator: self.base.display().to_string(),
                    path: path.to_string(),
                }
            } else {
                MediaError::io(&full, e)
            }
        })?;
        Ok(MediaHandle::plain(file, full))
    }
}

/// Dispatch facade over the three backends, probed in fixed order:
/// ISO9660, then HTTP/FTP, then local directory.
#[derive(Clone)]
pub struct VirtualFilesystem {
    exec: Arc<dyn HostExec>,
}

impl std::fmt::Debug for VirtualFilesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFilesystem").finish()
    }
}

impl VirtualFilesystem {
    pub fn new(exec: Arc<dyn HostExec>) -> Self {
        Self { exec }
    }

    pub fn open(&self, locator: &str, path: &str) -> Result<MediaHandle, MediaError> {
        self.open_with_progress(locator, path, None)
    }

    /// Open `path` inside `locator`, reporting download progress for
    /// remote media.
    pub fn open_with_progress(
        &self,
        locator: &str,
        path: &str,
        progress: Option<Progress>,
    ) -> Result<MediaHandle, MediaError> {
        // Self-describing iso://<image>?path=<entry> locators carry
        // their own path.
        if locator.starts_with(ISO_SCHEME) && locator.contains("?path=") {
            return IsoFs::open_location(locator, self.exec.clone());
        }
        if IsoFs::accepts(locator) {
            return IsoFs::new(locator, self.exec.clone())?.open(path);
        }
        if HttpFs::accepts(locator) {
            return HttpFs::new(locator)?.open(path, progress);
        }
        if LocalFs::accepts(locator) {
            return LocalFs::new(locator)?.open(path);
        }
        Err(MediaError::UnsupportedLocation(locator.to_string()))
    }
}
