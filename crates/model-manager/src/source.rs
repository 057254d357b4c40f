//! Bundle sources
//!
//! A bundle arrives as a tar archive (optionally gzip-compressed), as a
//! directory, or as a git repository to clone. Sources are first prepared
//! into something the materializer can read synchronously; any temporary
//! file or clone lives as long as the [`PreparedBundle`] and is removed when
//! it drops.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_compression::tokio::bufread::GzipDecoder;
use tempfile::{NamedTempFile, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::utils::execute_with_timeout;
use config::ConfigManager;

use crate::materializer::{BundleMaterializer, MaterializedBundle};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 2] = [b'P', b'K'];

/// URL prefixes accepted for git sources
const GIT_SCHEMES: [&str; 5] = ["https://", "http://", "ssh://", "file://", "git@"];

/// Where a bundle comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    /// Tar archive on disk, plain or gzip-compressed
    Archive(PathBuf),
    /// Directory tree on disk
    Directory(PathBuf),
    /// Git repository, cloned shallowly
    Git {
        url: String,
        /// Branch or tag; the remote default branch when absent
        reference: Option<String>,
    },
}

impl BundleSource {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            BundleSource::Archive(path) => format!("archive {}", path.display()),
            BundleSource::Directory(path) => format!("directory {}", path.display()),
            BundleSource::Git { url, reference: Some(r) } => format!("git {}@{}", url, r),
            BundleSource::Git { url, reference: None } => format!("git {}", url),
        }
    }
}

/// A source ready for synchronous materialization
#[derive(Debug)]
pub enum PreparedBundle {
    /// Uncompressed tar file
    Tar {
        path: PathBuf,
        /// Decompressed copy, removed on drop
        temp: Option<NamedTempFile>,
    },
    /// Directory tree
    Directory {
        path: PathBuf,
        /// Clone directory, removed on drop
        temp: Option<TempDir>,
    },
}

impl PreparedBundle {
    /// Feeds the bundle through `materializer`; blocks
    pub fn materialize(self, materializer: BundleMaterializer) -> Result<MaterializedBundle> {
        match &self {
            PreparedBundle::Tar { path, .. } => {
                let file = File::open(path)?;
                materializer.materialize_tar(BufReader::new(file))
            }
            PreparedBundle::Directory { path, .. } => materializer.materialize_dir(path),
        }
    }
}

/// Prepares bundle sources in a temp directory
pub struct SourceFetcher {
    /// Parent of decompressed archives and clones
    temp_dir: PathBuf,

    /// Bound on a single clone
    clone_timeout: Duration,
}

impl SourceFetcher {
    /// Creates a fetcher from `temp_path` and `git_clone_timeout_ms`
    pub fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        // Get temp path from config
        let temp_dir = config_manager
            .get_path("temp_path")
            .unwrap_or_else(|_| std::env::temp_dir().join("model-hub"));

        // Get clone timeout from config
        let clone_timeout = config_manager
            .get_duration("git_clone_timeout_ms")
            .unwrap_or_else(|_| Duration::from_secs(600));

        Self::with_temp_dir(temp_dir, clone_timeout)
    }

    /// Creates a fetcher with explicit settings
    pub fn with_temp_dir(temp_dir: impl Into<PathBuf>, clone_timeout: Duration) -> Result<Self> {
        let temp_dir = temp_dir.into();
        std::fs::create_dir_all(&temp_dir)?;

        Ok(Self { temp_dir, clone_timeout })
    }

    /// Prepares `source` for materialization
    pub async fn prepare(&self, source: &BundleSource) -> Result<PreparedBundle> {
        debug!("Preparing {}", source.describe());

        match source {
            BundleSource::Archive(path) => self.prepare_archive(path).await,
            BundleSource::Directory(path) => {
                if !tokio::fs::metadata(path).await?.is_dir() {
                    return Err(Error::InvalidArgument(format!("{} is not a directory", path.display())));
                }
                Ok(PreparedBundle::Directory { path: path.clone(), temp: None })
            }
            BundleSource::Git { url, reference } => {
                let dir = self.clone_repository(url, reference.as_deref()).await?;
                Ok(PreparedBundle::Directory {
                    path: dir.path().to_path_buf(),
                    temp: Some(dir),
                })
            }
        }
    }

    async fn prepare_archive(&self, path: &Path) -> Result<PreparedBundle> {
        let file = tokio::fs::File::open(path).await?;
        let mut magic = Vec::with_capacity(GZIP_MAGIC.len());
        file.take(GZIP_MAGIC.len() as u64).read_to_end(&mut magic).await?;

        if magic == ZIP_MAGIC {
            return Err(Error::InvalidArgument(format!(
                "{} is a zip archive; only tar and tar.gz are supported",
                path.display()
            )));
        }

        if magic != GZIP_MAGIC {
            return Ok(PreparedBundle::Tar { path: path.to_path_buf(), temp: None });
        }

        let temp = self.decompress(path).await?;
        Ok(PreparedBundle::Tar {
            path: temp.path().to_path_buf(),
            temp: Some(temp),
        })
    }

    /// Decompresses a gzip file into a temp file
    async fn decompress(&self, path: &Path) -> Result<NamedTempFile> {
        let input = tokio::fs::File::open(path).await?;
        let mut decoder = GzipDecoder::new(tokio::io::BufReader::new(input));

        let temp = tempfile::Builder::new()
            .prefix("bundle-")
            .suffix(".tar")
            .tempfile_in(&self.temp_dir)?;
        let mut output = tokio::fs::File::from_std(temp.reopen()?);

        let bytes = tokio::io::copy(&mut decoder, &mut output).await?;
        output.flush().await?;

        debug!("Decompressed {} into {} bytes", path.display(), bytes);

        Ok(temp)
    }

    /// Clones `url` shallowly into a fresh temp directory
    async fn clone_repository(&self, url: &str, reference: Option<&str>) -> Result<TempDir> {
        validate_git_source(url, reference)?;

        let dir = tempfile::Builder::new()
            .prefix("bundle-clone-")
            .tempdir_in(&self.temp_dir)?;

        let mut command = Command::new("git");
        command
            .args(["clone", "--quiet", "--depth", "1"])
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(reference) = reference {
            command.arg("--branch").arg(reference);
        }
        command.arg("--").arg(url).arg(dir.path());

        info!("Cloning {} into {}", url, dir.path().display());

        let output = execute_with_timeout(
            async { command.output().await.map_err(Error::from) },
            self.clone_timeout,
            "git clone",
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ExternalService(format!(
                "git clone of {} failed ({}): {}",
                url,
                output.status,
                stderr.trim()
            )));
        }

        Ok(dir)
    }
}

/// Rejects unsupported URL schemes and option-like arguments
pub fn validate_git_source(url: &str, reference: Option<&str>) -> Result<()> {
    if url.starts_with('-') || !GIT_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(Error::InvalidArgument(format!("unsupported repository URL scheme: {}", url)));
    }
    if let Some(reference) = reference {
        if reference.is_empty() || reference.starts_with('-') {
            return Err(Error::InvalidArgument(format!("invalid repository reference: '{}'", reference)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use async_compression::tokio::write::GzipEncoder;

    fn tar_with(path: &str, content: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_validate_git_source() {
        assert!(validate_git_source("https://example.com/acme/cat.git", None).is_ok());
        assert!(validate_git_source("git@example.com:acme/cat.git", Some("v1")).is_ok());
        assert!(validate_git_source("file:///srv/repos/cat", None).is_ok());

        assert!(validate_git_source("ftp://example.com/cat.git", None).is_err());
        assert!(validate_git_source("/srv/repos/cat", None).is_err());
        assert!(validate_git_source("--upload-pack=touch /tmp/x", None).is_err());
        assert!(validate_git_source("https://example.com/cat.git", Some("-b")).is_err());
    }

    #[tokio::test]
    async fn test_plain_tar_is_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.tar");
        std::fs::write(&archive, tar_with("foo/1/model.bin", "x")).unwrap();

        let fetcher = SourceFetcher::with_temp_dir(dir.path().join("tmp"), Duration::from_secs(5)).unwrap();
        match fetcher.prepare(&BundleSource::Archive(archive.clone())).await.unwrap() {
            PreparedBundle::Tar { path, temp } => {
                assert_eq!(path, archive);
                assert!(temp.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gzip_is_decompressed_and_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_with("foo/1/model.bin", "weights");

        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(&tar).await.unwrap();
        encoder.shutdown().await.unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        std::fs::write(&archive, encoder.into_inner()).unwrap();

        let fetcher = SourceFetcher::with_temp_dir(dir.path().join("tmp"), Duration::from_secs(5)).unwrap();
        let prepared = fetcher.prepare(&BundleSource::Archive(archive)).await.unwrap();
        let temp_path = match &prepared {
            PreparedBundle::Tar { path, temp } => {
                assert!(temp.is_some());
                assert_eq!(std::fs::read(path).unwrap(), tar);
                path.clone()
            }
            other => panic!("unexpected {:?}", other),
        };

        drop(prepared);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_zip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        let mut file = std::fs::File::create(&archive).unwrap();
        file.write_all(b"PK\x03\x04rest").unwrap();

        let fetcher = SourceFetcher::with_temp_dir(dir.path().join("tmp"), Duration::from_secs(5)).unwrap();
        let err = fetcher.prepare(&BundleSource::Archive(archive)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_unsupported_git_scheme_is_rejected_before_cloning() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = SourceFetcher::with_temp_dir(dir.path().join("tmp"), Duration::from_secs(5)).unwrap();
        let source = BundleSource::Git { url: "svn://example.com/cat".to_string(), reference: None };

        let err = fetcher.prepare(&source).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }
}
