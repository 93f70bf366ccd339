//! URI-addressable byte sources
//!
//! Resolves a source URI (local path, glob pattern, or `s3://` / `gs://` /
//! `az://` object-store location) into an ordered list of file openers.
//! Listing never returns contents; opening streams bytes, spooling remote
//! objects to a temporary file so downstream extraction reads a plain
//! `Read` with constant memory.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use evload_common::{checksum, EtlError};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::ObjectStore;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Characters that make a local path segment a glob pattern
const GLOB_CHARS: &[char] = &['*', '?', '['];

/// A resolved source of input files
#[derive(Debug)]
pub struct FileSource {
    uri: String,
    kind: SourceKind,
}

#[derive(Debug)]
enum SourceKind {
    LocalPath(PathBuf),
    LocalGlob(String),
    Remote {
        store: Arc<dyn ObjectStore>,
        prefix: object_store::path::Path,
        pattern: Option<glob::Pattern>,
    },
}

/// An opener for one input file. Contents are only read through
/// [`SourceFile::open`], [`SourceFile::sha256`], or [`SourceFile::read_bytes`].
#[derive(Clone, Debug)]
pub struct SourceFile {
    /// Display URI (local path or `scheme://...` object key)
    pub uri: String,
    /// Base name, used for quarantine destinations and the history journal
    pub name: String,
    location: Location,
}

#[derive(Clone, Debug)]
enum Location {
    Local(PathBuf),
    Remote {
        store: Arc<dyn ObjectStore>,
        path: object_store::path::Path,
    },
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Build an object store for a cloud URI, taking credentials from the
/// environment the way the SDKs do.
fn build_store(url: &Url) -> Result<Arc<dyn ObjectStore>, EtlError> {
    let uri = url.as_str();
    let store: Arc<dyn ObjectStore> = match url.scheme() {
        "s3" => Arc::new(
            AmazonS3Builder::from_env()
                .with_url(uri)
                .build()
                .map_err(|e| EtlError::source_unavailable(uri, e.to_string()))?,
        ),
        "gs" => Arc::new(
            GoogleCloudStorageBuilder::from_env()
                .with_url(uri)
                .build()
                .map_err(|e| EtlError::source_unavailable(uri, e.to_string()))?,
        ),
        "az" | "azure" | "abfs" => Arc::new(
            MicrosoftAzureBuilder::from_env()
                .with_url(uri)
                .build()
                .map_err(|e| EtlError::source_unavailable(uri, e.to_string()))?,
        ),
        other => {
            return Err(EtlError::source_unavailable(
                uri,
                format!("unsupported URI scheme '{}'", other),
            ))
        }
    };
    Ok(store)
}

impl FileSource {
    /// Parse a source URI into a listable source. No I/O happens here.
    pub fn parse(uri: &str) -> Result<Self, EtlError> {
        if uri.is_empty() {
            return Err(EtlError::config(
                "source_uri is empty",
                "provide a path, glob, or object-store URI",
            ));
        }

        let kind = if uri.contains("://") {
            let url = Url::parse(uri)
                .map_err(|e| EtlError::source_unavailable(uri, e.to_string()))?;
            if url.scheme() == "file" {
                let path = url
                    .to_file_path()
                    .map_err(|_| EtlError::source_unavailable(uri, "invalid file URL"))?;
                SourceKind::LocalPath(path)
            } else {
                let store = build_store(&url)?;
                let raw_path = url.path().trim_matches('/');
                // A glob in the final segment filters listed object names
                let (prefix, pattern) = match basename(raw_path) {
                    last if last.contains(GLOB_CHARS) => {
                        let parent = raw_path
                            .strip_suffix(last.as_str())
                            .unwrap_or("")
                            .trim_matches('/');
                        let pattern = glob::Pattern::new(&last).map_err(|e| {
                            EtlError::source_unavailable(uri, e.to_string())
                        })?;
                        (object_store::path::Path::from(parent), Some(pattern))
                    }
                    _ => (object_store::path::Path::from(raw_path), None),
                };
                SourceKind::Remote {
                    store,
                    prefix,
                    pattern,
                }
            }
        } else if uri.contains(GLOB_CHARS) {
            SourceKind::LocalGlob(uri.to_string())
        } else {
            SourceKind::LocalPath(PathBuf::from(uri))
        };

        Ok(Self {
            uri: uri.to_string(),
            kind,
        })
    }

    /// Resolve the URI into an ordered list of file openers.
    /// Any listing failure is `SourceUnavailable`, fatal for the run.
    pub async fn list(&self) -> Result<Vec<SourceFile>, EtlError> {
        match &self.kind {
            SourceKind::LocalPath(path) => {
                if path.is_dir() {
                    let mut files = Vec::new();
                    let entries = std::fs::read_dir(path).map_err(|e| {
                        EtlError::source_unavailable(&self.uri, e.to_string())
                    })?;
                    for entry in entries {
                        let entry = entry.map_err(|e| {
                            EtlError::source_unavailable(&self.uri, e.to_string())
                        })?;
                        if entry.path().is_file() {
                            files.push(SourceFile::local(entry.path()));
                        }
                    }
                    files.sort_by(|a, b| a.uri.cmp(&b.uri));
                    Ok(files)
                } else if path.is_file() {
                    Ok(vec![SourceFile::local(path.clone())])
                } else {
                    Err(EtlError::source_unavailable(
                        &self.uri,
                        "path does not exist",
                    ))
                }
            }
            SourceKind::LocalGlob(pattern) => {
                let paths = glob::glob(pattern)
                    .map_err(|e| EtlError::source_unavailable(&self.uri, e.to_string()))?;
                let mut files = Vec::new();
                for path in paths {
                    let path = path.map_err(|e| {
                        EtlError::source_unavailable(&self.uri, e.to_string())
                    })?;
                    if path.is_file() {
                        files.push(SourceFile::local(path));
                    }
                }
                files.sort_by(|a, b| a.uri.cmp(&b.uri));
                Ok(files)
            }
            SourceKind::Remote {
                store,
                prefix,
                pattern,
            } => {
                let mut listing = store.list(Some(prefix));
                let mut files = Vec::new();
                while let Some(meta) = listing.next().await {
                    let meta = meta.map_err(|e| {
                        EtlError::source_unavailable(&self.uri, e.to_string())
                    })?;
                    let name = basename(meta.location.as_ref());
                    if let Some(pattern) = pattern {
                        if !pattern.matches(&name) {
                            continue;
                        }
                    }
                    files.push(SourceFile {
                        uri: format!(
                            "{}://{}",
                            self.uri.split("://").next().unwrap_or("object"),
                            meta.location
                        ),
                        name,
                        location: Location::Remote {
                            store: store.clone(),
                            path: meta.location,
                        },
                    });
                }
                files.sort_by(|a, b| a.uri.cmp(&b.uri));
                Ok(files)
            }
        }
    }
}

impl SourceFile {
    fn local(path: PathBuf) -> Self {
        let uri = path.display().to_string();
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| uri.clone()),
            uri,
            location: Location::Local(path),
        }
    }

    /// Open the file for streaming reads. Remote objects are spooled to an
    /// unnamed temporary file first, so the returned reader is seekable and
    /// memory use stays constant in object size.
    pub async fn open(&self) -> Result<Box<dyn Read + Send>, EtlError> {
        match &self.location {
            Location::Local(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                Ok(Box::new(file))
            }
            Location::Remote { store, path } => {
                let result = store
                    .get(path)
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                let spool = tempfile::tempfile()
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                let mut writer = tokio::fs::File::from_std(spool);
                let mut stream = result.into_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk
                        .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                    writer
                        .write_all(&chunk)
                        .await
                        .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                }
                writer
                    .flush()
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                let mut spool = writer.into_std().await;
                spool
                    .seek(SeekFrom::Start(0))
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                Ok(Box::new(spool))
            }
        }
    }

    /// SHA-256 hex digest of the content, streamed
    pub async fn sha256(&self) -> Result<String, EtlError> {
        match &self.location {
            Location::Local(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || checksum::compute_file_sha256(path))
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?
            }
            Location::Remote { store, path } => {
                let result = store
                    .get(path)
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                let mut hasher = Sha256::new();
                let mut stream = result.into_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk
                        .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                    hasher.update(&chunk);
                }
                Ok(hex::encode(hasher.finalize()))
            }
        }
    }

    /// Whole-file contents, for quarantine copies only
    pub async fn read_bytes(&self) -> Result<Vec<u8>, EtlError> {
        match &self.location {
            Location::Local(path) => {
                std::fs::read(path).map_err(|e| EtlError::file_open(&self.uri, e.to_string()))
            }
            Location::Remote { store, path } => {
                let result = store
                    .get(path)
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

/// Destination for failed files: the file bytes plus a `.meta.json` sidecar
/// describing the failure.
pub struct Quarantine {
    uri: String,
    kind: QuarantineKind,
}

enum QuarantineKind {
    Local(PathBuf),
    Remote {
        store: Arc<dyn ObjectStore>,
        prefix: object_store::path::Path,
    },
}

impl Quarantine {
    pub fn parse(uri: &str) -> Result<Self, EtlError> {
        let kind = if uri.contains("://") {
            let url = Url::parse(uri)
                .map_err(|e| EtlError::source_unavailable(uri, e.to_string()))?;
            if url.scheme() == "file" {
                let path = url
                    .to_file_path()
                    .map_err(|_| EtlError::source_unavailable(uri, "invalid file URL"))?;
                QuarantineKind::Local(path)
            } else {
                let store = build_store(&url)?;
                QuarantineKind::Remote {
                    store,
                    prefix: object_store::path::Path::from(url.path().trim_matches('/')),
                }
            }
        } else {
            QuarantineKind::Local(PathBuf::from(uri))
        };
        Ok(Self {
            uri: uri.to_string(),
            kind,
        })
    }

    /// Copy a failed file under the quarantine URI and write its failure
    /// metadata alongside. Returns the destination of the copied file.
    pub async fn store(
        &self,
        file: &SourceFile,
        file_hash: &str,
        error: &str,
    ) -> Result<String, EtlError> {
        let bytes = file.read_bytes().await?;
        let meta = serde_json::json!({
            "failed_at": Utc::now().to_rfc3339(),
            "source_file": file.uri,
            "file_hash": file_hash,
            "error_message": error,
        });
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        let meta_name = format!("{}.meta.json", file.name);

        match &self.kind {
            QuarantineKind::Local(dir) => {
                std::fs::create_dir_all(dir)?;
                let dest = dir.join(&file.name);
                std::fs::write(&dest, &bytes)?;
                std::fs::write(dir.join(&meta_name), &meta_bytes)?;
                Ok(dest.display().to_string())
            }
            QuarantineKind::Remote { store, prefix } => {
                let dest = prefix.child(file.name.as_str());
                store
                    .put(&dest, bytes.into())
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                store
                    .put(&prefix.child(meta_name.as_str()), meta_bytes.into())
                    .await
                    .map_err(|e| EtlError::file_open(&self.uri, e.to_string()))?;
                Ok(format!("{}/{}", self.uri.trim_end_matches('/'), file.name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_list_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "one.xml", "<a/>");

        let source = FileSource::parse(path.to_str().unwrap()).unwrap();
        let files = source.list().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "one.xml");
    }

    #[tokio::test]
    async fn test_list_directory_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "b.xml", "<b/>");
        write_file(dir.path(), "a.xml", "<a/>");

        let source = FileSource::parse(dir.path().to_str().unwrap()).unwrap();
        let files = source.list().await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.xml", "b.xml"]);
    }

    #[tokio::test]
    async fn test_list_glob_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "batch1.xml", "<a/>");
        write_file(dir.path(), "batch2.xml", "<b/>");
        write_file(dir.path(), "notes.txt", "skip me");

        let pattern = format!("{}/batch*.xml", dir.path().display());
        let source = FileSource::parse(&pattern).unwrap();
        let files = source.list().await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.name.starts_with("batch")));
    }

    #[tokio::test]
    async fn test_missing_path_is_source_unavailable() {
        let source = FileSource::parse("/definitely/not/here.xml").unwrap();
        let err = source.list().await.unwrap_err();
        assert!(matches!(err, EtlError::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_open_and_hash_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "data.xml", "stream me");

        let source = FileSource::parse(path.to_str().unwrap()).unwrap();
        let files = source.list().await.unwrap();

        let mut content = String::new();
        files[0]
            .open()
            .await
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "stream me");

        let expected = checksum::compute_bytes_sha256(b"stream me");
        assert_eq!(files[0].sha256().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_quarantine_writes_file_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = write_file(dir.path(), "bad.xml", "<broken>");
        let quarantine_dir = dir.path().join("quarantine");

        let source = FileSource::parse(source_path.to_str().unwrap()).unwrap();
        let files = source.list().await.unwrap();

        let quarantine = Quarantine::parse(quarantine_dir.to_str().unwrap()).unwrap();
        quarantine
            .store(&files[0], "deadbeef", "simulated failure")
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(quarantine_dir.join("bad.xml")).unwrap(),
            "<broken>"
        );
        let meta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(quarantine_dir.join("bad.xml.meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["file_hash"], "deadbeef");
        assert_eq!(meta["error_message"], "simulated failure");
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let err = FileSource::parse("ftp://example.org/data").unwrap_err();
        assert!(matches!(err, EtlError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_empty_uri_is_config_error() {
        assert!(matches!(
            FileSource::parse(""),
            Err(EtlError::ConfigInvalid { .. })
        ));
    }
}
