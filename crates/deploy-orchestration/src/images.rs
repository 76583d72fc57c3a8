//! Offline image archives: download on a networked host, import on the air-gapped one.
//!
//! Archives are named after the image (`haxqer/confluence:9.2.1` is saved as
//! `haxqer_confluence-9.2.1.tar`) and listed in an `images_manifest.json`
//! next to them so the importer can map files back to image names.

use chrono::Local;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::collaborators::{with_timeout, CollaboratorError, ContainerRuntime};
use crate::model::ImageRef;
use crate::{DeployError, Result};

/// Manifest file written next to the archives
pub const MANIFEST_FILE: &str = "images_manifest.json";

/// Default archive directory
pub const DEFAULT_IMAGES_DIR: &str = "offline_images";

/// Default concurrent downloads
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 3;

/// Application versions the offline bundle is built for
pub const SUPPORTED_APP_VERSIONS: &[&str] = &["9.2.1", "8.5.23"];

/// Application image repository
pub const APP_REPOSITORY: &str = "haxqer/confluence";

/// An archive selected for import
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageArchive {
    /// Archive path
    pub path: PathBuf,
    /// Image the archive holds, when it can be determined before loading
    pub image: Option<ImageRef>,
    /// Archive size
    pub size_bytes: u64,
}

/// An archive that cannot be imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedArchive {
    /// Archive path
    pub path: PathBuf,
    /// Why it was rejected
    pub reason: String,
}

/// One manifest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Image name (`repository:tag`)
    pub name: String,
    /// Archive file name relative to the manifest
    pub file: String,
    /// Archive size
    pub size_bytes: u64,
}

/// Index of the archives in an image directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Local time the manifest was written (`%Y-%m-%d %H:%M:%S`)
    pub generated_at: String,
    /// Number of entries
    pub total_images: usize,
    /// Entries
    pub images: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest stamped with the current local time
    pub fn new(images: Vec<ManifestEntry>) -> Self {
        Self {
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            total_images: images.len(),
            images,
        }
    }

    /// Image recorded for an archive file name
    pub fn image_for(&self, file_name: &str) -> Option<ImageRef> {
        self.images
            .iter()
            .find(|entry| entry.file == file_name)
            .and_then(|entry| entry.name.parse().ok())
    }

    /// Read `images_manifest.json` from `dir`
    ///
    /// A missing manifest is `None`; an unreadable one is logged and ignored.
    pub async fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = match async_fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring malformed manifest {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Write the manifest into `dir`, returning its path
    pub async fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        async_fs::write(&path, json).await?;
        Ok(path)
    }
}

/// Differences between a manifest and the archives on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestCheck {
    /// Files listed in the manifest but absent
    pub missing: Vec<String>,
    /// Archives on disk the manifest does not list
    pub unlisted: Vec<String>,
}

impl ManifestCheck {
    /// Whether the manifest and the directory agree
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.unlisted.is_empty()
    }
}

/// Compare a manifest against archive paths
pub fn verify_manifest(manifest: &Manifest, archives: &[PathBuf]) -> ManifestCheck {
    let on_disk: BTreeSet<String> = archives.iter().filter_map(|p| file_name(p)).collect();
    let listed: BTreeSet<String> = manifest.images.iter().map(|e| e.file.clone()).collect();

    ManifestCheck {
        missing: listed.difference(&on_disk).cloned().collect(),
        unlisted: on_disk.difference(&listed).cloned().collect(),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

/// Sorted `*.tar` files in `dir`
pub async fn discover_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DeployError::MissingPrerequisite {
                images: Vec::new(),
                paths: vec![dir.to_path_buf()],
                remedy: format!(
                    "copy the offline image bundle to {} or pass the archives with --files",
                    dir.display()
                ),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let mut archives = Vec::new();
    while let Some(entry) = entries.next().await {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tar") {
            archives.push(path);
        }
    }
    archives.sort();
    debug!("Found {} archive(s) in {}", archives.len(), dir.display());
    Ok(archives)
}

/// Resolve image names and sizes, rejecting archives that cannot be loaded
pub async fn inspect_archives(
    paths: &[PathBuf],
    manifest: Option<&Manifest>,
) -> (Vec<ImageArchive>, Vec<RejectedArchive>) {
    let mut archives = Vec::new();
    let mut rejected = Vec::new();

    for path in paths {
        let size_bytes = match async_fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                rejected.push(RejectedArchive {
                    path: path.clone(),
                    reason: "not a regular file".to_string(),
                });
                continue;
            }
            Err(e) => {
                rejected.push(RejectedArchive {
                    path: path.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if size_bytes == 0 {
            rejected.push(RejectedArchive {
                path: path.clone(),
                reason: "archive is empty".to_string(),
            });
            continue;
        }

        let name = file_name(path).unwrap_or_default();
        let image = manifest.and_then(|m| m.image_for(&name)).or_else(|| {
            path.file_stem()
                .and_then(|stem| ImageRef::from_archive_stem(&stem.to_string_lossy()))
        });
        if image.is_none() {
            debug!("Image name of {} is unknown until it is loaded", name);
        }

        archives.push(ImageArchive {
            path: path.clone(),
            image,
            size_bytes,
        });
    }

    (archives, rejected)
}

/// Images referenced by the `services.*.image` keys of a compose file
///
/// Images whose reference still contains a `${...}` placeholder are skipped.
pub fn parse_compose_images(content: &str) -> std::result::Result<Vec<ImageRef>, String> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| format!("invalid compose file: {e}"))?;

    let Some(services) = doc.get("services").and_then(|s| s.as_mapping()) else {
        return Ok(Vec::new());
    };

    let mut images = Vec::new();
    for (service, config) in services {
        let Some(image) = config.get("image").and_then(|i| i.as_str()) else {
            continue;
        };
        if image.contains('$') {
            warn!("Skipping templated image '{}' of service {:?}", image, service);
            continue;
        }
        let image: ImageRef = image.parse()?;
        if !images.contains(&image) {
            images.push(image);
        }
    }
    Ok(images)
}

/// Image set for a backend and application version
pub fn catalogue(
    backend: crate::model::DatabaseBackend,
    app_version: &str,
) -> std::result::Result<Vec<ImageRef>, String> {
    if !SUPPORTED_APP_VERSIONS.contains(&app_version) {
        return Err(format!(
            "unsupported application version '{app_version}' (expected one of {})",
            SUPPORTED_APP_VERSIONS.join(", ")
        ));
    }
    Ok(vec![
        ImageRef::new(APP_REPOSITORY, app_version),
        backend.default_image(),
    ])
}

/// How an image ended up archived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    /// Pulled (if needed) and saved in this run
    Saved,
    /// The archive already existed
    AlreadyArchived,
}

/// An image archived successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedImage {
    /// Image
    pub image: ImageRef,
    /// Archive path
    pub file: PathBuf,
    /// Archive size
    pub size_bytes: u64,
    /// Whether it was saved in this run
    pub status: SaveStatus,
}

/// An image that could not be archived
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedImage {
    /// Image
    pub image: ImageRef,
    /// Failure detail
    pub reason: String,
}

/// Result of a download run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    /// Archived images in request order
    pub saved: Vec<SavedImage>,
    /// Failures in request order
    pub failed: Vec<FailedImage>,
    /// Manifest written, if any
    pub manifest: Option<PathBuf>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl DownloadReport {
    /// Whether every image was archived
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Human readable summary
    pub fn summary(&self) -> String {
        let total_bytes: u64 = self.saved.iter().map(|s| s.size_bytes).sum();
        let mut out = format!(
            "Archived {} of {} image(s), {:.1} MB in {:.1}s",
            self.saved.len(),
            self.saved.len() + self.failed.len(),
            total_bytes as f64 / (1024.0 * 1024.0),
            self.duration_ms as f64 / 1000.0
        );
        for failed in &self.failed {
            out.push_str(&format!("\n  ✗ {}: {}", failed.image, failed.reason));
        }
        if let Some(manifest) = &self.manifest {
            out.push_str(&format!("\nManifest: {}", manifest.display()));
        }
        out
    }
}

/// Options for [`ImageDownloader::download`]
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Directory receiving the archives
    pub output_dir: PathBuf,
    /// Concurrent pull/save workers
    pub workers: usize,
    /// Write `images_manifest.json`
    pub write_manifest: bool,
    /// Upper bound for one pull or save
    pub timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            workers: DEFAULT_DOWNLOAD_WORKERS,
            write_manifest: true,
            timeout: Duration::from_secs(600),
        }
    }
}

/// Pulls images and saves them as archives
pub struct ImageDownloader {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageDownloader {
    /// Create a downloader
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Archive every image into `options.output_dir`
    pub async fn download(
        &self,
        images: &[ImageRef],
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        let start = Instant::now();

        let present = self.runtime.list_images().await.map_err(|e| {
            DeployError::CollaboratorUnavailable {
                collaborator: "container runtime".to_string(),
                reason: e.to_string(),
            }
        })?;
        async_fs::create_dir_all(&options.output_dir).await?;

        info!(
            "Archiving {} image(s) into {} with {} worker(s)",
            images.len(),
            options.output_dir.display(),
            options.workers.max(1)
        );

        let mut outcomes: Vec<(usize, std::result::Result<SavedImage, FailedImage>)> =
            stream::iter(images.iter().enumerate())
                .map(|(index, image)| {
                    let present = &present;
                    async move { (index, self.archive_one(image, present, options).await) }
                })
                .buffer_unordered(options.workers.max(1))
                .collect()
                .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut report = DownloadReport::default();
        for (_, outcome) in outcomes {
            match outcome {
                Ok(saved) => report.saved.push(saved),
                Err(failed) => report.failed.push(failed),
            }
        }

        if options.write_manifest && !report.saved.is_empty() {
            let entries = report
                .saved
                .iter()
                .map(|s| ManifestEntry {
                    name: s.image.to_string(),
                    file: s.image.archive_file_name(),
                    size_bytes: s.size_bytes,
                })
                .collect();
            let path = Manifest::new(entries).save(&options.output_dir).await?;
            info!("Wrote manifest {}", path.display());
            report.manifest = Some(path);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn archive_one(
        &self,
        image: &ImageRef,
        present: &BTreeSet<ImageRef>,
        options: &DownloadOptions,
    ) -> std::result::Result<SavedImage, FailedImage> {
        let file = options.output_dir.join(image.archive_file_name());
        let fail = |reason: String| {
            error!("Failed to archive {}: {}", image, reason);
            FailedImage {
                image: image.clone(),
                reason,
            }
        };

        if let Ok(meta) = async_fs::metadata(&file).await {
            if meta.len() > 0 {
                info!("Archive {} already exists, skipping", file.display());
                return Ok(SavedImage {
                    image: image.clone(),
                    file,
                    size_bytes: meta.len(),
                    status: SaveStatus::AlreadyArchived,
                });
            }
        }

        if present.contains(image) {
            debug!("{} is present locally, skipping pull", image);
        } else {
            with_timeout(options.timeout, self.runtime.pull_image(image))
                .await
                .map_err(|e| fail(e.to_string()))?;
        }

        if let Err(e) = with_timeout(options.timeout, self.runtime.save_image(image, &file)).await
        {
            remove_partial(&file).await;
            return Err(fail(e.to_string()));
        }

        let size_bytes = match async_fs::metadata(&file).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            Ok(_) | Err(_) => {
                remove_partial(&file).await;
                return Err(fail(
                    CollaboratorError::CommandFailed {
                        command: format!("docker save {image}"),
                        detail: "no archive was written".to_string(),
                    }
                    .to_string(),
                ));
            }
        };

        info!("Saved {} ({} bytes)", file.display(), size_bytes);
        Ok(SavedImage {
            image: image.clone(),
            file,
            size_bytes,
            status: SaveStatus::Saved,
        })
    }
}

async fn remove_partial(file: &Path) {
    match async_fs::remove_file(file).await {
        Ok(()) => debug!("Removed partial archive {}", file.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial archive {}: {}", file.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseBackend;
    use crate::testing::FakeRuntime;

    fn entry(name: &str) -> ManifestEntry {
        let image: ImageRef = name.parse().unwrap();
        ManifestEntry {
            name: name.to_string(),
            file: image.archive_file_name(),
            size_bytes: 10,
        }
    }

    #[test]
    fn test_catalogue() {
        let images = catalogue(DatabaseBackend::Postgresql, "8.5.23").unwrap();
        assert_eq!(
            images,
            vec![
                ImageRef::new("haxqer/confluence", "8.5.23"),
                ImageRef::new("postgres", "15")
            ]
        );
        assert!(catalogue(DatabaseBackend::Mysql, "7.0").is_err());
    }

    #[test]
    fn test_parse_compose_images() {
        let compose = r#"
services:
  confluence:
    image: haxqer/confluence:9.2.1
    ports: ["8090:8090"]
  mysql:
    image: mysql:8.0
  proxy:
    build: .
  templated:
    image: haxqer/confluence:${APP_VERSION}
"#;
        let images = parse_compose_images(compose).unwrap();
        assert_eq!(
            images,
            vec![
                ImageRef::new("haxqer/confluence", "9.2.1"),
                ImageRef::new("mysql", "8.0")
            ]
        );
        assert!(parse_compose_images("services: [").is_err());
        assert!(parse_compose_images("version: '3'").unwrap().is_empty());
    }

    #[test]
    fn test_verify_manifest() {
        let manifest = Manifest::new(vec![entry("mysql:8.0"), entry("haxqer/confluence:9.2.1")]);
        let on_disk = vec![
            PathBuf::from("/bundle/haxqer_confluence-9.2.1.tar"),
            PathBuf::from("/bundle/extra.tar"),
        ];

        let check = verify_manifest(&manifest, &on_disk);
        assert_eq!(check.missing, vec!["mysql-8.0.tar".to_string()]);
        assert_eq!(check.unlisted, vec!["extra.tar".to_string()]);
        assert!(!check.is_consistent());
        assert_eq!(manifest.total_images, 2);
    }

    #[test]
    fn test_discover_and_inspect_archives() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("mysql-8.0.tar"), b"layer").unwrap();
            std::fs::write(dir.path().join("haxqer_confluence-9.2.1.tar"), b"layer").unwrap();
            std::fs::write(dir.path().join("broken.tar"), b"").unwrap();
            std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

            let paths = discover_archives(dir.path()).await.unwrap();
            assert_eq!(paths.len(), 3);

            let manifest = Manifest::new(vec![entry("mysql:8.0")]);
            let (archives, rejected) = inspect_archives(&paths, Some(&manifest)).await;

            assert_eq!(rejected.len(), 1);
            assert!(rejected[0].path.ends_with("broken.tar"));
            assert_eq!(rejected[0].reason, "archive is empty");

            let images: Vec<Option<String>> = archives
                .iter()
                .map(|a| a.image.as_ref().map(ToString::to_string))
                .collect();
            assert_eq!(
                images,
                vec![
                    Some("haxqer/confluence:9.2.1".to_string()),
                    Some("mysql:8.0".to_string())
                ]
            );

            // Without a manifest the unnamespaced archive cannot be named
            let (archives, _) = inspect_archives(&paths, None).await;
            assert!(archives.iter().any(|a| a.image.is_none()));
        });
    }

    #[test]
    fn test_discover_missing_directory() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let missing = dir.path().join("offline_images");
            match discover_archives(&missing).await {
                Err(DeployError::MissingPrerequisite { paths, .. }) => {
                    assert_eq!(paths, vec![missing])
                }
                other => panic!("expected MissingPrerequisite, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_manifest_roundtrip_on_disk() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            assert!(Manifest::load(dir.path()).await.is_none());

            let manifest = Manifest::new(vec![entry("postgres:15")]);
            manifest.save(dir.path()).await.unwrap();
            let loaded = Manifest::load(dir.path()).await.unwrap();
            assert_eq!(loaded, manifest);
            assert_eq!(
                loaded.image_for("postgres-15.tar"),
                Some(ImageRef::new("postgres", "15"))
            );

            std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
            assert!(Manifest::load(dir.path()).await.is_none());
        });
    }

    #[test]
    fn test_download_skips_pull_and_existing_archives() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let runtime = Arc::new(FakeRuntime::new());
            runtime.add_image("mysql:8.0");
            std::fs::write(dir.path().join("postgres-15.tar"), b"existing").unwrap();

            let images: Vec<ImageRef> = vec![
                "haxqer/confluence:9.2.1".parse().unwrap(),
                "mysql:8.0".parse().unwrap(),
                "postgres:15".parse().unwrap(),
            ];
            let options = DownloadOptions {
                output_dir: dir.path().to_path_buf(),
                ..Default::default()
            };

            let report = ImageDownloader::new(runtime.clone())
                .download(&images, &options)
                .await
                .unwrap();

            assert!(report.success());
            assert_eq!(report.saved.len(), 3);
            assert_eq!(report.saved[2].status, SaveStatus::AlreadyArchived);
            assert_eq!(runtime.pulled(), vec![ImageRef::new("haxqer/confluence", "9.2.1")]);
            assert!(dir.path().join("haxqer_confluence-9.2.1.tar").exists());

            let manifest = Manifest::load(dir.path()).await.unwrap();
            assert_eq!(manifest.total_images, 3);
            assert_eq!(
                manifest.image_for("mysql-8.0.tar"),
                Some(ImageRef::new("mysql", "8.0"))
            );
        });
    }

    #[test]
    fn test_download_failure_removes_partial_archive() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let runtime = Arc::new(FakeRuntime::new());
            runtime.fail_save("mysql:8.0");

            let images: Vec<ImageRef> = vec!["mysql:8.0".parse().unwrap()];
            let options = DownloadOptions {
                output_dir: dir.path().to_path_buf(),
                ..Default::default()
            };

            let report = ImageDownloader::new(runtime)
                .download(&images, &options)
                .await
                .unwrap();

            assert!(!report.success());
            assert_eq!(report.failed[0].image, ImageRef::new("mysql", "8.0"));
            assert!(!dir.path().join("mysql-8.0.tar").exists());
            assert!(report.manifest.is_none());
        });
    }
}
