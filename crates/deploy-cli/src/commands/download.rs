use super::Context;
use anyhow::Result;
use deploy_orchestration::images::{parse_compose_images, DownloadOptions};
use deploy_orchestration::{DeployError, DesiredState, ImageRef, Reconciler};
use std::path::PathBuf;

pub struct Args {
    pub images: Vec<String>,
    pub compose_file: Option<PathBuf>,
    pub output: PathBuf,
    pub workers: usize,
    pub write_manifest: bool,
}

pub async fn run(ctx: &Context, args: Args) -> Result<u8> {
    let desired = match ctx.desired(None) {
        Ok(desired) => desired,
        Err(e) => return ctx.fail("download", &e),
    };
    let images = match select_images(&args, &desired).await {
        Ok(images) => images,
        Err(e) => return ctx.fail("download", &e),
    };

    let options = DownloadOptions {
        output_dir: args.output,
        workers: args.workers,
        write_manifest: args.write_manifest,
        timeout: desired.timeouts.image_load,
    };
    let reconciler = Reconciler::detect().await;
    let report = match reconciler.downloader().download(&images, &options).await {
        Ok(report) => report,
        Err(e) => return ctx.fail("download", &e),
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }
    Ok(if report.success() { 0 } else { 1 })
}

/// Images to archive: an explicit list, a compose file's images, or the configured set
async fn select_images(
    args: &Args,
    desired: &DesiredState,
) -> std::result::Result<Vec<ImageRef>, DeployError> {
    let invalid = |reason: String| DeployError::InvalidConfiguration { reason };

    if !args.images.is_empty() {
        return args
            .images
            .iter()
            .map(|image| image.parse::<ImageRef>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(invalid);
    }

    if let Some(path) = &args.compose_file {
        let content = match smol::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DeployError::MissingPrerequisite {
                    images: Vec::new(),
                    paths: vec![path.clone()],
                    remedy: "pass an existing compose file with --compose-file".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let images = parse_compose_images(&content).map_err(invalid)?;
        if images.is_empty() {
            return Err(invalid(format!(
                "{} references no concrete images",
                path.display()
            )));
        }
        return Ok(images);
    }

    Ok(desired.required_images.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args() -> Args {
        Args {
            images: Vec::new(),
            compose_file: None,
            output: PathBuf::from("offline_images"),
            workers: 3,
            write_manifest: true,
        }
    }

    fn desired() -> DesiredState {
        deploy_config::resolve(&Default::default()).unwrap()
    }

    #[test]
    fn test_configured_images_by_default() {
        let images = smol::block_on(select_images(&args(), &desired())).unwrap();
        assert_eq!(images, desired().required_images);
    }

    #[test]
    fn test_explicit_images() {
        let args = Args {
            images: vec!["postgres:15".to_string(), "nginx".to_string()],
            ..args()
        };
        let images = smol::block_on(select_images(&args, &desired())).unwrap();
        assert_eq!(images, vec![ImageRef::new("postgres", "15"), ImageRef::new("nginx", "latest")]);
    }

    #[test]
    fn test_compose_file_images() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "services:\n  confluence:\n    image: haxqer/confluence:8.5.23\n  mysql:\n    image: mysql:8.0\n"
        )
        .unwrap();
        let args = Args {
            compose_file: Some(file.path().to_path_buf()),
            ..args()
        };
        let images = smol::block_on(select_images(&args, &desired())).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], ImageRef::new("haxqer/confluence", "8.5.23"));
    }

    #[test]
    fn test_missing_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            compose_file: Some(dir.path().join("docker-compose.yml")),
            ..args()
        };
        let err = smol::block_on(select_images(&args, &desired())).unwrap_err();
        assert_eq!(err.category(), "missing-prerequisite");
    }
}
