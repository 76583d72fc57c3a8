use super::{execute, Context};
use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use deploy_orchestration::images::{discover_archives, inspect_archives, verify_manifest, Manifest};
use deploy_orchestration::{DeployError, ImageSummary, ImportRequest, Intent, Reconciler};
use std::path::PathBuf;
use tracing::{info, warn};

pub struct Args {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub verify: bool,
    pub force: bool,
    pub cleanup: bool,
    pub list: bool,
}

pub async fn run(ctx: &Context, args: Args) -> Result<u8> {
    if args.list {
        return list(ctx).await;
    }

    let desired = match ctx.desired(None) {
        Ok(desired) => desired,
        Err(e) => return ctx.fail("import", &e),
    };

    let scanned = args.files.is_empty();
    let paths = if scanned {
        match discover_archives(&args.dir).await {
            Ok(paths) => paths,
            Err(e) => return ctx.fail("import", &e),
        }
    } else {
        args.files.clone()
    };
    if paths.is_empty() {
        let err = DeployError::MissingPrerequisite {
            images: Vec::new(),
            paths: vec![args.dir.join("*.tar")],
            remedy: "run `airgap-deploy download` on a networked host and copy the archives here"
                .to_string(),
        };
        return ctx.fail("import", &err);
    }

    let manifest = Manifest::load(&args.dir).await;
    if args.verify && scanned {
        match &manifest {
            Some(manifest) => {
                let check = verify_manifest(manifest, &paths);
                for file in &check.missing {
                    warn!("Archive listed in the manifest is missing: {}", file);
                }
                for file in &check.unlisted {
                    warn!("Archive not listed in the manifest: {}", file);
                }
                if check.is_consistent() {
                    info!("Manifest matches {} archive(s)", paths.len());
                }
            }
            None => warn!(
                "No manifest in {}; archive names are used to identify images",
                args.dir.display()
            ),
        }
    }

    let (archives, rejected) = inspect_archives(&paths, manifest.as_ref()).await;
    for archive in &rejected {
        warn!("Rejected {}: {}", archive.path.display(), archive.reason);
    }

    let request = ImportRequest {
        archives,
        rejected,
        force: args.force,
        prune: args.cleanup,
    };
    execute(ctx, &desired, Intent::Import(request), false).await
}

/// Show the images the container runtime already holds
async fn list(ctx: &Context) -> Result<u8> {
    let reconciler = Reconciler::detect().await;
    let images = match reconciler.image_inventory().await {
        Ok(images) => images,
        Err(e) => return ctx.fail("import", &e),
    };

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&images)?);
    } else if images.is_empty() {
        println!("No images loaded");
    } else {
        println!("{}", image_table(&images));
    }
    Ok(0)
}

fn image_table(images: &[ImageSummary]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Image", "Size", "Created"]);
    for summary in images {
        table.add_row(vec![
            Cell::new(summary.image.to_string()).fg(Color::Cyan),
            Cell::new(&summary.size),
            Cell::new(&summary.created),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_table_lists_every_image() {
        let images = vec![
            ImageSummary {
                image: "mysql:8.0".parse().unwrap(),
                size: "573MB".to_string(),
                created: "2024-05-02 10:11:12 +0000 UTC".to_string(),
            },
            ImageSummary {
                image: "haxqer/confluence:9.2.1".parse().unwrap(),
                size: "1.1GB".to_string(),
                created: "2024-06-01 08:00:00 +0000 UTC".to_string(),
            },
        ];

        let rendered = image_table(&images).to_string();
        assert!(rendered.contains("mysql:8.0"));
        assert!(rendered.contains("573MB"));
        assert!(rendered.contains("haxqer/confluence:9.2.1"));
        assert!(rendered.contains("2024-06-01 08:00:00 +0000 UTC"));
    }
}
