//! Action planning: a pure diff of desired against observed state.
//!
//! [`plan`] never touches the host. The same inputs always produce the same
//! plan, and a host that already matches the desired state produces an
//! empty one.

use std::path::PathBuf;
use tracing::debug;

use crate::env_file::EnvFile;
use crate::model::{DesiredState, ImageRef, ObservedState};
use crate::plan::{Action, ImportRequest, Intent, Plan, PlanNote, StopRequest};
use crate::{DeployError, Result};

/// Build the ordered action list that moves `observed` towards `desired` for `intent`
pub fn plan(desired: &DesiredState, observed: &ObservedState, intent: &Intent) -> Result<Plan> {
    desired
        .validate()
        .map_err(|reason| DeployError::InvalidConfiguration { reason })?;

    let mut plan = Plan::new(intent);
    plan.watched_containers = desired.containers.all();

    match intent {
        Intent::Configure => plan_configure(desired, observed, &mut plan),
        Intent::Start => plan_start(desired, observed, &mut plan)?,
        Intent::Stop(request) => plan_stop(desired, observed, request, &mut plan)?,
        Intent::Install => plan_install(desired, observed, &mut plan)?,
        Intent::Import(request) => plan_import(observed, request, &mut plan)?,
        Intent::StatusOnly => {}
    }

    debug!(
        "Planned {} action(s) for {}: [{}]",
        plan.actions.len(),
        plan.intent,
        plan.actions
            .iter()
            .map(Action::describe)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(plan)
}

/// Missing install root and data directories, parents before children
fn directory_actions(desired: &DesiredState, observed: &ObservedState) -> Vec<Action> {
    let mut missing: Vec<PathBuf> = std::iter::once(&desired.install_root)
        .chain(desired.data_dirs.iter())
        .filter(|path| !observed.path_exists(path))
        .cloned()
        .collect();
    missing.sort_by(|a, b| {
        a.components()
            .count()
            .cmp(&b.components().count())
            .then_with(|| a.cmp(b))
    });
    missing.dedup();

    missing
        .into_iter()
        .map(|path| Action::EnsureDirectory {
            path,
            mode: desired.dir_mode,
        })
        .collect()
}

/// Permission bits of the env file, which may hold credentials
const ENV_FILE_MODE: u32 = 0o600;

fn env_file_action(desired: &DesiredState) -> Action {
    Action::WriteFile {
        path: desired.env_file.clone(),
        content: EnvFile::render(&desired.env_overrides),
        mode: ENV_FILE_MODE,
    }
}

fn env_file_current(desired: &DesiredState, observed: &ObservedState) -> bool {
    EnvFile::matches(observed.env_file_content.as_deref(), &desired.env_overrides)
}

fn plan_configure(desired: &DesiredState, observed: &ObservedState, plan: &mut Plan) {
    plan.actions.extend(directory_actions(desired, observed));
    if !env_file_current(desired, observed) {
        plan.actions.push(env_file_action(desired));
    }
}

fn plan_start(desired: &DesiredState, observed: &ObservedState, plan: &mut Plan) -> Result<()> {
    let missing_images: Vec<ImageRef> = desired
        .required_images
        .iter()
        .filter(|image| !observed.present_images.contains(image))
        .cloned()
        .collect();
    let missing_paths: Vec<PathBuf> = if observed.path_exists(&desired.compose_file) {
        Vec::new()
    } else {
        vec![desired.compose_file.clone()]
    };

    if !missing_images.is_empty() || !missing_paths.is_empty() {
        let mut remedies = Vec::new();
        if !missing_images.is_empty() {
            remedies.push(
                "run `airgap-deploy import <dir>` to load the offline image archives before start"
                    .to_string(),
            );
        }
        if !missing_paths.is_empty() {
            remedies.push(format!(
                "copy the bundled compose files into {}",
                desired.source_dir.display()
            ));
        }
        return Err(DeployError::MissingPrerequisite {
            images: missing_images,
            paths: missing_paths,
            remedy: remedies.join("; "),
        });
    }

    plan.actions.extend(directory_actions(desired, observed));

    // No overrides and no file is current: start does not create an empty one
    let env_changed = match observed.env_file_content {
        Some(_) => !env_file_current(desired, observed),
        None => !desired.env_overrides.is_empty(),
    };
    if env_changed {
        plan.actions.push(env_file_action(desired));
    }

    let app_running = observed.running_containers.contains(&desired.containers.app);
    if !app_running && observed.bound_ports.contains(&desired.service_port) {
        plan.notes.push(PlanNote::warning(format!(
            "port {} is already in use by another process; the application may fail to bind it",
            desired.service_port
        )));
    }

    let all_running = plan
        .watched_containers
        .iter()
        .all(|name| observed.running_containers.contains(name));
    // Compose recreates the services whose environment changed
    if !all_running || env_changed {
        plan.actions.push(Action::ComposeUp {
            workload: desired.workload(),
        });
    }
    Ok(())
}

fn plan_stop(
    desired: &DesiredState,
    observed: &ObservedState,
    request: &StopRequest,
    plan: &mut Plan,
) -> Result<()> {
    let any_running = plan
        .watched_containers
        .iter()
        .any(|name| observed.running_containers.contains(name));
    let remove = request.remove_containers || request.remove_volumes;
    let remove_volumes = request.remove_volumes && request.confirmed;

    if request.remove_volumes && !request.confirmed {
        plan.notes.push(PlanNote::degraded(
            "volume removal was requested without confirmation; volumes were kept",
        ));
    }

    let compose_action = if remove {
        Some(Action::ComposeDown {
            workload: desired.workload(),
            remove_volumes,
        })
    } else if any_running {
        Some(Action::ComposeStop {
            workload: desired.workload(),
        })
    } else {
        None
    };

    if let Some(action) = compose_action {
        if !observed.path_exists(&desired.compose_file) {
            return Err(DeployError::MissingPrerequisite {
                images: Vec::new(),
                paths: vec![desired.compose_file.clone()],
                remedy: format!(
                    "restore the compose file in {} so the workload can be stopped",
                    desired.source_dir.display()
                ),
            });
        }
        plan.actions.push(action);
    }

    if request.prune_images {
        plan.actions.push(Action::PruneDanglingImages);
    }
    Ok(())
}

fn plan_install(desired: &DesiredState, observed: &ObservedState, plan: &mut Plan) -> Result<()> {
    let missing_paths: Vec<PathBuf> = [&desired.install_root, &desired.compose_file]
        .into_iter()
        .filter(|path| !observed.path_exists(path))
        .cloned()
        .collect();
    if !missing_paths.is_empty() {
        return Err(DeployError::MissingPrerequisite {
            images: Vec::new(),
            paths: missing_paths,
            remedy: "run `airgap-deploy configure` (or `start`) before install".to_string(),
        });
    }

    if !observed.service_unit_registered || !observed.service_unit_current {
        if observed.service_unit_registered {
            debug!("Unit {} differs from the desired one, re-registering", desired.unit.name);
        }
        plan.actions.push(Action::RegisterService {
            unit: desired.unit.clone(),
        });
    }
    if !observed.service_unit_enabled {
        plan.actions.push(Action::SetServiceEnabled {
            unit_name: desired.unit.name.clone(),
            enabled: true,
        });
    }
    Ok(())
}

fn plan_import(observed: &ObservedState, request: &ImportRequest, plan: &mut Plan) -> Result<()> {
    if request.archives.is_empty() && request.rejected.is_empty() {
        return Err(DeployError::MissingPrerequisite {
            images: Vec::new(),
            paths: Vec::new(),
            remedy: "copy the *.tar image archives from the download host first".to_string(),
        });
    }

    for rejected in &request.rejected {
        plan.notes.push(PlanNote::degraded(format!(
            "skipped {}: {}",
            rejected.path.display(),
            rejected.reason
        )));
    }

    for archive in &request.archives {
        let already_present = archive
            .image
            .as_ref()
            .is_some_and(|image| observed.present_images.contains(image));
        if already_present && !request.force {
            debug!("Skipping {}: image already present", archive.path.display());
            continue;
        }
        plan.actions.push(Action::LoadImage {
            archive: archive.path.clone(),
            image: archive.image.clone(),
        });
    }

    if request.prune {
        plan.actions.push(Action::PruneDanglingImages);
    }
    Ok(())
}
