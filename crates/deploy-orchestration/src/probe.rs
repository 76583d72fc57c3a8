//! Read-only observation of the host.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collaborators::{
    with_timeout, CollaboratorError, ContainerRuntime, Filesystem, PortProbe, ServiceManager,
};
use crate::model::{DesiredState, ObservedState};
use crate::{DeployError, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds an [`ObservedState`] without changing anything on the host
#[derive(Clone)]
pub struct InventoryProbe {
    runtime: Arc<dyn ContainerRuntime>,
    service_manager: Arc<dyn ServiceManager>,
    fs: Arc<dyn Filesystem>,
    ports: Arc<dyn PortProbe>,
}

fn runtime_unavailable(e: CollaboratorError) -> DeployError {
    DeployError::CollaboratorUnavailable {
        collaborator: "container runtime".to_string(),
        reason: e.to_string(),
    }
}

impl InventoryProbe {
    /// Create a probe over the given collaborators
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        service_manager: Arc<dyn ServiceManager>,
        fs: Arc<dyn Filesystem>,
        ports: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            runtime,
            service_manager,
            fs,
            ports,
        }
    }

    /// Observe the host
    ///
    /// Fails with `CollaboratorUnavailable` when the container runtime cannot
    /// be reached. An unreachable service manager is reported as "not
    /// registered" so hosts without systemd can still start the workload.
    pub async fn probe(&self, desired: &DesiredState) -> Result<ObservedState> {
        let runtime_version = with_timeout(PROBE_TIMEOUT, self.runtime.version())
            .await
            .map_err(runtime_unavailable)?;
        debug!("Container runtime version {}", runtime_version);

        let present_images = with_timeout(PROBE_TIMEOUT, self.runtime.list_images())
            .await
            .map_err(runtime_unavailable)?;
        let running_containers =
            with_timeout(PROBE_TIMEOUT, self.runtime.list_running_containers())
                .await
                .map_err(runtime_unavailable)?;

        let mut bound_ports = BTreeSet::new();
        for port in [desired.service_port, desired.database_port] {
            if self.ports.is_bound(port).await {
                bound_ports.insert(port);
            }
        }

        let unit = match with_timeout(
            PROBE_TIMEOUT,
            self.service_manager.status(&desired.unit.name),
        )
        .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!("Service manager unavailable, assuming unit is not installed: {}", e);
                Default::default()
            }
        };

        let service_unit_current = if unit.registered {
            match with_timeout(PROBE_TIMEOUT, self.service_manager.is_current(&desired.unit)).await
            {
                Ok(current) => current,
                Err(e) => {
                    warn!("Could not compare the installed unit, keeping it: {}", e);
                    true
                }
            }
        } else {
            false
        };

        let mut existing_paths = BTreeSet::new();
        for path in desired.tracked_paths() {
            if self.fs.exists(&path).await {
                existing_paths.insert(path);
            }
        }

        let env_file_content = match self.fs.read_to_string(&desired.env_file).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", desired.env_file.display(), e);
                None
            }
        };

        let observed = ObservedState {
            present_images,
            running_containers,
            bound_ports,
            service_unit_registered: unit.registered,
            service_unit_enabled: unit.enabled,
            service_unit_current,
            existing_paths,
            env_file_content,
            runtime_version: Some(runtime_version),
        };

        info!(
            "Observed {} image(s), {} running container(s), unit registered: {}",
            observed.present_images.len(),
            observed.running_containers.len(),
            observed.service_unit_registered
        );
        Ok(observed)
    }
}
