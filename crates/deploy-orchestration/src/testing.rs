//! In-memory collaborators and fixtures for tests.
//!
//! Enabled for this crate's own tests and, through the `test-utils` feature,
//! for dependants that want to drive the pipeline without docker or systemd.

use async_trait::async_trait;
use command_executor::{ExitResult, ExitStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collaborators::{
    CollabResult, CollaboratorError, ContainerRuntime, Filesystem, ImageSummary, PortProbe,
    ServiceManager, UnitStatus,
};
use crate::executor::ActionExecutor;
use crate::model::{
    ActionTimeouts, ContainerNames, DatabaseBackend, DesiredState, ImageRef, ObservedState,
    ReadinessPolicies, UnitSpec,
};
use crate::plan::{Action, ComposeWorkload, Plan};
use crate::probe::InventoryProbe;
use crate::readiness::{ReadinessProbe, ReadinessStatus, ReadinessTarget};
use crate::reconciler::Reconciler;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn daemon_down() -> CollaboratorError {
    CollaboratorError::Unreachable {
        collaborator: "container runtime",
        detail: "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".to_string(),
    }
}

/// A MySQL deployment rooted at `root` with compose files in a separate bundle directory
pub fn desired_state(root: &str) -> DesiredState {
    let install_root = PathBuf::from(root);
    let source_dir = PathBuf::from("/srv/confluence-bundle");
    let compose_file = source_dir.join("docker-compose-mysql.yml");
    let backend = DatabaseBackend::Mysql;

    let mut desired = DesiredState {
        database_backend: backend,
        compose_variant: "mysql".to_string(),
        install_root: install_root.clone(),
        source_dir,
        compose_file,
        env_file: install_root.join(".env"),
        data_dirs: [install_root.join("data"), install_root.join("mysql")]
            .into_iter()
            .collect(),
        required_images: vec![
            ImageRef::new("haxqer/confluence", "9.2.1"),
            backend.default_image(),
        ],
        service_port: 8090,
        database_port: backend.default_port(),
        database_user: "confluence".to_string(),
        app_version: "9.2.1".to_string(),
        env_overrides: BTreeMap::new(),
        containers: ContainerNames {
            app: "confluence".to_string(),
            database: backend.default_container().to_string(),
        },
        unit: UnitSpec {
            name: "confluence".to_string(),
            description: "Confluence (docker compose)".to_string(),
            working_dir: install_root,
            workload: ComposeWorkload::default(),
            restart: "on-failure".to_string(),
            timeout_start_secs: 300,
            timeout_stop_secs: 120,
        },
        dir_mode: 0o755,
        readiness: ReadinessPolicies::default(),
        timeouts: ActionTimeouts::default(),
    };
    desired.unit.workload = desired.workload();
    desired
}

/// Host with every prerequisite in place and nothing running
pub fn observed_ready(desired: &DesiredState) -> ObservedState {
    let mut existing_paths = BTreeSet::new();
    existing_paths.insert(desired.install_root.clone());
    existing_paths.extend(desired.data_dirs.iter().cloned());
    existing_paths.insert(desired.compose_file.clone());

    ObservedState {
        present_images: desired.required_images.iter().cloned().collect(),
        existing_paths,
        runtime_version: Some("27.0.3".to_string()),
        ..Default::default()
    }
}

/// The observation a probe would make after `plan` ran successfully
pub fn apply_plan(desired: &DesiredState, observed: &ObservedState, plan: &Plan) -> ObservedState {
    let mut after = observed.clone();
    for action in &plan.actions {
        match action {
            Action::EnsureDirectory { path, .. } => {
                after.existing_paths.insert(path.clone());
            }
            Action::WriteFile { path, content, .. } => {
                after.existing_paths.insert(path.clone());
                if *path == desired.env_file {
                    after.env_file_content = Some(content.clone());
                }
            }
            Action::LoadImage { image, .. } => {
                if let Some(image) = image {
                    after.present_images.insert(image.clone());
                }
            }
            Action::ComposeUp { .. } => {
                after
                    .running_containers
                    .extend(plan.watched_containers.iter().cloned());
            }
            Action::ComposeStop { .. } | Action::ComposeDown { .. } => {
                for name in &plan.watched_containers {
                    after.running_containers.remove(name);
                }
            }
            Action::RegisterService { .. } => {
                after.service_unit_registered = true;
                after.service_unit_current = true;
            }
            Action::SetServiceEnabled { enabled, .. } => after.service_unit_enabled = *enabled,
            Action::PruneDanglingImages => {}
        }
    }
    after
}

/// Container runtime that keeps images and containers in memory
#[derive(Default)]
pub struct FakeRuntime {
    unreachable: AtomicBool,
    images: Mutex<BTreeSet<ImageRef>>,
    running: Mutex<BTreeSet<String>>,
    workload_containers: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    compose_calls: Mutex<Vec<String>>,
    transient_compose_failures: AtomicUsize,
    prune_fails: AtomicBool,
    dangling: AtomicUsize,
    failing_saves: Mutex<BTreeSet<ImageRef>>,
    pulled: Mutex<Vec<ImageRef>>,
    exec_result: Mutex<Option<(i32, String)>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeRuntime {
    /// Reachable runtime with no images and nothing running
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an image present
    pub fn add_image(&self, image: &str) {
        if let Ok(image) = image.parse() {
            lock(&self.images).insert(image);
        }
    }

    /// Replace the set of running containers
    pub fn set_running(&self, names: &[&str]) {
        *lock(&self.running) = names.iter().map(|n| n.to_string()).collect();
    }

    /// Containers that compose up starts and compose stop/down removes
    pub fn set_workload_containers(&self, names: Vec<String>) {
        *lock(&self.workload_containers) = names;
    }

    /// Make every call fail as if the daemon were down
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` compose calls with a transient error
    pub fn fail_compose_transiently(&self, count: usize) {
        self.transient_compose_failures
            .store(count, Ordering::SeqCst);
    }

    /// Make image pruning fail
    pub fn fail_prune(&self) {
        self.prune_fails.store(true, Ordering::SeqCst);
    }

    /// Number of dangling images the next prune removes
    pub fn set_dangling(&self, count: usize) {
        self.dangling.store(count, Ordering::SeqCst);
    }

    /// Make saving `image` fail after writing a partial archive
    pub fn fail_save(&self, image: &str) {
        if let Ok(image) = image.parse() {
            lock(&self.failing_saves).insert(image);
        }
    }

    /// Exit code and stderr returned by `exec`
    pub fn set_exec_exit(&self, code: i32, stderr: &str) {
        *lock(&self.exec_result) = Some((code, stderr.to_string()));
    }

    /// Every call, in order (`version`, `compose up mysql`, ...)
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Compose calls that succeeded (`up mysql`, `down mysql`, ...)
    pub fn compose_calls(&self) -> Vec<String> {
        lock(&self.compose_calls).clone()
    }

    /// Images pulled, in order
    pub fn pulled(&self) -> Vec<ImageRef> {
        lock(&self.pulled).clone()
    }

    /// `(container, argv)` of every exec
    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.execs).clone()
    }

    /// Currently running containers
    pub fn running(&self) -> BTreeSet<String> {
        lock(&self.running).clone()
    }

    /// Currently present images
    pub fn images(&self) -> BTreeSet<ImageRef> {
        lock(&self.images).clone()
    }

    fn record(&self, call: impl Into<String>) -> CollabResult<()> {
        lock(&self.calls).push(call.into());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(daemon_down());
        }
        Ok(())
    }

    fn compose(&self, verb: &str, workload: &ComposeWorkload) -> CollabResult<()> {
        self.record(format!("compose {verb} {}", workload.variant))?;
        let pending = self.transient_compose_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_compose_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(daemon_down());
        }
        lock(&self.compose_calls).push(format!("{verb} {}", workload.variant));
        Ok(())
    }

    fn stop_workload(&self) {
        let workload = lock(&self.workload_containers).clone();
        let mut running = lock(&self.running);
        for name in &workload {
            running.remove(name);
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn version(&self) -> CollabResult<String> {
        self.record("version")?;
        Ok("27.0.3".to_string())
    }

    async fn list_images(&self) -> CollabResult<BTreeSet<ImageRef>> {
        self.record("images")?;
        Ok(self.images())
    }

    async fn describe_images(&self) -> CollabResult<Vec<ImageSummary>> {
        self.record("images --details")?;
        Ok(self
            .images()
            .into_iter()
            .map(|image| ImageSummary {
                image,
                size: "100MB".to_string(),
                created: "2024-06-01 08:00:00 +0000 UTC".to_string(),
            })
            .collect())
    }

    async fn list_running_containers(&self) -> CollabResult<BTreeSet<String>> {
        self.record("ps")?;
        Ok(self.running())
    }

    async fn pull_image(&self, image: &ImageRef) -> CollabResult<()> {
        self.record(format!("pull {image}"))?;
        lock(&self.pulled).push(image.clone());
        lock(&self.images).insert(image.clone());
        Ok(())
    }

    async fn save_image(&self, image: &ImageRef, archive: &Path) -> CollabResult<()> {
        self.record(format!("save {image}"))?;
        if lock(&self.failing_saves).contains(image) {
            async_fs::write(archive, b"partial").await?;
            return Err(CollaboratorError::CommandFailed {
                command: format!("docker save {image}"),
                detail: "write /dev/stdout: no space left on device".to_string(),
            });
        }
        if !lock(&self.images).contains(image) {
            return Err(CollaboratorError::CommandFailed {
                command: format!("docker save {image}"),
                detail: format!("No such image: {image}"),
            });
        }
        async_fs::write(archive, format!("image archive for {image}")).await?;
        Ok(())
    }

    async fn load_image(&self, archive: &Path) -> CollabResult<Vec<ImageRef>> {
        self.record(format!("load {}", archive.display()))?;
        let loaded: Vec<ImageRef> = archive
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(ImageRef::from_archive_stem)
            .into_iter()
            .collect();
        lock(&self.images).extend(loaded.iter().cloned());
        Ok(loaded)
    }

    async fn prune_dangling_images(&self) -> CollabResult<usize> {
        self.record("prune")?;
        if self.prune_fails.load(Ordering::SeqCst) {
            return Err(CollaboratorError::CommandFailed {
                command: "docker rmi".to_string(),
                detail: "image is being used by stopped container".to_string(),
            });
        }
        Ok(self.dangling.swap(0, Ordering::SeqCst))
    }

    async fn compose_up(&self, workload: &ComposeWorkload) -> CollabResult<()> {
        self.compose("up", workload)?;
        let started = lock(&self.workload_containers).clone();
        lock(&self.running).extend(started);
        Ok(())
    }

    async fn compose_stop(&self, workload: &ComposeWorkload) -> CollabResult<()> {
        self.compose("stop", workload)?;
        self.stop_workload();
        Ok(())
    }

    async fn compose_down(
        &self,
        workload: &ComposeWorkload,
        remove_volumes: bool,
    ) -> CollabResult<()> {
        let verb = if remove_volumes { "down-volumes" } else { "down" };
        self.compose(verb, workload)?;
        self.stop_workload();
        Ok(())
    }

    async fn container_logs(&self, container: &str, tail: usize) -> CollabResult<String> {
        self.record(format!("logs {container} {tail}"))?;
        Ok(format!("{container}: started\n"))
    }

    async fn exec(&self, container: &str, argv: &[String]) -> CollabResult<ExitResult> {
        self.record(format!("exec {container}"))?;
        lock(&self.execs).push((container.to_string(), argv.to_vec()));
        let (code, stderr) = lock(&self.exec_result)
            .clone()
            .unwrap_or((0, String::new()));
        Ok(ExitResult {
            status: ExitStatus {
                code: Some(code),
                signal: None,
            },
            stdout: String::new(),
            stderr,
        })
    }
}

/// Service manager with a single in-memory unit status per name
#[derive(Default)]
pub struct FakeServiceManager {
    unreachable: AtomicBool,
    hanging: AtomicBool,
    status: Mutex<UnitStatus>,
    installed: Mutex<Option<UnitSpec>>,
    calls: Mutex<Vec<String>>,
}

impl FakeServiceManager {
    /// Reachable manager with no unit registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the unit registration state
    pub fn set_status(&self, registered: bool, enabled: bool) {
        let mut status = lock(&self.status);
        status.registered = registered;
        status.enabled = enabled;
    }

    /// Register `unit` as if a previous install had written it
    pub fn install(&self, unit: &UnitSpec) {
        *lock(&self.installed) = Some(unit.clone());
        lock(&self.status).registered = true;
    }

    /// The unit last registered
    pub fn installed(&self) -> Option<UnitSpec> {
        lock(&self.installed).clone()
    }

    /// Make every call fail as if systemd were absent
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make every call hang forever
    pub fn hang(&self) {
        self.hanging.store(true, Ordering::SeqCst);
    }

    /// Mutating calls, in order (`register confluence`, `enable confluence`)
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    async fn gate(&self) -> CollabResult<()> {
        if self.hanging.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unreachable {
                collaborator: "service manager",
                detail: "System has not been booted with systemd as init system".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for FakeServiceManager {
    async fn status(&self, _unit_name: &str) -> CollabResult<UnitStatus> {
        self.gate().await?;
        Ok(*lock(&self.status))
    }

    async fn is_current(&self, unit: &UnitSpec) -> CollabResult<bool> {
        self.gate().await?;
        // A unit registered through `set_status` has unknown content and counts as current
        Ok(match &*lock(&self.installed) {
            Some(installed) => installed == unit,
            None => lock(&self.status).registered,
        })
    }

    async fn register(&self, unit: &UnitSpec) -> CollabResult<()> {
        self.gate().await?;
        lock(&self.calls).push(format!("register {}", unit.name));
        *lock(&self.installed) = Some(unit.clone());
        lock(&self.status).registered = true;
        Ok(())
    }

    async fn set_enabled(&self, unit_name: &str, enabled: bool) -> CollabResult<()> {
        self.gate().await?;
        let verb = if enabled { "enable" } else { "disable" };
        lock(&self.calls).push(format!("{verb} {unit_name}"));
        lock(&self.status).enabled = enabled;
        Ok(())
    }

    async fn journal(&self, unit_name: &str, lines: usize) -> CollabResult<String> {
        self.gate().await?;
        Ok(format!("-- {lines} line(s) of {unit_name} --\n"))
    }
}

/// Filesystem of directories and text files held in memory
#[derive(Default)]
pub struct MemoryFs {
    dirs: Mutex<BTreeSet<PathBuf>>,
    files: Mutex<BTreeMap<PathBuf, String>>,
    failing: Mutex<BTreeSet<PathBuf>>,
    writes: Mutex<Vec<PathBuf>>,
}

impl MemoryFs {
    /// Empty filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory without recording a write
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        lock(&self.dirs).insert(path.as_ref().to_path_buf());
    }

    /// Create a file without recording a write
    pub fn add_file(&self, path: impl AsRef<Path>, content: &str) {
        lock(&self.files).insert(path.as_ref().to_path_buf(), content.to_string());
    }

    /// Remove a single directory or file entry
    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        lock(&self.dirs).remove(path);
        lock(&self.files).remove(path);
    }

    /// Make creating or writing `path` fail with a permission error
    pub fn fail_on(&self, path: impl AsRef<Path>) {
        lock(&self.failing).insert(path.as_ref().to_path_buf());
    }

    /// Whether a directory or file exists
    pub fn exists_sync(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        lock(&self.dirs).contains(path) || lock(&self.files).contains_key(path)
    }

    /// Content of a file
    pub fn content(&self, path: impl AsRef<Path>) -> Option<String> {
        lock(&self.files).get(path.as_ref()).cloned()
    }

    /// Paths written through [`Filesystem::write_file`], in order
    pub fn writes(&self) -> Vec<PathBuf> {
        lock(&self.writes).clone()
    }

    fn check(&self, path: &Path) -> CollabResult<()> {
        if lock(&self.failing).contains(path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", path.display()),
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    async fn exists(&self, path: &Path) -> bool {
        self.exists_sync(path)
    }

    async fn read_to_string(&self, path: &Path) -> CollabResult<Option<String>> {
        Ok(self.content(path))
    }

    async fn ensure_dir(&self, path: &Path, _mode: u32) -> CollabResult<()> {
        self.check(path)?;
        let mut dirs = lock(&self.dirs);
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    async fn write_file(&self, path: &Path, content: &str, _mode: u32) -> CollabResult<()> {
        self.check(path)?;
        lock(&self.files).insert(path.to_path_buf(), content.to_string());
        lock(&self.writes).push(path.to_path_buf());
        Ok(())
    }
}

/// Port probe answering from a fixed set of bound ports
#[derive(Default)]
pub struct StaticPorts {
    bound: Mutex<BTreeSet<u16>>,
}

impl StaticPorts {
    /// No port bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a port as bound
    pub fn bind(&self, port: u16) {
        lock(&self.bound).insert(port);
    }
}

#[async_trait]
impl PortProbe for StaticPorts {
    async fn is_bound(&self, port: u16) -> bool {
        lock(&self.bound).contains(&port)
    }
}

/// Readiness probe that replays a scripted status sequence per target
///
/// The last scripted status repeats. Targets without a script are unreachable.
#[derive(Default)]
pub struct ScriptedProbe {
    scripts: Mutex<BTreeMap<ReadinessTarget, Vec<ReadinessStatus>>>,
    hanging: Mutex<BTreeSet<ReadinessTarget>>,
    checks: Mutex<BTreeMap<ReadinessTarget, usize>>,
}

impl ScriptedProbe {
    /// Probe with no scripts
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses returned by successive checks of `target`
    pub fn script(&self, target: ReadinessTarget, statuses: &[ReadinessStatus]) {
        lock(&self.scripts).insert(target, statuses.to_vec());
    }

    /// Make checks of `target` never return
    pub fn hang(&self, target: ReadinessTarget) {
        lock(&self.hanging).insert(target);
    }

    /// Number of checks started for `target`
    pub fn checks(&self, target: ReadinessTarget) -> usize {
        lock(&self.checks).get(&target).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self, target: ReadinessTarget) -> ReadinessStatus {
        let attempt = {
            let mut checks = lock(&self.checks);
            let count = checks.entry(target).or_insert(0);
            *count += 1;
            *count
        };
        let hanging = lock(&self.hanging).contains(&target);
        if hanging {
            futures::future::pending::<()>().await;
        }
        let scripts = lock(&self.scripts);
        match scripts.get(&target) {
            Some(statuses) if !statuses.is_empty() => {
                statuses[(attempt - 1).min(statuses.len() - 1)]
            }
            _ => ReadinessStatus::Unreachable,
        }
    }
}

/// One of each fake, shared with the pipeline components built from them
pub struct Fakes {
    /// Container runtime
    pub runtime: Arc<FakeRuntime>,
    /// Service manager
    pub services: Arc<FakeServiceManager>,
    /// Filesystem
    pub fs: Arc<MemoryFs>,
    /// Port probe
    pub ports: Arc<StaticPorts>,
    /// Readiness probe
    pub readiness: Arc<ScriptedProbe>,
}

impl Fakes {
    /// Empty host
    pub fn new() -> Self {
        Self {
            runtime: Arc::new(FakeRuntime::new()),
            services: Arc::new(FakeServiceManager::new()),
            fs: Arc::new(MemoryFs::new()),
            ports: Arc::new(StaticPorts::new()),
            readiness: Arc::new(ScriptedProbe::new()),
        }
    }

    /// Host matching [`observed_ready`]: images loaded, directories and compose file in place
    pub fn ready(desired: &DesiredState) -> Self {
        let fakes = Self::new();
        for image in &desired.required_images {
            fakes.runtime.add_image(&image.to_string());
        }
        fakes
            .runtime
            .set_workload_containers(desired.containers.all());
        fakes.fs.add_dir(&desired.install_root);
        for dir in &desired.data_dirs {
            fakes.fs.add_dir(dir);
        }
        fakes.fs.add_file(&desired.compose_file, "services: {}\n");
        fakes
    }

    /// Inventory probe over the fakes
    pub fn probe(&self) -> InventoryProbe {
        InventoryProbe::new(
            self.runtime.clone(),
            self.services.clone(),
            self.fs.clone(),
            self.ports.clone(),
        )
    }

    /// Executor over the fakes with default timeouts
    pub fn executor(&self) -> ActionExecutor {
        self.executor_with(ActionTimeouts::default())
    }

    /// Executor over the fakes with the given timeouts
    pub fn executor_with(&self, timeouts: ActionTimeouts) -> ActionExecutor {
        ActionExecutor::new(
            self.runtime.clone(),
            self.services.clone(),
            self.fs.clone(),
            timeouts,
        )
    }

    /// Reconciler over the fakes, using the scripted readiness probe
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.runtime.clone(),
            self.services.clone(),
            self.fs.clone(),
            self.ports.clone(),
        )
        .with_readiness_probe(self.readiness.clone())
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}
