//! Orchestrator (C6).
//!
//! Owns plugin discovery and lifecycle, the pod-keyed lock table, and the
//! per-event dispatch pipeline: walk plugins in sorted order, merge their
//! proposals (C5) under ownership tracking (C4), run policy (C7), and
//! hand the result back to the runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::fs;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;

use crate::api;
use crate::api_ttrpc;
use crate::error::{Error, FatalReason, Result};
use crate::merge::{self, ContainerLookup, MergeResult, Proposal};
use crate::mux::{self, Mux};
use crate::ownership::OwnershipTracker;
use crate::plugin::Plugin;
use crate::transport::{ExternalTransport, PluginTransport, PreConnectedTransport};
use crate::validate::{Validator, ValidatorConfig};

/// Sentinel pod UID used to serialize events that arrive with no pod
/// context at all.
const NO_POD_UID: &str = "<no-pod-uid>";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub drop_in_dir: PathBuf,
    pub config_dir: PathBuf,
    pub socket_path: PathBuf,
    pub registration_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// If true, a pre-launched plugin that fails to register within the
    /// timeout aborts the whole startup sequence rather than being
    /// skipped.
    pub disable_on_plugin_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            drop_in_dir: PathBuf::from("/opt/nri/plugins"),
            config_dir: PathBuf::from("/etc/nri/conf.d"),
            socket_path: PathBuf::from("/var/run/nri.sock"),
            registration_timeout_secs: 5,
            request_timeout_secs: 2,
            disable_on_plugin_failure: true,
        }
    }
}

/// One entry discovered in the drop-in directory.
struct DropIn {
    index: String,
    name: String,
    path: PathBuf,
}

/// Per-pod mutex table. Grows on demand, shrinks on `cleanup_pod`.
#[derive(Default)]
struct PodLockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PodLockTable {
    fn key(pod_uid: &str) -> String {
        if pod_uid.is_empty() {
            NO_POD_UID.to_string()
        } else {
            pod_uid.to_string()
        }
    }

    async fn lock_for(&self, pod_uid: &str) -> Arc<Mutex<()>> {
        let key = Self::key(pod_uid);
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn cleanup_pod(&self, pod_uid: &str) {
        self.locks.lock().await.remove(&Self::key(pod_uid));
    }
}

/// Live view of registered containers, used both to dispatch events and
/// to satisfy [`ContainerLookup`] for the merger's collateral-update
/// validation.
#[derive(Default)]
struct ContainerRegistry {
    containers: HashMap<String, api::Container>,
}

struct RegistryLookup<'a>(&'a ContainerRegistry);
impl ContainerLookup for RegistryLookup<'_> {
    fn exists(&self, container_id: &str) -> bool {
        self.0.containers.contains_key(container_id)
    }
}

/// Plugins in sorted `(index, name)` invocation order, keyed by
/// qualified name so the registry never holds a plugin by raw pointer.
///
/// Each plugin lives behind its own `Mutex` so a dispatch loop can take a
/// [`snapshot`](Self::snapshot) — cloning a handful of `Arc`s under the
/// registry's own lock — and then run every plugin's RPC with the
/// registry lock already released. The registry lock is never held
/// across an `.await` on a plugin call.
#[derive(Default)]
struct PluginRegistry {
    order: Vec<String>,
    plugins: HashMap<String, Arc<Mutex<Plugin>>>,
}

impl PluginRegistry {
    fn insert(&mut self, plugin: Plugin) {
        let id = plugin.qualified_name();
        if !self.plugins.contains_key(&id) {
            self.order.push(id.clone());
            self.order.sort();
        }
        self.plugins.insert(id, Arc::new(Mutex::new(plugin)));
    }

    fn base_names(&self) -> std::collections::HashSet<String> {
        self.order
            .iter()
            .filter_map(|id| id.split_once('-').map(|(_, name)| name.to_string()))
            .collect()
    }

    /// Cheap `Arc` clones in invocation order. Safe to hold onto after
    /// the registry's own lock is dropped.
    fn snapshot(&self) -> Vec<Arc<Mutex<Plugin>>> {
        self.order
            .iter()
            .filter_map(|id| self.plugins.get(id).cloned())
            .collect()
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: RwLock<PluginRegistry>,
    pod_locks: PodLockTable,
    containers: RwLock<ContainerRegistry>,
    validator: Validator,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, validator_config: ValidatorConfig) -> Arc<Self> {
        Arc::new(Orchestrator {
            config,
            registry: RwLock::new(PluginRegistry::default()),
            pod_locks: PodLockTable::default(),
            containers: RwLock::new(ContainerRegistry::default()),
            validator: Validator::new(validator_config),
        })
    }

    /// Full startup sequence: scan, launch, register, configure every
    /// drop-in plugin, then start the accept loop for external
    /// connections. Returns once the accept loop is spawned; it runs for
    /// the orchestrator's lifetime.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let drop_ins = self.scan_drop_in_dir().await?;
        for entry in drop_ins {
            if let Err(e) = self.launch_and_register(&entry).await {
                warn!("plugin {} failed to start: {e}", entry.name);
                if self.config.disable_on_plugin_failure {
                    return Err(e);
                }
            }
        }
        self.spawn_accept_loop();
        Ok(())
    }

    async fn scan_drop_in_dir(&self) -> Result<Vec<DropIn>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(&self.config.drop_in_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(Error::Transport(e)),
        };

        while let Some(entry) = dir.next_entry().await.map_err(Error::Transport)? {
            let path = entry.path();
            let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o111 == 0 {
                    warn!("skipping non-executable drop-in file {filename}");
                    continue;
                }
            }

            let digit_count = filename.chars().take_while(|c| c.is_ascii_digit()).count();
            if digit_count < 2 {
                warn!("skipping drop-in file {filename}: no 2+ digit index prefix");
                continue;
            }
            let (index, name) = filename.split_at(digit_count);
            entries.push(DropIn {
                index: index.to_string(),
                name: name.to_string(),
                path,
            });
        }

        entries.sort_by(|a, b| (a.index.as_str(), a.name.as_str()).cmp(&(b.index.as_str(), b.name.as_str())));
        Ok(entries)
    }

    /// Config lookup order: `INDEX-NAME.conf`, then `NAME.conf`, then
    /// empty. A missing file at either path is not an error.
    async fn load_plugin_config(&self, entry: &DropIn) -> Vec<u8> {
        let indexed = self.config.config_dir.join(format!("{}{}.conf", entry.index, entry.name));
        if let Ok(bytes) = fs::read(&indexed).await {
            return bytes;
        }
        let named = self.config.config_dir.join(format!("{}.conf", entry.name));
        fs::read(&named).await.unwrap_or_default()
    }

    async fn launch_and_register(self: &Arc<Self>, entry: &DropIn) -> Result<()> {
        let magic = fs::read(&entry.path).await.ok().map(|b| b.len() >= 4 && b[0..4] == [0x00, 0x61, 0x73, 0x6d]);

        let (transport, mux) = if magic == Some(true) {
            #[cfg(feature = "wasm")]
            {
                let bytes = fs::read(&entry.path).await.map_err(Error::Transport)?;
                crate::transport::wasm::WasmTransport::instantiate(&entry.name, &bytes).await?
            }
            #[cfg(not(feature = "wasm"))]
            {
                return Err(Error::Registration(format!(
                    "plugin {} is a wasm module but the wasm feature is disabled",
                    entry.name
                )));
            }
        } else {
            ExternalTransport::spawn(&entry.path, &entry.name, &entry.index, &[]).await?
        };

        let config_bytes = self.load_plugin_config(entry).await;
        self.establish_plugin(transport, mux, Some((entry.index.clone(), entry.name.clone())), config_bytes)
            .await
    }

    fn spawn_accept_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = fs::remove_file(&this.config.socket_path).await;
            let listener = match UnixListener::bind(&this.config.socket_path) {
                Ok(l) => l,
                Err(e) => {
                    warn!("failed to bind external plugin socket: {e}");
                    return;
                }
            };
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.accept_preconnected(stream).await {
                                warn!("pre-connected plugin registration failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept loop error: {e}");
                        break;
                    }
                }
            }
        });
    }

    async fn accept_preconnected(self: &Arc<Self>, stream: UnixStream) -> Result<()> {
        let (transport, mux) = PreConnectedTransport::from_stream(stream).await?;
        self.establish_plugin(transport, mux, None, Vec::new()).await
    }

    async fn current_runtime_view(&self) -> (Vec<api::PodSandbox>, Vec<api::Container>) {
        let containers = self.containers.read().await;
        (Vec::new(), containers.containers.values().cloned().collect())
    }

    /// Serves the plugin's `Runtime` service over `RUNTIME_SERVICE_CONN`
    /// just long enough to receive `RegisterPlugin`, enforcing
    /// `registration_timeout_secs`; on success drives `Configure` and,
    /// for late (non-drop-in) registrations, `Synchronize`, then inserts
    /// the plugin into the registry. The server keeps running afterward
    /// so it can also serve `UpdateContainers` for the plugin's lifetime.
    ///
    /// `expected` carries the drop-in's filename-derived `(index, name)`
    /// so a misbehaving drop-in can't register under someone else's
    /// identity; `None` means any identity is accepted (pre-connected
    /// plugins have no filename to check against).
    async fn establish_plugin(
        self: &Arc<Self>,
        transport: Box<dyn PluginTransport>,
        mux: Arc<Mux>,
        expected: Option<(String, String)>,
        config_bytes: Vec<u8>,
    ) -> Result<()> {
        let (registered_tx, registered_rx) = oneshot::channel();
        let service = Arc::new(ConnectionRuntimeService {
            orchestrator: self.clone(),
            registered: Mutex::new(Some(registered_tx)),
        });
        let service_map = api_ttrpc::create_runtime(service);
        let mut server = ttrpc::r#async::Server::new().register_service(service_map);

        let logical = match mux.open(mux::RUNTIME_SERVICE_CONN).await {
            Ok(l) => l,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };
        let ttrpc_socket = ttrpc::r#async::transport::Socket::new(logical);

        let server_mux = mux.clone();
        tokio::spawn(async move {
            let server_future = server.start_connected(ttrpc_socket);
            tokio::pin!(server_future);
            tokio::select! {
                reason = server_mux.monitor_handle() => {
                    debug!("plugin connection's runtime service stopping: {reason:?}");
                    let _ = server.shutdown().await;
                }
                result = &mut server_future => {
                    if let Err(e) = result {
                        warn!("runtime service ttrpc server error: {e}");
                    }
                    server_mux.shutdown().await;
                }
            }
        });

        let registration_timeout = Duration::from_secs(self.config.registration_timeout_secs);
        let (name, idx) = match timeout(registration_timeout, registered_rx).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(_)) => {
                transport.close().await;
                mux.shutdown().await;
                return Err(Error::Registration("plugin connection closed before registering".into()));
            }
            Err(_) => {
                transport
                    .shutdown(shutdown_request(FatalReason::RequestTimeout.shutdown_reason()))
                    .await
                    .ok();
                transport.close().await;
                mux.shutdown().await;
                return Err(Error::fatal(
                    FatalReason::RequestTimeout,
                    "plugin did not call RegisterPlugin within the registration timeout",
                ));
            }
        };

        if let Some((expected_idx, expected_name)) = &expected {
            if &idx != expected_idx || &name != expected_name {
                let detail = format!("plugin registered as {idx}-{name}, expected {expected_idx}-{expected_name}");
                transport.shutdown(shutdown_request(&detail)).await.ok();
                transport.close().await;
                mux.shutdown().await;
                return Err(Error::Registration(detail));
            }
        }
        Plugin::validate_registration(&idx, &name)?;

        let request_timeout = Duration::from_secs(self.config.request_timeout_secs);
        let mut plugin = Plugin::new(name.clone(), idx.clone(), transport, request_timeout);
        plugin.mark_registered();

        let mut req = api::ConfigureRequest::new();
        req.config = config_bytes;
        plugin.configure(req).await?;

        // Drop-in plugins are synchronized together once the whole
        // startup batch has registered; late registrations (pre-connected
        // or otherwise arriving after startup) synchronize immediately
        // against whatever the runtime already knows.
        if expected.is_none() {
            let (pods, containers) = self.current_runtime_view().await;
            plugin.synchronize_chunked(pods, containers).await?;
            plugin.mark_serving();
        }

        self.registry.write().await.insert(plugin);
        info!("registered plugin {idx}-{name}");
        Ok(())
    }

    /// Dispatches `CreateContainer` through every subscribed plugin in
    /// order, merges their proposals, runs local policy (C7), then runs
    /// every plugin subscribed to `VALIDATE_CONTAINER_ADJUSTMENT`.
    /// Partial adjustments are never applied: any failure at any stage
    /// drops the whole merged result.
    pub async fn dispatch_create_container(
        self: &Arc<Self>,
        pod: &api::PodSandbox,
        container: &api::Container,
    ) -> Result<MergeResult> {
        let pod_lock = self.pod_locks.lock_for(&pod.uid).await;
        let _guard = pod_lock.lock().await;

        let mut owners = OwnershipTracker::new();
        let plugins = self.registry.read().await.snapshot();
        let mut proposals = Vec::new();

        for plugin in &plugins {
            let mut guard = plugin.lock().await;
            let mut req = api::CreateContainerRequest::new();
            req.pod = protobuf::MessageField::some(pod.clone());
            req.container = protobuf::MessageField::some(container.clone());

            match guard.dispatch_create_container(req).await {
                Ok(Some(resp)) => proposals.push(Proposal {
                    plugin: guard.qualified_name(),
                    adjustment: resp.adjustment.into_option(),
                    updates: resp.update,
                }),
                Ok(None) => {}
                Err(e) if e.is_fatal_to_plugin() => {
                    warn!("plugin {} fatal error on CreateContainer: {e}", guard.qualified_name());
                    guard.shutdown(e.to_string().as_str()).await;
                }
                Err(e) => return Err(e),
            }
        }

        let merged = {
            let containers = self.containers.read().await;
            merge::merge(&container.id, proposals, &mut owners, &RegistryLookup(&containers))?
        };

        let seccomp_kind = merged.adjustment.seccomp.as_ref().map(|s| s.kind.enum_value_or_default());
        self.validator.validate("default", &container.id, seccomp_kind, &owners)?;

        let required = self.validator.required_plugins(pod, &container.name);
        let present = self.registry.read().await.base_names();
        self.validator.check_required_plugins(&required, &present)?;

        self.run_validate_container_adjustment(pod, container, &merged).await?;

        Ok(merged)
    }

    async fn run_validate_container_adjustment(
        self: &Arc<Self>,
        pod: &api::PodSandbox,
        container: &api::Container,
        merged: &MergeResult,
    ) -> Result<()> {
        let plugins = self.registry.read().await.snapshot();
        for plugin in &plugins {
            let mut guard = plugin.lock().await;
            let mut req = api::ValidateContainerAdjustmentRequest::new();
            req.pod = protobuf::MessageField::some(pod.clone());
            req.container = protobuf::MessageField::some(container.clone());
            req.adjustment = protobuf::MessageField::some(merged.adjustment.clone());

            match guard.dispatch_validate_container_adjustment(req).await {
                Ok(Some(resp)) if !resp.reject => {}
                Ok(Some(resp)) => {
                    return Err(Error::ValidationRejected {
                        plugin: guard.qualified_name(),
                        reason: resp.reason,
                    });
                }
                Ok(None) => {}
                Err(e) if e.is_fatal_to_plugin() => {
                    warn!("plugin {} fatal error on ValidateContainerAdjustment: {e}", guard.qualified_name());
                    guard.shutdown(e.to_string().as_str()).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Dispatches `UpdateContainer` through every subscribed plugin and
    /// merges their proposals the same way `CreateContainer` does: an
    /// `UpdateContainer` response carries both an adjustment and a list
    /// of collateral updates.
    pub async fn dispatch_update_container(
        self: &Arc<Self>,
        pod: &api::PodSandbox,
        container: &api::Container,
    ) -> Result<MergeResult> {
        let pod_lock = self.pod_locks.lock_for(&pod.uid).await;
        let _guard = pod_lock.lock().await;

        let mut owners = OwnershipTracker::new();
        let plugins = self.registry.read().await.snapshot();
        let mut proposals = Vec::new();

        for plugin in &plugins {
            let mut guard = plugin.lock().await;
            let mut req = api::UpdateContainerRequest::new();
            req.pod = protobuf::MessageField::some(pod.clone());
            req.container = protobuf::MessageField::some(container.clone());

            match guard.dispatch_update_container(req).await {
                Ok(Some(resp)) => proposals.push(Proposal {
                    plugin: guard.qualified_name(),
                    adjustment: resp.adjustment.into_option(),
                    updates: resp.update,
                }),
                Ok(None) => {}
                Err(e) if e.is_fatal_to_plugin() => {
                    warn!("plugin {} fatal error on UpdateContainer: {e}", guard.qualified_name());
                    guard.shutdown(e.to_string().as_str()).await;
                }
                Err(e) => return Err(e),
            }
        }

        let containers = self.containers.read().await;
        merge::merge(&container.id, proposals, &mut owners, &RegistryLookup(&containers))
    }

    /// Dispatches `StopContainer`, whose response carries only collateral
    /// updates (no adjustment to merge or validate).
    pub async fn dispatch_stop_container(
        self: &Arc<Self>,
        pod: &api::PodSandbox,
        container: &api::Container,
    ) -> Result<Vec<api::ContainerUpdate>> {
        let pod_lock = self.pod_locks.lock_for(&pod.uid).await;
        let _guard = pod_lock.lock().await;

        let mut owners = OwnershipTracker::new();
        let plugins = self.registry.read().await.snapshot();
        let mut proposals = Vec::new();

        for plugin in &plugins {
            let mut guard = plugin.lock().await;
            let mut req = api::StopContainerRequest::new();
            req.pod = protobuf::MessageField::some(pod.clone());
            req.container = protobuf::MessageField::some(container.clone());

            match guard.dispatch_stop_container(req).await {
                Ok(Some(resp)) => proposals.push(Proposal {
                    plugin: guard.qualified_name(),
                    adjustment: None,
                    updates: resp.update,
                }),
                Ok(None) => {}
                Err(e) if e.is_fatal_to_plugin() => {
                    warn!("plugin {} fatal error on StopContainer: {e}", guard.qualified_name());
                    guard.shutdown(e.to_string().as_str()).await;
                }
                Err(e) => return Err(e),
            }
        }

        let containers = self.containers.read().await;
        merge::merge(&container.id, proposals, &mut owners, &RegistryLookup(&containers)).map(|r| r.updates)
    }

    pub async fn register_container(&self, container: api::Container) {
        self.containers.write().await.containers.insert(container.id.clone(), container);
    }

    pub async fn remove_container(&self, container_id: &str) {
        self.containers.write().await.containers.remove(container_id);
    }

    pub async fn cleanup_pod(&self, pod_uid: &str) {
        self.pod_locks.cleanup_pod(pod_uid).await;
    }

    /// Handles an inbound `UpdateContainers` call: the plugin proposes
    /// updates unprompted by any current event. Returns the container ids
    /// for which the update was rejected (unknown container and not
    /// marked `ignore_failure`), per `UpdateContainersResponse.failed`.
    pub async fn update_containers(&self, updates: Vec<api::ContainerUpdate>) -> Vec<String> {
        let containers = self.containers.read().await;
        let lookup = RegistryLookup(&containers);
        updates
            .into_iter()
            .filter(|u| !lookup.exists(&u.container_id) && !u.ignore_failure)
            .map(|u| u.container_id)
            .collect()
    }
}

/// Signal-only lifecycle events: the plugin observes but returns nothing
/// for the orchestrator to merge. Declared once via macro since every one
/// of these methods differs only in request/response type and the
/// `Plugin::dispatch_*` method it calls.
macro_rules! pod_sandbox_signal_dispatch {
    ($name:ident, $dispatch_method:ident, $req_ty:ty) => {
        impl Orchestrator {
            pub async fn $name(self: &Arc<Self>, pod: &api::PodSandbox) -> Result<()> {
                let pod_lock = self.pod_locks.lock_for(&pod.uid).await;
                let _guard = pod_lock.lock().await;

                let plugins = self.registry.read().await.snapshot();
                for plugin in &plugins {
                    let mut guard = plugin.lock().await;
                    let mut req = <$req_ty>::new();
                    req.pod = protobuf::MessageField::some(pod.clone());

                    match guard.$dispatch_method(req).await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal_to_plugin() => {
                            warn!("plugin {} fatal error on {}: {e}", guard.qualified_name(), stringify!($name));
                            guard.shutdown(e.to_string().as_str()).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    };
}

pod_sandbox_signal_dispatch!(dispatch_run_pod_sandbox, dispatch_run_pod_sandbox, api::RunPodSandboxRequest);
pod_sandbox_signal_dispatch!(dispatch_stop_pod_sandbox, dispatch_stop_pod_sandbox, api::StopPodSandboxRequest);
pod_sandbox_signal_dispatch!(dispatch_remove_pod_sandbox, dispatch_remove_pod_sandbox, api::RemovePodSandboxRequest);
pod_sandbox_signal_dispatch!(
    dispatch_post_update_pod_sandbox,
    dispatch_post_update_pod_sandbox,
    api::PostUpdatePodSandboxRequest
);

macro_rules! container_signal_dispatch {
    ($name:ident, $dispatch_method:ident, $req_ty:ty) => {
        impl Orchestrator {
            pub async fn $name(
                self: &Arc<Self>,
                pod: &api::PodSandbox,
                container: &api::Container,
            ) -> Result<()> {
                let pod_lock = self.pod_locks.lock_for(&pod.uid).await;
                let _guard = pod_lock.lock().await;

                let plugins = self.registry.read().await.snapshot();
                for plugin in &plugins {
                    let mut guard = plugin.lock().await;
                    let mut req = <$req_ty>::new();
                    req.pod = protobuf::MessageField::some(pod.clone());
                    req.container = protobuf::MessageField::some(container.clone());

                    match guard.$dispatch_method(req).await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal_to_plugin() => {
                            warn!("plugin {} fatal error on {}: {e}", guard.qualified_name(), stringify!($name));
                            guard.shutdown(e.to_string().as_str()).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    };
}

container_signal_dispatch!(dispatch_post_create_container, dispatch_post_create_container, api::PostCreateContainerRequest);
container_signal_dispatch!(dispatch_start_container, dispatch_start_container, api::StartContainerRequest);
container_signal_dispatch!(dispatch_post_start_container, dispatch_post_start_container, api::PostStartContainerRequest);
container_signal_dispatch!(dispatch_post_update_container, dispatch_post_update_container, api::PostUpdateContainerRequest);
container_signal_dispatch!(dispatch_remove_container, dispatch_remove_container, api::RemoveContainerRequest);

impl Orchestrator {
    /// `UpdatePodSandbox` carries resource-adjustment input fields but an
    /// empty response; every subscribed plugin still observes it in
    /// order, under the pod's lock, with the same fatal-error handling.
    pub async fn dispatch_update_pod_sandbox(
        self: &Arc<Self>,
        pod: &api::PodSandbox,
        overhead: Option<api::LinuxResourcesAdjustment>,
        resources: Option<api::LinuxResourcesAdjustment>,
    ) -> Result<()> {
        let pod_lock = self.pod_locks.lock_for(&pod.uid).await;
        let _guard = pod_lock.lock().await;

        let plugins = self.registry.read().await.snapshot();
        for plugin in &plugins {
            let mut guard = plugin.lock().await;
            let mut req = api::UpdatePodSandboxRequest::new();
            req.pod = protobuf::MessageField::some(pod.clone());
            req.overhead = match &overhead {
                Some(o) => protobuf::MessageField::some(o.clone()),
                None => protobuf::MessageField::none(),
            };
            req.resources = match &resources {
                Some(r) => protobuf::MessageField::some(r.clone()),
                None => protobuf::MessageField::none(),
            };

            match guard.dispatch_update_pod_sandbox(req).await {
                Ok(_) => {}
                Err(e) if e.is_fatal_to_plugin() => {
                    warn!("plugin {} fatal error on UpdatePodSandbox: {e}", guard.qualified_name());
                    guard.shutdown(e.to_string().as_str()).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn shutdown_request(reason: &str) -> api::ShutdownRequest {
    let mut req = api::ShutdownRequest::new();
    req.reason = reason.to_string();
    req
}

/// Serves the `Runtime` ttrpc service for one plugin connection:
/// `RegisterPlugin` resolves the oneshot the connection setup is waiting
/// on, `UpdateContainers` forwards straight into the orchestrator.
struct ConnectionRuntimeService {
    orchestrator: Arc<Orchestrator>,
    registered: Mutex<Option<oneshot::Sender<(String, String)>>>,
}

#[async_trait::async_trait]
impl api_ttrpc::Runtime for ConnectionRuntimeService {
    async fn register_plugin(
        &self,
        _ctx: &::ttrpc::r#async::TtrpcContext,
        req: api::RegisterPluginRequest,
    ) -> ::ttrpc::Result<api::Empty> {
        if let Some(tx) = self.registered.lock().await.take() {
            let _ = tx.send((req.plugin_name, req.plugin_idx));
        }
        Ok(api::Empty::new())
    }

    async fn update_containers(
        &self,
        _ctx: &::ttrpc::r#async::TtrpcContext,
        req: api::UpdateContainersRequest,
    ) -> ::ttrpc::Result<api::UpdateContainersResponse> {
        let failed = self.orchestrator.update_containers(req.update).await;
        let mut resp = api::UpdateContainersResponse::new();
        resp.failed = failed;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BuiltinTransport;

    struct NoopHandlers;
    impl crate::transport::BuiltinHandlers for NoopHandlers {}

    #[tokio::test]
    async fn pod_lock_serializes_same_pod_events() {
        let orch = Orchestrator::new(OrchestratorConfig::default(), ValidatorConfig::default());
        let counter = Arc::new(tokio::sync::Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let orch = orch.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = orch.pod_locks.lock_for("pod-a").await;
                let _guard = lock.lock().await;
                let mut c = counter.lock().await;
                *c += 1;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*counter.lock().await, 20);
    }

    #[tokio::test]
    async fn empty_pod_uid_maps_to_sentinel() {
        let orch = Orchestrator::new(OrchestratorConfig::default(), ValidatorConfig::default());
        let a = orch.pod_locks.lock_for("").await;
        let b = orch.pod_locks.lock_for(NO_POD_UID).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn create_container_with_no_plugins_is_a_no_op_merge() {
        let orch = Orchestrator::new(OrchestratorConfig::default(), ValidatorConfig::default());
        let pod = api::PodSandbox::new();
        let container = api::Container::new();
        let result = orch.dispatch_create_container(&pod, &container).await.unwrap();
        assert!(result.adjustment.annotations.is_none());
    }

    #[tokio::test]
    async fn builtin_plugin_participates_in_registry_order() {
        let orch = Orchestrator::new(OrchestratorConfig::default(), ValidatorConfig::default());
        let transport = BuiltinTransport::new(NoopHandlers);
        let mut plugin = Plugin::new("builtin".into(), "00".into(), transport, Duration::from_secs(2));
        plugin.mark_registered();
        plugin.configure(api::ConfigureRequest::new()).await.unwrap();
        orch.registry.write().await.insert(plugin);
        assert_eq!(orch.registry.read().await.order, vec!["00-builtin".to_string()]);
    }
}
