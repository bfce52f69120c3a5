//! Plugin instance and registration (C3).
//!
//! Tracks one connected plugin through its lifecycle and wraps the raw
//! [`PluginTransport`] with the timeout, retry and qualified-naming rules
//! the orchestrator applies uniformly across all hosting modes.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::timeout;

use crate::api;
use crate::error::{Error, FatalReason, Result};
use crate::events_mask::EventMask;
use crate::transport::PluginTransport;

/// Registration index must be at least two ASCII digits so plugins sort
/// lexically in the same order regardless of how many are configured
/// (`"05"` before `"12"`, not `"12"` before `"5"`).
const MIN_INDEX_DIGITS: usize = 2;

const SHUTDOWN_DELAY: Duration = Duration::from_secs(1);

/// Synchronize splits its pod/container payload when a plugin can't
/// accept it whole; each retry halves both counts...
const SYNCHRONIZE_SHRINK_FACTOR: f64 = 0.5;
/// ...down to this floor on the combined pod+container count, below
/// which the orchestrator gives up and fails the plugin rather than
/// split forever.
const SYNCHRONIZE_MIN_CHUNK: usize = 8;

/// True for the one error class Synchronize retries by splitting: an
/// oversize-message rejection from the plugin's transport.
fn is_resource_exhausted(err: &Error) -> bool {
    matches!(
        err,
        Error::Ttrpc(ttrpc::Error::RpcStatus(status))
            if status.code.enum_value_or_default() == ttrpc::Code::RESOURCE_EXHAUSTED
    )
}

fn shrink_chunk(n: usize) -> usize {
    ((n as f64 * SYNCHRONIZE_SHRINK_FACTOR).ceil() as usize).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Launched,
    Registering,
    Registered,
    Configured,
    Synchronized,
    Serving,
    Closed,
}

/// A connected plugin: its identity, negotiated event subscription, and
/// the transport used to reach it.
pub struct Plugin {
    name: String,
    idx: String,
    transport: Box<dyn PluginTransport>,
    state: PluginState,
    events: EventMask,
    request_timeout: Duration,
}

impl Plugin {
    pub fn new(
        name: String,
        idx: String,
        transport: Box<dyn PluginTransport>,
        request_timeout: Duration,
    ) -> Self {
        Plugin {
            name,
            idx,
            transport,
            state: PluginState::Launched,
            events: EventMask::new(),
            request_timeout,
        }
    }

    /// `kind:index-base[pid]` style qualified name used in logs and in
    /// required-plugin matching. No pid is tracked at this layer, so the
    /// bracketed suffix is simply omitted when unknown.
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.idx, self.name)
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn events(&self) -> EventMask {
        self.events
    }

    /// Validates a `RegisterPlugin` request's index and name, per the
    /// registration invariants: index must be >= 2 ASCII digits, name
    /// must be non-empty, and both must agree with what the transport
    /// was already told (env vars for external plugins).
    pub fn validate_registration(idx: &str, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Registration("plugin name must not be empty".into()));
        }
        if idx.len() < MIN_INDEX_DIGITS || !idx.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Registration(format!(
                "plugin index {idx:?} must be at least {MIN_INDEX_DIGITS} ASCII digits"
            )));
        }
        Ok(())
    }

    pub fn mark_registered(&mut self) {
        self.state = PluginState::Registered;
    }

    /// Runs `Configure`, validating and recording the plugin's requested
    /// event subscription. `events == 0` in the response means "all
    /// valid events".
    pub async fn configure(&mut self, req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
        let resp = self.call_with_timeout(|t| t.configure(req)).await?;
        if !EventMask::is_valid(resp.events as u32) {
            return Err(Error::ProtocolViolation(format!(
                "plugin {} requested invalid event mask {:#x}",
                self.qualified_name(),
                resp.events
            )));
        }
        self.events = if resp.events == 0 {
            crate::events_mask::valid_events()
        } else {
            EventMask::from_raw(resp.events as u32)
        };
        self.state = PluginState::Configured;
        Ok(resp)
    }

    /// Runs `Synchronize` with the runtime's full pod/container view,
    /// splitting it into shrinking chunks when the plugin's transport
    /// rejects a chunk as oversize. The request's `more` flag carries the
    /// chunking, not the response's: every chunk but the last sets
    /// `more=true`, and a plugin that returns updates before the last
    /// chunk has committed a protocol violation.
    pub async fn synchronize_chunked(
        &mut self,
        pods: Vec<api::PodSandbox>,
        containers: Vec<api::Container>,
    ) -> Result<Vec<api::ContainerUpdate>> {
        let mut updates = Vec::new();
        let mut pod_offset = 0usize;
        let mut container_offset = 0usize;
        let mut pod_chunk = pods.len().max(1);
        let mut container_chunk = containers.len().max(1);

        loop {
            let pod_end = (pod_offset + pod_chunk).min(pods.len());
            let container_end = (container_offset + container_chunk).min(containers.len());
            let is_last = pod_end == pods.len() && container_end == containers.len();

            let mut req = api::SynchronizeRequest::new();
            req.pods = pods[pod_offset..pod_end].to_vec();
            req.containers = containers[container_offset..container_end].to_vec();
            req.more = !is_last;

            match self.call_with_timeout(|t| t.synchronize(req.clone())).await {
                Ok(resp) => {
                    if req.more && !resp.update.is_empty() {
                        return Err(Error::ProtocolViolation(format!(
                            "plugin {} returned container updates before the last Synchronize chunk",
                            self.qualified_name()
                        )));
                    }
                    updates.extend(resp.update);
                    pod_offset = pod_end;
                    container_offset = container_end;
                    if is_last {
                        break;
                    }
                }
                Err(e) if is_resource_exhausted(&e) && pod_chunk + container_chunk > SYNCHRONIZE_MIN_CHUNK => {
                    pod_chunk = shrink_chunk(pod_chunk);
                    container_chunk = shrink_chunk(container_chunk);
                    warn!(
                        "plugin {} hit ResourceExhausted on Synchronize, retrying with chunk sizes {}/{}",
                        self.qualified_name(),
                        pod_chunk,
                        container_chunk
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.state = PluginState::Synchronized;
        Ok(updates)
    }

    pub fn mark_serving(&mut self) {
        self.state = PluginState::Serving;
    }

    /// Every call the plugin runs after Synchronize goes through here so
    /// the per-request timeout and fatal-error classification are
    /// applied uniformly.
    async fn call_with_timeout<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn PluginTransport) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match timeout(self.request_timeout, f(self.transport.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(Error::fatal(
                FatalReason::RequestTimeout,
                format!("plugin {} exceeded request timeout", self.qualified_name()),
            )),
        }
    }

    /// Dispatches one already-classified lifecycle event to the plugin,
    /// provided it subscribed to it. Returns `Ok(None)` if the plugin did
    /// not subscribe, so the caller can skip it without treating absence
    /// as failure.
    pub async fn dispatch_create_container(
        &self,
        req: api::CreateContainerRequest,
    ) -> Result<Option<api::CreateContainerResponse>> {
        if !self.events.is_set(api::Event::CREATE_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.create_container(req)).await.map(Some)
    }

    pub async fn dispatch_validate_container_adjustment(
        &self,
        req: api::ValidateContainerAdjustmentRequest,
    ) -> Result<Option<api::ValidateContainerAdjustmentResponse>> {
        if !self.events.is_set(api::Event::VALIDATE_CONTAINER_ADJUSTMENT) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.validate_container_adjustment(req))
            .await
            .map(Some)
    }

    pub async fn dispatch_run_pod_sandbox(
        &self,
        req: api::RunPodSandboxRequest,
    ) -> Result<Option<api::RunPodSandboxResponse>> {
        if !self.events.is_set(api::Event::RUN_POD_SANDBOX) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.run_pod_sandbox(req)).await.map(Some)
    }

    pub async fn dispatch_stop_pod_sandbox(
        &self,
        req: api::StopPodSandboxRequest,
    ) -> Result<Option<api::StopPodSandboxResponse>> {
        if !self.events.is_set(api::Event::STOP_POD_SANDBOX) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.stop_pod_sandbox(req)).await.map(Some)
    }

    pub async fn dispatch_remove_pod_sandbox(
        &self,
        req: api::RemovePodSandboxRequest,
    ) -> Result<Option<api::RemovePodSandboxResponse>> {
        if !self.events.is_set(api::Event::REMOVE_POD_SANDBOX) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.remove_pod_sandbox(req)).await.map(Some)
    }

    pub async fn dispatch_update_pod_sandbox(
        &self,
        req: api::UpdatePodSandboxRequest,
    ) -> Result<Option<api::UpdatePodSandboxResponse>> {
        if !self.events.is_set(api::Event::UPDATE_POD_SANDBOX) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.update_pod_sandbox(req)).await.map(Some)
    }

    pub async fn dispatch_post_update_pod_sandbox(
        &self,
        req: api::PostUpdatePodSandboxRequest,
    ) -> Result<Option<api::PostUpdatePodSandboxResponse>> {
        if !self.events.is_set(api::Event::POST_UPDATE_POD_SANDBOX) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.post_update_pod_sandbox(req))
            .await
            .map(Some)
    }

    pub async fn dispatch_post_create_container(
        &self,
        req: api::PostCreateContainerRequest,
    ) -> Result<Option<api::PostCreateContainerResponse>> {
        if !self.events.is_set(api::Event::POST_CREATE_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.post_create_container(req))
            .await
            .map(Some)
    }

    pub async fn dispatch_start_container(
        &self,
        req: api::StartContainerRequest,
    ) -> Result<Option<api::StartContainerResponse>> {
        if !self.events.is_set(api::Event::START_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.start_container(req)).await.map(Some)
    }

    pub async fn dispatch_post_start_container(
        &self,
        req: api::PostStartContainerRequest,
    ) -> Result<Option<api::PostStartContainerResponse>> {
        if !self.events.is_set(api::Event::POST_START_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.post_start_container(req))
            .await
            .map(Some)
    }

    pub async fn dispatch_update_container(
        &self,
        req: api::UpdateContainerRequest,
    ) -> Result<Option<api::UpdateContainerResponse>> {
        if !self.events.is_set(api::Event::UPDATE_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.update_container(req)).await.map(Some)
    }

    pub async fn dispatch_post_update_container(
        &self,
        req: api::PostUpdateContainerRequest,
    ) -> Result<Option<api::PostUpdateContainerResponse>> {
        if !self.events.is_set(api::Event::POST_UPDATE_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.post_update_container(req))
            .await
            .map(Some)
    }

    pub async fn dispatch_stop_container(
        &self,
        req: api::StopContainerRequest,
    ) -> Result<Option<api::StopContainerResponse>> {
        if !self.events.is_set(api::Event::STOP_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.stop_container(req)).await.map(Some)
    }

    pub async fn dispatch_remove_container(
        &self,
        req: api::RemoveContainerRequest,
    ) -> Result<Option<api::RemoveContainerResponse>> {
        if !self.events.is_set(api::Event::REMOVE_CONTAINER) {
            return Ok(None);
        }
        self.call_with_timeout(|t| t.remove_container(req)).await.map(Some)
    }

    /// Requests graceful shutdown, waits [`SHUTDOWN_DELAY`] for the
    /// plugin to exit on its own, then tears the transport down
    /// regardless.
    pub async fn shutdown(&mut self, reason: &str) {
        if self.state == PluginState::Closed {
            return;
        }
        debug!("shutting down plugin {}: {}", self.qualified_name(), reason);
        let mut req = api::ShutdownRequest::new();
        req.reason = reason.to_string();
        let _ = timeout(self.request_timeout, self.transport.shutdown(req)).await;
        tokio::time::sleep(SHUTDOWN_DELAY).await;
        self.transport.close().await;
        self.state = PluginState::Closed;
        info!("plugin {} shut down", self.qualified_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_requires_two_digit_index() {
        assert!(Plugin::validate_registration("5", "foo").is_err());
        assert!(Plugin::validate_registration("05", "foo").is_ok());
        assert!(Plugin::validate_registration("10", "foo").is_ok());
    }

    #[test]
    fn registration_requires_non_empty_name() {
        assert!(Plugin::validate_registration("10", "").is_err());
    }

    #[test]
    fn registration_rejects_non_digit_index() {
        assert!(Plugin::validate_registration("1a", "foo").is_err());
    }

    /// A transport whose `create_container` never resolves, so the
    /// surrounding `call_with_timeout` is the only thing that can end it.
    struct HangingTransport;

    #[async_trait::async_trait]
    impl PluginTransport for HangingTransport {
        async fn configure(&self, _req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
            Ok(api::ConfigureResponse::new())
        }
        async fn synchronize(&self, _req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
            Ok(api::SynchronizeResponse::new())
        }
        async fn shutdown(&self, _req: api::ShutdownRequest) -> Result<api::Empty> {
            Ok(api::Empty::new())
        }
        async fn create_container(&self, _req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
            futures::future::pending().await
        }
        async fn post_create_container(&self, _req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse> {
            Ok(api::PostCreateContainerResponse::new())
        }
        async fn start_container(&self, _req: api::StartContainerRequest) -> Result<api::StartContainerResponse> {
            Ok(api::StartContainerResponse::new())
        }
        async fn post_start_container(&self, _req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse> {
            Ok(api::PostStartContainerResponse::new())
        }
        async fn update_container(&self, _req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse> {
            Ok(api::UpdateContainerResponse::new())
        }
        async fn post_update_container(&self, _req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse> {
            Ok(api::PostUpdateContainerResponse::new())
        }
        async fn stop_container(&self, _req: api::StopContainerRequest) -> Result<api::StopContainerResponse> {
            Ok(api::StopContainerResponse::new())
        }
        async fn remove_container(&self, _req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse> {
            Ok(api::RemoveContainerResponse::new())
        }
        async fn run_pod_sandbox(&self, _req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse> {
            Ok(api::RunPodSandboxResponse::new())
        }
        async fn stop_pod_sandbox(&self, _req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse> {
            Ok(api::StopPodSandboxResponse::new())
        }
        async fn remove_pod_sandbox(&self, _req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse> {
            Ok(api::RemovePodSandboxResponse::new())
        }
        async fn update_pod_sandbox(&self, _req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse> {
            Ok(api::UpdatePodSandboxResponse::new())
        }
        async fn post_update_pod_sandbox(&self, _req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse> {
            Ok(api::PostUpdatePodSandboxResponse::new())
        }
        async fn validate_container_adjustment(
            &self,
            _req: api::ValidateContainerAdjustmentRequest,
        ) -> Result<api::ValidateContainerAdjustmentResponse> {
            Ok(api::ValidateContainerAdjustmentResponse::new())
        }
        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn request_exceeding_timeout_becomes_fatal() {
        let request_timeout = Duration::from_secs(2);
        let mut plugin = Plugin::new(
            "hangs".to_string(),
            "00".to_string(),
            Box::new(HangingTransport),
            request_timeout,
        );
        plugin.events.set(&[api::Event::CREATE_CONTAINER]);

        let call = plugin.dispatch_create_container(api::CreateContainerRequest::new());
        tokio::pin!(call);

        tokio::time::advance(request_timeout + Duration::from_millis(1)).await;
        let err = call.await.unwrap_err();
        assert!(matches!(
            err,
            Error::Fatal {
                reason: FatalReason::RequestTimeout,
                ..
            }
        ));
    }

    /// Rejects any chunk bigger than `max_len` with `ResourceExhausted`,
    /// accepts everything else, and only ever attaches a `ContainerUpdate`
    /// to the final chunk.
    struct ChunkingTransport {
        max_len: usize,
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PluginTransport for ChunkingTransport {
        async fn configure(&self, _req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
            Ok(api::ConfigureResponse::new())
        }
        async fn synchronize(&self, req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
            self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if req.pods.len() + req.containers.len() > self.max_len {
                return Err(Error::Ttrpc(ttrpc::Error::RpcStatus(ttrpc::get_status(
                    ttrpc::Code::RESOURCE_EXHAUSTED,
                    "message too large".to_string(),
                ))));
            }
            let mut resp = api::SynchronizeResponse::new();
            if !req.more {
                resp.update = vec![api::ContainerUpdate::new()];
            }
            Ok(resp)
        }
        async fn shutdown(&self, _req: api::ShutdownRequest) -> Result<api::Empty> {
            Ok(api::Empty::new())
        }
        async fn create_container(&self, _req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
            Ok(api::CreateContainerResponse::new())
        }
        async fn post_create_container(&self, _req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse> {
            Ok(api::PostCreateContainerResponse::new())
        }
        async fn start_container(&self, _req: api::StartContainerRequest) -> Result<api::StartContainerResponse> {
            Ok(api::StartContainerResponse::new())
        }
        async fn post_start_container(&self, _req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse> {
            Ok(api::PostStartContainerResponse::new())
        }
        async fn update_container(&self, _req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse> {
            Ok(api::UpdateContainerResponse::new())
        }
        async fn post_update_container(&self, _req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse> {
            Ok(api::PostUpdateContainerResponse::new())
        }
        async fn stop_container(&self, _req: api::StopContainerRequest) -> Result<api::StopContainerResponse> {
            Ok(api::StopContainerResponse::new())
        }
        async fn remove_container(&self, _req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse> {
            Ok(api::RemoveContainerResponse::new())
        }
        async fn run_pod_sandbox(&self, _req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse> {
            Ok(api::RunPodSandboxResponse::new())
        }
        async fn stop_pod_sandbox(&self, _req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse> {
            Ok(api::StopPodSandboxResponse::new())
        }
        async fn remove_pod_sandbox(&self, _req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse> {
            Ok(api::RemovePodSandboxResponse::new())
        }
        async fn update_pod_sandbox(&self, _req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse> {
            Ok(api::UpdatePodSandboxResponse::new())
        }
        async fn post_update_pod_sandbox(&self, _req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse> {
            Ok(api::PostUpdatePodSandboxResponse::new())
        }
        async fn validate_container_adjustment(
            &self,
            _req: api::ValidateContainerAdjustmentRequest,
        ) -> Result<api::ValidateContainerAdjustmentResponse> {
            Ok(api::ValidateContainerAdjustmentResponse::new())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn synchronize_splits_on_resource_exhausted_and_concatenates_chunks() {
        let transport = ChunkingTransport {
            max_len: 8,
            attempts: std::sync::atomic::AtomicUsize::new(0),
        };
        let mut plugin = Plugin::new(
            "sync".to_string(),
            "00".to_string(),
            Box::new(transport),
            Duration::from_secs(2),
        );

        let containers: Vec<api::Container> = (0..20).map(|_| api::Container::new()).collect();
        let updates = plugin.synchronize_chunked(Vec::new(), containers).await.unwrap();

        // Only the final chunk attaches an update, so exactly one survives.
        assert_eq!(updates.len(), 1);
        assert_eq!(plugin.state(), PluginState::Synchronized);
    }

    /// Rejects the first attempt (forcing a split into multiple chunks),
    /// then attaches an update to a non-final chunk — a protocol
    /// violation `synchronize_chunked` must catch regardless of how the
    /// plugin got there.
    struct ViolatingTransport {
        attempts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PluginTransport for ViolatingTransport {
        async fn configure(&self, _req: api::ConfigureRequest) -> Result<api::ConfigureResponse> {
            Ok(api::ConfigureResponse::new())
        }
        async fn synchronize(&self, req: api::SynchronizeRequest) -> Result<api::SynchronizeResponse> {
            if self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                return Err(Error::Ttrpc(ttrpc::Error::RpcStatus(ttrpc::get_status(
                    ttrpc::Code::RESOURCE_EXHAUSTED,
                    "message too large".to_string(),
                ))));
            }
            let mut resp = api::SynchronizeResponse::new();
            if req.more {
                resp.update = vec![api::ContainerUpdate::new()];
            }
            Ok(resp)
        }
        async fn shutdown(&self, _req: api::ShutdownRequest) -> Result<api::Empty> {
            Ok(api::Empty::new())
        }
        async fn create_container(&self, _req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
            Ok(api::CreateContainerResponse::new())
        }
        async fn post_create_container(&self, _req: api::PostCreateContainerRequest) -> Result<api::PostCreateContainerResponse> {
            Ok(api::PostCreateContainerResponse::new())
        }
        async fn start_container(&self, _req: api::StartContainerRequest) -> Result<api::StartContainerResponse> {
            Ok(api::StartContainerResponse::new())
        }
        async fn post_start_container(&self, _req: api::PostStartContainerRequest) -> Result<api::PostStartContainerResponse> {
            Ok(api::PostStartContainerResponse::new())
        }
        async fn update_container(&self, _req: api::UpdateContainerRequest) -> Result<api::UpdateContainerResponse> {
            Ok(api::UpdateContainerResponse::new())
        }
        async fn post_update_container(&self, _req: api::PostUpdateContainerRequest) -> Result<api::PostUpdateContainerResponse> {
            Ok(api::PostUpdateContainerResponse::new())
        }
        async fn stop_container(&self, _req: api::StopContainerRequest) -> Result<api::StopContainerResponse> {
            Ok(api::StopContainerResponse::new())
        }
        async fn remove_container(&self, _req: api::RemoveContainerRequest) -> Result<api::RemoveContainerResponse> {
            Ok(api::RemoveContainerResponse::new())
        }
        async fn run_pod_sandbox(&self, _req: api::RunPodSandboxRequest) -> Result<api::RunPodSandboxResponse> {
            Ok(api::RunPodSandboxResponse::new())
        }
        async fn stop_pod_sandbox(&self, _req: api::StopPodSandboxRequest) -> Result<api::StopPodSandboxResponse> {
            Ok(api::StopPodSandboxResponse::new())
        }
        async fn remove_pod_sandbox(&self, _req: api::RemovePodSandboxRequest) -> Result<api::RemovePodSandboxResponse> {
            Ok(api::RemovePodSandboxResponse::new())
        }
        async fn update_pod_sandbox(&self, _req: api::UpdatePodSandboxRequest) -> Result<api::UpdatePodSandboxResponse> {
            Ok(api::UpdatePodSandboxResponse::new())
        }
        async fn post_update_pod_sandbox(&self, _req: api::PostUpdatePodSandboxRequest) -> Result<api::PostUpdatePodSandboxResponse> {
            Ok(api::PostUpdatePodSandboxResponse::new())
        }
        async fn validate_container_adjustment(
            &self,
            _req: api::ValidateContainerAdjustmentRequest,
        ) -> Result<api::ValidateContainerAdjustmentResponse> {
            Ok(api::ValidateContainerAdjustmentResponse::new())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn synchronize_rejects_update_returned_before_last_chunk() {
        let transport = ViolatingTransport {
            attempts: std::sync::atomic::AtomicUsize::new(0),
        };
        let mut plugin = Plugin::new(
            "violates".to_string(),
            "00".to_string(),
            Box::new(transport),
            Duration::from_secs(2),
        );

        let containers: Vec<api::Container> = (0..20).map(|_| api::Container::new()).collect();
        let err = plugin
            .synchronize_chunked(Vec::new(), containers)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
